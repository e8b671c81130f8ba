//! Framing: `id[4] | type[1] | len[2] | body | signature[64]?`, big-endian.

use std::net::{IpAddr, SocketAddr};

use crate::crypto::{Identity, SIGNATURE_LEN};

pub const HEADER_LEN: usize = 7;
pub const OFFSET_TYPE: usize = 4;
pub const OFFSET_LEN: usize = 5;
pub const OFFSET_BODY: usize = 7;
pub const MAX_DATAGRAM: usize = 65535;

/// All wire message types. Codes >= 128 are responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    Hello = 1,
    RootRequest = 2,
    DatumRequest = 3,
    NatTraversalRequest = 4,
    NatTraversalRequest2 = 5,
    Ok = 128,
    Error = 129,
    HelloReply = 130,
    RootReply = 131,
    Datum = 132,
    NoDatum = 133,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Ping,
            1 => Self::Hello,
            2 => Self::RootRequest,
            3 => Self::DatumRequest,
            4 => Self::NatTraversalRequest,
            5 => Self::NatTraversalRequest2,
            128 => Self::Ok,
            129 => Self::Error,
            130 => Self::HelloReply,
            131 => Self::RootReply,
            132 => Self::Datum,
            133 => Self::NoDatum,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// High bit set means response; the receive loop routes on this.
    pub fn is_response(self) -> bool {
        self.code() >= 128
    }

    /// Whether frames of this type carry a trailing ECDSA signature.
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Self::Hello
                | Self::NatTraversalRequest
                | Self::NatTraversalRequest2
                | Self::HelloReply
                | Self::RootReply
                | Self::NoDatum
        )
    }
}

/// Error building or parsing a frame.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short")]
    TooShort,
    #[error("declared body length exceeds datagram")]
    Truncated,
    #[error("signed type {0} without signature")]
    MissingSignature(u8),
    #[error("body too large for 16-bit length")]
    BodyTooLarge,
    #[error("bad NAT body length {0}")]
    BadNatBody(usize),
    #[error("signing failed")]
    Signing,
}

/// A parsed frame, borrowing from the datagram.
#[derive(Debug)]
pub struct ParsedMessage<'a> {
    pub id: u32,
    pub type_code: u8,
    pub body: &'a [u8],
    /// Header plus body, the region a signature covers.
    pub signed: &'a [u8],
    pub signature: Option<&'a [u8]>,
}

/// Build a complete frame, signing it when an identity is given.
pub fn build_message(
    id: u32,
    mtype: MessageType,
    body: &[u8],
    signer: Option<&Identity>,
) -> Result<Vec<u8>, WireError> {
    if body.len() > u16::MAX as usize {
        return Err(WireError::BodyTooLarge);
    }
    let mut out = Vec::with_capacity(HEADER_LEN + body.len() + SIGNATURE_LEN);
    out.extend_from_slice(&id.to_be_bytes());
    out.push(mtype.code());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    if let Some(identity) = signer {
        let sig = identity.sign(&out);
        out.extend_from_slice(&sig);
    }
    Ok(out)
}

/// Parse a received datagram. Fails when the frame is shorter than its header,
/// shorter than its declared body, or when a signed type lacks its signature.
pub fn parse_message(pkt: &[u8]) -> Result<ParsedMessage<'_>, WireError> {
    if pkt.len() < HEADER_LEN {
        return Err(WireError::TooShort);
    }
    let id = u32::from_be_bytes([pkt[0], pkt[1], pkt[2], pkt[3]]);
    let type_code = pkt[OFFSET_TYPE];
    let body_len = u16::from_be_bytes([pkt[OFFSET_LEN], pkt[OFFSET_LEN + 1]]) as usize;
    if pkt.len() < HEADER_LEN + body_len {
        return Err(WireError::Truncated);
    }
    let body = &pkt[OFFSET_BODY..OFFSET_BODY + body_len];
    let signed = &pkt[..OFFSET_BODY + body_len];
    let sig_end = OFFSET_BODY + body_len + SIGNATURE_LEN;
    let signature = if pkt.len() >= sig_end {
        Some(&pkt[OFFSET_BODY + body_len..sig_end])
    } else {
        None
    };
    if signature.is_none() {
        if let Some(mtype) = MessageType::from_code(type_code) {
            if mtype.is_signed() {
                return Err(WireError::MissingSignature(type_code));
            }
        }
    }
    Ok(ParsedMessage {
        id,
        type_code,
        body,
        signed,
        signature,
    })
}

/// Encode a NAT traversal body: `IPv4[4] | port[2]` or `IPv6[16] | port[2]`.
pub fn encode_nat_body(addr: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    match addr.ip().to_canonical() {
        IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

/// Decode a NAT traversal body back into a socket address.
pub fn decode_nat_body(body: &[u8]) -> Result<SocketAddr, WireError> {
    match body.len() {
        6 => {
            let ip: [u8; 4] = body[..4].try_into().map_err(|_| WireError::BadNatBody(6))?;
            let port = u16::from_be_bytes([body[4], body[5]]);
            Ok(SocketAddr::new(IpAddr::from(ip), port))
        }
        18 => {
            let ip: [u8; 16] = body[..16]
                .try_into()
                .map_err(|_| WireError::BadNatBody(18))?;
            let port = u16::from_be_bytes([body[16], body[17]]);
            Ok(SocketAddr::new(IpAddr::from(ip), port))
        }
        n => Err(WireError::BadNatBody(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_unsigned() {
        let msg = build_message(42, MessageType::DatumRequest, &[7u8; 32], None).unwrap();
        let parsed = parse_message(&msg).unwrap();
        assert_eq!(parsed.id, 42);
        assert_eq!(parsed.type_code, MessageType::DatumRequest.code());
        assert_eq!(parsed.body, &[7u8; 32]);
        assert_eq!(parsed.signed, &msg[..]);
        assert!(parsed.signature.is_none());
    }

    #[test]
    fn roundtrip_signed_verifies() {
        let identity = Identity::generate();
        let msg = build_message(7, MessageType::Hello, b"ext-and-name", Some(&identity)).unwrap();
        let parsed = parse_message(&msg).unwrap();
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.body, b"ext-and-name");
        let sig = parsed.signature.expect("signature present");
        assert!(crate::crypto::verify(
            &identity.public_key(),
            parsed.signed,
            sig
        ));
    }

    #[test]
    fn too_short_rejected() {
        assert!(matches!(
            parse_message(&[0u8; 6]),
            Err(WireError::TooShort)
        ));
    }

    #[test]
    fn truncated_body_rejected() {
        let mut msg = build_message(1, MessageType::Datum, &[1u8; 40], None).unwrap();
        msg.truncate(20);
        assert!(matches!(parse_message(&msg), Err(WireError::Truncated)));
    }

    #[test]
    fn signed_type_without_signature_rejected() {
        // Hand-build a Hello frame with no trailing signature.
        let msg = {
            let mut out = Vec::new();
            out.extend_from_slice(&9u32.to_be_bytes());
            out.push(MessageType::Hello.code());
            out.extend_from_slice(&4u16.to_be_bytes());
            out.extend_from_slice(&[0, 0, 0, 1]);
            out
        };
        assert!(matches!(
            parse_message(&msg),
            Err(WireError::MissingSignature(1))
        ));
    }

    #[test]
    fn response_codes() {
        assert!(!MessageType::DatumRequest.is_response());
        assert!(MessageType::Datum.is_response());
        assert!(MessageType::NoDatum.is_signed());
        assert!(!MessageType::Datum.is_signed());
    }

    #[test]
    fn nat_body_roundtrip_v4() {
        let addr: SocketAddr = "192.0.2.7:4433".parse().unwrap();
        let body = encode_nat_body(addr);
        assert_eq!(body.len(), 6);
        assert_eq!(decode_nat_body(&body).unwrap(), addr);
    }

    #[test]
    fn nat_body_roundtrip_v6() {
        let addr: SocketAddr = "[2001:db8::2]:9000".parse().unwrap();
        let body = encode_nat_body(addr);
        assert_eq!(body.len(), 18);
        assert_eq!(decode_nat_body(&body).unwrap(), addr);
    }

    #[test]
    fn nat_body_bad_length() {
        assert!(decode_nat_body(&[0u8; 5]).is_err());
    }
}
