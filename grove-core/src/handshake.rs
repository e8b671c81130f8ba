//! Hello / HelloReply bodies: the extension word, name packing and the
//! ephemeral-key tail of the Diffie-Hellman variant.
//!
//! Body layout: `extensions[4] | name | ephemeralPub[64]?`. The ephemeral
//! tail is present only when the encryption bit is set, and never on frames
//! exchanged with the directory, which stays on the plain path even when the
//! bit is advertised.

use crate::crypto::PUBLIC_KEY_LEN;

pub const EXTENSION_LEN: usize = 4;

/// Bit 0: NAT traversal supported. Always set.
pub const EXT_NAT: u32 = 1;
/// Bit 1: encryption supported; the body carries an ephemeral ECDH key.
pub const EXT_ENCRYPTION: u32 = 1 << 1;

/// Extension word we advertise.
pub fn build_extensions(encrypt: bool) -> u32 {
    let mut ext = EXT_NAT;
    if encrypt {
        ext |= EXT_ENCRYPTION;
    }
    ext
}

/// Big-endian extension word at the front of a Hello body.
pub fn parse_extensions(body: &[u8]) -> Option<u32> {
    if body.len() < EXTENSION_LEN {
        return None;
    }
    Some(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
}

pub fn encryption_enabled(body: &[u8]) -> bool {
    parse_extensions(body)
        .map(|ext| ext & EXT_ENCRYPTION != 0)
        .unwrap_or(false)
}

/// Assemble a Hello or HelloReply body.
pub fn hello_body(extensions: u32, name: &str, ephemeral: Option<&[u8; PUBLIC_KEY_LEN]>) -> Vec<u8> {
    let mut body =
        Vec::with_capacity(EXTENSION_LEN + name.len() + ephemeral.map_or(0, |_| PUBLIC_KEY_LEN));
    body.extend_from_slice(&extensions.to_be_bytes());
    body.extend_from_slice(name.as_bytes());
    if let Some(key) = ephemeral {
        body.extend_from_slice(key);
    }
    body
}

fn trim_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Extract the sender's claimed name from a Hello body. The directory is
/// recognized first on the plain layout; otherwise an advertised encryption
/// bit means the last 64 bytes are the ephemeral key, not part of the name.
pub fn peer_name(body: &[u8], directory_name: &str) -> Option<String> {
    if body.len() < EXTENSION_LEN {
        return None;
    }
    let plain = trim_name(&body[EXTENSION_LEN..]);
    if plain == directory_name {
        return Some(plain);
    }
    if encryption_enabled(body) && body.len() >= EXTENSION_LEN + PUBLIC_KEY_LEN {
        return Some(trim_name(&body[EXTENSION_LEN..body.len() - PUBLIC_KEY_LEN]));
    }
    Some(plain)
}

/// The trailing ephemeral public key of an encrypted Hello body.
pub fn ephemeral_public(body: &[u8]) -> Option<[u8; PUBLIC_KEY_LEN]> {
    if !encryption_enabled(body) || body.len() < EXTENSION_LEN + PUBLIC_KEY_LEN {
        return None;
    }
    let mut out = [0u8; PUBLIC_KEY_LEN];
    out.copy_from_slice(&body[body.len() - PUBLIC_KEY_LEN..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_bits() {
        assert_eq!(build_extensions(false), EXT_NAT);
        assert_eq!(build_extensions(true), EXT_NAT | EXT_ENCRYPTION);
    }

    #[test]
    fn parse_extensions_roundtrip() {
        let body = hello_body(build_extensions(true), "node-a", None);
        assert_eq!(parse_extensions(&body), Some(EXT_NAT | EXT_ENCRYPTION));
        assert!(encryption_enabled(&body));
        assert!(parse_extensions(&[0, 0]).is_none());
    }

    #[test]
    fn plain_name_extraction() {
        let body = hello_body(build_extensions(false), "node-a", None);
        assert_eq!(peer_name(&body, "dir.example").unwrap(), "node-a");
    }

    #[test]
    fn encrypted_name_drops_ephemeral_tail() {
        let eph = [0x41u8; PUBLIC_KEY_LEN];
        let body = hello_body(build_extensions(true), "node-b", Some(&eph));
        assert_eq!(peer_name(&body, "dir.example").unwrap(), "node-b");
        assert_eq!(ephemeral_public(&body).unwrap(), eph);
    }

    #[test]
    fn directory_hello_stays_plain() {
        // The directory may advertise the encryption bit yet attach no key.
        let body = hello_body(build_extensions(true), "dir.example", None);
        assert_eq!(peer_name(&body, "dir.example").unwrap(), "dir.example");
        assert!(ephemeral_public(&body).is_none());
    }

    #[test]
    fn ephemeral_absent_on_plain_body() {
        let body = hello_body(build_extensions(false), "node-c", None);
        assert!(ephemeral_public(&body).is_none());
    }
}
