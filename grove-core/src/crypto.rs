//! Crypto primitives: P-256 identity keys, ECDSA signatures, ECDH key
//! agreement, AES-256-GCM sealing, datum integrity.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, FieldBytes, PublicKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const PUBLIC_KEY_LEN: usize = 64;
pub const SIGNATURE_LEN: usize = 64;
pub const SESSION_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("public key must be {PUBLIC_KEY_LEN} raw bytes")]
    BadPublicKey,
    #[error("invalid secret scalar")]
    BadSecret,
    #[error("ciphertext too short")]
    CiphertextTooShort,
    #[error("AEAD failure")]
    Aead,
}

/// Long-term node identity: a P-256 signing key.
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::random(&mut OsRng),
        }
    }

    /// Rebuild an identity from its raw 32-byte secret scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::BadSecret);
        }
        let signing = SigningKey::from_bytes(FieldBytes::from_slice(bytes))
            .map_err(|_| CryptoError::BadSecret)?;
        Ok(Self { signing })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.signing.to_bytes());
        out
    }

    pub fn public_key(&self) -> VerifyingKey {
        *self.signing.verifying_key()
    }

    /// Raw X||Y serialization of the public key, the wire and directory format.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        serialize_public(&self.public_key())
    }

    /// ECDSA sign over SHA-256 of `message`, serialized as r||s.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let sig: Signature = self.signing.sign(message);
        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(&sig.to_bytes());
        out
    }
}

/// Serialize a verifying key as X||Y (64 bytes, uncompressed affine coordinates).
pub fn serialize_public(key: &VerifyingKey) -> [u8; PUBLIC_KEY_LEN] {
    let point = key.to_encoded_point(false);
    let mut out = [0u8; PUBLIC_KEY_LEN];
    out.copy_from_slice(&point.as_bytes()[1..1 + PUBLIC_KEY_LEN]);
    out
}

/// Parse a raw X||Y public key.
pub fn parse_public(raw: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let point = encoded_point(raw)?;
    VerifyingKey::from_encoded_point(&point).map_err(|_| CryptoError::BadPublicKey)
}

fn encoded_point(raw: &[u8]) -> Result<EncodedPoint, CryptoError> {
    if raw.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::BadPublicKey);
    }
    Ok(EncodedPoint::from_affine_coordinates(
        FieldBytes::from_slice(&raw[..32]),
        FieldBytes::from_slice(&raw[32..]),
        false,
    ))
}

/// Verify an r||s signature over `message` against `key`.
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    if signature.len() != SIGNATURE_LEN {
        return false;
    }
    match Signature::from_slice(signature) {
        Ok(sig) => key.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}

/// Ephemeral ECDH key pair used during an encrypted handshake. The secret
/// half lives inside the pending Hello transaction until the reply arrives.
pub struct EphemeralKey {
    secret: EphemeralSecret,
}

impl EphemeralKey {
    pub fn generate() -> Self {
        Self {
            secret: EphemeralSecret::random(&mut OsRng),
        }
    }

    /// Raw X||Y serialization of the ephemeral public half.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        let point = self.secret.public_key().to_encoded_point(false);
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(&point.as_bytes()[1..1 + PUBLIC_KEY_LEN]);
        out
    }

    /// Derive the shared session key: SHA-256 over the x-coordinate of the
    /// shared point.
    pub fn agree(&self, peer_public: &[u8]) -> Result<[u8; SESSION_KEY_LEN], CryptoError> {
        let point = encoded_point(peer_public)?;
        let public = Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
            .ok_or(CryptoError::BadPublicKey)?;
        let shared = self.secret.diffie_hellman(&public);
        let digest = Sha256::digest(shared.raw_secret_bytes());
        let mut out = [0u8; SESSION_KEY_LEN];
        out.copy_from_slice(&digest);
        Ok(out)
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey").finish_non_exhaustive()
    }
}

/// AES-256-GCM seal: random 12-byte nonce prepended to the ciphertext.
pub fn seal(key: &[u8; SESSION_KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Aead)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Aead)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// AES-256-GCM open of a `nonce || ciphertext` sealed body.
pub fn open(key: &[u8; SESSION_KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::CiphertextTooShort);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Aead)?;
    cipher
        .decrypt(Nonce::from_slice(&sealed[..NONCE_LEN]), &sealed[NONCE_LEN..])
        .map_err(|_| CryptoError::Aead)
}

/// Check a Datum body `receivedHash[32] || payload` against the hash that was
/// requested. Both the embedded hash and the recomputed payload hash must
/// match it.
pub fn verify_datum(body: &[u8], requested: &[u8; 32]) -> bool {
    if body.len() < 32 {
        return false;
    }
    let received = &body[..32];
    let payload = &body[32..];
    let computed = Sha256::digest(payload);
    computed.as_slice() == requested && received == requested
}
