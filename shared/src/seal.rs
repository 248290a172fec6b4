//! Sealed-token capability.
//!
//! The shared secret never crosses the wire in the clear. Every outbound
//! realm/shard message carries a freshly sealed copy of it and every inbound
//! one is accepted only if its token opens back to the same secret.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum SealError {
    #[error("shared secret must not be empty")]
    EmptySecret,
    #[error("invalid key material")]
    InvalidKey,
    #[error("failed to seal token")]
    Seal,
    #[error("token is not valid base64")]
    Encoding,
    #[error("token too short ({0} bytes)")]
    TooShort(usize),
    #[error("token failed to open")]
    Open,
}

/// Opaque symmetric seal/open primitive
pub trait Sealer: Send + Sync {
    fn seal(&self, plaintext: &str) -> Result<String, SealError>;
    fn open(&self, token: &str) -> Result<String, SealError>;
}

/// AES-256-GCM sealer. The key is the SHA-256 digest of the key material and
/// each seal draws a fresh random nonce, so no two tokens are equal.
///
/// Token layout: base64(`nonce[12] || ciphertext || tag[16]`).
pub struct AesSealer {
    cipher: Aes256Gcm,
}

impl AesSealer {
    pub fn new(key_material: &str) -> Result<Self, SealError> {
        let digest = Sha256::digest(key_material.as_bytes());
        let cipher =
            Aes256Gcm::new_from_slice(digest.as_slice()).map_err(|_| SealError::InvalidKey)?;
        Ok(Self { cipher })
    }
}

impl Sealer for AesSealer {
    fn seal(&self, plaintext: &str) -> Result<String, SealError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SealError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    fn open(&self, token: &str) -> Result<String, SealError> {
        let sealed = STANDARD.decode(token).map_err(|_| SealError::Encoding)?;
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(SealError::TooShort(sealed.len()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Open)?;
        String::from_utf8(plaintext).map_err(|_| SealError::Open)
    }
}

/// Issues and verifies tokens for one process-wide secret.
///
/// Cheap to clone; hand one to every component that stamps or checks tokens.
#[derive(Clone)]
pub struct TokenAuthority {
    sealer: Arc<dyn Sealer>,
    secret: Arc<str>,
}

impl TokenAuthority {
    pub fn new(sealer: Arc<dyn Sealer>, secret: &str) -> Result<Self, SealError> {
        if secret.is_empty() {
            return Err(SealError::EmptySecret);
        }
        Ok(Self {
            sealer,
            secret: Arc::from(secret),
        })
    }

    /// Builds an authority backed by [`AesSealer`] keyed from the secret itself
    pub fn from_secret(secret: &str) -> Result<Self, SealError> {
        let sealer = AesSealer::new(secret)?;
        Self::new(Arc::new(sealer), secret)
    }

    /// Seals a fresh token. Call once per outbound message.
    pub fn issue(&self) -> Result<String, SealError> {
        self.sealer.seal(&self.secret)
    }

    /// True iff the token opens to the shared secret
    pub fn verify(&self, token: &str) -> bool {
        match self.sealer.open(token) {
            Ok(opened) => constant_time_eq(opened.as_bytes(), self.secret.as_bytes()),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("secret", &"<redacted>")
            .finish()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
