//! At-rest encoding of connection secrets.
//!
//! Stored values carry a scheme prefix: `b64:` for plain base64 and `gcm:`
//! for AES-256-GCM sealed values. Values without a prefix are legacy bare
//! base64.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

const BASE64_PREFIX: &str = "b64:";
const SEALED_PREFIX: &str = "gcm:";
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("invalid encoding: {0}")]
    Encoding(String),
    #[error("sealed secret found but no secret key is configured")]
    MissingKey,
    #[error("failed to seal secret")]
    Seal,
    #[error("failed to open sealed secret (wrong key or corrupted value)")]
    Open,
}

/// Reversible codec for connection secrets.
pub enum SecretCodec {
    Base64,
    Sealed(Box<Aes256Gcm>),
}

impl fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretCodec::Base64 => f.write_str("SecretCodec::Base64"),
            SecretCodec::Sealed(_) => f.write_str("SecretCodec::Sealed"),
        }
    }
}

impl SecretCodec {
    /// Build a codec from an optional passphrase.
    ///
    /// With a passphrase, secrets are sealed with AES-256-GCM under the
    /// SHA-256 digest of the passphrase.
    pub fn from_key(passphrase: Option<&str>) -> Result<Self, SecretError> {
        match passphrase {
            None => Ok(SecretCodec::Base64),
            Some(passphrase) => {
                let digest = Sha256::digest(passphrase.as_bytes());
                let cipher = Aes256Gcm::new_from_slice(&digest)
                    .map_err(|e| SecretError::Encoding(e.to_string()))?;
                Ok(SecretCodec::Sealed(Box::new(cipher)))
            }
        }
    }

    pub fn encode(&self, secret: &str) -> Result<String, SecretError> {
        match self {
            SecretCodec::Base64 => Ok(format!("{}{}", BASE64_PREFIX, STANDARD.encode(secret))),
            SecretCodec::Sealed(cipher) => {
                let nonce: [u8; NONCE_LEN] = rand::random();
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce), secret.as_bytes())
                    .map_err(|_| SecretError::Seal)?;

                let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                sealed.extend_from_slice(&nonce);
                sealed.extend_from_slice(&ciphertext);
                Ok(format!("{}{}", SEALED_PREFIX, STANDARD.encode(sealed)))
            }
        }
    }

    pub fn decode(&self, stored: &str) -> Result<String, SecretError> {
        if let Some(body) = stored.strip_prefix(SEALED_PREFIX) {
            let cipher = match self {
                SecretCodec::Sealed(cipher) => cipher,
                SecretCodec::Base64 => return Err(SecretError::MissingKey),
            };

            let sealed = decode_base64(body)?;
            if sealed.len() <= NONCE_LEN {
                return Err(SecretError::Open);
            }
            let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
            let plain = cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| SecretError::Open)?;
            return into_utf8(plain);
        }

        let body = stored.strip_prefix(BASE64_PREFIX).unwrap_or(stored);
        into_utf8(decode_base64(body)?)
    }
}

fn decode_base64(body: &str) -> Result<Vec<u8>, SecretError> {
    STANDARD
        .decode(body)
        .map_err(|e| SecretError::Encoding(e.to_string()))
}

fn into_utf8(bytes: Vec<u8>) -> Result<String, SecretError> {
    String::from_utf8(bytes).map_err(|e| SecretError::Encoding(e.to_string()))
}
