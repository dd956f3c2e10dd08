//! Authenticated encryption collaborator.
//!
//! Used for session-at-rest encryption and for nonces bound to an access
//! token through the associated data.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::AuthResult;
use crate::error::AuthError;

/// Nonce size for AES-256-GCM (96 bits)
const NONCE_SIZE: usize = 12;

/// Encrypts and decrypts opaque payloads with associated data.
pub trait Cipher: Send + Sync {
    /// Encrypts `plaintext`, authenticating `aad` alongside it.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if encryption fails.
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> AuthResult<String>;

    /// Decrypts a value produced by [`Cipher::encrypt`] with the same `aad`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the ciphertext is malformed, was produced for
    /// different associated data, or no key opens it.
    fn decrypt(&self, ciphertext: &str, aad: &[u8]) -> AuthResult<Vec<u8>>;
}

/// AES-256-GCM keyed by the SHA-256 of each system secret.
///
/// The first secret encrypts. Decryption tries every secret in order so old
/// secrets can be rotated out.
pub struct AesGcmCipher {
    ciphers: Vec<Aes256Gcm>,
}

impl AesGcmCipher {
    /// Creates a cipher from the configured system secrets.
    ///
    /// # Errors
    ///
    /// Returns `Misconfiguration` if no secret is given.
    pub fn new<S: AsRef<str>>(secrets: &[S]) -> AuthResult<Self> {
        if secrets.is_empty() {
            return Err(AuthError::misconfiguration(
                "at least one system secret is required for encryption",
            ));
        }

        let ciphers = secrets
            .iter()
            .map(|secret| {
                let key = Sha256::digest(secret.as_ref().as_bytes());
                Aes256Gcm::new_from_slice(&key).map_err(|e| {
                    AuthError::misconfiguration(format!("failed to create cipher: {e}"))
                })
            })
            .collect::<AuthResult<Vec<_>>>()?;

        Ok(Self { ciphers })
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> AuthResult<String> {
        let cipher = self
            .ciphers
            .first()
            .ok_or_else(|| AuthError::misconfiguration("no encryption key configured"))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|e| AuthError::internal(format!("encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    fn decrypt(&self, ciphertext: &str, aad: &[u8]) -> AuthResult<Vec<u8>> {
        let raw = BASE64
            .decode(ciphertext)
            .map_err(|e| AuthError::internal(format!("invalid ciphertext base64: {e}")))?;
        if raw.len() <= NONCE_SIZE {
            return Err(AuthError::internal("ciphertext is too short"));
        }
        let (nonce_bytes, body) = raw.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.ciphers
            .iter()
            .find_map(|cipher| cipher.decrypt(nonce, Payload { msg: body, aad }).ok())
            .ok_or_else(|| AuthError::internal("decryption failed with every configured key"))
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher")
            .field("keys", &self.ciphers.len())
            .finish()
    }
}
