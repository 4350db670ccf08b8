//! Field-level authenticated encryption
//!
//! Every sensitive column in the database (account payloads, snapshot
//! metadata, watchlist details, encrypted settings) is a self-describing
//! AEAD frame: `[version(1)][algorithm(1)][nonce(12)][ciphertext]`.
//! Decryption with the wrong key or tampered ciphertext fails with a
//! distinct error instead of returning garbage; the unlock path relies on
//! this to detect a wrong master password.

use crate::{kdf, Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use zeroize::Zeroizing;

/// Ciphertext frame version
const FRAME_VERSION: u8 = 1;

/// Nonce length for both supported ciphers
const NONCE_LEN: usize = 12;

/// Frame header length: version + algorithm + nonce
const HEADER_LEN: usize = 2 + NONCE_LEN;

/// Encryption algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM
    AesGcm,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    fn as_u8(self) -> u8 {
        match self {
            EncryptionAlgorithm::AesGcm => 0,
            EncryptionAlgorithm::ChaCha20Poly1305 => 1,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(EncryptionAlgorithm::AesGcm),
            1 => Ok(EncryptionAlgorithm::ChaCha20Poly1305),
            other => Err(Error::Encryption(format!("Unknown algorithm tag: {}", other))),
        }
    }
}

impl Default for EncryptionAlgorithm {
    fn default() -> Self {
        EncryptionAlgorithm::ChaCha20Poly1305
    }
}

/// Session encryption key derived from the master password
#[derive(Clone)]
pub struct MasterKey {
    key: Zeroizing<[u8; kdf::KEY_LEN]>,
    algorithm: EncryptionAlgorithm,
}

impl MasterKey {
    /// Derive from a master password and stored salt
    pub fn from_password(password: &str, salt: &[u8], params: &kdf::KdfParams) -> Result<Self> {
        let key = kdf::derive_key(password, salt, params)?;
        Ok(Self {
            key,
            algorithm: EncryptionAlgorithm::default(),
        })
    }

    /// Create from raw key bytes
    pub fn from_bytes(bytes: &[u8], algorithm: EncryptionAlgorithm) -> Result<Self> {
        if bytes.len() != kdf::KEY_LEN {
            return Err(Error::Encryption("Invalid key length".to_string()));
        }

        let mut key = Zeroizing::new([0u8; kdf::KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(Self { key, algorithm })
    }

    /// Generate a random key (tests and ephemeral use)
    pub fn generate(algorithm: EncryptionAlgorithm) -> Self {
        let mut key = Zeroizing::new([0u8; kdf::KEY_LEN]);
        OsRng.fill_bytes(&mut *key);
        Self { key, algorithm }
    }

    /// Encrypt a payload under a fresh random nonce.
    ///
    /// Randomized: the same plaintext encrypts to a different frame every
    /// call, so equal balances never produce equal ciphertexts.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = match self.algorithm {
            EncryptionAlgorithm::AesGcm => {
                let cipher = Aes256Gcm::new(self.key.as_ref().into());
                cipher
                    .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
                    .map_err(|e| Error::Encryption(e.to_string()))?
            }
            EncryptionAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(self.key.as_ref().into());
                cipher
                    .encrypt(chacha20poly1305::Nonce::from_slice(&nonce_bytes), plaintext)
                    .map_err(|e| Error::Encryption(e.to_string()))?
            }
        };

        let mut frame = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        frame.push(FRAME_VERSION);
        frame.push(self.algorithm.as_u8());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Decrypt a frame produced by [`MasterKey::encrypt`].
    ///
    /// Fails with [`Error::Encryption`] on a wrong key, a flipped bit, or a
    /// malformed frame.
    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < HEADER_LEN {
            return Err(Error::Encryption("Ciphertext frame too short".to_string()));
        }

        let version = frame[0];
        if version != FRAME_VERSION {
            return Err(Error::Encryption(format!(
                "Unsupported ciphertext version: {}",
                version
            )));
        }

        let algorithm = EncryptionAlgorithm::from_u8(frame[1])?;
        let nonce = &frame[2..HEADER_LEN];
        let ciphertext = &frame[HEADER_LEN..];

        match algorithm {
            EncryptionAlgorithm::AesGcm => {
                let cipher = Aes256Gcm::new(self.key.as_ref().into());
                cipher
                    .decrypt(Nonce::from_slice(nonce), ciphertext)
                    .map_err(|_| Error::Encryption("Authentication failed".to_string()))
            }
            EncryptionAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(self.key.as_ref().into());
                cipher
                    .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
                    .map_err(|_| Error::Encryption("Authentication failed".to_string()))
            }
        }
    }

    /// Key bytes (for key-rotation internals only; never persist)
    pub(crate) fn as_bytes(&self) -> &[u8; kdf::KEY_LEN] {
        &self.key
    }
}
