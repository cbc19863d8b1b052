//! Payload encryption using AES-256-GCM.
//!
//! The codec has no knowledge of message semantics: it encrypts and
//! decrypts opaque payloads. The initialization vector is generated fresh
//! per call, never derived from content, and is returned separately so it
//! can be persisted alongside the ciphertext in the DTO.

use crate::error::{EngineError, EngineResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM initialization vector in bytes.
pub const IV_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Encryption key for AES-256-GCM.
///
/// The key is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a new random encryption key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(EngineError::InvalidKeySize {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }

        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Returns the key as a byte slice.
    ///
    /// # Security
    ///
    /// Do not log or serialize the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Derives a key from a passphrase using HKDF-SHA256.
    ///
    /// The salt should be random, unique per installation, and stored.
    /// HKDF assumes the input material already has reasonable entropy;
    /// for low-entropy user passwords prefer a dedicated password hash
    /// upstream.
    pub fn derive_from_passphrase(passphrase: &[u8], salt: &[u8]) -> EngineResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), passphrase);

        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"opsync-encryption-key-v1", &mut bytes)
            .map_err(|_| EngineError::encryption_failed("HKDF expand failed"))?;

        Ok(Self { bytes })
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypts and decrypts opaque payloads with per-record IVs.
pub struct CryptoCodec {
    cipher: Aes256Gcm,
}

impl CryptoCodec {
    /// Creates a codec with the given key.
    #[must_use]
    pub fn new(key: EncryptionKey) -> Self {
        // Infallible: EncryptionKey is always exactly KEY_SIZE bytes.
        let key_array = GenericArray::from_slice(key.as_bytes());
        let cipher = Aes256Gcm::new(key_array);
        Self { cipher }
    }

    /// Encrypts a payload, returning the fresh IV and the ciphertext.
    ///
    /// The IV is unique per call and must be persisted alongside the
    /// ciphertext for later decryption.
    pub fn encrypt(&self, plaintext: &[u8]) -> EngineResult<(Vec<u8>, Vec<u8>)> {
        let mut iv = vec![0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| EngineError::encryption_failed("AEAD encryption error"))?;

        Ok((iv, ciphertext))
    }

    /// Decrypts a payload encrypted with [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DecryptionFailed`] on a wrong key, corrupted
    /// ciphertext, or tampered IV. Never panics, never returns silently
    /// corrupted plaintext.
    pub fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> EngineResult<Vec<u8>> {
        if iv.len() != IV_SIZE {
            return Err(EngineError::decryption_failed("invalid IV length"));
        }
        if ciphertext.len() < TAG_SIZE {
            return Err(EngineError::decryption_failed("ciphertext too short"));
        }

        let nonce = Nonce::from_slice(iv);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| EngineError::decryption_failed("AEAD decryption error"))
    }
}

impl std::fmt::Debug for CryptoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoCodec")
            .field("cipher", &"Aes256Gcm")
            .finish()
    }
}
