//! AEAD record encryption
//!
//! Seals and opens whole carrier records. Nonces are explicit and travel
//! with the record: multiple carrier writers encrypt concurrently, so a
//! shared counter would need cross-task coordination for no gain.

use super::{CryptoError, KEY_LEN, NONCE_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};

/// Cipher suites selectable by the config's encryption method byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadSuite {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl AeadSuite {
    /// Map an encryption method byte to a suite. 0x00 (plain) has no suite.
    pub fn from_method_byte(method: u8) -> Result<Option<Self>, CryptoError> {
        match method {
            0x00 => Ok(None),
            0x01 => Ok(Some(Self::Aes256Gcm)),
            0x02 => Ok(Some(Self::ChaCha20Poly1305)),
            other => Err(CryptoError::UnknownSuite(other)),
        }
    }

    fn algorithm(self) -> &'static ring::aead::Algorithm {
        match self {
            Self::Aes256Gcm => &AES_256_GCM,
            Self::ChaCha20Poly1305 => &CHACHA20_POLY1305,
        }
    }
}

/// AEAD cipher over whole records, explicit-nonce
pub struct RecordCipher {
    key: LessSafeKey,
}

impl RecordCipher {
    /// Create a cipher from a 32-byte key
    pub fn new(suite: AeadSuite, key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(suite.algorithm(), key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
        })
    }

    /// Encrypt in place, appending the auth tag
    pub fn seal(
        &self,
        nonce: [u8; NONCE_LEN],
        aad: &[u8],
        buffer: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        let nonce = Nonce::assume_unique_for_key(nonce);
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(aad), buffer)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;
        Ok(())
    }

    /// Decrypt in place, verifying and stripping the auth tag.
    /// Returns the plaintext slice.
    pub fn open<'a>(
        &self,
        nonce: [u8; NONCE_LEN],
        aad: &[u8],
        buffer: &'a mut [u8],
    ) -> Result<&'a [u8], CryptoError> {
        let nonce = Nonce::assume_unique_for_key(nonce);
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad), buffer)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))?;
        Ok(plaintext)
    }
}
