//! Cryptographic primitives for Veil Tunnel
//!
//! This module provides:
//! - X25519 key generation for the carrier handshake material
//! - AEAD record ciphers (AES-256-GCM, ChaCha20-Poly1305)
//! - HKDF-SHA256 key derivation
//! - Secure random number generation

mod aead;
mod kdf;
mod keys;

pub use aead::{AeadSuite, RecordCipher};
pub use kdf::{derive_record_key, Hkdf};
pub use keys::{KeyPair, PrivateKey, PublicKey};

use thiserror::Error;

/// X25519 parameter set used when generating ephemeral key pairs
pub const KEYGEN_PATTERN: &str = "Noise_N_25519_ChaChaPoly_SHA256";

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of AEAD nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of AEAD authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Unknown cipher suite: 0x{0:02x}")]
    UnknownSuite(u8),
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("system RNG failure");
}
