//! Key Derivation Functions
//!
//! HKDF-SHA256, used to derive record-encryption keys from the client UID
//! and the per-connection session id.

use super::{CryptoError, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };

        let prk = salt.extract(ikm);

        Self { prk }
    }

    /// Derive a key from the PRK
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyGeneration("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyGeneration("HKDF fill failed".to_string()))?;

        Ok(())
    }

    /// Derive a 32-byte key
    pub fn expand_key(&self, info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.expand(info, &mut key)?;
        Ok(key)
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derive the record-encryption key for one session.
///
/// The UID is the keying material; the session id is mixed into the info
/// string so reconnects with fresh session ids never reuse a record key.
pub fn derive_record_key(uid: &[u8], session_id: u32) -> Result<[u8; KEY_LEN], CryptoError> {
    let hkdf = Hkdf::new(None, uid);
    let mut info = Vec::with_capacity(24);
    info.extend_from_slice(b"veil_tunnel_record_key");
    info.extend_from_slice(&session_id.to_be_bytes());
    hkdf.expand_key(&info)
}
