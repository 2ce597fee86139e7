//! Value sealing for encrypted stores.
//!
//! Wire format: `[ nonce (12 bytes) | ciphertext + tag ]`, random nonce
//! per value. The key-check record lets an open detect a wrong or stale
//! secret before any data is touched.

use crate::error::StoreError;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use quilt_keys::SecretKey;
use rand::RngCore;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;
pub(crate) const KEY_CHECK_PLAIN: &[u8] = b"quilt-store-key-check";

/// A store-level cipher built from the per-store secret.
#[derive(Clone)]
pub struct ValueSealer {
    cipher: ChaCha20Poly1305,
}

impl ValueSealer {
    pub fn new(secret: &SecretKey) -> Result<Self, StoreError> {
        let cipher = ChaCha20Poly1305::new_from_slice(secret.as_bytes())
            .map_err(|_| StoreError::Crypt("bad secret length".into()))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ct = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| StoreError::Crypt("seal failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn unseal(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        if data.len() < NONCE_LEN {
            return Err(StoreError::Crypt("sealed value truncated".into()));
        }
        let (nonce, ct) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map(Zeroizing::new)
            .map_err(|_| StoreError::Crypt("unseal failed".into()))
    }

    /// The record proving this secret opens this store.
    pub fn key_check(&self) -> Result<Vec<u8>, StoreError> {
        self.seal(KEY_CHECK_PLAIN)
    }

    /// Verify a stored key-check record against this secret.
    pub fn verify_key_check(&self, stored: &[u8]) -> Result<(), StoreError> {
        let plain = self.unseal(stored)?;
        if &plain[..] == KEY_CHECK_PLAIN {
            Ok(())
        } else {
            Err(StoreError::Crypt("key check mismatch".into()))
        }
    }
}

impl std::fmt::Debug for ValueSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueSealer").finish_non_exhaustive()
    }
}
