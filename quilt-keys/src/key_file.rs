//! Sealed secret-key codec and file handling.
//!
//! Both persisted copies of a store secret (the meta row and the `.key`
//! file next to the store data) use the same layout: an 8-byte
//! little-endian creation timestamp followed by the root-key-sealed
//! 32-byte secret. The copies must agree on the key bytes; timestamps may
//! differ, and on conflict the file copy wins.

use crate::vault::{RootKeyVault, VaultError};
use sha2::{Digest, Sha256};
use std::path::Path;
use zeroize::Zeroizing;

pub const SECRET_KEY_SIZE: usize = 32;
const TIMESTAMP_HEADER_LEN: usize = 8;

/// An encoded secret copy: timestamp header plus sealed key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub created_at_ms: u64,
    sealed: Vec<u8>,
}

impl SealedSecret {
    /// Seal fresh key bytes under the vault.
    pub fn seal(
        vault: &RootKeyVault,
        key: &[u8; SECRET_KEY_SIZE],
        created_at_ms: u64,
    ) -> Result<Self, VaultError> {
        Ok(Self {
            created_at_ms,
            sealed: vault.seal(key)?,
        })
    }

    /// Recover the key bytes. Fails if the vault is uninitialized or the
    /// blob does not authenticate.
    pub fn unseal(&self, vault: &RootKeyVault) -> Result<Zeroizing<[u8; SECRET_KEY_SIZE]>, VaultError> {
        let plain = vault.unseal(&self.sealed)?;
        if plain.len() != SECRET_KEY_SIZE {
            return Err(VaultError::Crypt);
        }
        let mut key = Zeroizing::new([0u8; SECRET_KEY_SIZE]);
        key.copy_from_slice(&plain);
        Ok(key)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TIMESTAMP_HEADER_LEN + self.sealed.len());
        out.extend_from_slice(&self.created_at_ms.to_le_bytes());
        out.extend_from_slice(&self.sealed);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() <= TIMESTAMP_HEADER_LEN {
            return None;
        }
        let created_at_ms = u64::from_le_bytes(bytes[..TIMESTAMP_HEADER_LEN].try_into().ok()?);
        Some(Self {
            created_at_ms,
            sealed: bytes[TIMESTAMP_HEADER_LEN..].to_vec(),
        })
    }
}

/// Canonical file name of a store's secret: hex SHA-256 of `<app>_<store>`.
pub fn secret_file_name(app_id: &str, store_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(app_id.as_bytes());
    hasher.update(b"_");
    hasher.update(store_id.as_bytes());
    format!("{}.key", hex::encode(hasher.finalize()))
}

/// Read and decode a secret file. A missing file is `None`; a garbled one
/// is also `None` (the caller falls back to the other copy).
pub fn load_secret_file(path: &Path) -> std::io::Result<Option<SealedSecret>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(SealedSecret::decode(&bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write a secret file atomically (tmp + rename).
pub fn write_secret_file(path: &Path, secret: &SealedSecret) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("key.tmp");
    std::fs::write(&tmp, secret.encode())?;
    std::fs::rename(&tmp, path)
}

/// Remove a secret file if present.
pub fn remove_secret_file(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
