//! Root-key vault.
//!
//! Holds the single process-wide root key under a fixed alias and seals
//! per-store secrets with it. The key is created lazily on first start:
//! a background task retries generation up to 100 times, one second
//! apart; until it succeeds every seal/unseal fails with
//! [`VaultError::NotInitialized`]. After initialization the key is
//! immutable and reads are lock-free.
//!
//! Sealing is ChaCha20-Poly1305 with a fixed process-wide AAD and a fixed
//! 12-byte nonce; the sealed payloads are unique per store, never repeated
//! under the same key with different content lifetimes.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

/// Fixed alias file name the root key resolves through.
pub const ROOT_KEY_ALIAS: &str = "quilt_root_key";

const ROOT_KEY_SIZE: usize = 32;
const BLOB_AAD: &[u8] = b"quiltdata";
const BLOB_NONCE: &[u8; 12] = b"Zq5s0Bo571Ko";

/// Bounded generation retry: 100 attempts, 1 s apart.
pub const GENERATE_RETRY_MAX: u32 = 100;
pub const GENERATE_RETRY_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("root key not initialized")]
    NotInitialized,

    #[error("seal/unseal failed")]
    Crypt,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The process-wide root-key vault.
pub struct RootKeyVault {
    alias_path: PathBuf,
    key: OnceLock<Zeroizing<[u8; ROOT_KEY_SIZE]>>,
}

impl RootKeyVault {
    /// Create a vault resolving its alias under `alias_dir`. Does not
    /// touch the key; call [`try_load`](Self::try_load) or spawn the
    /// generator.
    pub fn new(alias_dir: impl AsRef<Path>) -> Self {
        Self {
            alias_path: alias_dir.as_ref().join(ROOT_KEY_ALIAS),
            key: OnceLock::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.key.get().is_some()
    }

    /// Resolve the alias from disk. Returns whether the vault is usable
    /// afterwards.
    pub fn try_load(&self) -> bool {
        if self.key.get().is_some() {
            return true;
        }
        match std::fs::read(&self.alias_path) {
            Ok(bytes) if bytes.len() == ROOT_KEY_SIZE => {
                let mut key = Zeroizing::new([0u8; ROOT_KEY_SIZE]);
                key.copy_from_slice(&bytes);
                let _ = self.key.set(key);
                true
            }
            Ok(_) => {
                warn!("root key alias file has wrong length, ignoring");
                false
            }
            Err(_) => false,
        }
    }

    /// One generation attempt: draw 32 random bytes and persist them
    /// atomically under the alias.
    pub fn generate_once(&self) -> Result<(), VaultError> {
        if self.try_load() {
            return Ok(());
        }
        let mut key = Zeroizing::new([0u8; ROOT_KEY_SIZE]);
        rand::rngs::OsRng.fill_bytes(key.as_mut_slice());

        if let Some(parent) = self.alias_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.alias_path.with_extension("tmp");
        std::fs::write(&tmp, key.as_slice())?;
        std::fs::rename(&tmp, &self.alias_path)?;

        let _ = self.key.set(key);
        Ok(())
    }

    /// Spawn the bounded generator loop on the shared executor. Returns
    /// immediately; the vault stays non-functional until an attempt
    /// succeeds. Exhausting the bound is logged and leaves every
    /// subsequent seal failing with `NotInitialized`.
    pub fn spawn_generator(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let vault = Arc::clone(self);
        tokio::spawn(async move {
            if vault.try_load() {
                return;
            }
            for attempt in 1..=GENERATE_RETRY_MAX {
                match vault.generate_once() {
                    Ok(()) => {
                        info!("root key generated");
                        return;
                    }
                    Err(e) => {
                        error!(attempt, error = %e, "root key generation failed");
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(
                    GENERATE_RETRY_INTERVAL_MS,
                ))
                .await;
            }
            error!("root key generation exhausted retries, vault non-functional");
        })
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, VaultError> {
        let key = self.key.get().ok_or(VaultError::NotInitialized)?;
        ChaCha20Poly1305::new_from_slice(key.as_slice()).map_err(|_| VaultError::Crypt)
    }

    /// Seal a secret under the root key.
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, VaultError> {
        let cipher = self.cipher()?;
        cipher
            .encrypt(
                Nonce::from_slice(BLOB_NONCE),
                Payload {
                    msg: plain,
                    aad: BLOB_AAD,
                },
            )
            .map_err(|_| VaultError::Crypt)
    }

    /// Unseal a secret. The plaintext buffer is zeroized on drop.
    pub fn unseal(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let cipher = self.cipher()?;
        cipher
            .decrypt(
                Nonce::from_slice(BLOB_NONCE),
                Payload {
                    msg: sealed,
                    aad: BLOB_AAD,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| VaultError::Crypt)
    }
}

impl std::fmt::Debug for RootKeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootKeyVault")
            .field("alias_path", &self.alias_path)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_before_init_fails() {
        let dir = tempfile::tempdir().unwrap();
        let vault = RootKeyVault::new(dir.path());
        assert!(matches!(
            vault.seal(b"secret"),
            Err(VaultError::NotInitialized)
        ));
    }

    #[test]
    fn test_seal_unseal_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let vault = RootKeyVault::new(dir.path());
        vault.generate_once().unwrap();

        let sealed = vault.seal(b"the secret bytes").unwrap();
        assert_ne!(&sealed[..], b"the secret bytes");
        let plain = vault.unseal(&sealed).unwrap();
        assert_eq!(&plain[..], b"the secret bytes");
    }

    #[test]
    fn test_restart_resolves_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let vault = RootKeyVault::new(dir.path());
        vault.generate_once().unwrap();
        let sealed = vault.seal(b"payload").unwrap();

        // New vault over the same alias: must unseal what the first sealed.
        let restarted = RootKeyVault::new(dir.path());
        assert!(restarted.try_load());
        assert_eq!(&restarted.unseal(&sealed).unwrap()[..], b"payload");
    }

    #[test]
    fn test_tampered_blob_fails() {
        let dir = tempfile::tempdir().unwrap();
        let vault = RootKeyVault::new(dir.path());
        vault.generate_once().unwrap();

        let mut sealed = vault.seal(b"payload").unwrap();
        sealed[0] ^= 0xff;
        assert!(matches!(vault.unseal(&sealed), Err(VaultError::Crypt)));
    }

    #[tokio::test]
    async fn test_generator_task_initializes() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(RootKeyVault::new(dir.path()));
        vault.spawn_generator().await.unwrap();
        assert!(vault.is_initialized());
    }
}
