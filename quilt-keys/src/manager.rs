//! Per-store secret-key management.
//!
//! Every encrypted store owns a 32-byte secret with exactly two persisted
//! copies: a meta-store row and a `.key` file beside the store data. The
//! manager keeps the two in agreement, recovers one from the other, and
//! rotates secrets that have outlived their one-year validity.

use crate::key_file::{
    self, SealedSecret, SECRET_KEY_SIZE,
};
use crate::vault::{RootKeyVault, VaultError};
use quilt_meta::keys::{secret_key_key, SecretKind};
use quilt_meta::{MetaError, MetaStore};
use quilt_model::{Clock, DataDir, SecurityLevel, StoreTuple};
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

const HOURS_PER_YEAR: u64 = 24 * 365;
/// A secret older than this is rotated on the next open.
pub const OUTDATED_AFTER_MS: u64 = HOURS_PER_YEAR * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("meta error: {0}")]
    Meta(#[from] MetaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted secret exists but the caller asked for a plaintext
    /// store, or vice versa.
    #[error("encrypt option does not match persisted state")]
    OptionMismatch,

    /// No copy of the secret could be recovered.
    #[error("secret key unrecoverable")]
    Unrecoverable,
}

/// A live per-store secret. The bytes are zeroized when dropped and are
/// never logged or cached beyond the open/rekey operation that needed
/// them.
pub struct SecretKey {
    bytes: Zeroizing<[u8; SECRET_KEY_SIZE]>,
    created_at_ms: u64,
    outdated: bool,
    fresh: bool,
}

impl SecretKey {
    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.bytes
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// Older than the one-year validity; triggers re-key on open.
    pub fn is_outdated(&self) -> bool {
        self.outdated
    }

    /// Generated by this very call rather than recovered from a persisted
    /// copy. Recovery treats a crypt failure under a fresh secret as a
    /// failed creation and purges it.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes intentionally absent.
        f.debug_struct("SecretKey")
            .field("created_at_ms", &self.created_at_ms)
            .field("outdated", &self.outdated)
            .finish_non_exhaustive()
    }
}

/// A generated-but-unpersisted rotation. Apply it to the store first,
/// then [`SecurityManager::commit_rekey`]; dropping it instead leaves the
/// old secret fully usable.
pub struct PendingRekey {
    secret: SecretKey,
    meta_key: Vec<u8>,
    file_path: PathBuf,
}

impl PendingRekey {
    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

/// Derives, persists, recovers, and rotates per-store secrets.
pub struct SecurityManager {
    vault: Arc<RootKeyVault>,
    meta: Arc<MetaStore>,
    data_dir: DataDir,
    clock: Arc<dyn Clock>,
}

impl SecurityManager {
    pub fn new(
        vault: Arc<RootKeyVault>,
        meta: Arc<MetaStore>,
        data_dir: DataDir,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            vault,
            meta,
            data_dir,
            clock,
        }
    }

    pub fn vault(&self) -> &Arc<RootKeyVault> {
        &self.vault
    }

    fn secret_file_path(&self, tuple: &StoreTuple, level: SecurityLevel) -> PathBuf {
        self.data_dir
            .secret_dir(level, &tuple.user_id, &tuple.app_id)
            .join(key_file::secret_file_name(
                tuple.app_id.as_str(),
                tuple.store_id.as_str(),
            ))
    }

    /// Resolve the secret protecting a store, per the open contract:
    ///
    /// - `encrypt = false`: any persisted copy means the store is actually
    ///   encrypted — the open is rejected. Otherwise there is no secret.
    /// - `encrypt = true`: meta copy, else file copy (written back to
    ///   meta), else a freshly generated secret persisted to both.
    pub fn get_db_password(
        &self,
        tuple: &StoreTuple,
        kind: SecretKind,
        level: SecurityLevel,
        encrypt: bool,
    ) -> Result<Option<SecretKey>, KeyError> {
        let meta_key = secret_key_key(tuple, kind);
        let file_path = self.secret_file_path(tuple, level);

        if !encrypt {
            let meta_present = self.meta.get(&meta_key)?.is_some();
            if meta_present || file_path.exists() {
                warn!(store = %tuple, "plaintext open requested for an encrypted store");
                return Err(KeyError::OptionMismatch);
            }
            return Ok(None);
        }

        if let Some(secret) = self.load_from_meta(&meta_key)? {
            return Ok(Some(secret));
        }

        if let Some(secret) = self.recover_from_file(tuple, kind, level)? {
            return Ok(Some(secret));
        }

        info!(store = %tuple, "generating new store secret");
        let secret = self.generate()?;
        let sealed = SealedSecret::seal(&self.vault, &secret.bytes, secret.created_at_ms)?;
        key_file::write_secret_file(&file_path, &sealed)?;
        self.meta.put(&meta_key, &sealed.encode())?;
        Ok(Some(secret))
    }

    /// Reload the file-side copy (authoritative after corruption) and
    /// write it back to meta. Used by both the open fallback and the
    /// recovery coordinator's retry.
    pub fn recover_from_file(
        &self,
        tuple: &StoreTuple,
        kind: SecretKind,
        level: SecurityLevel,
    ) -> Result<Option<SecretKey>, KeyError> {
        let file_path = self.secret_file_path(tuple, level);
        let Some(sealed) = key_file::load_secret_file(&file_path)? else {
            return Ok(None);
        };
        match self.decode(&sealed) {
            Ok(secret) => {
                // File wins: restore the meta copy from it.
                self.meta
                    .put(&secret_key_key(tuple, kind), &sealed.encode())?;
                Ok(Some(secret))
            }
            Err(VaultError::NotInitialized) => Err(VaultError::NotInitialized.into()),
            Err(e) => {
                warn!(store = %tuple, error = %e, "secret file unreadable");
                Ok(None)
            }
        }
    }

    /// Remove both persisted copies. Absent copies are not an error.
    pub fn del_db_password(
        &self,
        tuple: &StoreTuple,
        kind: SecretKind,
        level: SecurityLevel,
    ) -> Result<(), KeyError> {
        self.meta.delete(&secret_key_key(tuple, kind))?;
        key_file::remove_secret_file(&self.secret_file_path(tuple, level))?;
        Ok(())
    }

    /// Generate the replacement secret for a rotation. The caller
    /// re-encrypts the store with it and then commits; nothing is
    /// persisted until the commit.
    pub fn begin_rekey(
        &self,
        tuple: &StoreTuple,
        kind: SecretKind,
        level: SecurityLevel,
    ) -> Result<PendingRekey, KeyError> {
        Ok(PendingRekey {
            secret: self.generate()?,
            meta_key: secret_key_key(tuple, kind),
            file_path: self.secret_file_path(tuple, level),
        })
    }

    /// Overwrite both persisted copies with the rotated secret.
    pub fn commit_rekey(&self, pending: PendingRekey) -> Result<(), KeyError> {
        let sealed = SealedSecret::seal(
            &self.vault,
            &pending.secret.bytes,
            pending.secret.created_at_ms,
        )?;
        key_file::write_secret_file(&pending.file_path, &sealed)?;
        self.meta.put(&pending.meta_key, &sealed.encode())?;
        info!("store secret rotated");
        Ok(())
    }

    fn load_from_meta(&self, meta_key: &[u8]) -> Result<Option<SecretKey>, KeyError> {
        let Some(bytes) = self.meta.get(meta_key)? else {
            return Ok(None);
        };
        let Some(sealed) = SealedSecret::decode(&bytes) else {
            warn!("meta secret row truncated, falling back to file copy");
            return Ok(None);
        };
        match self.decode(&sealed) {
            Ok(secret) => Ok(Some(secret)),
            Err(VaultError::NotInitialized) => Err(VaultError::NotInitialized.into()),
            Err(e) => {
                warn!(error = %e, "meta secret unreadable, falling back to file copy");
                Ok(None)
            }
        }
    }

    fn decode(&self, sealed: &SealedSecret) -> Result<SecretKey, VaultError> {
        let bytes = sealed.unseal(&self.vault)?;
        let now = self.clock.now_ms();
        Ok(SecretKey {
            bytes,
            created_at_ms: sealed.created_at_ms,
            outdated: now.saturating_sub(sealed.created_at_ms) >= OUTDATED_AFTER_MS,
            fresh: false,
        })
    }

    fn generate(&self) -> Result<SecretKey, KeyError> {
        let mut bytes = Zeroizing::new([0u8; SECRET_KEY_SIZE]);
        rand::rngs::OsRng.fill_bytes(bytes.as_mut_slice());
        Ok(SecretKey {
            bytes,
            created_at_ms: self.clock.now_ms(),
            outdated: false,
            fresh: true,
        })
    }
}

impl std::fmt::Debug for SecurityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quilt_model::MockClock;

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: SecurityManager,
        clock: Arc<MockClock>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = DataDir::new(dir.path());
        let vault = Arc::new(RootKeyVault::new(dir.path()));
        vault.generate_once().unwrap();
        let meta = Arc::new(MetaStore::open(data_dir.meta_db()).unwrap());
        let clock = Arc::new(MockClock::new(1_700_000_000_000));
        let manager = SecurityManager::new(vault, meta, data_dir, clock.clone());
        Fixture {
            _dir: dir,
            manager,
            clock,
        }
    }

    fn tuple() -> StoreTuple {
        StoreTuple::new("0", "app.a", "s1")
    }

    #[test]
    fn test_first_open_generates_and_persists_both_copies() {
        let fx = fixture();
        let secret = fx
            .manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, true)
            .unwrap()
            .unwrap();
        assert!(!secret.is_outdated());

        // Second lookup resolves the meta copy to the same bytes.
        let again = fx
            .manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, true)
            .unwrap()
            .unwrap();
        assert_eq!(secret.as_bytes(), again.as_bytes());

        // File copy exists too.
        let path = fx.manager.secret_file_path(&tuple(), SecurityLevel::De);
        assert!(path.exists());
    }

    #[test]
    fn test_plaintext_open_over_encrypted_store_rejected() {
        let fx = fixture();
        fx.manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, true)
            .unwrap();

        let err = fx
            .manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, false)
            .unwrap_err();
        assert!(matches!(err, KeyError::OptionMismatch));
    }

    #[test]
    fn test_plaintext_store_has_no_secret() {
        let fx = fixture();
        let secret = fx
            .manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, false)
            .unwrap();
        assert!(secret.is_none());
    }

    #[test]
    fn test_meta_loss_recovers_from_file_and_restores_meta() {
        let fx = fixture();
        let original = fx
            .manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, true)
            .unwrap()
            .unwrap();

        // Lose the meta copy.
        let meta_key = secret_key_key(&tuple(), SecretKind::SingleKey);
        fx.manager.meta.delete(&meta_key).unwrap();

        let recovered = fx
            .manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, true)
            .unwrap()
            .unwrap();
        assert_eq!(original.as_bytes(), recovered.as_bytes());
        assert!(fx.manager.meta.get(&meta_key).unwrap().is_some());
    }

    #[test]
    fn test_secret_outdated_after_a_year() {
        let fx = fixture();
        fx.manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, true)
            .unwrap();

        fx.clock.advance(OUTDATED_AFTER_MS + 1);
        let secret = fx
            .manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, true)
            .unwrap()
            .unwrap();
        assert!(secret.is_outdated());
    }

    #[test]
    fn test_rekey_commit_replaces_both_copies() {
        let fx = fixture();
        let old = fx
            .manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, true)
            .unwrap()
            .unwrap();

        let pending = fx
            .manager
            .begin_rekey(&tuple(), SecretKind::SingleKey, SecurityLevel::De)
            .unwrap();
        assert_ne!(old.as_bytes(), pending.secret().as_bytes());
        fx.manager.commit_rekey(pending).unwrap();

        let current = fx
            .manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, true)
            .unwrap()
            .unwrap();
        assert_ne!(old.as_bytes(), current.as_bytes());
    }

    #[test]
    fn test_abandoned_rekey_leaves_old_secret() {
        let fx = fixture();
        let old = fx
            .manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, true)
            .unwrap()
            .unwrap();

        let pending = fx
            .manager
            .begin_rekey(&tuple(), SecretKind::SingleKey, SecurityLevel::De)
            .unwrap();
        drop(pending);

        let current = fx
            .manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, true)
            .unwrap()
            .unwrap();
        assert_eq!(old.as_bytes(), current.as_bytes());
    }

    #[test]
    fn test_del_db_password_removes_both_copies() {
        let fx = fixture();
        fx.manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, true)
            .unwrap();

        fx.manager
            .del_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De)
            .unwrap();

        // A plaintext open now succeeds: nothing persisted remains.
        assert!(fx
            .manager
            .get_db_password(&tuple(), SecretKind::SingleKey, SecurityLevel::De, false)
            .unwrap()
            .is_none());
    }
}
