//! Single-version key-value store engine.
//!
//! One redb database per store. When the store is encrypted, values are
//! sealed with the per-store secret and a key-check record written at
//! creation lets later opens reject a wrong key with a crypt error
//! instead of handing out garbage.

use crate::error::StoreError;
use crate::seal::ValueSealer;
use quilt_keys::SecretKey;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

const DATA_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("data");
const STORE_META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("store_meta");

const KEY_CHECK: &str = "key_check";
const DB_FILE: &str = "single.db";

/// An open single-version store.
pub struct SingleStore {
    db: Database,
    sealer: RwLock<Option<ValueSealer>>,
}

impl SingleStore {
    /// Open or create the store under `dir`.
    ///
    /// `secret` must be `Some` exactly when the store is encrypted; the
    /// key-check record enforces it for pre-existing data. A missing
    /// store with `create_if_missing = false` is [`StoreError::NotFound`].
    pub fn open(
        dir: &Path,
        create_if_missing: bool,
        secret: Option<&SecretKey>,
    ) -> Result<Self, StoreError> {
        let db_path = dir.join(DB_FILE);
        let existed = db_path.exists();
        if !existed && !create_if_missing {
            return Err(StoreError::NotFound);
        }
        std::fs::create_dir_all(dir)?;

        let db = Database::create(&db_path).map_err(classify_open_error)?;
        let store = Self {
            db,
            sealer: RwLock::new(match secret {
                Some(s) => Some(ValueSealer::new(s)?),
                None => None,
            }),
        };
        store.check_key(existed)?;
        debug!(path = %db_path.display(), existed, "single store opened");
        Ok(store)
    }

    /// Database file path for a store directory.
    pub fn db_path(dir: &Path) -> PathBuf {
        dir.join(DB_FILE)
    }

    fn check_key(&self, existed: bool) -> Result<(), StoreError> {
        let sealer = self.sealer.read().unwrap_or_else(|e| e.into_inner());

        let read_txn = self.db.begin_read().map_err(StoreError::from)?;
        let stored = match read_txn.open_table(STORE_META_TABLE) {
            Ok(table) => table.get(KEY_CHECK)?.map(|v| v.value().to_vec()),
            // Fresh database: no tables yet.
            Err(redb::TableError::TableDoesNotExist(_)) => None,
            Err(e) => return Err(e.into()),
        };

        match (&*sealer, stored) {
            (Some(sealer), Some(stored)) => sealer.verify_key_check(&stored),
            (Some(sealer), None) => {
                if existed && !self.is_empty()? {
                    return Err(StoreError::Crypt(
                        "encrypted open of a store without key check".into(),
                    ));
                }
                let check = sealer.key_check()?;
                self.put_meta(KEY_CHECK, &check)
            }
            (None, Some(_)) => Err(StoreError::Crypt(
                "plaintext open of an encrypted store".into(),
            )),
            (None, None) => Ok(()),
        }
    }

    fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(STORE_META_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let sealer = self.sealer.read().unwrap_or_else(|e| e.into_inner());
        let stored = match &*sealer {
            Some(s) => s.seal(value)?,
            None => value.to_vec(),
        };
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DATA_TABLE)?;
            table.insert(key, stored.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let sealer = self.sealer.read().unwrap_or_else(|e| e.into_inner());
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(DATA_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(stored) = table.get(key)? else {
            return Ok(None);
        };
        match &*sealer {
            Some(s) => Ok(Some(s.unseal(stored.value())?.to_vec())),
            None => Ok(Some(stored.value().to_vec())),
        }
    }

    pub fn delete(&self, key: &[u8]) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        let removed;
        {
            let mut table = write_txn.open_table(DATA_TABLE)?;
            removed = table.remove(key)?.is_some();
        }
        write_txn.commit()?;
        Ok(removed)
    }

    /// All entries in key order, values unsealed.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let sealer = self.sealer.read().unwrap_or_else(|e| e.into_inner());
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(DATA_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for result in table.iter()? {
            let (k, v) = result?;
            let value = match &*sealer {
                Some(s) => s.unseal(v.value())?.to_vec(),
                None => v.value().to_vec(),
            };
            out.push((k.value().to_vec(), value));
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        use redb::ReadableTableMetadata;
        let read_txn = self.db.begin_read()?;
        match read_txn.open_table(DATA_TABLE) {
            Ok(t) => Ok(t.len()?),
            Err(redb::TableError::TableDoesNotExist(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.count()? == 0)
    }

    /// Re-encrypt every value and the key-check record with a new secret.
    /// The store stays readable under the old secret until the commit.
    pub fn rekey(&self, new_secret: &SecretKey) -> Result<(), StoreError> {
        let new_sealer = ValueSealer::new(new_secret)?;
        let mut sealer = self.sealer.write().unwrap_or_else(|e| e.into_inner());
        let old_sealer = sealer
            .as_ref()
            .ok_or_else(|| StoreError::Crypt("rekey of a plaintext store".into()))?
            .clone();

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DATA_TABLE)?;
            let keys: Vec<Vec<u8>> = table
                .iter()?
                .map(|r| r.map(|(k, _)| k.value().to_vec()))
                .collect::<Result<_, _>>()?;
            for key in keys {
                let stored = table
                    .get(key.as_slice())?
                    .map(|v| v.value().to_vec())
                    .unwrap_or_default();
                let plain = old_sealer.unseal(&stored)?;
                let resealed = new_sealer.seal(&plain)?;
                table.insert(key.as_slice(), resealed.as_slice())?;
            }
            let mut meta = write_txn.open_table(STORE_META_TABLE)?;
            meta.insert(KEY_CHECK, new_sealer.key_check()?.as_slice())?;
        }
        write_txn.commit()?;

        *sealer = Some(new_sealer);
        Ok(())
    }

    /// Snapshot every record into a fresh database at `dest`, replacing
    /// any previous snapshot. Sealed values stay sealed.
    pub fn export(&self, dest: &Path) -> Result<(), StoreError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = dest.with_extension("bak.tmp");
        let _ = std::fs::remove_file(&tmp);
        {
            let backup = Database::create(&tmp)?;
            let write_txn = backup.begin_write()?;
            {
                let mut data = write_txn.open_table(DATA_TABLE)?;
                let mut meta = write_txn.open_table(STORE_META_TABLE)?;

                let read_txn = self.db.begin_read()?;
                if let Ok(table) = read_txn.open_table(DATA_TABLE) {
                    for result in table.iter()? {
                        let (k, v) = result?;
                        data.insert(k.value(), v.value())?;
                    }
                }
                if let Ok(table) = read_txn.open_table(STORE_META_TABLE) {
                    for result in table.iter()? {
                        let (k, v) = result?;
                        meta.insert(k.value(), v.value())?;
                    }
                }
            }
            write_txn.commit()?;
        }
        std::fs::rename(&tmp, dest)?;
        Ok(())
    }

    /// Replace this store's contents with a snapshot written by
    /// [`export`](Self::export). The snapshot's key check must match the
    /// current secret, otherwise the import fails with a crypt error.
    pub fn import(&self, src: &Path) -> Result<u64, StoreError> {
        let backup = Database::open(src).map_err(classify_open_error)?;
        let read_txn = backup.begin_read()?;

        let sealer = self.sealer.read().unwrap_or_else(|e| e.into_inner());
        if let Some(sealer) = &*sealer {
            let check = match read_txn.open_table(STORE_META_TABLE) {
                Ok(t) => t.get(KEY_CHECK)?.map(|v| v.value().to_vec()),
                Err(_) => None,
            };
            let check =
                check.ok_or_else(|| StoreError::Crypt("backup has no key check".into()))?;
            sealer.verify_key_check(&check)?;
        }

        let mut imported = 0u64;
        let write_txn = self.db.begin_write()?;
        {
            let mut data = write_txn.open_table(DATA_TABLE)?;
            // Clear whatever survived the damage.
            let stale: Vec<Vec<u8>> = data
                .iter()?
                .map(|r| r.map(|(k, _)| k.value().to_vec()))
                .collect::<Result<_, _>>()?;
            for key in stale {
                data.remove(key.as_slice())?;
            }
            if let Ok(table) = read_txn.open_table(DATA_TABLE) {
                for result in table.iter()? {
                    let (k, v) = result?;
                    data.insert(k.value(), v.value())?;
                    imported += 1;
                }
            }
        }
        write_txn.commit()?;
        debug!(imported, "store imported from backup");
        Ok(imported)
    }
}

impl std::fmt::Debug for SingleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleStore").finish_non_exhaustive()
    }
}

/// An unreadable database file is a crypt-class failure: the recovery
/// coordinator decides whether a backup can rebuild it.
fn classify_open_error(e: redb::DatabaseError) -> StoreError {
    match e {
        redb::DatabaseError::Storage(redb::StorageError::Corrupted(msg)) => {
            warn!(error = %msg, "database corrupted");
            StoreError::Crypt(msg)
        }
        other => StoreError::Database(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quilt_keys::{RootKeyVault, SecurityManager};
    use quilt_meta::keys::SecretKind;
    use quilt_meta::MetaStore;
    use quilt_model::{DataDir, MockClock, SecurityLevel, StoreTuple};
    use std::sync::Arc;

    fn secret_for(dir: &Path, store: &str) -> SecretKey {
        let data_dir = DataDir::new(dir);
        let vault = Arc::new(RootKeyVault::new(dir));
        vault.generate_once().unwrap();
        let meta = Arc::new(MetaStore::open(dir.join(format!("{store}-meta.db"))).unwrap());
        let manager = SecurityManager::new(
            vault,
            meta,
            data_dir,
            Arc::new(MockClock::new(1_700_000_000_000)),
        );
        manager
            .get_db_password(
                &StoreTuple::new("0", "app.a", store),
                SecretKind::SingleKey,
                SecurityLevel::De,
                true,
            )
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_plaintext_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = SingleStore::open(dir.path(), true, None).unwrap();
        store.put(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(store.delete(b"k").unwrap());
        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_missing_store_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let err = SingleStore::open(&dir.path().join("absent"), false, None).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn test_encrypted_values_are_sealed_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let secret = secret_for(dir.path(), "s1");
        let store_dir = dir.path().join("store");
        let store = SingleStore::open(&store_dir, true, Some(&secret)).unwrap();
        store.put(b"k", b"plaintext-value").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"plaintext-value".to_vec()));
        drop(store);

        let raw = std::fs::read(SingleStore::db_path(&store_dir)).unwrap();
        assert!(!raw
            .windows(b"plaintext-value".len())
            .any(|w| w == b"plaintext-value"));
    }

    #[test]
    fn test_wrong_secret_fails_key_check() {
        let dir = tempfile::tempdir().unwrap();
        let secret = secret_for(dir.path(), "s1");
        let other = secret_for(dir.path(), "s2");
        let store_dir = dir.path().join("store");
        {
            let store = SingleStore::open(&store_dir, true, Some(&secret)).unwrap();
            store.put(b"k", b"v").unwrap();
        }

        let err = SingleStore::open(&store_dir, true, Some(&other)).unwrap_err();
        assert!(matches!(err, StoreError::Crypt(_)));
    }

    #[test]
    fn test_plaintext_open_of_encrypted_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let secret = secret_for(dir.path(), "s1");
        let store_dir = dir.path().join("store");
        drop(SingleStore::open(&store_dir, true, Some(&secret)).unwrap());

        let err = SingleStore::open(&store_dir, true, None).unwrap_err();
        assert!(matches!(err, StoreError::Crypt(_)));
    }

    #[test]
    fn test_rekey_invalidates_old_secret() {
        let dir = tempfile::tempdir().unwrap();
        let old = secret_for(dir.path(), "s1");
        let new = secret_for(dir.path(), "s2");
        let store_dir = dir.path().join("store");
        {
            let store = SingleStore::open(&store_dir, true, Some(&old)).unwrap();
            store.put(b"k", b"v").unwrap();
            store.rekey(&new).unwrap();
            // Still readable through the live handle.
            assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        }

        assert!(matches!(
            SingleStore::open(&store_dir, true, Some(&old)).unwrap_err(),
            StoreError::Crypt(_)
        ));
        let reopened = SingleStore::open(&store_dir, true, Some(&new)).unwrap();
        assert_eq!(reopened.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_export_import_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("store");
        let backup = dir.path().join("backup").join("snap");
        let store = SingleStore::open(&store_dir, true, None).unwrap();
        for i in 0..10u8 {
            store.put(&[i], &[i, i]).unwrap();
        }
        store.export(&backup).unwrap();

        store.put(b"extra", b"gone-after-import").unwrap();
        let imported = store.import(&backup).unwrap();
        assert_eq!(imported, 10);
        assert_eq!(store.count().unwrap(), 10);
        assert_eq!(store.get(b"extra").unwrap(), None);
    }

    #[test]
    fn test_corrupted_file_classified_as_crypt() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("store");
        drop(SingleStore::open(&store_dir, true, None).unwrap());

        std::fs::write(SingleStore::db_path(&store_dir), b"garbage".repeat(128)).unwrap();
        let err = SingleStore::open(&store_dir, true, None).unwrap_err();
        assert!(matches!(err, StoreError::Crypt(_)));
    }
}
