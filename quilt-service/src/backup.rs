//! Backup snapshots of stores.
//!
//! Snapshots live under `<root>/<level>/quilt/backup/<user>/` with a
//! canonical file name: the hex SHA-256 of `<group>_<app>_<store>`. The
//! recovery coordinator restores from them; a periodic task on the
//! shared executor refreshes them for stores opened with `backup = true`.

use quilt_model::{DataDir, SecurityLevel, StoreTuple};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Weak;
use std::time::Duration;
use tracing::{debug, warn};

/// Fixed group id of this service's stores.
pub const DEFAULT_GROUP_ID: &str = "default";

/// Interval of the periodic backup pass.
pub const BACKUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Canonical backup file name for a store.
pub fn backup_file_name(tuple: &StoreTuple) -> String {
    let mut hasher = Sha256::new();
    hasher.update(DEFAULT_GROUP_ID.as_bytes());
    hasher.update(b"_");
    hasher.update(tuple.app_id.as_str().as_bytes());
    hasher.update(b"_");
    hasher.update(tuple.store_id.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Path helpers over the data-dir layout.
#[derive(Debug, Clone)]
pub struct BackupHandler {
    data_dir: DataDir,
}

impl BackupHandler {
    pub fn new(data_dir: DataDir) -> Self {
        Self { data_dir }
    }

    pub fn backup_path(&self, tuple: &StoreTuple, level: SecurityLevel) -> PathBuf {
        self.data_dir
            .backup_dir(level, &tuple.user_id)
            .join(backup_file_name(tuple))
    }

    /// The snapshot under the descriptor's recorded level, or, when the
    /// level cannot be trusted, under whichever level holds one.
    pub fn find_backup(&self, tuple: &StoreTuple, level: Option<SecurityLevel>) -> Option<PathBuf> {
        let candidates: Vec<SecurityLevel> = match level {
            Some(level) => vec![level],
            None => SecurityLevel::all().to_vec(),
        };
        candidates
            .into_iter()
            .map(|l| self.backup_path(tuple, l))
            .find(|p| p.exists())
    }

    /// Remove the snapshot under both security levels; part of store
    /// deletion, ahead of the data itself.
    pub fn remove_backups(&self, tuple: &StoreTuple) {
        for level in SecurityLevel::all() {
            let path = self.backup_path(tuple, level);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "backup removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "backup removal failed"),
            }
        }
    }
}

/// What the scheduler asks of the registry each pass.
pub trait BackupSource: Send + Sync {
    /// Export a fresh snapshot for every open store with backup enabled.
    fn run_backup_pass(&self);
}

/// Periodic backup task on the shared executor. Stops when the source is
/// dropped.
pub fn spawn_scheduler(
    source: Weak<dyn BackupSource>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fresh service
        // does not back up empty stores.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(source) = source.upgrade() else { break };
            source.run_backup_pass();
        }
        debug!("backup scheduler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple() -> StoreTuple {
        StoreTuple::new("0", "app.a", "s1")
    }

    #[test]
    fn test_backup_name_is_stable_and_per_store() {
        assert_eq!(backup_file_name(&tuple()), backup_file_name(&tuple()));
        assert_ne!(
            backup_file_name(&tuple()),
            backup_file_name(&StoreTuple::new("0", "app.a", "s2"))
        );
    }

    #[test]
    fn test_find_backup_probes_both_levels_when_unsure() {
        let dir = tempfile::tempdir().unwrap();
        let handler = BackupHandler::new(DataDir::new(dir.path()));

        assert!(handler.find_backup(&tuple(), None).is_none());

        let ce_path = handler.backup_path(&tuple(), SecurityLevel::Ce);
        std::fs::create_dir_all(ce_path.parent().unwrap()).unwrap();
        std::fs::write(&ce_path, b"snapshot").unwrap();

        // Recorded level misses, unknown level finds it.
        assert!(handler
            .find_backup(&tuple(), Some(SecurityLevel::De))
            .is_none());
        assert_eq!(handler.find_backup(&tuple(), None).unwrap(), ce_path);
    }

    #[test]
    fn test_remove_backups_clears_both_levels() {
        let dir = tempfile::tempdir().unwrap();
        let handler = BackupHandler::new(DataDir::new(dir.path()));
        for level in SecurityLevel::all() {
            let path = handler.backup_path(&tuple(), level);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"snapshot").unwrap();
        }

        handler.remove_backups(&tuple());
        assert!(handler.find_backup(&tuple(), None).is_none());
    }
}
