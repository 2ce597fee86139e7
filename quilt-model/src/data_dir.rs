//! On-disk layout of the service data root.
//!
//! ```text
//! <root>/<level>/quilt/<user>/<app>/<store>/   store data
//! <root>/<level>/quilt/<user>/<app>/secret/    sealed secret-key files
//! <root>/<level>/quilt/backup/<user>/          backup snapshots
//! <root>/meta/meta.db                          meta store
//! <root>/quilt_root_key                        root-key alias file
//! ```

use crate::options::SecurityLevel;
use crate::types::{AppId, StoreId, UserId};
use std::path::{Path, PathBuf};

const SERVICE_NAME: &str = "quilt";

/// Path layout rooted at the service data directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    base: PathBuf,
}

impl DataDir {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Platform data directory, e.g. `~/.local/share/quilt/` on Linux.
    pub fn default_location() -> Option<Self> {
        dirs::data_dir().map(|d| Self::new(d.join(SERVICE_NAME)))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Per-user root under one security level.
    pub fn user_dir(&self, level: SecurityLevel, user_id: &UserId) -> PathBuf {
        self.base
            .join(level.dir_name())
            .join(SERVICE_NAME)
            .join(user_id.as_str())
    }

    /// Data directory of a single store.
    pub fn store_dir(
        &self,
        level: SecurityLevel,
        user_id: &UserId,
        app_id: &AppId,
        store_id: &StoreId,
    ) -> PathBuf {
        self.user_dir(level, user_id)
            .join(app_id.as_str())
            .join(store_id.as_str())
    }

    /// Directory holding sealed secret-key files for one app.
    pub fn secret_dir(&self, level: SecurityLevel, user_id: &UserId, app_id: &AppId) -> PathBuf {
        self.user_dir(level, user_id)
            .join(app_id.as_str())
            .join("secret")
    }

    /// Backup directory for one user under one security level.
    pub fn backup_dir(&self, level: SecurityLevel, user_id: &UserId) -> PathBuf {
        self.base
            .join(level.dir_name())
            .join(SERVICE_NAME)
            .join("backup")
            .join(user_id.as_str())
    }

    /// The meta store database file.
    pub fn meta_db(&self) -> PathBuf {
        self.base.join("meta").join("meta.db")
    }

    /// The root-key alias file.
    pub fn root_key_alias(&self) -> PathBuf {
        self.base.join("quilt_root_key")
    }

    pub fn ensure_base(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)
    }
}

impl Default for DataDir {
    fn default() -> Self {
        Self::default_location().unwrap_or_else(|| Self::new("./data"))
    }
}
