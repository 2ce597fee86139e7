//! Key management for the quilt data service.
//!
//! Two layers: the process-wide [`RootKeyVault`] (a single symmetric root
//! key behind a fixed alias) and the [`SecurityManager`] (per-store
//! secrets sealed by the root key, persisted twice, rotated yearly).

pub mod key_file;
pub mod manager;
pub mod vault;

pub use key_file::{SealedSecret, SECRET_KEY_SIZE};
pub use manager::{KeyError, PendingRekey, SecretKey, SecurityManager, OUTDATED_AFTER_MS};
pub use vault::{RootKeyVault, VaultError, ROOT_KEY_ALIAS};
