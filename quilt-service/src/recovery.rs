//! Recovery coordinator.
//!
//! Entered only when an open fails with a crypt-class error. The ladder:
//! purge a freshly created secret (failed creation), retry under the
//! authoritative file-side secret, and finally rebuild in place from the
//! backup snapshot.

use crate::backup::BackupHandler;
use crate::bucket::StoreBackend;
use crate::registry::{key_status, open_backend, secret_kind, store_status};
use quilt_keys::{SecretKey, SecurityManager};
use quilt_model::{Clock, Options, Status, StoreMeta, StoreTuple};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) struct RecoveryContext<'a> {
    pub keys: &'a SecurityManager,
    pub backup: &'a BackupHandler,
    /// Security level read back from the persisted descriptor, when
    /// trustworthy.
    pub recorded_meta: Option<StoreMeta>,
    pub clock: Arc<dyn Clock>,
}

/// Try to produce a usable backend after a crypt-class open failure.
/// `recovered = true` means the store was rebuilt from backup.
pub(crate) fn recover_open(
    ctx: &RecoveryContext<'_>,
    tuple: &StoreTuple,
    options: &Options,
    dir: &Path,
    secret: Option<&SecretKey>,
) -> Result<(StoreBackend, bool), Status> {
    let kind = secret_kind(options.kind);

    // A secret generated by this very open means the creation itself
    // failed; leave no orphan key behind.
    if options.encrypt && secret.map(SecretKey::is_fresh) == Some(true) {
        warn!(store = %tuple, "encrypted create failed, purging fresh secret");
        let _ = ctx
            .keys
            .del_db_password(tuple, kind, options.security_level);
        return Err(Status::Error);
    }

    // The file-side copy is authoritative after a disagreement.
    let file_secret = if options.encrypt {
        ctx.keys
            .recover_from_file(tuple, kind, options.security_level)
            .map_err(key_status)?
    } else {
        None
    };
    if let Some(file_secret) = &file_secret {
        match open_backend(dir, options, Some(file_secret), Arc::clone(&ctx.clock)) {
            Ok(backend) => {
                info!(store = %tuple, "open recovered via file-side secret");
                if file_secret.is_outdated() {
                    rekey_after_recovery(ctx, tuple, options, &backend);
                }
                return Ok((backend, false));
            }
            Err(e) => warn!(store = %tuple, error = %e, "retry under file-side secret failed"),
        }
    }

    // Without a backup snapshot there is nothing left to rebuild from.
    let recorded_level = ctx.recorded_meta.as_ref().map(|m| m.security_level);
    let Some(backup_path) = ctx.backup.find_backup(tuple, recorded_level) else {
        warn!(store = %tuple, "no backup snapshot, store unrecoverable");
        return Err(Status::CryptError);
    };

    // Rebuild in place: drop the damaged database, open empty, import.
    if dir.exists() {
        std::fs::remove_dir_all(dir).map_err(|_| Status::DbError)?;
    }
    let mut create_options = options.clone();
    create_options.create_if_missing = true;
    let effective_secret = file_secret.as_ref().or(secret);
    let backend = open_backend(
        dir,
        &create_options,
        effective_secret,
        Arc::clone(&ctx.clock),
    )
    .map_err(store_status)?;

    match backend.import(&backup_path) {
        Ok(()) => {
            info!(store = %tuple, backup = %backup_path.display(), "store recovered from backup");
            Ok((backend, true))
        }
        Err(e) => {
            warn!(store = %tuple, error = %e, "backup import failed");
            Err(Status::RecoverFailed)
        }
    }
}

fn rekey_after_recovery(
    ctx: &RecoveryContext<'_>,
    tuple: &StoreTuple,
    options: &Options,
    backend: &StoreBackend,
) {
    let kind = secret_kind(options.kind);
    let rotated = ctx
        .keys
        .begin_rekey(tuple, kind, options.security_level)
        .and_then(|pending| {
            backend
                .rekey(pending.secret())
                .map_err(|_| quilt_keys::KeyError::Unrecoverable)?;
            ctx.keys.commit_rekey(pending)
        });
    if let Err(e) = rotated {
        warn!(store = %tuple, error = %e, "re-key after recovery failed, old secret stays usable");
    }
}
