//! StoreRegistry - locates, opens, closes, and deletes stores on behalf
//! of authenticated callers.
//!
//! The registry's global lock only resolves a user's bucket; every store
//! operation then runs under that bucket's own lock. Secret resolution
//! and option checks serialize on the account mutex, and account
//! add/remove processing gates the mutating surface with
//! `SystemAccountEventProcessing`.

use crate::account::{AccountDelegate, AccountEvent};
use crate::backup::{BackupHandler, BackupSource};
use crate::bucket::{StoreBackend, StoreHandle, UserBucket};
use crate::checker::Checker;
use crate::recovery::{recover_open, RecoveryContext};
use quilt_keys::{KeyError, SecretKey, SecurityManager};
use quilt_meta::keys::{
    store_meta_app_prefix, store_meta_key, store_meta_prefix, strategy_meta_key, SecretKind,
};
use quilt_meta::{ChangeEvent, ChangeFlag, MetaStore};
use quilt_model::{
    AppId, Clock, DataDir, DeviceId, Options, SecurityLevel, Status, StoreId, StoreKind, StoreMeta,
    StoreTuple, StrategyMeta, UserId,
};
use quilt_store::{RelationalStore, SingleStore, StoreError};
use quilt_sync::{Syncer, Transport};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const HARMONY_APP: &str = "harmony";

/// Result of a successful open.
pub struct OpenedStore {
    pub handle: Arc<StoreHandle>,
    /// The store was rebuilt from a backup snapshot on the way in; the
    /// caller-facing surface reports `RecoverSuccess` for it.
    pub recovered: bool,
}

impl std::fmt::Debug for OpenedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedStore")
            .field("recovered", &self.recovered)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountState {
    Idle,
    Processing,
}

pub struct StoreRegistry {
    data_dir: DataDir,
    meta: Arc<MetaStore>,
    keys: Arc<SecurityManager>,
    checker: Arc<dyn Checker>,
    account: Arc<dyn AccountDelegate>,
    transport: Arc<dyn Transport>,
    backup: BackupHandler,
    clock: Arc<dyn Clock>,
    local_device: DeviceId,
    buckets: Mutex<HashMap<UserId, Arc<UserBucket>>>,
    /// Serializes secret resolution and option checks per the open
    /// contract.
    account_mutex: Mutex<()>,
    account_state: Mutex<AccountState>,
}

impl StoreRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data_dir: DataDir,
        meta: Arc<MetaStore>,
        keys: Arc<SecurityManager>,
        checker: Arc<dyn Checker>,
        account: Arc<dyn AccountDelegate>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        local_device: DeviceId,
    ) -> Self {
        Self {
            backup: BackupHandler::new(data_dir.clone()),
            data_dir,
            meta,
            keys,
            checker,
            account,
            transport,
            clock,
            local_device,
            buckets: Mutex::new(HashMap::new()),
            account_mutex: Mutex::new(()),
            account_state: Mutex::new(AccountState::Idle),
        }
    }

    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    pub fn keys(&self) -> &Arc<SecurityManager> {
        &self.keys
    }

    pub fn backup_handler(&self) -> &BackupHandler {
        &self.backup
    }

    pub fn local_device(&self) -> &DeviceId {
        &self.local_device
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn gate(&self) -> Result<(), Status> {
        let state = self
            .account_state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *state == AccountState::Processing {
            return Err(Status::SystemAccountEventProcessing);
        }
        Ok(())
    }

    /// Resolve the bucket under the global lock, creating it on first
    /// use; the caller then works against the bucket's own lock.
    fn bucket_for(&self, user_id: &UserId) -> Arc<UserBucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            buckets
                .entry(user_id.clone())
                .or_insert_with(|| Arc::new(UserBucket::new(user_id.clone()))),
        )
    }

    fn existing_bucket(&self, user_id: &UserId) -> Option<Arc<UserBucket>> {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.get(user_id).cloned()
    }

    fn resolve_caller(&self, uid: u32, app_id: &AppId) -> Result<(UserId, String), Status> {
        let true_app = self
            .checker
            .get_app_id(uid, app_id.as_str())
            .ok_or_else(|| {
                warn!(app = %app_id, uid, "checker rejected caller");
                Status::PermissionDenied
            })?;
        Ok((self.account.get_device_account_id(uid), true_app))
    }

    fn read_store_meta(&self, tuple: &StoreTuple) -> Result<Option<StoreMeta>, Status> {
        let key = store_meta_key(&self.local_device, tuple);
        let Some(bytes) = self.meta.get(&key).map_err(|_| Status::DbError)? else {
            return Ok(None);
        };
        match StoreMeta::from_json(&bytes) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!(store = %tuple, error = %e, "store meta record unreadable");
                Ok(None)
            }
        }
    }

    /// Options must agree with what meta recorded for the store.
    fn check_options(&self, tuple: &StoreTuple, options: &Options) -> Result<(), Status> {
        let Some(meta) = self.read_store_meta(tuple)? else {
            return Ok(());
        };
        if meta.encrypted != options.encrypt {
            warn!(store = %tuple, "encrypt option does not match meta");
            return Err(Status::InvalidArgument);
        }
        if meta.kind != options.kind && meta.version != 0 {
            warn!(store = %tuple, "store kind does not match meta");
            return Err(Status::InvalidArgument);
        }
        Ok(())
    }

    /// Open (or create) the store identified by the caller's triple.
    pub fn open_store(
        &self,
        uid: u32,
        app_id: &AppId,
        store_id: &StoreId,
        options: &Options,
    ) -> Result<OpenedStore, Status> {
        if !app_id.is_valid() || !store_id.is_valid() {
            return Err(Status::InvalidArgument);
        }
        if !options.is_supported_kind() {
            warn!(app = %app_id, store = %store_id, "multi-version store requested");
            return Err(Status::NotSupported);
        }
        self.gate()?;
        let (user_id, _true_app) = self.resolve_caller(uid, app_id)?;
        let tuple = StoreTuple::new(user_id.clone(), app_id.clone(), store_id.clone());

        let secret = {
            let _account = self
                .account_mutex
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            self.check_options(&tuple, options)?;
            self.keys
                .get_db_password(
                    &tuple,
                    secret_kind(options.kind),
                    options.security_level,
                    options.encrypt,
                )
                .map_err(key_status)?
        };

        let bucket = self.bucket_for(&user_id);
        let (handle, recovered) = bucket.open_with(app_id, store_id, || {
            self.do_open(&tuple, options, secret.as_ref())
        })?;

        let record = StoreMeta::from_open(
            &tuple,
            options,
            self.local_device.clone(),
            handle.data_dir().display().to_string(),
        );
        if self
            .meta
            .put(&store_meta_key(&self.local_device, &tuple), &record.to_json())
            .is_err()
        {
            warn!(store = %tuple, "failed to write store meta, closing");
            let _ = bucket.close(app_id, store_id);
            return Err(Status::DbError);
        }

        debug!(store = %tuple, recovered, "store opened");
        Ok(OpenedStore { handle, recovered })
    }

    fn do_open(
        &self,
        tuple: &StoreTuple,
        options: &Options,
        secret: Option<&SecretKey>,
    ) -> Result<(Arc<StoreHandle>, bool), Status> {
        let dir = self.data_dir.store_dir(
            options.security_level,
            &tuple.user_id,
            &tuple.app_id,
            &tuple.store_id,
        );

        let (backend, recovered) =
            match open_backend(&dir, options, secret, Arc::clone(&self.clock)) {
                Ok(backend) => (backend, false),
                Err(StoreError::Crypt(reason)) => {
                    warn!(store = %tuple, reason, "open failed with crypt error, recovering");
                    let ctx = RecoveryContext {
                        keys: &self.keys,
                        backup: &self.backup,
                        recorded_meta: self.read_store_meta(tuple)?,
                        clock: Arc::clone(&self.clock),
                    };
                    recover_open(&ctx, tuple, options, &dir, secret)?
                }
                Err(StoreError::NotFound) => return Err(Status::StoreNotOpen),
                Err(first) => {
                    // One retry before a storage failure is surfaced.
                    warn!(store = %tuple, error = %first, "open failed, retrying once");
                    match open_backend(&dir, options, secret, Arc::clone(&self.clock)) {
                        Ok(backend) => (backend, false),
                        Err(e) => return Err(store_status(e)),
                    }
                }
            };

        // An outdated secret rotates before the handle is handed out.
        if !recovered {
            if let Some(secret) = secret {
                if secret.is_outdated() {
                    self.rekey_backend(tuple, options, &backend)?;
                }
            }
        }

        let syncer = self.make_syncer(tuple, options);
        let handle = Arc::new(StoreHandle::new(
            tuple.clone(),
            options.clone(),
            backend,
            syncer,
            dir,
        ));
        Ok((handle, recovered))
    }

    fn rekey_backend(
        &self,
        tuple: &StoreTuple,
        options: &Options,
        backend: &StoreBackend,
    ) -> Result<(), Status> {
        info!(store = %tuple, "rotating outdated store secret");
        let pending = self
            .keys
            .begin_rekey(tuple, secret_kind(options.kind), options.security_level)
            .map_err(key_status)?;
        backend.rekey(pending.secret()).map_err(store_status)?;
        self.keys.commit_rekey(pending).map_err(key_status)?;
        Ok(())
    }

    fn make_syncer(&self, tuple: &StoreTuple, options: &Options) -> Arc<Syncer> {
        let label = format!("{tuple}");
        let syncer = Arc::new(Syncer::new(label));
        syncer.set_auto_sync(options.auto_sync);
        if let Err(e) = syncer.initialize(Arc::clone(&self.transport)) {
            // The store stays usable; sync reports NotInit until a
            // transport shows up on a later open.
            warn!(store = %tuple, error = %e, "sync engine not initialized");
        }
        syncer
    }

    /// Drop one caller reference to a store.
    pub fn close_store(&self, uid: u32, app_id: &AppId, store_id: &StoreId) -> Result<(), Status> {
        if !app_id.is_valid() || !store_id.is_valid() {
            return Err(Status::InvalidArgument);
        }
        let (user_id, _) = self.resolve_caller(uid, app_id)?;
        let bucket = self
            .existing_bucket(&user_id)
            .ok_or(Status::StoreNotOpen)?;
        bucket.close(app_id, store_id)
    }

    /// Close every store the app holds open for the calling user.
    pub fn close_all_stores(&self, uid: u32, app_id: &AppId) -> Result<(), Status> {
        if !app_id.is_valid() {
            return Err(Status::InvalidArgument);
        }
        let (user_id, _) = self.resolve_caller(uid, app_id)?;
        let bucket = self
            .existing_bucket(&user_id)
            .ok_or(Status::StoreNotOpen)?;
        bucket.close_all(app_id)
    }

    /// Delete a store and everything recorded about it, in the order
    /// backup → close → data → meta → secret → strategy.
    pub fn delete_store(&self, uid: u32, app_id: &AppId, store_id: &StoreId) -> Result<(), Status> {
        if !app_id.is_valid() || !store_id.is_valid() {
            return Err(Status::InvalidArgument);
        }
        if !self.checker.is_valid(uid, app_id.as_str()) {
            return Err(Status::PermissionDenied);
        }
        let user_id = self.account.get_device_account_id(uid);
        let tuple = StoreTuple::new(user_id, app_id.clone(), store_id.clone());
        self.delete_store_internal(&tuple)
    }

    /// Deletion path shared with the meta watcher and account removal;
    /// bypasses the checker.
    fn delete_store_internal(&self, tuple: &StoreTuple) -> Result<(), Status> {
        self.backup.remove_backups(tuple);

        if let Some(bucket) = self.existing_bucket(&tuple.user_id) {
            bucket.remove(&tuple.app_id, &tuple.store_id);
        }

        for level in SecurityLevel::all() {
            let dir = self
                .data_dir
                .store_dir(level, &tuple.user_id, &tuple.app_id, &tuple.store_id);
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!(path = %dir.display(), "store data removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "store data removal failed");
                    return Err(Status::DbError);
                }
            }
        }

        self.meta
            .delete(&store_meta_key(&self.local_device, tuple))
            .map_err(|_| Status::DbError)?;
        for kind in [SecretKind::SingleKey, SecretKind::Key] {
            for level in SecurityLevel::all() {
                let _ = self.keys.del_db_password(tuple, kind, level);
            }
        }
        let _ = self.meta.delete(&strategy_meta_key(&self.local_device, tuple));

        info!(store = %tuple, "store deleted");
        Ok(())
    }

    /// Delete every store of one app for the calling user.
    pub fn delete_all_stores(&self, uid: u32, app_id: &AppId) -> Result<(), Status> {
        let store_ids = self.get_all_store_ids(uid, app_id)?;
        for store_id in store_ids {
            self.delete_store(uid, app_id, &store_id)?;
        }
        Ok(())
    }

    /// Store ids recorded in meta for `(caller's user, app)` on this
    /// device.
    pub fn get_all_store_ids(&self, uid: u32, app_id: &AppId) -> Result<Vec<StoreId>, Status> {
        if !app_id.is_valid() {
            return Err(Status::InvalidArgument);
        }
        let user_id = self.account.get_device_account_id(uid);
        let prefix =
            store_meta_app_prefix(&self.local_device, user_id.as_str(), app_id.as_str());
        let rows = self.meta.scan(&prefix).map_err(|_| Status::DbError)?;
        Ok(rows
            .iter()
            .filter_map(|(_, value)| StoreMeta::from_json(value).ok())
            .map(|meta| meta.store_id)
            .collect())
    }

    /// Death of a client process: close everything it held open. The
    /// death registry has already dropped its observer and permission
    /// listeners.
    pub fn on_client_death(&self, app_id: &AppId, uid: u32) {
        info!(app = %app_id, uid, "client died, closing its stores");
        let _ = self.close_all_stores(uid, app_id);
    }

    pub fn is_store_opened(&self, user_id: &UserId, app_id: &AppId, store_id: &StoreId) -> bool {
        self.existing_bucket(user_id)
            .map(|b| b.is_open(app_id, store_id))
            .unwrap_or(false)
    }

    /// Sync activation policy: only the foreground user's copy of a
    /// store syncs, and only if no other user holds it open.
    pub fn check_sync_activation(
        &self,
        user_id: &UserId,
        app_id: &AppId,
        store_id: &StoreId,
    ) -> bool {
        if *user_id != self.account.get_current_account_id() {
            debug!(user = %user_id, "store not in active user");
            return false;
        }
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        for (other, bucket) in buckets.iter() {
            if other != user_id && bucket.is_open(app_id, store_id) {
                debug!(user = %other, "store already opened by another user");
                return false;
            }
        }
        true
    }

    /// Translate an OS account event into registry actions.
    pub fn on_account_event(&self, event: &AccountEvent) {
        match event {
            AccountEvent::Removed { user_id } => {
                info!(user = %user_id, "account removed, tearing down its stores");
                {
                    let mut state = self
                        .account_state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    *state = AccountState::Processing;
                }

                let bucket = {
                    let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
                    buckets.remove(user_id)
                };
                if let Some(bucket) = &bucket {
                    bucket.remove_all();
                }

                // Every store meta records, not just the open ones.
                let prefix_rows: Vec<StoreTuple> = {
                    let mut prefix = store_meta_prefix();
                    prefix.extend_from_slice(self.local_device.as_str().as_bytes());
                    prefix.push(b':');
                    prefix.extend_from_slice(user_id.as_str().as_bytes());
                    prefix.push(b':');
                    self.meta
                        .scan(&prefix)
                        .unwrap_or_default()
                        .iter()
                        .filter_map(|(_, value)| StoreMeta::from_json(value).ok())
                        .map(|meta| meta.tuple())
                        .collect()
                };
                for tuple in prefix_rows {
                    let _ = self.delete_store_internal(&tuple);
                }

                for level in SecurityLevel::all() {
                    let dir = self.data_dir.user_dir(level, user_id);
                    if let Err(e) = std::fs::remove_dir_all(&dir) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(path = %dir.display(), error = %e, "user dir removal failed");
                        }
                    }
                }

                let mut state = self
                    .account_state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                *state = AccountState::Idle;
            }
            AccountEvent::Switched { user_id } => {
                info!(user = %user_id, "account switched, re-evaluating sync bindings");
                let buckets: Vec<Arc<UserBucket>> = {
                    let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
                    buckets.values().cloned().collect()
                };
                for bucket in buckets {
                    let active_user = bucket.user_id() == user_id;
                    for handle in bucket.open_handles() {
                        handle
                            .syncer()
                            .set_auto_sync(active_user && handle.options().auto_sync);
                    }
                }
            }
        }
    }

    /// Whether a descriptor record exists on this device.
    pub fn has_store_meta(&self, tuple: &StoreTuple) -> bool {
        matches!(self.read_store_meta(tuple), Ok(Some(_)))
    }

    /// The live handle for a caller's store, if open.
    pub fn handle_for(
        &self,
        uid: u32,
        app_id: &AppId,
        store_id: &StoreId,
    ) -> Result<Arc<StoreHandle>, Status> {
        let (user_id, _) = self.resolve_caller(uid, app_id)?;
        self.existing_bucket(&user_id)
            .and_then(|b| b.get(app_id, store_id))
            .ok_or(Status::StoreNotOpen)
    }

    /// Pre-creation validation: caller identity plus option/meta
    /// agreement, without opening anything.
    pub fn check_before_create(
        &self,
        uid: u32,
        app_id: &AppId,
        store_id: &StoreId,
        options: &Options,
    ) -> Result<(), Status> {
        if !app_id.is_valid() || !store_id.is_valid() {
            return Err(Status::InvalidArgument);
        }
        if !options.is_supported_kind() {
            return Err(Status::NotSupported);
        }
        self.gate()?;
        let (user_id, _) = self.resolve_caller(uid, app_id)?;
        let tuple = StoreTuple::new(user_id, app_id.clone(), store_id.clone());
        let _account = self
            .account_mutex
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        self.check_options(&tuple, options)
    }

    /// Publish the descriptor record for a store created by a client-side
    /// engine.
    pub fn publish_store_meta(
        &self,
        uid: u32,
        app_id: &AppId,
        store_id: &StoreId,
        options: &Options,
    ) -> Result<(), Status> {
        let (user_id, _) = self.resolve_caller(uid, app_id)?;
        let tuple = StoreTuple::new(user_id, app_id.clone(), store_id.clone());
        let dir = self.data_dir.store_dir(
            options.security_level,
            &tuple.user_id,
            &tuple.app_id,
            &tuple.store_id,
        );
        let record = StoreMeta::from_open(
            &tuple,
            options,
            self.local_device.clone(),
            dir.display().to_string(),
        );
        self.meta
            .put(&store_meta_key(&self.local_device, &tuple), &record.to_json())
            .map_err(|_| Status::DbError)
    }

    /// Record a store's capability strategy.
    pub fn set_strategy_meta(&self, tuple: &StoreTuple, strategy: &StrategyMeta) -> Result<(), Status> {
        self.meta
            .put(
                &strategy_meta_key(&self.local_device, tuple),
                &strategy.to_json(),
            )
            .map_err(|_| Status::DbError)
    }

    pub fn get_strategy_meta(&self, tuple: &StoreTuple) -> Result<Option<StrategyMeta>, Status> {
        let bytes = self
            .meta
            .get(&strategy_meta_key(&self.local_device, tuple))
            .map_err(|_| Status::DbError)?;
        Ok(bytes.and_then(|b| StrategyMeta::from_json(&b).ok()))
    }

    /// Subscribe to store-meta changes: a local-device update carrying
    /// `is_dirty` for a harmony app means a peer asked for this replica
    /// to go away.
    pub fn start_meta_watcher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.meta.subscribe(
            store_meta_prefix(),
            Arc::new(move |event: &ChangeEvent| {
                if event.flag != ChangeFlag::Update {
                    return;
                }
                let Ok(meta) = StoreMeta::from_json(&event.value) else {
                    return;
                };
                let Some(registry) = weak.upgrade() else { return };
                if meta.device_id.as_str().is_empty()
                    || meta.device_id != registry.local_device
                {
                    return;
                }
                if !meta.is_dirty || meta.app_type != HARMONY_APP {
                    return;
                }
                info!(store = %meta.tuple(), "dirty store meta observed, deleting replica");
                let tuple = meta.tuple();
                if let Some(bucket) = registry.existing_bucket(&tuple.user_id) {
                    let _ = bucket.close(&tuple.app_id, &tuple.store_id);
                }
                let _ = registry.delete_store_internal(&tuple);
            }),
        );
    }

    /// Human-readable report of buckets and open stores.
    pub fn dump(&self) -> String {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = String::new();
        let _ = writeln!(out, "user buckets: {}", buckets.len());
        for (user, bucket) in buckets.iter() {
            let _ = writeln!(out, "  user {user}: {} stores", bucket.len());
            for handle in bucket.open_handles() {
                let _ = writeln!(
                    out,
                    "    {} kind={:?} refs={}",
                    handle.tuple(),
                    handle.options().kind,
                    handle.open_count()
                );
            }
        }
        out
    }
}

impl BackupSource for StoreRegistry {
    fn run_backup_pass(&self) {
        let buckets: Vec<Arc<UserBucket>> = {
            let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
            buckets.values().cloned().collect()
        };
        for bucket in buckets {
            for handle in bucket.open_handles() {
                if !handle.options().backup {
                    continue;
                }
                let path = self
                    .backup
                    .backup_path(handle.tuple(), handle.options().security_level);
                match handle.backend().export(&path) {
                    Ok(()) => debug!(store = %handle.tuple(), "backup refreshed"),
                    Err(e) => warn!(store = %handle.tuple(), error = %e, "backup failed"),
                }
            }
        }
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("device", &self.local_device)
            .finish_non_exhaustive()
    }
}

/// Which sealed-secret slot a store kind uses.
pub(crate) fn secret_kind(kind: StoreKind) -> SecretKind {
    match kind {
        StoreKind::Relational => SecretKind::Key,
        _ => SecretKind::SingleKey,
    }
}

pub(crate) fn open_backend(
    dir: &Path,
    options: &Options,
    secret: Option<&SecretKey>,
    clock: Arc<dyn Clock>,
) -> Result<StoreBackend, StoreError> {
    match options.kind {
        StoreKind::Relational => {
            RelationalStore::open(dir, options.create_if_missing, secret, clock)
                .map(|s| StoreBackend::Relational(Arc::new(s)))
        }
        _ => SingleStore::open(dir, options.create_if_missing, secret)
            .map(|s| StoreBackend::Single(Arc::new(s))),
    }
}

pub(crate) fn store_status(e: StoreError) -> Status {
    match e {
        StoreError::Crypt(_) => Status::CryptError,
        StoreError::NotFound => Status::StoreNotOpen,
        StoreError::Busy => Status::Busy,
        _ => Status::DbError,
    }
}

pub(crate) fn key_status(e: KeyError) -> Status {
    match e {
        KeyError::OptionMismatch => Status::InvalidArgument,
        KeyError::Unrecoverable | KeyError::Vault(_) => Status::CryptError,
        _ => Status::DbError,
    }
}
