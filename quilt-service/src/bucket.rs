//! Live store handles and the per-user bucket that owns them.

use quilt_model::{AppId, Options, StoreId, StoreKind, StoreTuple, UserId};
use quilt_store::{RelationalStore, SingleStore};
use quilt_sync::Syncer;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// The engine behind a handle.
#[derive(Clone)]
pub enum StoreBackend {
    Single(Arc<SingleStore>),
    Relational(Arc<RelationalStore>),
}

impl StoreBackend {
    pub fn kind(&self) -> StoreKind {
        match self {
            StoreBackend::Single(_) => StoreKind::SingleVersion,
            StoreBackend::Relational(_) => StoreKind::Relational,
        }
    }

    pub fn as_single(&self) -> Option<&Arc<SingleStore>> {
        match self {
            StoreBackend::Single(store) => Some(store),
            _ => None,
        }
    }

    pub fn as_relational(&self) -> Option<&Arc<RelationalStore>> {
        match self {
            StoreBackend::Relational(store) => Some(store),
            _ => None,
        }
    }

    pub fn rekey(&self, secret: &quilt_keys::SecretKey) -> Result<(), quilt_store::StoreError> {
        match self {
            StoreBackend::Single(store) => store.rekey(secret),
            StoreBackend::Relational(store) => store.rekey(secret),
        }
    }

    pub fn export(&self, dest: &std::path::Path) -> Result<(), quilt_store::StoreError> {
        match self {
            StoreBackend::Single(store) => store.export(dest),
            StoreBackend::Relational(store) => store.export(dest),
        }
    }

    pub fn import(&self, src: &std::path::Path) -> Result<(), quilt_store::StoreError> {
        match self {
            StoreBackend::Single(store) => store.import(src).map(|_| ()),
            StoreBackend::Relational(store) => store.import(src),
        }
    }
}

/// A live, open store: backend, syncer, and bookkeeping.
pub struct StoreHandle {
    tuple: StoreTuple,
    options: Options,
    backend: StoreBackend,
    syncer: Arc<Syncer>,
    data_dir: PathBuf,
    open_count: AtomicU32,
    /// Allowed sync delay in milliseconds, settable per store.
    sync_delay_ms: AtomicU32,
}

impl StoreHandle {
    pub fn new(
        tuple: StoreTuple,
        options: Options,
        backend: StoreBackend,
        syncer: Arc<Syncer>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            tuple,
            options,
            backend,
            syncer,
            data_dir,
            open_count: AtomicU32::new(1),
            sync_delay_ms: AtomicU32::new(0),
        }
    }

    pub fn tuple(&self) -> &StoreTuple {
        &self.tuple
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn backend(&self) -> &StoreBackend {
        &self.backend
    }

    pub fn single(&self) -> Option<&Arc<SingleStore>> {
        self.backend.as_single()
    }

    pub fn relational(&self) -> Option<&Arc<RelationalStore>> {
        self.backend.as_relational()
    }

    pub fn syncer(&self) -> &Arc<Syncer> {
        &self.syncer
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::SeqCst)
    }

    pub fn set_sync_delay_ms(&self, delay: u32) {
        self.sync_delay_ms.store(delay, Ordering::SeqCst);
    }

    pub fn sync_delay_ms(&self) -> u32 {
        self.sync_delay_ms.load(Ordering::SeqCst)
    }

    fn acquire(&self) {
        self.open_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the remaining count.
    fn release(&self) -> u32 {
        let mut current = self.open_count.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return 0;
            }
            match self.open_count.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return current - 1,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Per-user container of live store handles. At most one handle exists
/// per `(app, store)`; concurrent openers serialize on the bucket lock
/// and see the winner's handle.
pub struct UserBucket {
    user_id: UserId,
    stores: Mutex<HashMap<(AppId, StoreId), Arc<StoreHandle>>>,
}

impl UserBucket {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Resolve or create the handle for `(app, store)` under the bucket
    /// lock. `open` runs only when no handle exists; its second return
    /// value (recovered) is passed through.
    pub fn open_with<F>(
        &self,
        app_id: &AppId,
        store_id: &StoreId,
        open: F,
    ) -> Result<(Arc<StoreHandle>, bool), quilt_model::Status>
    where
        F: FnOnce() -> Result<(Arc<StoreHandle>, bool), quilt_model::Status>,
    {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = stores.get(&(app_id.clone(), store_id.clone())) {
            handle.acquire();
            return Ok((Arc::clone(handle), false));
        }
        let (handle, recovered) = open()?;
        stores.insert((app_id.clone(), store_id.clone()), Arc::clone(&handle));
        Ok((handle, recovered))
    }

    pub fn get(&self, app_id: &AppId, store_id: &StoreId) -> Option<Arc<StoreHandle>> {
        let stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores.get(&(app_id.clone(), store_id.clone())).cloned()
    }

    pub fn is_open(&self, app_id: &AppId, store_id: &StoreId) -> bool {
        self.get(app_id, store_id).is_some()
    }

    /// Drop one reference; the handle leaves the bucket when the count
    /// reaches zero. Returns `StoreNotOpen` for an absent handle.
    pub fn close(&self, app_id: &AppId, store_id: &StoreId) -> Result<(), quilt_model::Status> {
        let closed = {
            let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
            let key = (app_id.clone(), store_id.clone());
            let Some(handle) = stores.get(&key) else {
                return Err(quilt_model::Status::StoreNotOpen);
            };
            if handle.release() == 0 {
                stores.remove(&key)
            } else {
                None
            }
        };
        if let Some(handle) = closed {
            // Outside the bucket lock: draining in-flight syncs can take
            // a while.
            handle.syncer().close();
            debug!(store = %handle.tuple(), "store closed");
        }
        Ok(())
    }

    /// Close every handle of one app, regardless of reference counts.
    pub fn close_all(&self, app_id: &AppId) -> Result<(), quilt_model::Status> {
        let removed: Vec<Arc<StoreHandle>> = {
            let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<_> = stores
                .keys()
                .filter(|(app, _)| app == app_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| stores.remove(k)).collect()
        };
        if removed.is_empty() {
            return Err(quilt_model::Status::StoreNotOpen);
        }
        for handle in removed {
            handle.syncer().stop_sync();
            handle.syncer().close();
        }
        Ok(())
    }

    /// Force-remove one handle (deletion path). Absent is fine.
    pub fn remove(&self, app_id: &AppId, store_id: &StoreId) -> Option<Arc<StoreHandle>> {
        let handle = {
            let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
            stores.remove(&(app_id.clone(), store_id.clone()))
        };
        if let Some(handle) = &handle {
            handle.syncer().stop_sync();
            handle.syncer().close();
        }
        handle
    }

    /// Drain the whole bucket (user removal path).
    pub fn remove_all(&self) -> Vec<Arc<StoreHandle>> {
        let removed: Vec<Arc<StoreHandle>> = {
            let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
            stores.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &removed {
            handle.syncer().stop_sync();
            handle.syncer().close();
        }
        removed
    }

    pub fn open_handles(&self) -> Vec<Arc<StoreHandle>> {
        let stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for UserBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserBucket")
            .field("user_id", &self.user_id)
            .field("stores", &self.len())
            .finish()
    }
}
