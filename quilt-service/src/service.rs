//! Caller-facing service surface.
//!
//! The IPC framing lives outside this workspace; these methods are what
//! the stubs call into. Every method takes the caller uid the stub
//! resolved and returns a [`Status`] on failure.

use crate::death::ClientDeathRegistry;
use crate::registry::{OpenedStore, StoreRegistry};
use quilt_model::{AppId, Options, Status, StoreId, StoreKind, StrategyMeta};
use quilt_store::relational::SyncQuery;
use quilt_sync::{DeviceInfo, OnComplete, SyncMode, SyncParams, TransportEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Callback observing device online/offline changes.
pub type DeviceChangeListener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Token handed out by the watch/subscribe registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken(u64);

pub struct DataService {
    registry: Arc<StoreRegistry>,
    death: Arc<ClientDeathRegistry>,
    device_listeners: Arc<Mutex<HashMap<u64, DeviceChangeListener>>>,
    subscriptions: Mutex<HashMap<u64, (AppId, StoreId)>>,
    next_token: AtomicU64,
    watch_shutdown: Arc<AtomicBool>,
    watch_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl DataService {
    pub fn new(registry: Arc<StoreRegistry>, death: Arc<ClientDeathRegistry>) -> Self {
        let service = Self {
            registry,
            death,
            device_listeners: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            watch_shutdown: Arc::new(AtomicBool::new(false)),
            watch_thread: Mutex::new(None),
        };
        service.start_device_watch_pump();
        service
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    pub fn death_registry(&self) -> &Arc<ClientDeathRegistry> {
        &self.death
    }

    // ==================== KV store surface ====================

    /// Legacy multi-version entry point. The kind is still recognized on
    /// the wire, but the engine behind it is retired.
    pub fn get_kv_store(
        &self,
        _uid: u32,
        app_id: &AppId,
        store_id: &StoreId,
        options: &Options,
    ) -> Result<OpenedStore, Status> {
        if !app_id.is_valid() || !store_id.is_valid() || options.kind != StoreKind::MultiVersion {
            return Err(Status::InvalidArgument);
        }
        warn!(app = %app_id, store = %store_id, "multi-version stores are no longer supported");
        Err(Status::NotSupported)
    }

    pub fn get_single_kv_store(
        &self,
        uid: u32,
        app_id: &AppId,
        store_id: &StoreId,
        options: &Options,
    ) -> Result<OpenedStore, Status> {
        if options.kind != StoreKind::SingleVersion {
            return Err(Status::InvalidArgument);
        }
        self.registry.open_store(uid, app_id, store_id, options)
    }

    pub fn get_rdb_store(
        &self,
        uid: u32,
        app_id: &AppId,
        store_id: &StoreId,
        options: &Options,
    ) -> Result<OpenedStore, Status> {
        if options.kind != StoreKind::Relational {
            return Err(Status::InvalidArgument);
        }
        self.registry.open_store(uid, app_id, store_id, options)
    }

    pub fn close_kv_store(&self, uid: u32, app_id: &AppId, store_id: &StoreId) -> Result<(), Status> {
        self.registry.close_store(uid, app_id, store_id)
    }

    pub fn close_all_kv_store(&self, uid: u32, app_id: &AppId) -> Result<(), Status> {
        self.registry.close_all_stores(uid, app_id)
    }

    pub fn delete_kv_store(&self, uid: u32, app_id: &AppId, store_id: &StoreId) -> Result<(), Status> {
        self.registry.delete_store(uid, app_id, store_id)
    }

    pub fn delete_all_kv_store(&self, uid: u32, app_id: &AppId) -> Result<(), Status> {
        self.registry.delete_all_stores(uid, app_id)
    }

    pub fn get_all_kv_store_id(&self, uid: u32, app_id: &AppId) -> Result<Vec<StoreId>, Status> {
        self.registry.get_all_store_ids(uid, app_id)
    }

    // ==================== Death observation ====================

    pub fn register_client_death_observer(&self, app_id: &AppId, uid: u32) -> Result<(), Status> {
        self.death.register(app_id, uid)
    }

    /// Invoked by the IPC layer when a registered remote dies.
    pub fn notify_client_death(&self, app_id: &AppId) {
        self.death.notify_death(app_id);
    }

    // ==================== Devices ====================

    pub fn get_local_device(&self) -> DeviceInfo {
        self.registry.transport().local_device()
    }

    pub fn get_device_list(&self) -> Vec<DeviceInfo> {
        self.registry.transport().device_list()
    }

    pub fn start_watch_device_change(
        &self,
        listener: DeviceChangeListener,
    ) -> Result<WatchToken, Status> {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let mut listeners = self
            .device_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        listeners.insert(token, listener);
        Ok(WatchToken(token))
    }

    pub fn stop_watch_device_change(&self, token: WatchToken) -> Result<(), Status> {
        let mut listeners = self
            .device_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if listeners.remove(&token.0).is_none() {
            return Err(Status::IllegalState);
        }
        Ok(())
    }

    // ==================== Relational / sync commands ====================

    /// Kick off a sync for a store the caller holds open.
    pub fn sync(
        &self,
        uid: u32,
        app_id: &AppId,
        store_id: &StoreId,
        devices: Vec<quilt_model::DeviceId>,
        mode: SyncMode,
        wait: bool,
        query: Option<&SyncQuery>,
        on_complete: Option<OnComplete>,
    ) -> Result<u32, Status> {
        let handle = self.registry.handle_for(uid, app_id, store_id)?;
        let mut params = SyncParams::new(devices, mode, wait);
        params.on_complete = on_complete;
        if let Some(query) = query {
            params.query = borsh::to_vec(query).map_err(|_| Status::InvalidArgument)?;
        }
        handle.syncer().sync(params)
    }

    pub fn set_sync_param(
        &self,
        uid: u32,
        app_id: &AppId,
        store_id: &StoreId,
        allowed_delay_ms: u32,
    ) -> Result<(), Status> {
        let handle = self.registry.handle_for(uid, app_id, store_id)?;
        handle.set_sync_delay_ms(allowed_delay_ms);
        Ok(())
    }

    pub fn get_sync_param(&self, uid: u32, app_id: &AppId, store_id: &StoreId) -> Result<u32, Status> {
        Ok(self.registry.handle_for(uid, app_id, store_id)?.sync_delay_ms())
    }

    /// Record the store's sync capability labels.
    pub fn set_capability(
        &self,
        uid: u32,
        app_id: &AppId,
        store_id: &StoreId,
        enabled: bool,
        local_label: Vec<String>,
        remote_label: Vec<String>,
    ) -> Result<(), Status> {
        self.registry.gate()?;
        let handle = self.registry.handle_for(uid, app_id, store_id)?;
        let strategy = StrategyMeta {
            capability_enabled: enabled,
            local_label,
            remote_label,
        };
        self.registry.set_strategy_meta(handle.tuple(), &strategy)
    }

    pub fn get_capability(
        &self,
        uid: u32,
        app_id: &AppId,
        store_id: &StoreId,
    ) -> Result<Option<StrategyMeta>, Status> {
        let handle = self.registry.handle_for(uid, app_id, store_id)?;
        self.registry.get_strategy_meta(handle.tuple())
    }

    /// Register interest in a store's remote changes.
    pub fn subscribe(&self, uid: u32, app_id: &AppId, store_id: &StoreId) -> Result<WatchToken, Status> {
        // The store must be open for the caller.
        let _ = self.registry.handle_for(uid, app_id, store_id)?;
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subs.insert(token, (app_id.clone(), store_id.clone()));
        Ok(WatchToken(token))
    }

    pub fn unsubscribe(&self, token: WatchToken) -> Result<(), Status> {
        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        if subs.remove(&token.0).is_none() {
            return Err(Status::IllegalState);
        }
        Ok(())
    }

    /// Pre-creation validation used by client-side engines.
    pub fn before_create(
        &self,
        uid: u32,
        app_id: &AppId,
        store_id: &StoreId,
        options: &Options,
    ) -> Result<(), Status> {
        self.registry.check_before_create(uid, app_id, store_id, options)
    }

    /// Post-creation registration used by client-side engines.
    pub fn after_create(
        &self,
        uid: u32,
        app_id: &AppId,
        store_id: &StoreId,
        options: &Options,
    ) -> Result<(), Status> {
        self.registry.publish_store_meta(uid, app_id, store_id, options)
    }

    pub fn get_store_ids(&self, uid: u32, app_id: &AppId) -> Result<Vec<StoreId>, Status> {
        self.registry.get_all_store_ids(uid, app_id)
    }

    /// Human-readable state dump for diagnostics.
    pub fn dump(&self) -> String {
        self.registry.dump()
    }

    fn start_device_watch_pump(&self) {
        let events = self.registry.transport().subscribe_events();
        let listeners = Arc::clone(&self.device_listeners);
        let shutdown = Arc::clone(&self.watch_shutdown);
        let handle = std::thread::spawn(move || loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match events.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => {
                    if !matches!(
                        event,
                        TransportEvent::DeviceOnline { .. } | TransportEvent::DeviceOffline { .. }
                    ) {
                        continue;
                    }
                    let snapshot: Vec<DeviceChangeListener> = {
                        let listeners = listeners.lock().unwrap_or_else(|e| e.into_inner());
                        listeners.values().cloned().collect()
                    };
                    for listener in snapshot {
                        listener(&event);
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        });
        *self
            .watch_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        debug!("device watch pump started");
    }
}

impl Drop for DataService {
    fn drop(&mut self) {
        self.watch_shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .watch_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for DataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataService").finish_non_exhaustive()
    }
}

