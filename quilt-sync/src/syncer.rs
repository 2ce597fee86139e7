//! Syncer - the sync operation queue and control plane of one store.
//!
//! Owns the operation map, enforces the manual-sync quota, generates
//! wrapping sync ids, and guarantees every admitted operation terminates
//! exactly once (completion or kill). Per-device work is delegated to
//! the [`SyncEngine`](crate::engine::SyncEngine).

use crate::engine::SyncEngine;
use crate::operation::{DeviceStatus, OnComplete, OnFinalize, SyncOperation};
use crate::transport::{SyncMode, Transport, TransportEvent};
use quilt_model::{DeviceId, Status};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default cap on queued (non-wait) manual operations.
pub const QUEUED_SYNC_LIMIT_DEFAULT: u32 = 32;

const MIN_VALID_SYNC_ID: u32 = 1;

/// Pluggable admission policy consulted after the basic parameter
/// checks. The default admits everything; a future policy may reject a
/// triple with `PermissionDenied`.
pub trait SyncPolicy: Send + Sync {
    fn check(&self, store_label: &str, mode: SyncMode, devices: &[DeviceId]) -> Result<(), Status>;
}

/// Admit-everything default policy.
pub struct AllowAll;

impl SyncPolicy for AllowAll {
    fn check(&self, _label: &str, _mode: SyncMode, _devices: &[DeviceId]) -> Result<(), Status> {
        Ok(())
    }
}

/// Parameters of one sync request.
pub struct SyncParams {
    pub devices: Vec<DeviceId>,
    pub mode: SyncMode,
    pub wait: bool,
    pub on_complete: Option<OnComplete>,
    pub on_finalize: Option<OnFinalize>,
    pub query: Vec<u8>,
}

impl SyncParams {
    pub fn new(devices: Vec<DeviceId>, mode: SyncMode, wait: bool) -> Self {
        Self {
            devices,
            mode,
            wait,
            on_complete: None,
            on_finalize: None,
            query: Vec::new(),
        }
    }
}

struct LifeState {
    initialized: bool,
    closing: bool,
}

struct Queued {
    size: u32,
    limit: u32,
    enabled: bool,
}

/// State shared between the queue surface and the engine's workers. The
/// core owns operations strongly; workers address them by sync id.
pub(crate) struct SyncerCore {
    label: String,
    ops: Mutex<HashMap<u32, Arc<SyncOperation>>>,
    ops_drained: Condvar,
    queued: Mutex<Queued>,
    next_id: Mutex<u32>,
}

impl SyncerCore {
    fn new(label: String) -> Self {
        Self {
            label,
            ops: Mutex::new(HashMap::new()),
            ops_drained: Condvar::new(),
            queued: Mutex::new(Queued {
                size: 0,
                limit: QUEUED_SYNC_LIMIT_DEFAULT,
                enabled: true,
            }),
            next_id: Mutex::new(0),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    fn generate_sync_id(&self) -> u32 {
        let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        *next = next.wrapping_add(1);
        if *next < MIN_VALID_SYNC_ID {
            *next = MIN_VALID_SYNC_ID;
        }
        *next
    }

    fn register(&self, op: Arc<SyncOperation>) {
        let mut ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        ops.insert(op.sync_id(), op);
    }

    pub(crate) fn get(&self, sync_id: u32) -> Option<Arc<SyncOperation>> {
        let ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        ops.get(&sync_id).cloned()
    }

    fn live_ids(&self) -> Vec<u32> {
        let ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        ops.keys().copied().collect()
    }

    fn live_ops(&self) -> Vec<Arc<SyncOperation>> {
        let ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        ops.values().cloned().collect()
    }

    /// Remove and terminate one operation. The map holds the only
    /// registration, so callbacks and quota release run at most once no
    /// matter how many paths race here.
    pub(crate) fn terminate(&self, sync_id: u32, kill: bool) -> bool {
        let op = {
            let mut ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
            ops.remove(&sync_id)
        };
        let Some(op) = op else {
            return false;
        };

        let fired = if kill { op.kill() } else { op.finish() };
        if fired && op.holds_queue_slot() {
            self.sub_queued_size();
        }

        let ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        if ops.is_empty() {
            self.ops_drained.notify_all();
        }
        true
    }

    fn add_queued_size(&self, mode: SyncMode, wait: bool) -> Result<(), Status> {
        if !mode.is_manual() || wait {
            return Ok(());
        }
        let mut queued = self.queued.lock().unwrap_or_else(|e| e.into_inner());
        if !queued.enabled {
            info!(store = %self.label, "manual sync disabled");
            return Err(Status::Busy);
        }
        if queued.size >= queued.limit {
            debug!(store = %self.label, size = queued.size, "manual sync queue full");
            return Err(Status::Busy);
        }
        queued.size += 1;
        Ok(())
    }

    fn sub_queued_size(&self) {
        let mut queued = self.queued.lock().unwrap_or_else(|e| e.into_inner());
        if queued.size == 0 {
            warn!(store = %self.label, "queued sync size underflow");
            return;
        }
        queued.size -= 1;
    }

    fn wait_ops_drained(&self) {
        let mut ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        while !ops.is_empty() {
            ops = self
                .ops_drained
                .wait(ops)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// The per-store syncer: queue (this type) plus engine.
pub struct Syncer {
    core: Arc<SyncerCore>,
    engine: SyncEngine,
    state: Mutex<LifeState>,
    policy: Box<dyn SyncPolicy>,
    auto_sync: AtomicBool,
    event_shutdown: Arc<AtomicBool>,
    event_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Syncer {
    pub fn new(store_label: impl Into<String>) -> Self {
        Self::with_policy(store_label, Box::new(AllowAll))
    }

    pub fn with_policy(store_label: impl Into<String>, policy: Box<dyn SyncPolicy>) -> Self {
        let core = Arc::new(SyncerCore::new(store_label.into()));
        Self {
            engine: SyncEngine::new(Arc::clone(&core)),
            core,
            state: Mutex::new(LifeState {
                initialized: false,
                closing: false,
            }),
            policy,
            auto_sync: AtomicBool::new(false),
            event_shutdown: Arc::new(AtomicBool::new(false)),
            event_thread: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Whether the engine may start syncs without an explicit call.
    pub fn set_auto_sync(&self, enabled: bool) {
        self.auto_sync.store(enabled, Ordering::SeqCst);
    }

    /// Bind the transport and start the event pump. A transport without
    /// a usable local identity leaves the engine closed with `NotInit`.
    pub fn initialize(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<(), Status> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.initialized {
                return Ok(());
            }
            if state.closing {
                return Err(Status::Busy);
            }
            self.engine.bind_transport(Arc::clone(&transport))?;
            state.initialized = true;
        }

        self.event_shutdown.store(false, Ordering::SeqCst);
        let events = transport.subscribe_events();
        let weak: Weak<Syncer> = Arc::downgrade(self);
        let shutdown = Arc::clone(&self.event_shutdown);
        let handle = std::thread::spawn(move || loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match events.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => {
                    let Some(syncer) = weak.upgrade() else { break };
                    syncer.on_transport_event(event);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        });
        *self
            .event_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!(store = %self.core.label(), "syncer initialized");
        Ok(())
    }

    fn status_check(&self) -> Result<(), Status> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.initialized {
            return Err(Status::NotInit);
        }
        if state.closing {
            return Err(Status::Busy);
        }
        Ok(())
    }

    /// Submit a sync across `params.devices`. Returns the assigned sync
    /// id; with `wait = true` the call blocks until the operation reaches
    /// a terminal state.
    pub fn sync(&self, params: SyncParams) -> Result<u32, Status> {
        self.status_check()?;
        if params.devices.is_empty() {
            warn!(store = %self.core.label(), "sync with no devices");
            return Err(Status::InvalidArgument);
        }
        self.policy
            .check(self.core.label(), params.mode, &params.devices)?;
        self.core.add_queued_size(params.mode, params.wait)?;

        let sync_id = self.core.generate_sync_id();
        let op = Arc::new(SyncOperation::new(
            sync_id,
            &params.devices,
            params.mode,
            params.wait,
            params.on_complete,
            params.on_finalize,
        ));
        self.core.register(Arc::clone(&op));
        debug!(store = %self.core.label(), sync_id, mode = ?params.mode, devices = params.devices.len(), "sync admitted");

        self.engine.dispatch(Arc::clone(&op), params.query);

        if params.wait {
            op.wait_until_finished();
            // The worker that completed it also unregistered it; this is
            // a no-op unless the caller lost the race with stop_sync.
            self.core.terminate(sync_id, false);
        }
        Ok(sync_id)
    }

    /// Cancel one live operation.
    pub fn remove_sync_operation(&self, sync_id: u32) -> Result<(), Status> {
        if self.core.terminate(sync_id, true) {
            Ok(())
        } else {
            Err(Status::InvalidArgument)
        }
    }

    /// Cancel every live operation.
    pub fn stop_sync(&self) {
        for sync_id in self.core.live_ids() {
            let _ = self.core.terminate(sync_id, true);
        }
    }

    pub fn get_queued_sync_size(&self) -> u32 {
        let queued = self.core.queued.lock().unwrap_or_else(|e| e.into_inner());
        queued.size
    }

    pub fn set_queued_sync_limit(&self, limit: u32) {
        let mut queued = self.core.queued.lock().unwrap_or_else(|e| e.into_inner());
        queued.limit = limit;
    }

    pub fn get_queued_sync_limit(&self) -> u32 {
        let queued = self.core.queued.lock().unwrap_or_else(|e| e.into_inner());
        queued.limit
    }

    /// Refuse future manual syncs. Succeeds only with an empty queue.
    pub fn disable_manual_sync(&self) -> Result<(), Status> {
        let mut queued = self.core.queued.lock().unwrap_or_else(|e| e.into_inner());
        if queued.size > 0 {
            return Err(Status::Busy);
        }
        queued.enabled = false;
        Ok(())
    }

    pub fn enable_manual_sync(&self) {
        let mut queued = self.core.queued.lock().unwrap_or_else(|e| e.into_inner());
        queued.enabled = true;
    }

    /// Idempotent: drains in-flight operations, then drops the transport
    /// binding.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.initialized || state.closing {
                return;
            }
            state.closing = true;
        }

        self.core.wait_ops_drained();
        self.event_shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .event_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }
        self.engine.unbind_transport();

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.initialized = false;
        state.closing = false;
        info!(store = %self.core.label(), "syncer closed");
    }

    fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::RemoteDataChanged { device } => {
                if !self.auto_sync.load(Ordering::SeqCst) {
                    return;
                }
                debug!(store = %self.core.label(), device = %device.fmt_short(), "remote data changed, auto sync");
                let _ = self.sync(SyncParams::new(vec![device], SyncMode::AutoPull, false));
            }
            TransportEvent::DeviceOffline { device } => {
                for op in self.core.live_ops() {
                    if op.set_device_status(&device, DeviceStatus::Offline) {
                        self.core.terminate(op.sync_id(), false);
                    }
                }
            }
            TransportEvent::DeviceOnline { .. } => {}
        }
    }
}

impl std::fmt::Debug for Syncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer")
            .field("store", &self.core.label())
            .finish_non_exhaustive()
    }
}
