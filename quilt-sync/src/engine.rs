//! SyncEngine - drives sync operations across devices.
//!
//! The engine owns the transport binding and fans each operation out to
//! one worker thread per target device. Per-device failures never cancel
//! sibling devices; whichever worker records the last terminal status
//! also terminates the operation through the shared core.

use crate::operation::{DeviceStatus, SyncOperation};
use crate::syncer::SyncerCore;
use crate::transport::{DeviceInfo, SyncRequest, Transport, TransportError};
use quilt_model::{DeviceId, Status};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

pub struct SyncEngine {
    core: Arc<SyncerCore>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    retry: AtomicBool,
    equal_identifiers: Mutex<HashMap<String, Vec<DeviceId>>>,
}

impl SyncEngine {
    pub(crate) fn new(core: Arc<SyncerCore>) -> Self {
        Self {
            core,
            transport: RwLock::new(None),
            retry: AtomicBool::new(false),
            equal_identifiers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn bind_transport(&self, transport: Arc<dyn Transport>) -> Result<(), Status> {
        if transport.local_device().id.is_local() {
            warn!("transport has no local device identity");
            return Err(Status::NotInit);
        }
        let mut slot = self.transport.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(transport);
        Ok(())
    }

    pub(crate) fn unbind_transport(&self) {
        let mut slot = self.transport.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        let slot = self.transport.read().unwrap_or_else(|e| e.into_inner());
        slot.clone()
    }

    /// Retry a failed per-device exchange once before reporting it.
    pub fn set_sync_retry(&self, retry: bool) {
        self.retry.store(retry, Ordering::SeqCst);
    }

    /// Record a legacy-compatible identifier for this store, reachable by
    /// the listed peers.
    pub fn set_equal_identifier(&self, identifier: &str, devices: Vec<DeviceId>) {
        debug!(store = %self.core.label(), identifier, peers = devices.len(), "equal identifier set");
        let mut map = self
            .equal_identifiers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        map.insert(identifier.to_string(), devices);
    }

    pub fn equal_identifiers(&self) -> Vec<String> {
        let map = self
            .equal_identifiers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        map.keys().cloned().collect()
    }

    pub fn local_device(&self) -> Result<DeviceInfo, Status> {
        Ok(self.transport().ok_or(Status::NotInit)?.local_device())
    }

    pub fn device_list(&self) -> Result<Vec<DeviceInfo>, Status> {
        Ok(self.transport().ok_or(Status::NotInit)?.device_list())
    }

    /// Fan an admitted operation out to its devices.
    pub(crate) fn dispatch(&self, op: Arc<SyncOperation>, query: Vec<u8>) {
        let Some(transport) = self.transport() else {
            // Engine lost its binding between admission and dispatch.
            for device in op.devices() {
                op.set_device_status(&device, DeviceStatus::Failed);
            }
            self.core.terminate(op.sync_id(), false);
            return;
        };

        let sync_id = op.sync_id();
        let request = SyncRequest {
            store_label: self.core.label().to_string(),
            mode: op.mode(),
            sync_id,
            query,
        };

        for device in op.devices() {
            let transport = Arc::clone(&transport);
            let core = Arc::clone(&self.core);
            let request = request.clone();
            let retry = self.retry.load(Ordering::SeqCst);

            std::thread::spawn(move || {
                // Workers address the operation by id; a kill that raced
                // ahead of this worker already unregistered it.
                let Some(op) = core.get(sync_id) else { return };
                // An offline event may have preempted this device.
                if op
                    .device_status(&device)
                    .is_some_and(|s| s.is_terminal())
                {
                    if op.is_all_finished() {
                        core.terminate(sync_id, false);
                    }
                    return;
                }

                let mut result = transport.sync_with_device(&device, request.clone());
                if retry && matches!(result, Err(TransportError::Failed(_))) {
                    debug!(device = %device.fmt_short(), "sync retry");
                    result = transport.sync_with_device(&device, request);
                }

                let status = match result {
                    Ok(_) => DeviceStatus::Ok,
                    Err(TransportError::DeviceOffline) => DeviceStatus::Offline,
                    Err(TransportError::Rejected(reason)) => {
                        debug!(device = %device.fmt_short(), reason, "sync rejected");
                        DeviceStatus::Denied
                    }
                    Err(TransportError::Unavailable) | Err(TransportError::Failed(_)) => {
                        DeviceStatus::Failed
                    }
                };
                if op.set_device_status(&device, status) {
                    core.terminate(op.sync_id(), false);
                }
            });
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("store", &self.core.label())
            .field("bound", &self.transport().is_some())
            .finish()
    }
}
