//! ChannelTransport — in-memory Transport implementation.
//!
//! A shared [`ChannelNetwork`] broker routes exchanges between
//! registered devices and fans transport events out to every other
//! device's subscribers. Tests drive peers on and off line, install
//! per-device sync handlers, and inject artificial exchange latency.

use crate::transport::{
    AutoLaunchRequest, DeviceInfo, PermissionCheck, SyncActivationCheck, SyncAck, SyncRequest,
    Transport, TransportError, TransportEvent,
};
use quilt_model::DeviceId;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a simulated peer does when an exchange reaches it.
pub type SyncHandler =
    Arc<dyn Fn(&DeviceId, &SyncRequest) -> Result<SyncAck, TransportError> + Send + Sync>;

struct PeerEntry {
    info: DeviceInfo,
    online: bool,
    handler: Option<SyncHandler>,
}

struct NetworkInner {
    peers: Mutex<HashMap<DeviceId, PeerEntry>>,
    subscribers: Mutex<HashMap<DeviceId, Vec<mpsc::Sender<TransportEvent>>>>,
    latency: Mutex<Duration>,
}

/// Shared broker connecting every [`ChannelTransport`] in a test.
#[derive(Clone)]
pub struct ChannelNetwork {
    inner: Arc<NetworkInner>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                peers: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                latency: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Register a device and get its transport endpoint.
    pub fn register(&self, name: &str) -> ChannelTransport {
        let info = DeviceInfo {
            id: DeviceId::new(format!("dev-{name}")),
            name: name.to_string(),
            device_type: "simulated".to_string(),
        };
        let mut peers = self.inner.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.insert(
            info.id.clone(),
            PeerEntry {
                info: info.clone(),
                online: true,
                handler: None,
            },
        );
        ChannelTransport {
            local: info,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Artificial per-exchange latency; keeps operations in flight long
    /// enough for quota and cancellation tests.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Install the peer-side behavior for exchanges targeting `device`.
    pub fn set_handler(&self, device: &DeviceId, handler: SyncHandler) {
        let mut peers = self.inner.peers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(device) {
            entry.handler = Some(handler);
        }
    }

    /// Flip a device's liveness and notify everyone else.
    pub fn set_online(&self, device: &DeviceId, online: bool) {
        {
            let mut peers = self.inner.peers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = peers.get_mut(device) {
                entry.online = online;
            }
        }
        let event = if online {
            TransportEvent::DeviceOnline {
                device: device.clone(),
            }
        } else {
            TransportEvent::DeviceOffline {
                device: device.clone(),
            }
        };
        self.inner.broadcast(device, event);
    }

    /// Announce that `device` committed new data, waking its peers.
    pub fn notify_data_changed(&self, device: &DeviceId) {
        self.inner.broadcast(
            device,
            TransportEvent::RemoteDataChanged {
                device: device.clone(),
            },
        );
    }
}

impl Default for ChannelNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkInner {
    /// Send an event to every registered device except its origin.
    fn broadcast(&self, origin: &DeviceId, event: TransportEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for (device, senders) in subscribers.iter_mut() {
            if device == origin {
                continue;
            }
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

/// One device's endpoint on the simulated network.
pub struct ChannelTransport {
    local: DeviceInfo,
    inner: Arc<NetworkInner>,
}

impl Transport for ChannelTransport {
    fn set_process_label(&self, _label: &str, _group: &str) {}

    fn set_permission_check_callback(&self, _check: PermissionCheck) {}

    fn set_sync_activation_check_callback(&self, _check: SyncActivationCheck) {}

    fn set_auto_launch_request_callback(&self, _request: AutoLaunchRequest) {}

    fn local_device(&self) -> DeviceInfo {
        self.local.clone()
    }

    fn device_list(&self) -> Vec<DeviceInfo> {
        let peers = self.inner.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.info.id != self.local.id)
            .map(|p| p.info.clone())
            .collect()
    }

    fn is_device_online(&self, device: &DeviceId) -> bool {
        let peers = self.inner.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.get(device).map(|p| p.online).unwrap_or(false)
    }

    fn sync_with_device(
        &self,
        device: &DeviceId,
        request: SyncRequest,
    ) -> Result<SyncAck, TransportError> {
        let latency = *self.inner.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let (online, handler) = {
            let peers = self.inner.peers.lock().unwrap_or_else(|e| e.into_inner());
            let entry = peers.get(device).ok_or(TransportError::Unavailable)?;
            (entry.online, entry.handler.clone())
        };
        if !online {
            return Err(TransportError::DeviceOffline);
        }
        match handler {
            Some(handler) => handler(&self.local.id, &request),
            None => Ok(SyncAck::default()),
        }
    }

    fn subscribe_events(&self) -> mpsc::Receiver<TransportEvent> {
        let (tx, rx) = mpsc::channel();
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subscribers.entry(self.local.id.clone()).or_default().push(tx);
        rx
    }
}
