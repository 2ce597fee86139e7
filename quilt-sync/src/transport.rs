//! Transport collaborator contract.
//!
//! Real drivers live outside this workspace; the engine only needs the
//! surface below. Exchanges are blocking calls made from the engine's
//! worker threads; events arrive on a channel drained by the syncer's
//! event thread. Callbacks registered here are invoked by the driver on
//! its own threads.

use quilt_model::DeviceId;
use std::sync::mpsc;
use thiserror::Error;

/// Basic information about a device on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub device_type: String,
}

/// Sync flavor requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Push,
    Pull,
    PushPull,
    SubscribeQuery,
    UnsubscribeQuery,
    AutoPush,
    AutoPull,
}

impl SyncMode {
    /// Manual modes are subject to the queued-sync quota.
    pub fn is_manual(&self) -> bool {
        matches!(
            self,
            SyncMode::Push
                | SyncMode::Pull
                | SyncMode::PushPull
                | SyncMode::SubscribeQuery
                | SyncMode::UnsubscribeQuery
        )
    }
}

/// A per-device sync exchange as handed to the transport.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// Store identity label (triple-derived); legacy peers may reach it
    /// through an equal identifier.
    pub store_label: String,
    pub mode: SyncMode,
    pub sync_id: u32,
    /// Serialized query for query-filtered sync, empty otherwise.
    pub query: Vec<u8>,
}

/// Driver acknowledgement of one per-device exchange.
#[derive(Debug, Clone, Default)]
pub struct SyncAck {
    pub entries_sent: u64,
    pub entries_received: u64,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("device offline")]
    DeviceOffline,

    #[error("transport unavailable")]
    Unavailable,

    #[error("peer rejected: {0}")]
    Rejected(String),

    #[error("exchange failed: {0}")]
    Failed(String),
}

/// Events pushed up from the driver.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer committed new data for a store we hold.
    RemoteDataChanged { device: DeviceId },
    DeviceOnline { device: DeviceId },
    DeviceOffline { device: DeviceId },
}

/// Permission gate consulted per exchange:
/// `(user, app, store, device, flag)`.
pub type PermissionCheck =
    std::sync::Arc<dyn Fn(&str, &str, &str, &str, u8) -> bool + Send + Sync>;

/// Sync-activation gate consulted before auto sync: `(user, app, store)`.
pub type SyncActivationCheck = std::sync::Arc<dyn Fn(&str, &str, &str) -> bool + Send + Sync>;

/// Auto-launch resolution for a store label a peer asked about.
pub type AutoLaunchRequest = std::sync::Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// The transport surface the service binds at initialize time.
pub trait Transport: Send + Sync {
    /// Identify this process on the transport.
    fn set_process_label(&self, label: &str, group: &str);

    fn set_permission_check_callback(&self, check: PermissionCheck);

    fn set_sync_activation_check_callback(&self, check: SyncActivationCheck);

    fn set_auto_launch_request_callback(&self, request: AutoLaunchRequest);

    /// Empty id means the transport has no usable local identity yet.
    fn local_device(&self) -> DeviceInfo;

    fn device_list(&self) -> Vec<DeviceInfo>;

    fn is_device_online(&self, device: &DeviceId) -> bool;

    /// Run one sync exchange with a device, blocking until the peer has
    /// acknowledged or the exchange failed.
    fn sync_with_device(
        &self,
        device: &DeviceId,
        request: SyncRequest,
    ) -> Result<SyncAck, TransportError>;

    /// Driver event feed (peer data changes, online/offline).
    fn subscribe_events(&self) -> mpsc::Receiver<TransportEvent>;
}
