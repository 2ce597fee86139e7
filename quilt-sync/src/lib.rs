//! Sync control plane for the quilt data service.
//!
//! Per store, a [`Syncer`] admits sync requests under the manual-sync
//! quota, assigns wrapping sync ids, and guarantees termination; its
//! [`SyncEngine`](engine::SyncEngine) fans each operation out to worker
//! threads against the bound [`Transport`](transport::Transport).
//! Scheduling is plain threads with lock-based coordination; there is no
//! event loop.

pub mod engine;
pub mod operation;
pub mod sim;
pub mod syncer;
pub mod transport;

pub use engine::SyncEngine;
pub use operation::{DeviceStatus, OnComplete, OnFinalize, SyncOperation};
pub use syncer::{AllowAll, SyncParams, SyncPolicy, Syncer, QUEUED_SYNC_LIMIT_DEFAULT};
pub use transport::{
    DeviceInfo, SyncAck, SyncMode, SyncRequest, Transport, TransportError, TransportEvent,
};
