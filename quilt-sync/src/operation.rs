//! SyncOperation - one logical sync across N devices.
//!
//! States: Created → Running → (Finished | Killed). The operation holds
//! the per-device status map; it fires `on_complete` (with the final
//! map) and then `on_finalize` exactly once, on whichever transition
//! reaches terminal first. Waiters park on the operation's completion
//! condition.

use crate::transport::SyncMode;
use quilt_model::DeviceId;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use tracing::debug;

/// Terminal and non-terminal per-device states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Waiting,
    Ok,
    Failed,
    Offline,
    Denied,
    Busy,
    Killed,
}

impl DeviceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeviceStatus::Waiting)
    }
}

/// Fired once with the final per-device status map.
pub type OnComplete = Box<dyn FnOnce(&HashMap<DeviceId, DeviceStatus>) + Send>;
/// Fired once after `on_complete`.
pub type OnFinalize = Box<dyn FnOnce() + Send>;

struct OpInner {
    statuses: HashMap<DeviceId, DeviceStatus>,
    on_complete: Option<OnComplete>,
    on_finalize: Option<OnFinalize>,
    finished: bool,
}

pub struct SyncOperation {
    sync_id: u32,
    mode: SyncMode,
    wait: bool,
    inner: Mutex<OpInner>,
    done: Condvar,
}

impl SyncOperation {
    pub fn new(
        sync_id: u32,
        devices: &[DeviceId],
        mode: SyncMode,
        wait: bool,
        on_complete: Option<OnComplete>,
        on_finalize: Option<OnFinalize>,
    ) -> Self {
        let statuses = devices
            .iter()
            .map(|d| (d.clone(), DeviceStatus::Waiting))
            .collect();
        Self {
            sync_id,
            mode,
            wait,
            inner: Mutex::new(OpInner {
                statuses,
                on_complete,
                on_finalize,
                finished: false,
            }),
            done: Condvar::new(),
        }
    }

    pub fn sync_id(&self) -> u32 {
        self.sync_id
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Non-wait manual operations occupy a quota slot.
    pub fn holds_queue_slot(&self) -> bool {
        self.mode.is_manual() && !self.wait
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.statuses.keys().cloned().collect()
    }

    pub fn statuses(&self) -> HashMap<DeviceId, DeviceStatus> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.statuses.clone()
    }

    /// Record a terminal status for one device. Returns `true` when this
    /// transition made the whole operation terminal.
    pub fn set_device_status(&self, device: &DeviceId, status: DeviceStatus) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.finished {
            return false;
        }
        match inner.statuses.get_mut(device) {
            // First terminal status wins; an offline cancellation must
            // not be overwritten by a late worker result.
            Some(slot) if !slot.is_terminal() => *slot = status,
            _ => return false,
        }
        inner.statuses.values().all(DeviceStatus::is_terminal)
    }

    /// A device's state, for workers deciding whether to bother.
    pub fn device_status(&self, device: &DeviceId) -> Option<DeviceStatus> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.statuses.get(device).copied()
    }

    pub fn is_all_finished(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.statuses.values().all(DeviceStatus::is_terminal)
    }

    /// Drive the operation to its terminal state and fire the callbacks.
    /// Only the first call does anything; it returns `true`.
    pub fn finish(&self) -> bool {
        let (on_complete, on_finalize, statuses) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.finished {
                return false;
            }
            inner.finished = true;
            (
                inner.on_complete.take(),
                inner.on_finalize.take(),
                inner.statuses.clone(),
            )
        };
        debug!(sync_id = self.sync_id, "sync operation finished");
        if let Some(on_complete) = on_complete {
            on_complete(&statuses);
        }
        if let Some(on_finalize) = on_finalize {
            on_finalize();
        }
        self.done.notify_all();
        true
    }

    /// Mark every pending device killed, then finish. Returns whether
    /// this call performed the kill.
    pub fn kill(&self) -> bool {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.finished {
                return false;
            }
            for status in inner.statuses.values_mut() {
                if !status.is_terminal() {
                    *status = DeviceStatus::Killed;
                }
            }
        }
        self.finish()
    }

    /// Block the caller until the operation reaches a terminal state.
    pub fn wait_until_finished(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        while !inner.finished {
            inner = self
                .done
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl std::fmt::Debug for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOperation")
            .field("sync_id", &self.sync_id)
            .field("mode", &self.mode)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn devices(n: usize) -> Vec<DeviceId> {
        (0..n).map(|i| DeviceId::new(format!("dev-{i}"))).collect()
    }

    #[test]
    fn test_terminal_when_every_device_terminal() {
        let devs = devices(2);
        let op = SyncOperation::new(1, &devs, SyncMode::Push, false, None, None);

        assert!(!op.set_device_status(&devs[0], DeviceStatus::Ok));
        assert!(op.set_device_status(&devs[1], DeviceStatus::Failed));
        assert!(op.is_all_finished());
    }

    #[test]
    fn test_callbacks_fire_exactly_once_in_order() {
        let devs = devices(1);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let complete_sink = Arc::clone(&calls);
        let finalize_sink = Arc::clone(&calls);

        let op = SyncOperation::new(
            7,
            &devs,
            SyncMode::Push,
            false,
            Some(Box::new(move |statuses| {
                complete_sink
                    .lock()
                    .unwrap()
                    .push(format!("complete:{}", statuses.len()));
            })),
            Some(Box::new(move || {
                finalize_sink.lock().unwrap().push("finalize".into());
            })),
        );

        op.set_device_status(&devs[0], DeviceStatus::Ok);
        assert!(op.finish());
        assert!(!op.finish());
        assert!(!op.kill());

        let calls = calls.lock().unwrap();
        assert_eq!(*calls, vec!["complete:1".to_string(), "finalize".to_string()]);
    }

    #[test]
    fn test_first_terminal_status_wins() {
        let devs = devices(1);
        let op = SyncOperation::new(1, &devs, SyncMode::Push, false, None, None);
        op.set_device_status(&devs[0], DeviceStatus::Offline);
        op.set_device_status(&devs[0], DeviceStatus::Ok);
        assert_eq!(op.device_status(&devs[0]), Some(DeviceStatus::Offline));
    }

    #[test]
    fn test_kill_marks_pending_devices() {
        let devs = devices(2);
        let op = SyncOperation::new(1, &devs, SyncMode::Push, false, None, None);
        op.set_device_status(&devs[0], DeviceStatus::Ok);
        assert!(op.kill());

        let statuses = op.statuses();
        assert_eq!(statuses[&devs[0]], DeviceStatus::Ok);
        assert_eq!(statuses[&devs[1]], DeviceStatus::Killed);
    }

    #[test]
    fn test_waiters_wake_on_finish() {
        let devs = devices(1);
        let op = Arc::new(SyncOperation::new(1, &devs, SyncMode::Push, true, None, None));
        let woke = Arc::new(AtomicUsize::new(0));

        let waiter_op = Arc::clone(&op);
        let waiter_woke = Arc::clone(&woke);
        let handle = std::thread::spawn(move || {
            waiter_op.wait_until_finished();
            waiter_woke.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(woke.load(Ordering::SeqCst), 0);
        op.set_device_status(&devs[0], DeviceStatus::Ok);
        op.finish();
        handle.join().unwrap();
        assert_eq!(woke.load(Ordering::SeqCst), 1);
    }
}
