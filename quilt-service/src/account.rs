//! Account collaborator and OS account event translation.

use quilt_model::UserId;
use std::sync::{Arc, Mutex};

/// Uids are partitioned into per-user ranges of this width.
const UIDS_PER_USER: u32 = 100_000;

/// OS account events the service reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    /// The user was removed from this device; their stores go with them.
    Removed { user_id: UserId },
    /// The foreground user changed; sync activation is re-evaluated.
    Switched { user_id: UserId },
}

pub type AccountEventHandler = Arc<dyn Fn(&AccountEvent) + Send + Sync>;

/// Resolves callers to device accounts and feeds account events.
pub trait AccountDelegate: Send + Sync {
    fn get_device_account_id(&self, uid: u32) -> UserId;

    /// The current foreground account.
    fn get_current_account_id(&self) -> UserId;

    fn subscribe(&self, handler: AccountEventHandler);
}

/// Default delegate: uid-range account mapping with an in-process event
/// feed, enough for a single-user device and for tests driving events by
/// hand.
pub struct StaticAccountDelegate {
    current: Mutex<UserId>,
    handlers: Mutex<Vec<AccountEventHandler>>,
}

impl StaticAccountDelegate {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(UserId::new("0")),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Push an account event to every subscriber, switching the current
    /// account first when applicable.
    pub fn publish(&self, event: AccountEvent) {
        if let AccountEvent::Switched { user_id } = &event {
            *self.current.lock().unwrap_or_else(|e| e.into_inner()) = user_id.clone();
        }
        let handlers: Vec<AccountEventHandler> = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers.clone()
        };
        for handler in handlers {
            handler(&event);
        }
    }
}

impl Default for StaticAccountDelegate {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountDelegate for StaticAccountDelegate {
    fn get_device_account_id(&self, uid: u32) -> UserId {
        UserId::new((uid / UIDS_PER_USER).to_string())
    }

    fn get_current_account_id(&self) -> UserId {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn subscribe(&self, handler: AccountEventHandler) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_uid_range_mapping() {
        let delegate = StaticAccountDelegate::new();
        assert_eq!(delegate.get_device_account_id(10_001).as_str(), "0");
        assert_eq!(delegate.get_device_account_id(100_123).as_str(), "1");
    }

    #[test]
    fn test_publish_reaches_subscribers_and_switch_updates_current() {
        let delegate = StaticAccountDelegate::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&seen);
        delegate.subscribe(Arc::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        delegate.publish(AccountEvent::Switched {
            user_id: UserId::new("7"),
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(delegate.get_current_account_id().as_str(), "7");
    }
}
