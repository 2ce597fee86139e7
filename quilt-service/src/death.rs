//! Client-death registry.
//!
//! Each client process registers one death observer per app id; when the
//! remote dies the registry drops the observer, revokes the app's
//! permission-change listeners, and closes everything the app held open.

use crate::account::AccountDelegate;
use crate::checker::Checker;
use crate::registry::StoreRegistry;
use quilt_model::{AppId, Status, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// State kept per registered observer. `on_death` stands in for the
/// remote object's death recipient; the transport layer calls
/// [`ClientDeathRegistry::notify_death`] when it fires.
struct DeathObserver {
    uid: u32,
}

pub struct ClientDeathRegistry {
    registry: Arc<StoreRegistry>,
    checker: Arc<dyn Checker>,
    account: Arc<dyn AccountDelegate>,
    observers: Mutex<HashMap<AppId, DeathObserver>>,
    permission_listeners: Mutex<HashSet<(UserId, String)>>,
}

impl ClientDeathRegistry {
    pub fn new(
        registry: Arc<StoreRegistry>,
        checker: Arc<dyn Checker>,
        account: Arc<dyn AccountDelegate>,
    ) -> Self {
        Self {
            registry,
            checker,
            account,
            observers: Mutex::new(HashMap::new()),
            permission_listeners: Mutex::new(HashSet::new()),
        }
    }

    /// Register the caller's death observer. Duplicate registration for
    /// an app id is rejected.
    pub fn register(&self, app_id: &AppId, uid: u32) -> Result<(), Status> {
        self.registry.gate()?;
        if !app_id.is_valid() {
            return Err(Status::InvalidArgument);
        }
        let Some(true_app) = self.checker.get_app_id(uid, app_id.as_str()) else {
            warn!(app = %app_id, uid, "death observer registration denied");
            return Err(Status::PermissionDenied);
        };

        {
            let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
            if observers.contains_key(app_id) {
                warn!(app = %app_id, "duplicate death observer");
                return Err(Status::Error);
            }
            observers.insert(app_id.clone(), DeathObserver { uid });
            info!(app = %app_id, observers = observers.len(), "death observer registered");
        }

        let user = self.account.get_device_account_id(uid);
        let mut listeners = self
            .permission_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        listeners.insert((user, true_app));
        Ok(())
    }

    /// The remote died: unwind its registrations and close its stores.
    pub fn notify_death(&self, app_id: &AppId) {
        let observer = {
            let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
            observers.remove(app_id)
        };
        let Some(observer) = observer else {
            warn!(app = %app_id, "death notification without observer");
            return;
        };

        if let Some(true_app) = self.checker.get_app_id(observer.uid, app_id.as_str()) {
            let user = self.account.get_device_account_id(observer.uid);
            let mut listeners = self
                .permission_listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            listeners.remove(&(user, true_app));
        }

        self.registry.on_client_death(app_id, observer.uid);
    }

    pub fn has_observer(&self, app_id: &AppId) -> bool {
        let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.contains_key(app_id)
    }

    pub fn permission_listener_count(&self) -> usize {
        let listeners = self
            .permission_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        listeners.len()
    }
}

impl std::fmt::Debug for ClientDeathRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("ClientDeathRegistry")
            .field("observers", &observers.len())
            .finish()
    }
}
