//! Store registry, lifecycle management, and service surface of the
//! quilt distributed data service.
//!
//! Everything hangs off a [`ServiceContext`] built once at startup; the
//! collaborators (checker, account delegate, transport) are passed in as
//! handles. There are no free-function singletons; the only process-wide
//! fixture is the root-key vault, immutable after initialization.

pub mod account;
pub mod backup;
pub mod bucket;
pub mod checker;
pub mod death;
pub mod recovery;
pub mod registry;
pub mod service;

pub use account::{AccountDelegate, AccountEvent, StaticAccountDelegate};
pub use backup::{BackupHandler, BackupSource, BACKUP_INTERVAL, DEFAULT_GROUP_ID};
pub use bucket::{StoreBackend, StoreHandle, UserBucket};
pub use checker::{BundleChecker, Checker, SYSTEM_UID};
pub use death::ClientDeathRegistry;
pub use registry::{OpenedStore, StoreRegistry};
pub use service::{DataService, DeviceChangeListener, WatchToken};

use quilt_keys::{RootKeyVault, SecurityManager};
use quilt_meta::MetaStore;
use quilt_model::{AppId, Clock, DataDir, DeviceId, Status, StoreId, StoreTuple, SystemClock, UserId};
use quilt_sync::Transport;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Bounded wait for the transport's local device identity.
const DEVICE_ID_RETRY_TIMES: u32 = 10;
const DEVICE_ID_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Collaborators and configuration the service is built from.
pub struct ServiceConfig {
    pub data_dir: DataDir,
    pub checker: Arc<dyn Checker>,
    pub account: Arc<dyn AccountDelegate>,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
}

impl ServiceConfig {
    /// Default collaborators over a data directory; tests and the daemon
    /// override what they need.
    pub fn new(data_dir: DataDir, transport: Arc<dyn Transport>) -> Self {
        Self {
            data_dir,
            checker: Arc::new(BundleChecker::new()),
            account: Arc::new(StaticAccountDelegate::new()),
            transport,
            clock: Arc::new(SystemClock),
        }
    }
}

/// The process-wide context: every manager, built once, passed by
/// handle.
pub struct ServiceContext {
    vault: Arc<RootKeyVault>,
    meta: Arc<MetaStore>,
    keys: Arc<SecurityManager>,
    registry: Arc<StoreRegistry>,
    death: Arc<ClientDeathRegistry>,
    service: Arc<DataService>,
    backup_task: tokio::task::JoinHandle<()>,
}

impl ServiceContext {
    /// Build and wire the whole service. Blocks (bounded) on the local
    /// device identity and kicks off root-key generation when the alias
    /// does not resolve yet.
    pub async fn initialize(config: ServiceConfig) -> Result<Arc<Self>, Status> {
        let ServiceConfig {
            data_dir,
            checker,
            account,
            transport,
            clock,
        } = config;

        data_dir.ensure_base().map_err(|_| Status::DbError)?;

        let vault = Arc::new(RootKeyVault::new(data_dir.base()));
        if !vault.try_load() {
            if let Err(e) = vault.generate_once() {
                warn!(error = %e, "root key generation failed, retrying in background");
                let _ = vault.spawn_generator();
            }
        }

        let mut transport_id = transport.local_device().id;
        for _ in 0..DEVICE_ID_RETRY_TIMES {
            if !transport_id.is_local() {
                break;
            }
            warn!("local device id unavailable, retrying");
            tokio::time::sleep(DEVICE_ID_RETRY_INTERVAL).await;
            transport_id = transport.local_device().id;
        }
        let local_device = if transport_id.is_local() {
            warn!("no local device identity, sync stays uninitialized");
            DeviceId::new(hex::encode(Sha256::digest(b"unknown-device")))
        } else {
            DeviceId::new(hex::encode(Sha256::digest(transport_id.as_str().as_bytes())))
        };

        let meta = Arc::new(MetaStore::open(data_dir.meta_db()).map_err(|_| Status::DbError)?);
        let keys = Arc::new(SecurityManager::new(
            Arc::clone(&vault),
            Arc::clone(&meta),
            data_dir.clone(),
            Arc::clone(&clock),
        ));

        let registry = Arc::new(StoreRegistry::new(
            data_dir,
            Arc::clone(&meta),
            Arc::clone(&keys),
            Arc::clone(&checker),
            Arc::clone(&account),
            Arc::clone(&transport),
            clock,
            local_device,
        ));
        registry.start_meta_watcher();
        wire_transport(&transport, &registry);

        {
            let weak = Arc::downgrade(&registry);
            account.subscribe(Arc::new(move |event| {
                if let Some(registry) = weak.upgrade() {
                    registry.on_account_event(event);
                }
            }));
        }

        let death = Arc::new(ClientDeathRegistry::new(
            Arc::clone(&registry),
            checker,
            account,
        ));
        let service = Arc::new(DataService::new(
            Arc::clone(&registry),
            Arc::clone(&death),
        ));

        let backup_source = Arc::downgrade(&(Arc::clone(&registry) as Arc<dyn BackupSource>));
        let backup_task = backup::spawn_scheduler(backup_source, BACKUP_INTERVAL);

        info!("quilt data service initialized");
        Ok(Arc::new(Self {
            vault,
            meta,
            keys,
            registry,
            death,
            service,
            backup_task,
        }))
    }

    pub fn vault(&self) -> &Arc<RootKeyVault> {
        &self.vault
    }

    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    pub fn keys(&self) -> &Arc<SecurityManager> {
        &self.keys
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    pub fn death_registry(&self) -> &Arc<ClientDeathRegistry> {
        &self.death
    }

    pub fn service(&self) -> &Arc<DataService> {
        &self.service
    }

    /// Stop background work; open stores stay valid until dropped.
    pub fn shutdown(&self) {
        self.backup_task.abort();
        info!("quilt data service stopped");
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext").finish_non_exhaustive()
    }
}

/// Register the service-side callbacks on the transport.
fn wire_transport(transport: &Arc<dyn Transport>, registry: &Arc<StoreRegistry>) {
    transport.set_process_label("quilt", DEFAULT_GROUP_ID);

    let weak = Arc::downgrade(registry);
    transport.set_permission_check_callback(Arc::new(
        move |user, app, store, _device, _flag| {
            let Some(registry) = weak.upgrade() else {
                return false;
            };
            // No strategy record means no restriction.
            match registry.get_strategy_meta(&StoreTuple::new(user, app, store)) {
                Ok(Some(strategy)) => strategy.capability_enabled,
                _ => true,
            }
        },
    ));

    let weak = Arc::downgrade(registry);
    transport.set_sync_activation_check_callback(Arc::new(move |user, app, store| {
        let Some(registry) = weak.upgrade() else {
            return false;
        };
        registry.check_sync_activation(
            &UserId::new(user),
            &AppId::new(app),
            &StoreId::new(store),
        )
    }));

    let weak = Arc::downgrade(registry);
    transport.set_auto_launch_request_callback(Arc::new(move |label| {
        let Some(registry) = weak.upgrade() else {
            return false;
        };
        // Labels are the store tuple rendered `user/app/store`.
        let mut parts = label.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(app), Some(store)) => {
                registry.has_store_meta(&StoreTuple::new(user, app, store))
            }
            _ => false,
        }
    }));
}
