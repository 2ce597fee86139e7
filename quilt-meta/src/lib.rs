//! MetaStore - durable service metadata in meta.db
//!
//! A single ordered table from byte keys to byte values, used for store
//! descriptors, sealed secrets, and sync strategy records. Writers emit
//! change notifications; subscribers register a prefix and receive
//! insert/update/delete events on a dedicated delivery task, so a slow
//! handler never blocks the writer.

pub mod keys;

use redb::{Database, TableDefinition};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const META_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("meta");

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeFlag {
    Insert,
    Update,
    Delete,
}

/// A change event as seen by subscribers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub flag: ChangeFlag,
}

/// Handler invoked on the delivery task for each matching change.
pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Token returned by [`MetaStore::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: u64,
    prefix: Vec<u8>,
    handler: ChangeHandler,
}

/// Durable meta store. One per service process, owned by the registry.
pub struct MetaStore {
    db: Database,
    subscribers: Arc<RwLock<Vec<Subscription>>>,
    next_sub_id: AtomicU64,
    delivery_tx: OnceLock<mpsc::UnboundedSender<ChangeEvent>>,
    // Serializes write transactions so flag classification (insert vs
    // update) matches the order subscribers observe.
    write_lock: Mutex<()>,
}

impl MetaStore {
    /// Open or create `meta.db` at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetaError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_sub_id: AtomicU64::new(1),
            delivery_tx: OnceLock::new(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    /// Insert or overwrite. Subscribers see `Insert` for a fresh key,
    /// `Update` for an overwrite.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), MetaError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let write_txn = self.db.begin_write()?;
        let existed;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            existed = table.insert(key, value)?.is_some();
        }
        write_txn.commit()?;

        self.publish(ChangeEvent {
            key: key.to_vec(),
            value: value.to_vec(),
            flag: if existed {
                ChangeFlag::Update
            } else {
                ChangeFlag::Insert
            },
        });
        Ok(())
    }

    /// Remove a key. Returns whether it existed; absent keys emit nothing.
    pub fn delete(&self, key: &[u8]) -> Result<bool, MetaError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let write_txn = self.db.begin_write()?;
        let removed;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            removed = table.remove(key)?.is_some();
        }
        write_txn.commit()?;

        if removed {
            self.publish(ChangeEvent {
                key: key.to_vec(),
                value: Vec::new(),
                flag: ChangeFlag::Delete,
            });
        }
        Ok(removed)
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, MetaError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;

        let mut out = Vec::new();
        for result in table.range::<&[u8]>(prefix..)? {
            let (key, value) = result?;
            if !key.value().starts_with(prefix) {
                break;
            }
            out.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(out)
    }

    /// Register a change handler for a key prefix.
    ///
    /// Delivery happens on a dedicated task spawned lazily on the first
    /// subscription, so this must be called from within a tokio runtime.
    /// Subscriptions live until [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, prefix: impl Into<Vec<u8>>, handler: ChangeHandler) -> SubscriptionId {
        self.ensure_delivery_task();
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        subs.push(Subscription {
            id,
            prefix: prefix.into(),
            handler,
        });
        debug!(subscription = id, "meta subscriber registered");
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id.0);
        subs.len() != before
    }

    fn publish(&self, event: ChangeEvent) {
        if let Some(tx) = self.delivery_tx.get() {
            // Receiver only drops on process teardown.
            let _ = tx.send(event);
        }
    }

    fn ensure_delivery_task(&self) {
        self.delivery_tx.get_or_init(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
            let subscribers = Arc::clone(&self.subscribers);
            tokio::spawn(async move {
                // Consecutive repeats of (key, flag) coalesce; delivery is
                // at-least-once, so handlers must be idempotent anyway.
                let mut last: Option<(Vec<u8>, ChangeFlag)> = None;
                while let Some(event) = rx.recv().await {
                    let seen = (event.key.clone(), event.flag);
                    if last.as_ref() == Some(&seen) {
                        continue;
                    }
                    last = Some(seen);

                    let matched: Vec<ChangeHandler> = {
                        let subs = subscribers.read().unwrap_or_else(|e| e.into_inner());
                        subs.iter()
                            .filter(|s| event.key.starts_with(&s.prefix))
                            .map(|s| Arc::clone(&s.handler))
                            .collect()
                    };
                    for handler in matched {
                        handler(&event);
                    }
                }
                warn!("meta delivery task exiting");
            });
            tx
        });
    }
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore").finish_non_exhaustive()
    }
}
