//! Errors shared by the store engines.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The store is unreadable under the supplied secret: wrong key,
    /// missing key-check record, or a corrupted database file.
    #[error("crypt error: {0}")]
    Crypt(String),

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

    #[error("Sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store does not exist")]
    NotFound,

    /// Peer schema is not a compatible extension of ours.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Monotonic clock tampered beyond the tolerated bound; sync is
    /// disabled until a scan repairs it.
    #[error("store clock not syncable")]
    NotSyncable,

    /// No reader connection became available within the retry budget.
    #[error("connection pool busy")]
    Busy,

    #[error("Decode error: {0}")]
    Decode(String),
}
