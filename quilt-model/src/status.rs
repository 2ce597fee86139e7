//! The externally visible status taxonomy.
//!
//! Every service-surface call resolves to one of these. Internal crate
//! errors (redb, rusqlite, io) are mapped onto the taxonomy at the service
//! boundary; the variants here are the contract with callers.

use thiserror::Error;

/// Service-surface result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Status {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("permission denied")]
    PermissionDenied,
    #[error("crypt error")]
    CryptError,
    #[error("database error")]
    DbError,
    #[error("store not open")]
    StoreNotOpen,
    #[error("recovered from backup")]
    RecoverSuccess,
    #[error("recovery from backup failed")]
    RecoverFailed,
    #[error("busy")]
    Busy,
    #[error("not initialized")]
    NotInit,
    #[error("illegal state")]
    IllegalState,
    #[error("account event processing")]
    SystemAccountEventProcessing,
    #[error("store kind not supported")]
    NotSupported,
    #[error("internal error")]
    Error,
}

/// Service-surface result: `Ok(v)` or a `Status` explaining why not.
///
/// `RecoverSuccess` never appears on the `Err` side; an open that went
/// through recovery still yields a usable handle and reports the outcome
/// separately.
pub type StatusResult<T> = Result<T, Status>;
