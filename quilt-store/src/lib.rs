//! Store engines for the quilt data service.
//!
//! Two engines share this crate: the single-version key-value store
//! (redb-backed, values sealed with the per-store secret when encrypted)
//! and the relational store (SQLite-backed) with its row-level change
//! capture, mirror tables, and sync read/apply paths.

pub mod error;
pub mod kv;
pub mod relational;
pub mod seal;

pub use error::StoreError;
pub use kv::SingleStore;
pub use relational::RelationalStore;
