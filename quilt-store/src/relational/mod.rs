//! Relational store engine and its change-capture layer.

pub mod pool;
pub mod schema;
pub mod store;
pub mod time_helper;
pub mod types;

pub use pool::MAX_READERS;
pub use schema::{ColumnDef, TableSchema};
pub use store::{log_table_name, mirror_log_name, mirror_table_name, RelationalStore};
pub use time_helper::{TimeHelper, MAX_BACKWARD_US};
pub use types::{
    flags, ColumnValue, ContinueToken, DataSizeSpec, Predicate, PredicateOp, SyncItem, SyncQuery,
    SyncRange, MAX_ITEM_SIZE,
};
