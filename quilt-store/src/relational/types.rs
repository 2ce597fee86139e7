//! Wire-facing types of the change-capture layer.

use borsh::{BorshDeserialize, BorshSerialize};

/// Log-entry flag bits.
pub mod flags {
    pub const LOCAL: u32 = 0x1;
    pub const REMOTE: u32 = 0x2;
    pub const DELETE: u32 = 0x4;
    /// The row exists in the range but no longer satisfies the peer's
    /// subscribed query; the peer tombstones it locally.
    pub const MISS_QUERY: u32 = 0x8;
}

/// A single column value, typed the way SQLite types it.
#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl ColumnValue {
    fn approx_size(&self) -> usize {
        match self {
            ColumnValue::Null => 1,
            ColumnValue::Integer(_) => 8,
            ColumnValue::Real(_) => 8,
            ColumnValue::Text(s) => s.len(),
            ColumnValue::Blob(b) => b.len(),
        }
    }
}

/// One change-log entry together with its row payload, as shipped to a
/// peer. `row` is empty for tombstones and miss-query entries.
#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub struct SyncItem {
    /// Rowid in the originating table; −1 for tombstones.
    pub data_key: i64,
    pub timestamp: u64,
    pub flags: u32,
    /// SHA-256 over the row's primary-key column values.
    pub hash_key: Vec<u8>,
    /// Originating device; empty for local entries.
    pub device: String,
    pub row: Vec<ColumnValue>,
}

impl SyncItem {
    pub fn is_delete(&self) -> bool {
        self.flags & flags::DELETE != 0
    }

    pub fn is_miss_query(&self) -> bool {
        self.flags & flags::MISS_QUERY != 0
    }

    /// Size accounting for the block cap and the per-entry limit.
    pub fn approx_size(&self) -> usize {
        let row: usize = self.row.iter().map(ColumnValue::approx_size).sum();
        32 + self.hash_key.len() + self.device.len() + row
    }
}

/// Half-open time range `(since, until]` of a sync read.
#[derive(Debug, Clone, Copy)]
pub struct SyncRange {
    pub since: u64,
    pub until: u64,
}

impl SyncRange {
    /// Everything up to now.
    pub fn all() -> Self {
        Self {
            since: 0,
            until: u64::MAX,
        }
    }
}

/// Individual entries above this are skipped, never shipped.
pub const MAX_ITEM_SIZE: usize = 4 * 1024 * 1024;

/// Size budget of one sync batch.
#[derive(Debug, Clone, Copy)]
pub struct DataSizeSpec {
    /// Total payload cap; past it the batch ends with a token.
    pub block_size: usize,
}

impl Default for DataSizeSpec {
    fn default() -> Self {
        Self {
            block_size: MAX_ITEM_SIZE,
        }
    }
}

/// Continuation of a capped batch; resumes at the first unseen timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ContinueToken {
    pub next_timestamp: u64,
}

/// Comparison operator of a [`Predicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum PredicateOp {
    Eq,
    NotEq,
    Gt,
    Lt,
}

/// A single-column filter evaluated against row values.
#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub struct Predicate {
    pub column: String,
    pub op: PredicateOp,
    pub value: ColumnValue,
}

/// A sync-read query over one distributed table.
#[derive(Debug, Clone, Default, BorshSerialize, BorshDeserialize)]
pub struct SyncQuery {
    pub predicate: Option<Predicate>,
    /// `(count, offset)`; bounded queries return a single batch, no token.
    pub limit: Option<(u64, u64)>,
    pub order_by: Vec<String>,
}

impl SyncQuery {
    pub fn select_all() -> Self {
        Self::default()
    }

    /// Bounded queries never produce a continuation token.
    pub fn is_bounded(&self) -> bool {
        self.limit.is_some() || !self.order_by.is_empty()
    }
}
