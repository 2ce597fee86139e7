//! Relational store engine with change capture.
//!
//! One SQLite database per store. A user table elevated to distributed
//! gets a shadow log `meta_<T>_log` maintained by triggers: every
//! committed insert/update/delete writes one log entry stamped by the
//! store's monotonic clock, keyed by a SHA-256 over the row's primary-key
//! columns. Remote batches apply into per-device mirror tables
//! `meta_<T>_<H(device)>` with their own shadow logs and watermarks.

use crate::error::StoreError;
use crate::relational::pool::{ConnPool, MAX_READERS};
use crate::relational::schema::{quote_ident, TableSchema};
use crate::relational::time_helper::TimeHelper;
use crate::relational::types::{
    flags, ColumnValue, ContinueToken, DataSizeSpec, Predicate, PredicateOp, SyncItem, SyncQuery,
    SyncRange, MAX_ITEM_SIZE,
};
use crate::seal::ValueSealer;
use quilt_keys::SecretKey;
use quilt_model::Clock;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

const DB_FILE: &str = "relational.db";
const META_KEY_CHECK: &str = "key_check";
const META_DISTRIBUTED: &str = "distributed_tables";

/// An open relational store.
pub struct RelationalStore {
    pool: ConnPool,
    time: Arc<TimeHelper>,
    distributed: RwLock<BTreeSet<String>>,
}

impl RelationalStore {
    /// Open or create the store under `dir`.
    pub fn open(
        dir: &Path,
        create_if_missing: bool,
        secret: Option<&SecretKey>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let db_path = dir.join(DB_FILE);
        let existed = db_path.exists();
        if !existed && !create_if_missing {
            return Err(StoreError::NotFound);
        }
        std::fs::create_dir_all(dir)?;

        let time = Arc::new(TimeHelper::new(clock));
        let writer = open_connection(&db_path, &time)?;

        // Structural damage shows up here, before any data is trusted.
        let check: String = writer
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| StoreError::Crypt(e.to_string()))?;
        if check != "ok" {
            return Err(StoreError::Crypt(check));
        }

        writer.execute_batch(
            "CREATE TABLE IF NOT EXISTS quilt_meta (key TEXT PRIMARY KEY, value BLOB)",
        )?;

        verify_key_check(&writer, secret, existed)?;

        let distributed = load_distributed(&writer)?;
        for table in &distributed {
            let max: i64 = writer.query_row(
                &format!(
                    "SELECT COALESCE(MAX(timestamp), 0) FROM {}",
                    quote_ident(&log_table_name(table))
                ),
                [],
                |row| row.get(0),
            )?;
            time.observe(max as u64);
        }

        let mut readers = Vec::with_capacity(MAX_READERS);
        for _ in 0..MAX_READERS {
            readers.push(open_connection(&db_path, &time)?);
        }

        debug!(path = %db_path.display(), existed, tables = distributed.len(), "relational store opened");
        Ok(Self {
            pool: ConnPool::new(writer, readers),
            time: Arc::clone(&time),
            distributed: RwLock::new(distributed),
        })
    }

    pub fn db_path(dir: &Path) -> PathBuf {
        dir.join(DB_FILE)
    }

    /// Run a user mutation on the writer connection; triggers capture the
    /// changes into the shadow log atomically with the commit.
    pub fn execute(&self, sql: &str, params: &[ColumnValue]) -> Result<usize, StoreError> {
        self.pool.with_writer(|conn| {
            Ok(conn.execute(
                sql,
                rusqlite::params_from_iter(params.iter().map(to_sql_value)),
            )?)
        })
    }

    /// Run a batch of mutations inside one transaction.
    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.pool.with_writer(|conn| Ok(conn.execute_batch(sql)?))
    }

    /// Read access on a pooled reader connection.
    pub fn with_reader<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.pool.with_reader(f)
    }

    pub fn is_syncable(&self) -> bool {
        self.time.is_syncable()
    }

    /// Rescan the shadow logs and repair the monotonic clock.
    pub fn repair_clock(&self) -> Result<(), StoreError> {
        let tables: Vec<String> = {
            let distributed = self.distributed.read().unwrap_or_else(|e| e.into_inner());
            distributed.iter().cloned().collect()
        };
        let mut max = 0u64;
        self.pool.with_reader(|conn| {
            for table in &tables {
                let seen: i64 = conn.query_row(
                    &format!(
                        "SELECT COALESCE(MAX(timestamp), 0) FROM {}",
                        quote_ident(&log_table_name(table))
                    ),
                    [],
                    |row| row.get(0),
                )?;
                max = max.max(seen as u64);
            }
            Ok(())
        })?;
        self.time.repair(max);
        info!(max, "store clock repaired from log scan");
        Ok(())
    }

    pub fn distributed_tables(&self) -> Vec<String> {
        let distributed = self.distributed.read().unwrap_or_else(|e| e.into_inner());
        distributed.iter().cloned().collect()
    }

    pub fn schema(&self, table: &str) -> Result<TableSchema, StoreError> {
        self.pool.with_reader(|conn| TableSchema::read(conn, table))
    }

    /// Elevate a user table to distributed: install the shadow log and
    /// the capture triggers, and backfill entries for existing rows.
    /// Idempotent.
    pub fn create_distributed_table(&self, table: &str) -> Result<(), StoreError> {
        {
            let distributed = self.distributed.read().unwrap_or_else(|e| e.into_inner());
            if distributed.contains(table) {
                debug!(table, "distributed table already created");
                return Ok(());
            }
        }

        self.pool.with_writer(|conn| {
            let schema = TableSchema::read(conn, table)?;
            if !schema.exists() {
                return Err(StoreError::SchemaMismatch(format!(
                    "table {table} does not exist"
                )));
            }
            let pks = schema.pk_columns();
            if pks.is_empty() {
                return Err(StoreError::SchemaMismatch(format!(
                    "table {table} has no primary key"
                )));
            }
            let old_hash = hash_expr("OLD", &pks);
            let new_hash = hash_expr("NEW", &pks);
            let log = quote_ident(&log_table_name(table));
            let user = quote_ident(table);

            let tx = conn.transaction()?;
            tx.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {log} (\n\
                     data_key INTEGER NOT NULL,\n\
                     timestamp INTEGER NOT NULL,\n\
                     flag INTEGER NOT NULL,\n\
                     hash_key BLOB NOT NULL UNIQUE,\n\
                     device TEXT NOT NULL DEFAULT ''\n\
                 );\n\
                 CREATE INDEX IF NOT EXISTS {ts_index} ON {log} (timestamp);\n\
                 CREATE TRIGGER IF NOT EXISTS {t_insert} AFTER INSERT ON {user}\n\
                 BEGIN\n\
                     INSERT OR REPLACE INTO {log} (data_key, timestamp, flag, hash_key, device)\n\
                     VALUES (NEW.rowid, quilt_timestamp(), {local}, {new_hash}, '');\n\
                 END;\n\
                 CREATE TRIGGER IF NOT EXISTS {t_update} AFTER UPDATE ON {user}\n\
                 BEGIN\n\
                     INSERT OR REPLACE INTO {log} (data_key, timestamp, flag, hash_key, device)\n\
                     SELECT -1, quilt_timestamp(), {tombstone}, {old_hash}, ''\n\
                     WHERE {old_hash} <> {new_hash};\n\
                     INSERT OR REPLACE INTO {log} (data_key, timestamp, flag, hash_key, device)\n\
                     VALUES (NEW.rowid, quilt_timestamp(), {local}, {new_hash}, '');\n\
                 END;\n\
                 CREATE TRIGGER IF NOT EXISTS {t_delete} AFTER DELETE ON {user}\n\
                 BEGIN\n\
                     INSERT OR REPLACE INTO {log} (data_key, timestamp, flag, hash_key, device)\n\
                     VALUES (-1, quilt_timestamp(), {tombstone}, {old_hash}, '');\n\
                 END;",
                log = log,
                user = user,
                ts_index = quote_ident(&format!("{}_ts", log_table_name(table))),
                t_insert = quote_ident(&format!("quilt_{table}_insert")),
                t_update = quote_ident(&format!("quilt_{table}_update")),
                t_delete = quote_ident(&format!("quilt_{table}_delete")),
                local = flags::LOCAL,
                tombstone = flags::LOCAL | flags::DELETE,
                old_hash = old_hash,
                new_hash = new_hash,
            ))?;

            // Rows that existed before elevation still need log entries.
            let row_hash = hash_expr("", &pks);
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {log} (data_key, timestamp, flag, hash_key, device)\n\
                     SELECT rowid, quilt_timestamp(), {local}, {row_hash}, '' FROM {user}",
                    log = log,
                    user = user,
                    local = flags::LOCAL,
                    row_hash = row_hash,
                ),
                [],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        let mut distributed = self.distributed.write().unwrap_or_else(|e| e.into_inner());
        distributed.insert(table.to_string());
        let joined = distributed.iter().cloned().collect::<Vec<_>>().join("\n");
        drop(distributed);
        self.pool.with_writer(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO quilt_meta (key, value) VALUES (?1, ?2)",
                rusqlite::params![META_DISTRIBUTED, joined.as_bytes()],
            )?;
            Ok(())
        })?;
        info!(table, "distributed table created");
        Ok(())
    }

    /// Sync-read: the local change-log entries of `table` inside
    /// `(range.since, range.until]`, strictly ascending by timestamp.
    ///
    /// Entries above the per-item limit are skipped. Once the running
    /// payload size passes `spec.block_size` the batch ends with a
    /// continuation token resuming at the first unseen timestamp; bounded
    /// queries (limit/offset/order-by) return a single batch without one.
    /// Rows in range that fail the query predicate come back flagged
    /// miss-query with no payload. Batches stay timestamp-ordered
    /// regardless of `order_by`, which only marks the query bounded.
    pub fn get_sync_data(
        &self,
        table: &str,
        query: &SyncQuery,
        range: SyncRange,
        spec: DataSizeSpec,
        token: Option<ContinueToken>,
    ) -> Result<(Vec<SyncItem>, Option<ContinueToken>), StoreError> {
        if !self.time.is_syncable() {
            return Err(StoreError::NotSyncable);
        }
        self.ensure_distributed(table)?;
        let schema = self.schema(table)?;

        let low = token
            .map(|t| t.next_timestamp.saturating_sub(1))
            .unwrap_or(range.since);
        let (limit_count, limit_offset) = match query.limit {
            Some((count, offset)) => (count, offset),
            None => (u64::MAX, 0),
        };
        let bounded = query.is_bounded();

        self.pool.with_reader(|conn| {
            let mut log_stmt = conn.prepare(&format!(
                "SELECT data_key, timestamp, flag, hash_key, device FROM {} \
                 WHERE timestamp > ?1 AND timestamp <= ?2 ORDER BY timestamp ASC",
                quote_ident(&log_table_name(table))
            ))?;
            let mut row_stmt = conn.prepare(&format!(
                "SELECT * FROM {} WHERE rowid = ?1",
                quote_ident(table)
            ))?;

            let mut items = Vec::new();
            let mut total = 0usize;
            let mut matched_seen = 0u64;
            let mut matched_taken = 0u64;
            let mut next_token = None;

            let mut rows = log_stmt.query(rusqlite::params![clamp_ts(low), clamp_ts(range.until)])?;
            while let Some(log_row) = rows.next()? {
                let mut item = SyncItem {
                    data_key: log_row.get(0)?,
                    timestamp: log_row.get::<_, i64>(1)? as u64,
                    flags: log_row.get::<_, i64>(2)? as u32,
                    hash_key: log_row.get(3)?,
                    device: log_row.get(4)?,
                    row: Vec::new(),
                };

                if !item.is_delete() {
                    let row = row_stmt
                        .query_row(rusqlite::params![item.data_key], |row| {
                            read_row(row, schema.columns.len())
                        })
                        .map(Some)
                        .or_else(|e| match e {
                            rusqlite::Error::QueryReturnedNoRows => Ok(None),
                            other => Err(other),
                        })?;
                    let Some(row) = row else {
                        // Log and table disagree; the row vanished.
                        continue;
                    };
                    match &query.predicate {
                        Some(predicate) if !matches(predicate, &schema, &row)? => {
                            item.flags |= flags::MISS_QUERY;
                        }
                        _ => item.row = row,
                    }
                }

                if bounded {
                    // Bounded queries ship matches only, offset first.
                    if item.is_miss_query() {
                        continue;
                    }
                    matched_seen += 1;
                    if matched_seen <= limit_offset {
                        continue;
                    }
                    if matched_taken >= limit_count {
                        break;
                    }
                }

                let size = item.approx_size();
                if size > MAX_ITEM_SIZE {
                    warn!(timestamp = item.timestamp, size, "oversized entry skipped");
                    continue;
                }
                if !bounded && !items.is_empty() && total + size > spec.block_size {
                    next_token = Some(ContinueToken {
                        next_timestamp: item.timestamp,
                    });
                    break;
                }
                total += size;
                if bounded {
                    matched_taken += 1;
                }
                items.push(item);
            }

            Ok((items, next_token))
        })
    }

    /// Apply a remote batch transactionally into the mirror of
    /// `(table, device)` and advance the device watermark.
    pub fn put_sync_data(
        &self,
        table: &str,
        device: &str,
        peer_schema: &TableSchema,
        items: &[SyncItem],
    ) -> Result<(), StoreError> {
        self.ensure_distributed(table)?;
        let local_schema = self.schema(table)?;
        local_schema.check_extension(peer_schema)?;

        let mirror = mirror_table_name(table, device);
        let mirror_log = mirror_log_name(&mirror);
        let columns: Vec<String> = peer_schema
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect();

        self.pool.with_writer(|conn| {
            let tx = conn.transaction()?;

            tx.execute_batch(&format!(
                "{};\n\
                 CREATE TABLE IF NOT EXISTS {log} (\n\
                     data_key INTEGER NOT NULL,\n\
                     timestamp INTEGER NOT NULL,\n\
                     flag INTEGER NOT NULL,\n\
                     hash_key BLOB NOT NULL UNIQUE,\n\
                     device TEXT NOT NULL DEFAULT ''\n\
                 )",
                peer_schema.create_table_sql(&mirror),
                log = quote_ident(&mirror_log),
            ))?;
            extend_mirror_columns(&tx, &mirror, peer_schema)?;

            let mut max_applied = 0u64;
            for item in items {
                let existing: Option<i64> = tx
                    .query_row(
                        &format!(
                            "SELECT data_key FROM {} WHERE hash_key = ?1",
                            quote_ident(&mirror_log)
                        ),
                        rusqlite::params![item.hash_key],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;

                if item.is_delete() || item.is_miss_query() {
                    if let Some(data_key) = existing {
                        tx.execute(
                            &format!("DELETE FROM {} WHERE rowid = ?1", quote_ident(&mirror)),
                            rusqlite::params![data_key],
                        )?;
                        tx.execute(
                            &format!(
                                "DELETE FROM {} WHERE hash_key = ?1",
                                quote_ident(&mirror_log)
                            ),
                            rusqlite::params![item.hash_key],
                        )?;
                    }
                    max_applied = max_applied.max(item.timestamp);
                    continue;
                }

                if item.row.len() != peer_schema.columns.len() {
                    return Err(StoreError::SchemaMismatch(format!(
                        "row width {} does not match peer schema {}",
                        item.row.len(),
                        peer_schema.columns.len()
                    )));
                }

                let params =
                    rusqlite::params_from_iter(item.row.iter().map(to_sql_value));
                let data_key = match existing {
                    Some(data_key) => {
                        let assignments: Vec<String> = columns
                            .iter()
                            .enumerate()
                            .map(|(i, c)| format!("{} = ?{}", c, i + 1))
                            .collect();
                        tx.execute(
                            &format!(
                                "UPDATE {} SET {} WHERE rowid = {}",
                                quote_ident(&mirror),
                                assignments.join(", "),
                                data_key
                            ),
                            params,
                        )?;
                        data_key
                    }
                    None => {
                        let placeholders: Vec<String> =
                            (1..=columns.len()).map(|i| format!("?{i}")).collect();
                        tx.execute(
                            &format!(
                                "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
                                quote_ident(&mirror),
                                columns.join(", "),
                                placeholders.join(", ")
                            ),
                            params,
                        )?;
                        tx.last_insert_rowid()
                    }
                };
                tx.execute(
                    &format!(
                        "INSERT OR REPLACE INTO {} (data_key, timestamp, flag, hash_key, device) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        quote_ident(&mirror_log)
                    ),
                    rusqlite::params![
                        data_key,
                        item.timestamp as i64,
                        flags::REMOTE as i64,
                        item.hash_key,
                        device
                    ],
                )?;
                max_applied = max_applied.max(item.timestamp);
            }

            if max_applied > 0 {
                let current = read_watermark(&tx, table, device)?;
                if max_applied > current {
                    tx.execute(
                        "INSERT OR REPLACE INTO quilt_meta (key, value) VALUES (?1, ?2)",
                        rusqlite::params![
                            watermark_key(table, device),
                            max_applied.to_le_bytes().to_vec()
                        ],
                    )?;
                }
            }
            tx.commit()?;
            debug!(table, device, applied = items.len(), "remote batch applied");
            Ok(())
        })
    }

    /// Highest timestamp applied from `device` into `table`'s mirror.
    pub fn watermark(&self, table: &str, device: &str) -> Result<u64, StoreError> {
        self.pool
            .with_reader(|conn| read_watermark(conn, table, device))
    }

    /// Replace the key-check record with one sealed by the new secret.
    /// Row data is gated, not row-encrypted; the check is what future
    /// opens verify.
    pub fn rekey(&self, new_secret: &SecretKey) -> Result<(), StoreError> {
        let check = ValueSealer::new(new_secret)?.key_check()?;
        self.pool.with_writer(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO quilt_meta (key, value) VALUES (?1, ?2)",
                rusqlite::params![META_KEY_CHECK, check],
            )?;
            Ok(())
        })
    }

    /// Snapshot the whole database into `dest`.
    pub fn export(&self, dest: &Path) -> Result<(), StoreError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.pool.with_reader(|conn| {
            let mut dst = Connection::open(dest)?;
            let backup = rusqlite::backup::Backup::new(conn, &mut dst)?;
            backup.run_to_completion(64, std::time::Duration::from_millis(10), None)?;
            Ok(())
        })
    }

    /// Restore the whole database from a snapshot written by
    /// [`export`](Self::export).
    pub fn import(&self, src: &Path) -> Result<(), StoreError> {
        self.pool.with_writer(|conn| {
            let source = Connection::open(src)?;
            let backup = rusqlite::backup::Backup::new(&source, conn)?;
            backup.run_to_completion(64, std::time::Duration::from_millis(10), None)?;
            Ok(())
        })?;
        let distributed = self.pool.with_writer(|conn| load_distributed(conn))?;
        *self.distributed.write().unwrap_or_else(|e| e.into_inner()) = distributed;
        Ok(())
    }

    fn ensure_distributed(&self, table: &str) -> Result<(), StoreError> {
        let distributed = self.distributed.read().unwrap_or_else(|e| e.into_inner());
        if distributed.contains(table) {
            Ok(())
        } else {
            Err(StoreError::SchemaMismatch(format!(
                "table {table} is not distributed"
            )))
        }
    }
}

impl std::fmt::Debug for RelationalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalStore")
            .field("pool", &self.pool)
            .field("time", &self.time)
            .finish_non_exhaustive()
    }
}

/// Shadow log of a table (user table or mirror).
pub fn log_table_name(table: &str) -> String {
    format!("meta_{table}_log")
}

/// Shadow log of a mirror table.
pub fn mirror_log_name(mirror: &str) -> String {
    format!("{mirror}_log")
}

fn clamp_ts(ts: u64) -> i64 {
    ts.min(i64::MAX as u64) as i64
}

/// Mirror of `table` for one remote device, named by a truncated hash of
/// the device id.
pub fn mirror_table_name(table: &str, device: &str) -> String {
    let digest = Sha256::digest(device.as_bytes());
    format!("meta_{}_{}", table, &hex::encode(digest)[..16])
}

fn watermark_key(table: &str, device: &str) -> String {
    format!("watermark:{table}:{device}")
}

fn read_watermark(conn: &Connection, table: &str, device: &str) -> Result<u64, StoreError> {
    let value: Option<Vec<u8>> = conn
        .query_row(
            "SELECT value FROM quilt_meta WHERE key = ?1",
            rusqlite::params![watermark_key(table, device)],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(value
        .and_then(|v| v.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0))
}

fn load_distributed(conn: &Connection) -> Result<BTreeSet<String>, StoreError> {
    let value: Option<Vec<u8>> = conn
        .query_row(
            "SELECT value FROM quilt_meta WHERE key = ?1",
            rusqlite::params![META_DISTRIBUTED],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(value
        .map(|v| {
            String::from_utf8_lossy(&v)
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default())
}

fn verify_key_check(
    conn: &Connection,
    secret: Option<&SecretKey>,
    existed: bool,
) -> Result<(), StoreError> {
    let stored: Option<Vec<u8>> = conn
        .query_row(
            "SELECT value FROM quilt_meta WHERE key = ?1",
            rusqlite::params![META_KEY_CHECK],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match (secret, stored) {
        (Some(secret), Some(stored)) => ValueSealer::new(secret)?.verify_key_check(&stored),
        (Some(secret), None) => {
            if existed {
                let user_tables: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
                     AND name NOT LIKE 'quilt_%' AND name NOT LIKE 'sqlite_%'",
                    [],
                    |row| row.get(0),
                )?;
                if user_tables > 0 {
                    return Err(StoreError::Crypt(
                        "encrypted open of a store without key check".into(),
                    ));
                }
            }
            let check = ValueSealer::new(secret)?.key_check()?;
            conn.execute(
                "INSERT OR REPLACE INTO quilt_meta (key, value) VALUES (?1, ?2)",
                rusqlite::params![META_KEY_CHECK, check],
            )?;
            Ok(())
        }
        (None, Some(_)) => Err(StoreError::Crypt(
            "plaintext open of an encrypted store".into(),
        )),
        (None, None) => Ok(()),
    }
}

fn open_connection(path: &Path, time: &Arc<TimeHelper>) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    register_functions(&conn, time)?;
    Ok(conn)
}

fn register_functions(conn: &Connection, time: &Arc<TimeHelper>) -> Result<(), StoreError> {
    let helper = std::panic::AssertUnwindSafe(Arc::clone(time));
    conn.create_scalar_function("quilt_timestamp", 0, FunctionFlags::SQLITE_UTF8, move |_| {
        Ok(helper.next() as i64)
    })?;
    conn.create_scalar_function(
        "quilt_hash",
        -1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let mut hasher = Sha256::new();
            for i in 0..ctx.len() {
                match ctx.get_raw(i) {
                    ValueRef::Null => hasher.update([0u8]),
                    ValueRef::Integer(v) => {
                        hasher.update([1u8]);
                        hasher.update(v.to_le_bytes());
                    }
                    ValueRef::Real(v) => {
                        hasher.update([2u8]);
                        hasher.update(v.to_le_bytes());
                    }
                    ValueRef::Text(v) => {
                        hasher.update([3u8]);
                        hasher.update((v.len() as u64).to_le_bytes());
                        hasher.update(v);
                    }
                    ValueRef::Blob(v) => {
                        hasher.update([4u8]);
                        hasher.update((v.len() as u64).to_le_bytes());
                        hasher.update(v);
                    }
                }
            }
            Ok(hasher.finalize().to_vec())
        },
    )?;
    Ok(())
}

/// `quilt_hash(<prefix>."pk1", ...)` expression over the key columns.
fn hash_expr(prefix: &str, pk_columns: &[&crate::relational::schema::ColumnDef]) -> String {
    let args: Vec<String> = pk_columns
        .iter()
        .map(|c| {
            if prefix.is_empty() {
                quote_ident(&c.name)
            } else {
                format!("{}.{}", prefix, quote_ident(&c.name))
            }
        })
        .collect();
    format!("quilt_hash({})", args.join(", "))
}

fn extend_mirror_columns(
    conn: &Connection,
    mirror: &str,
    peer_schema: &TableSchema,
) -> Result<(), StoreError> {
    let current = TableSchema::read(conn, mirror)?;
    for extra in peer_schema.columns.iter().skip(current.columns.len()) {
        let mut def = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(mirror),
            quote_ident(&extra.name),
            extra.type_name
        );
        if let Some(default) = &extra.default {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        if extra.not_null && extra.default.is_some() {
            def.push_str(" NOT NULL");
        }
        conn.execute(&def, [])?;
    }
    Ok(())
}

fn read_row(row: &rusqlite::Row<'_>, columns: usize) -> Result<Vec<ColumnValue>, rusqlite::Error> {
    let mut out = Vec::with_capacity(columns);
    for i in 0..columns {
        out.push(match row.get_ref(i)? {
            ValueRef::Null => ColumnValue::Null,
            ValueRef::Integer(v) => ColumnValue::Integer(v),
            ValueRef::Real(v) => ColumnValue::Real(v),
            ValueRef::Text(v) => ColumnValue::Text(String::from_utf8_lossy(v).into_owned()),
            ValueRef::Blob(v) => ColumnValue::Blob(v.to_vec()),
        });
    }
    Ok(out)
}

fn to_sql_value(value: &ColumnValue) -> rusqlite::types::Value {
    match value {
        ColumnValue::Null => rusqlite::types::Value::Null,
        ColumnValue::Integer(v) => rusqlite::types::Value::Integer(*v),
        ColumnValue::Real(v) => rusqlite::types::Value::Real(*v),
        ColumnValue::Text(v) => rusqlite::types::Value::Text(v.clone()),
        ColumnValue::Blob(v) => rusqlite::types::Value::Blob(v.clone()),
    }
}

fn matches(
    predicate: &Predicate,
    schema: &TableSchema,
    row: &[ColumnValue],
) -> Result<bool, StoreError> {
    let index = schema
        .columns
        .iter()
        .position(|c| c.name == predicate.column)
        .ok_or_else(|| {
            StoreError::Decode(format!("unknown predicate column {}", predicate.column))
        })?;
    let Some(order) = compare(&row[index], &predicate.value) else {
        return Ok(matches!(predicate.op, PredicateOp::NotEq));
    };
    Ok(match predicate.op {
        PredicateOp::Eq => order == Ordering::Equal,
        PredicateOp::NotEq => order != Ordering::Equal,
        PredicateOp::Gt => order == Ordering::Greater,
        PredicateOp::Lt => order == Ordering::Less,
    })
}

fn compare(a: &ColumnValue, b: &ColumnValue) -> Option<Ordering> {
    match (a, b) {
        (ColumnValue::Integer(x), ColumnValue::Integer(y)) => Some(x.cmp(y)),
        (ColumnValue::Real(x), ColumnValue::Real(y)) => x.partial_cmp(y),
        (ColumnValue::Integer(x), ColumnValue::Real(y)) => (*x as f64).partial_cmp(y),
        (ColumnValue::Real(x), ColumnValue::Integer(y)) => x.partial_cmp(&(*y as f64)),
        (ColumnValue::Text(x), ColumnValue::Text(y)) => Some(x.cmp(y)),
        (ColumnValue::Blob(x), ColumnValue::Blob(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
