//! Connection pool: one writer, a bounded set of readers.
//!
//! Readers queue FIFO when the pool is drained; an acquisition that finds
//! no free connection is classified stale and retried a fixed number of
//! times before surfacing as busy.

use crate::error::StoreError;
use rusqlite::Connection;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub const MAX_READERS: usize = 16;

const STALE_RETRY: u32 = 3;
const STALE_RETRY_INTERVAL_MS: u64 = 30;

pub struct ConnPool {
    writer: Mutex<Connection>,
    readers: Mutex<VecDeque<Connection>>,
    available: Condvar,
}

impl ConnPool {
    pub fn new(writer: Connection, readers: Vec<Connection>) -> Self {
        Self {
            writer: Mutex::new(writer),
            readers: Mutex::new(readers.into()),
            available: Condvar::new(),
        }
    }

    /// Run `f` on the single writer connection. Writers serialize here.
    pub fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut conn)
    }

    /// Run `f` on a reader connection, waiting FIFO for one to free up.
    pub fn with_reader<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.acquire_reader()?;
        let result = f(&conn);
        let mut readers = self.readers.lock().unwrap_or_else(|e| e.into_inner());
        readers.push_back(conn);
        drop(readers);
        self.available.notify_one();
        result
    }

    fn acquire_reader(&self) -> Result<Connection, StoreError> {
        let mut readers = self.readers.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..=STALE_RETRY {
            if let Some(conn) = readers.pop_front() {
                return Ok(conn);
            }
            let (guard, _timeout) = self
                .available
                .wait_timeout(readers, Duration::from_millis(STALE_RETRY_INTERVAL_MS))
                .unwrap_or_else(|e| e.into_inner());
            readers = guard;
        }
        match readers.pop_front() {
            Some(conn) => Ok(conn),
            None => Err(StoreError::Busy),
        }
    }
}

impl std::fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let readers = self.readers.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("ConnPool")
            .field("idle_readers", &readers.len())
            .finish()
    }
}
