//! Per-store monotonic clock.
//!
//! Timestamps drive change-log ordering and sync watermarks, so they must
//! be strictly increasing even when the wall clock jumps backwards. Small
//! regressions are absorbed by handing out `last + 1`; a regression past
//! the tolerated bound marks the clock tampered and the store
//! non-syncable until a log scan repairs it.

use quilt_model::Clock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Largest tolerated backwards wall-clock movement (1 hour).
pub const MAX_BACKWARD_US: u64 = 60 * 60 * 1000 * 1000;

pub struct TimeHelper {
    clock: Arc<dyn Clock>,
    last_us: AtomicU64,
    tampered: AtomicBool,
}

impl TimeHelper {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last_us: AtomicU64::new(0),
            tampered: AtomicBool::new(false),
        }
    }

    fn now_us(&self) -> u64 {
        self.clock.now_ms().saturating_mul(1000)
    }

    /// Next timestamp: wall-clock driven, strictly greater than every
    /// previous result.
    pub fn next(&self) -> u64 {
        let now = self.now_us();
        loop {
            let last = self.last_us.load(Ordering::SeqCst);
            if now.saturating_add(MAX_BACKWARD_US) < last {
                if !self.tampered.swap(true, Ordering::SeqCst) {
                    warn!(now, last, "wall clock moved backwards beyond bound, store non-syncable");
                }
            }
            let next = now.max(last.saturating_add(1));
            if next == u64::MAX && !self.tampered.swap(true, Ordering::SeqCst) {
                warn!("store clock overflow, store non-syncable");
            }
            if self
                .last_us
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }

    /// Whether sync reads may proceed.
    pub fn is_syncable(&self) -> bool {
        !self.tampered.load(Ordering::SeqCst)
    }

    /// Re-seed from the highest timestamp a log scan observed and clear
    /// the tamper mark.
    pub fn repair(&self, max_seen_us: u64) {
        let floor = max_seen_us.max(self.now_us());
        self.last_us.store(floor, Ordering::SeqCst);
        self.tampered.store(false, Ordering::SeqCst);
    }

    /// Seed at open time; keeps timestamps above everything already
    /// logged.
    pub fn observe(&self, seen_us: u64) {
        self.last_us.fetch_max(seen_us, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for TimeHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeHelper")
            .field("last_us", &self.last_us.load(Ordering::SeqCst))
            .field("tampered", &self.tampered.load(Ordering::SeqCst))
            .finish()
    }
}
