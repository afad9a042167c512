//! Time source for expiry bookkeeping

use std::{
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Source of the current unix time in seconds
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> u64;

    /// Absolute expiry for a TTL; `0` stays `0` (never expires)
    fn expires_at(&self, ttl_secs: u64) -> u64 {
        if ttl_secs == 0 {
            0
        } else {
            self.now().saturating_add(ttl_secs)
        }
    }

    /// Whether an absolute expiry lies in the past
    fn is_expired(&self, expires_at: u64) -> bool {
        expires_at != 0 && expires_at <= self.now()
    }
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Manually driven clock for deterministic expiry tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Start at the current wall-clock time
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now())
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
