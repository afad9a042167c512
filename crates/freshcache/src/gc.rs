//! Probabilistic, one-shot garbage collection for TTL-less backends
//!
//! Each write draws a number in `[0, 1_000_000)`; when it falls below the
//! configured probability and this store has not swept yet, the writer runs
//! one sweep inline. Reads already skip expired entries, so the sweep only
//! bounds disk or table growth.

use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;
use tracing::{info, warn};

use crate::Result;

/// Draws are taken from `0..PROBABILITY_SCALE`
pub const PROBABILITY_SCALE: u32 = 1_000_000;

/// 100 per million, i.e. 0.01% of writes
pub const DEFAULT_GC_PROBABILITY: u32 = 100;

/// Per-store GC trigger
#[derive(Debug)]
pub struct GcPolicy {
    probability_per_million: u32,
    swept: AtomicBool,
}

impl GcPolicy {
    pub fn new(probability_per_million: u32) -> Self {
        Self {
            probability_per_million: probability_per_million.min(PROBABILITY_SCALE),
            swept: AtomicBool::new(false),
        }
    }

    /// Policy that never triggers a sweep on write
    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn probability_per_million(&self) -> u32 {
        self.probability_per_million
    }

    /// Whether a sweep already ran for this store
    pub fn has_swept(&self) -> bool {
        self.swept.load(Ordering::Acquire)
    }

    /// Draw once; true at most once per policy instance
    pub fn should_sweep(&self) -> bool {
        if self.probability_per_million == 0 || self.has_swept() {
            return false;
        }
        let draw = rand::thread_rng().gen_range(0..PROBABILITY_SCALE);
        draw < self.probability_per_million && !self.swept.swap(true, Ordering::AcqRel)
    }

    /// Run `sweep` if this write drew the trigger. Sweep failures are logged,
    /// never propagated: the write that triggered them must still happen.
    pub fn maybe_sweep<F>(&self, store: &str, sweep: F)
    where
        F: FnOnce() -> Result<usize>,
    {
        if !self.should_sweep() {
            return;
        }
        match sweep() {
            Ok(removed) => info!("GC sweep on {} store removed {} expired entries", store, removed),
            Err(e) => warn!("GC sweep on {} store failed: {}", store, e),
        }
    }
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_GC_PROBABILITY)
    }
}
