//! Clock abstractions used by the bucket store and the rate-limit headers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
///
/// Values are milliseconds since the unix epoch: the store derives both refill
/// arithmetic and the `X-RateLimit-Reset` timestamp from the same reading.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Wall clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default()
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying time, so a test can keep one handle and
/// give another to the store.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start the clock at `millis` since the unix epoch.
    pub fn starting_at(millis: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(millis)) }
    }

    /// Move time forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
