//! In-memory bucket storage with a self-stopping cleanup sweeper.

use crate::clock::{Clock, SystemClock};
use crate::quota::{QuotaClass, QuotaConfig};
use crate::rate_limit::{Decision, TokenBucket};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_STALENESS_SECS: u64 = 300;

/// Validated timing for the background sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawStoreConfig", into = "RawStoreConfig"))]
pub struct StoreConfig {
    sweep_interval: Duration,
    staleness: Duration,
}

/// Errors produced when validating store configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreConfigError {
    /// Sweep interval must be > 0.
    #[error("sweep_interval must be > 0")]
    ZeroSweepInterval,
    /// Buckets must stay idle for at least one full sweep interval before eviction.
    #[error("staleness ({staleness:?}) must be >= sweep_interval ({sweep_interval:?})")]
    StalenessBelowInterval {
        /// Value provided for the staleness threshold.
        staleness: Duration,
        /// Value provided for the sweep interval.
        sweep_interval: Duration,
    },
}

impl StoreConfig {
    /// Start building a config from the defaults (sweep every 60s, evict after 300s idle).
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// How often the sweeper wakes up.
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Idle time after which a (full) bucket is evicted.
    pub fn staleness(&self) -> Duration {
        self.staleness
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            staleness: Duration::from_secs(DEFAULT_STALENESS_SECS),
        }
    }
}

/// Builder for [`StoreConfig`].
#[derive(Debug, Clone)]
pub struct StoreConfigBuilder {
    sweep_interval: Duration,
    staleness: Duration,
}

impl Default for StoreConfigBuilder {
    fn default() -> Self {
        let defaults = StoreConfig::default();
        Self { sweep_interval: defaults.sweep_interval, staleness: defaults.staleness }
    }
}

impl StoreConfigBuilder {
    /// Set how often the sweeper wakes up (must be > 0).
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the idle time after which a full bucket is evicted (must be >= the interval).
    pub fn staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Validate and build the config.
    pub fn build(self) -> Result<StoreConfig, StoreConfigError> {
        if self.sweep_interval.is_zero() {
            return Err(StoreConfigError::ZeroSweepInterval);
        }
        if self.staleness < self.sweep_interval {
            return Err(StoreConfigError::StalenessBelowInterval {
                staleness: self.staleness,
                sweep_interval: self.sweep_interval,
            });
        }
        Ok(StoreConfig { sweep_interval: self.sweep_interval, staleness: self.staleness })
    }
}

#[cfg(feature = "serde")]
#[derive(serde::Serialize, serde::Deserialize)]
struct RawStoreConfig {
    sweep_interval_secs: u64,
    staleness_secs: u64,
}

#[cfg(feature = "serde")]
impl TryFrom<RawStoreConfig> for StoreConfig {
    type Error = StoreConfigError;

    fn try_from(raw: RawStoreConfig) -> Result<Self, Self::Error> {
        StoreConfig::builder()
            .sweep_interval(Duration::from_secs(raw.sweep_interval_secs))
            .staleness(Duration::from_secs(raw.staleness_secs))
            .build()
    }
}

#[cfg(feature = "serde")]
impl From<StoreConfig> for RawStoreConfig {
    fn from(cfg: StoreConfig) -> Self {
        Self {
            sweep_interval_secs: cfg.sweep_interval.as_secs(),
            staleness_secs: cfg.staleness.as_secs(),
        }
    }
}

/// Which budget a bucket belongs to besides its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Scope {
    /// A named class; classes never share buckets even when their presets are equal.
    Class(QuotaClass),
    /// An ad-hoc quota, identified by its values.
    Custom(u32, u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    key: String,
    scope: Scope,
}

impl BucketKey {
    fn custom(key: &str, quota: &QuotaConfig) -> Self {
        let (max_tokens, rate_bits) = quota.fingerprint();
        Self { key: key.to_string(), scope: Scope::Custom(max_tokens, rate_bits) }
    }

    fn class(key: &str, class: QuotaClass) -> Self {
        Self { key: key.to_string(), scope: Scope::Class(class) }
    }
}

/// Lifecycle of the background sweep task.
#[derive(Debug)]
enum Sweeper {
    /// No task; the next bucket creation starts one.
    Idle,
    /// A task is sleeping between sweeps.
    Running(JoinHandle<()>),
}

#[derive(Debug)]
struct State {
    buckets: HashMap<BucketKey, TokenBucket>,
    sweeper: Sweeper,
}

#[derive(Debug)]
struct Shared {
    clock: Arc<dyn Clock>,
    config: StoreConfig,
    state: Mutex<State>,
}

impl Shared {
    // Every mutation leaves the map consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evict idle buckets. Returns the number evicted and, when the map ended up
    /// empty, the handle of the sweeper that is now considered stopped.
    fn sweep(&self) -> (usize, Option<JoinHandle<()>>) {
        let now = self.clock.now_millis();
        let staleness = self.config.staleness;
        let mut state = self.lock();
        let before = state.buckets.len();
        state.buckets.retain(|_, bucket| !bucket.is_evictable(now, staleness));
        let evicted = before - state.buckets.len();
        if evicted > 0 {
            debug!(evicted, remaining = state.buckets.len(), "evicted idle rate-limit buckets");
        }
        let stopped = if state.buckets.is_empty() {
            match std::mem::replace(&mut state.sweeper, Sweeper::Idle) {
                Sweeper::Running(handle) => {
                    debug!("bucket map empty; stopping sweeper");
                    Some(handle)
                }
                Sweeper::Idle => None,
            }
        } else {
            None
        };
        (evicted, stopped)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Sweeper::Running(handle) = &state.sweeper {
            handle.abort();
        }
    }
}

async fn run_sweeper(shared: Weak<Shared>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        // The store is gone; nothing left to sweep.
        let Some(shared) = shared.upgrade() else { return };
        let (_, stopped) = shared.sweep();
        if stopped.is_some() {
            return;
        }
    }
}

/// Process-wide token bucket storage.
///
/// Cloning is cheap and clones share the same buckets. Each admission check runs
/// under one lock with no suspension point, so concurrent requests for the same
/// key can never both spend the last token.
#[derive(Debug, Clone)]
pub struct BucketStore {
    shared: Arc<Shared>,
}

impl Default for BucketStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl BucketStore {
    /// Create a store on the system clock.
    pub fn new(config: StoreConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }

    /// Create a store on a custom clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(config: StoreConfig, clock: C) -> Self {
        Self {
            shared: Arc::new(Shared {
                clock: Arc::new(clock),
                config,
                state: Mutex::new(State { buckets: HashMap::new(), sweeper: Sweeper::Idle }),
            }),
        }
    }

    /// Refill the bucket for `(key, quota)` and try to take one token from it.
    ///
    /// A bucket seen for the first time starts full. Ad-hoc quotas are told
    /// apart by their values; use [`admit_class`](Self::admit_class) for the
    /// named classes.
    pub fn admit(&self, key: &str, quota: &QuotaConfig) -> Decision {
        self.admit_keyed(BucketKey::custom(key, quota), *quota)
    }

    /// Like [`admit`](Self::admit), but the bucket is keyed by `(key, class)`,
    /// so two classes with identical presets keep independent budgets.
    pub fn admit_class(&self, key: &str, class: QuotaClass) -> Decision {
        self.admit_keyed(BucketKey::class(key, class), class.config())
    }

    fn admit_keyed(&self, bucket_key: BucketKey, quota: QuotaConfig) -> Decision {
        let now = self.shared.clock.now_millis();
        let mut state = self.shared.lock();
        let (decision, created) = match state.buckets.entry(bucket_key) {
            Entry::Occupied(mut entry) => (entry.get_mut().try_acquire(now), false),
            Entry::Vacant(entry) => {
                (entry.insert(TokenBucket::full(quota, now)).try_acquire(now), true)
            }
        };
        if created {
            self.ensure_sweeper(&mut state);
        }
        decision
    }

    /// Run one eviction pass now. Returns the number of buckets evicted.
    pub fn sweep(&self) -> usize {
        let (evicted, stopped) = self.shared.sweep();
        if let Some(handle) = stopped {
            handle.abort();
        }
        evicted
    }

    /// Snapshot of a bucket as of its last admission check.
    pub fn bucket(&self, key: &str, quota: &QuotaConfig) -> Option<TokenBucket> {
        self.shared.lock().buckets.get(&BucketKey::custom(key, quota)).copied()
    }

    /// Snapshot of a named-class bucket.
    pub fn class_bucket(&self, key: &str, class: QuotaClass) -> Option<TokenBucket> {
        self.shared.lock().buckets.get(&BucketKey::class(key, class)).copied()
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.shared.lock().buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a background sweeper task is currently scheduled.
    pub fn is_sweeping(&self) -> bool {
        matches!(&self.shared.lock().sweeper, Sweeper::Running(handle) if !handle.is_finished())
    }

    /// Timing this store was built with.
    pub fn config(&self) -> StoreConfig {
        self.shared.config
    }

    fn ensure_sweeper(&self, state: &mut State) {
        // A task can also finish underneath us when the runtime that spawned it shuts down.
        if matches!(&state.sweeper, Sweeper::Running(handle) if !handle.is_finished()) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let interval = self.shared.config.sweep_interval;
                let handle = runtime.spawn(run_sweeper(Arc::downgrade(&self.shared), interval));
                debug!(interval_ms = interval.as_millis() as u64, "starting bucket sweeper");
                state.sweeper = Sweeper::Running(handle);
            }
            Err(_) => {
                debug!("no tokio runtime; idle buckets are only evicted by explicit sweep()");
                state.sweeper = Sweeper::Idle;
            }
        }
    }
}
