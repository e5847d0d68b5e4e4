use crate::quota::QuotaConfig;
use crate::rate_limit::Decision;
use std::time::Duration;

// Absorbs float rounding in refill arithmetic so that a bucket refilled for
// exactly `1 / rate` seconds reads as holding one whole token.
const TOKEN_EPSILON: f64 = 1e-9;

/// A single token bucket: a continuous balance refilled at a fixed rate.
///
/// Buckets are only ever touched while the owning store holds its lock, so
/// every method here is a plain synchronous state transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    tokens: f64,
    last_refill_at: u64,
    quota: QuotaConfig,
}

impl TokenBucket {
    /// A bucket at full capacity, as seen by a first-ever request.
    pub fn full(quota: QuotaConfig, now_millis: u64) -> Self {
        Self { tokens: f64::from(quota.max_tokens()), last_refill_at: now_millis, quota }
    }

    /// Current (possibly fractional) balance as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Unix millis of the last refill.
    pub fn last_refill_at(&self) -> u64 {
        self.last_refill_at
    }

    /// Quota this bucket was created for.
    pub fn quota(&self) -> QuotaConfig {
        self.quota
    }

    /// Credit tokens for the time elapsed since the last refill, capped at capacity.
    pub fn refill(&mut self, now_millis: u64) {
        self.tokens = self.balance_at(now_millis);
        // A clock that steps backwards must not credit the same interval twice.
        self.last_refill_at = self.last_refill_at.max(now_millis);
    }

    /// Refill, then try to take one token.
    pub fn try_acquire(&mut self, now_millis: u64) -> Decision {
        self.refill(now_millis);
        let limit = self.quota.max_tokens();
        let rate = self.quota.refill_per_second();

        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            let missing = f64::from(limit) - self.tokens;
            Decision::Admitted {
                remaining: (self.tokens + TOKEN_EPSILON).floor() as u32,
                reset_at_millis: now_millis.saturating_add(millis_for(missing, rate)),
                limit,
            }
        } else {
            let wait = millis_for(1.0 - self.tokens, rate);
            Decision::Refused {
                retry_after: Duration::from_millis(wait),
                reset_at_millis: now_millis.saturating_add(wait),
                limit,
            }
        }
    }

    /// True once the bucket has seen no traffic for `staleness` and has
    /// refilled completely, i.e. dropping it is indistinguishable from keeping it.
    pub fn is_evictable(&self, now_millis: u64, staleness: Duration) -> bool {
        let idle = now_millis.saturating_sub(self.last_refill_at);
        let staleness = u64::try_from(staleness.as_millis()).unwrap_or(u64::MAX);
        idle >= staleness
            && self.balance_at(now_millis) + TOKEN_EPSILON >= f64::from(self.quota.max_tokens())
    }

    fn balance_at(&self, now_millis: u64) -> f64 {
        let elapsed_secs = now_millis.saturating_sub(self.last_refill_at) as f64 / 1000.0;
        (self.tokens + elapsed_secs * self.quota.refill_per_second())
            .min(f64::from(self.quota.max_tokens()))
    }
}

/// Whole milliseconds needed to accumulate `tokens` at `rate` tokens/sec,
/// saturating at `u64::MAX` for rates too slow to represent.
fn millis_for(tokens: f64, rate: f64) -> u64 {
    if tokens <= TOKEN_EPSILON {
        return 0;
    }
    let millis = (tokens / rate * 1000.0 - TOKEN_EPSILON).ceil();
    if !millis.is_finite() || millis >= u64::MAX as f64 {
        return u64::MAX;
    }
    millis.max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn new_bucket_is_full() {
        let bucket = TokenBucket::full(quota::AUTH, T0);
        assert_eq!(bucket.tokens(), 5.0);
        assert_eq!(bucket.last_refill_at(), T0);
    }

    #[test]
    fn drains_then_refuses_with_time_to_one_token() {
        let mut bucket = TokenBucket::full(quota::AUTH, T0);
        let remaining: Vec<u32> =
            (0..5).map(|_| bucket.try_acquire(T0).remaining()).collect();
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        match bucket.try_acquire(T0) {
            Decision::Refused { retry_after, reset_at_millis, limit } => {
                assert_eq!(retry_after, Duration::from_secs(12));
                assert_eq!(reset_at_millis, T0 + 12_000);
                assert_eq!(limit, 5);
            }
            other => panic!("expected refusal, got {:?}", other),
        }
    }

    #[test]
    fn admitted_reset_is_time_until_full() {
        let mut bucket = TokenBucket::full(quota::AUTH, T0);
        let decision = bucket.try_acquire(T0);
        // one token missing at 5/60 tokens per second
        assert_eq!(decision.reset_at_millis(), T0 + 12_000);
    }

    #[test]
    fn partial_refill_does_not_admit_fractional_tokens() {
        let mut bucket = TokenBucket::full(quota::AUTH, T0);
        for _ in 0..5 {
            bucket.try_acquire(T0);
        }
        let decision = bucket.try_acquire(T0 + 6_000);
        assert!(!decision.is_admitted());
        assert_eq!(decision.retry_after(), Some(Duration::from_secs(6)));
        assert!((bucket.tokens() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let mut bucket = TokenBucket::full(quota::REVIEW, T0);
        bucket.try_acquire(T0);
        bucket.refill(T0 + 3_600_000);
        assert_eq!(bucket.tokens(), 10.0);
    }

    #[test]
    fn backwards_clock_does_not_double_credit() {
        let mut bucket = TokenBucket::full(quota::AUTH, T0);
        for _ in 0..5 {
            bucket.try_acquire(T0 + 12_000);
        }
        bucket.refill(T0);
        assert_eq!(bucket.last_refill_at(), T0 + 12_000);
        assert!(!bucket.try_acquire(T0 + 12_000).is_admitted());
    }

    #[test]
    fn evictable_only_when_idle_and_full() {
        let staleness = Duration::from_secs(300);
        let mut bucket = TokenBucket::full(quota::AUTH, T0);
        bucket.try_acquire(T0);
        assert!(!bucket.is_evictable(T0 + 299_999, staleness));
        assert!(bucket.is_evictable(T0 + 300_000, staleness));

        // A quota slower to refill than the staleness window stays resident.
        let slow = QuotaConfig::new(10, 0.001).unwrap();
        let mut bucket = TokenBucket::full(slow, T0);
        bucket.try_acquire(T0);
        assert!(!bucket.is_evictable(T0 + 300_000, staleness));
        assert!(bucket.is_evictable(T0 + 1_000_000, staleness));
    }

    #[test]
    fn vanishingly_slow_refill_saturates_instead_of_overflowing() {
        let glacial = QuotaConfig::new(1, 1e-300).unwrap();
        let mut bucket = TokenBucket::full(glacial, T0);

        let first = bucket.try_acquire(T0);
        assert!(first.is_admitted());
        assert_eq!(first.reset_at_millis(), u64::MAX);

        let second = bucket.try_acquire(T0 + 1_000);
        assert!(!second.is_admitted());
        assert_eq!(second.retry_after(), Some(Duration::from_millis(u64::MAX)));
        assert_eq!(second.reset_at_millis(), u64::MAX);
    }

    #[test]
    fn millis_for_clamps_unrepresentable_waits() {
        assert_eq!(millis_for(1.0, 1e-300), u64::MAX);
        assert_eq!(millis_for(1.0, f64::MIN_POSITIVE), u64::MAX);
        assert_eq!(millis_for(0.0, 1e-300), 0);
        assert_eq!(millis_for(1.0, 1.0), 1_000);
    }
}
