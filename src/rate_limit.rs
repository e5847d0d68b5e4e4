//! Rate limiting primitives.
//!
//! This module provides the building blocks for per-identity rate limiting:
//! - [`BucketStore`]: the shared, lock-guarded map of token buckets.
//! - [`RateLimitLayer`]: Tower middleware that enforces a quota class.
//! - [`Decision`]: the result of an admission check (Admitted/Refused).
//!
//! # Architecture
//!
//! - **Middleware**: `RateLimitLayer` wraps your service. It resolves the caller's key
//!   and asks the store; it never looks at the bucket arithmetic.
//! - **Logic**: [`TokenBucket`] (in `bucket`) handles the refill math.
//! - **Storage**: `BucketStore` (in `store`) owns every bucket plus the background
//!   sweeper that evicts idle ones.

use std::time::Duration;

pub mod bucket;
pub mod middleware;
pub mod store;

pub use bucket::TokenBucket;
pub use middleware::{RateLimitLayer, RateLimitService};
pub use store::{BucketStore, StoreConfig, StoreConfigBuilder, StoreConfigError};

/// The decision returned by an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The request may proceed; one token was consumed.
    Admitted {
        /// Whole tokens left after this admission.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u32,
        /// Unix millis at which the bucket will be full again.
        reset_at_millis: u64,
        /// Bucket capacity.
        limit: u32,
    },
    /// The request is refused; nothing was consumed.
    Refused {
        /// How long until one token is available.
        /// Useful for `Retry-After` headers.
        retry_after: Duration,
        /// Unix millis at which one token will be available.
        reset_at_millis: u64,
        /// Bucket capacity.
        limit: u32,
    },
}

impl Decision {
    /// Helper to check if admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }

    /// Whole tokens remaining; zero when refused.
    pub fn remaining(&self) -> u32 {
        match self {
            Decision::Admitted { remaining, .. } => *remaining,
            Decision::Refused { .. } => 0,
        }
    }

    /// Unix millis of the next reset point.
    pub fn reset_at_millis(&self) -> u64 {
        match self {
            Decision::Admitted { reset_at_millis, .. }
            | Decision::Refused { reset_at_millis, .. } => *reset_at_millis,
        }
    }

    /// Reset point rounded up to whole unix seconds, as sent in `X-RateLimit-Reset`.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_millis().div_ceil(1000)
    }

    /// Bucket capacity.
    pub fn limit(&self) -> u32 {
        match self {
            Decision::Admitted { limit, .. } | Decision::Refused { limit, .. } => *limit,
        }
    }

    /// Wait before retrying, if refused.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Admitted { .. } => None,
            Decision::Refused { retry_after, .. } => Some(*retry_after),
        }
    }
}
