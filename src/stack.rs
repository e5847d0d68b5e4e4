//! Route policies composing the governance layers.
//!
//! Layers are stacked with [`ServiceBuilder`], first listed outermost:
//!
//! `authenticate → limit → conditional cache → handler`
//!
//! The gate runs first so rejected callers never spend tokens, and the adaptive
//! limiter sits beneath it so it can see the verified principal.

use crate::auth::{AuthLayer, AuthService, SessionOracle};
use crate::cache::{ConditionalCacheLayer, ConditionalCacheService};
use crate::quota::QuotaClass;
use crate::rate_limit::{BucketStore, RateLimitLayer, RateLimitService};
use std::fmt;
use std::sync::Arc;
use tower::ServiceBuilder;

/// Shared bucket store plus session oracle, handing out configured layers.
#[derive(Clone)]
pub struct Governance {
    store: BucketStore,
    oracle: Arc<dyn SessionOracle>,
}

impl fmt::Debug for Governance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Governance").field("store", &self.store).finish_non_exhaustive()
    }
}

impl Governance {
    /// Governance over a fresh store with default sweep timing.
    pub fn new(oracle: Arc<dyn SessionOracle>) -> Self {
        Self::with_store(BucketStore::default(), oracle)
    }

    pub fn with_store(store: BucketStore, oracle: Arc<dyn SessionOracle>) -> Self {
        Self { store, oracle }
    }

    /// The store every limiter from this instance shares.
    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    pub fn authenticate(&self) -> AuthLayer {
        AuthLayer::new(self.oracle.clone())
    }

    pub fn require_admin(&self) -> AuthLayer {
        AuthLayer::admin(self.oracle.clone())
    }

    pub fn limit(&self, class: QuotaClass) -> RateLimitLayer {
        RateLimitLayer::new(self.store.clone(), class)
    }

    pub fn limit_adaptive(&self) -> RateLimitLayer {
        RateLimitLayer::adaptive(self.store.clone())
    }

    pub fn conditional_cache(&self) -> ConditionalCacheLayer {
        ConditionalCacheLayer::new()
    }

    /// Public GETs: default quota by address, then ETag negotiation.
    pub fn public_read<S>(&self, handler: S) -> RateLimitService<ConditionalCacheService<S>> {
        ServiceBuilder::new()
            .layer(self.limit(QuotaClass::Default))
            .layer(self.conditional_cache())
            .service(handler)
    }

    /// Login and registration: tight per-address quota.
    pub fn auth_endpoint<S>(&self, handler: S) -> RateLimitService<S> {
        ServiceBuilder::new().layer(self.limit(QuotaClass::Auth)).service(handler)
    }

    /// Writes open to anonymous callers.
    pub fn open_write<S>(&self, handler: S) -> RateLimitService<S> {
        ServiceBuilder::new().layer(self.limit_adaptive()).service(handler)
    }

    /// Writes requiring a session, limited per principal.
    pub fn protected_write<S>(&self, handler: S) -> AuthService<RateLimitService<S>> {
        ServiceBuilder::new()
            .layer(self.authenticate())
            .layer(self.limit_adaptive())
            .service(handler)
    }

    /// Review submissions.
    pub fn review_write<S>(&self, handler: S) -> AuthService<RateLimitService<S>> {
        ServiceBuilder::new()
            .layer(self.authenticate())
            .layer(self.limit(QuotaClass::Review))
            .service(handler)
    }

    /// Admin-only routes.
    pub fn admin<S>(&self, handler: S) -> AuthService<RateLimitService<S>> {
        ServiceBuilder::new()
            .layer(self.require_admin())
            .layer(self.limit(QuotaClass::Default))
            .service(handler)
    }
}
