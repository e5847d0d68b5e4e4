//! Convenient re-exports for common Floodgate types.
pub use crate::{
    auth::{AuthLayer, BearerSessions, Principal, Role, SessionError, SessionOracle},
    cache::{etag_for, ConditionalCacheLayer, CACHE_CONTROL_POLICY},
    clock::{Clock, ManualClock, SystemClock},
    error::{GovernanceError, Rejection},
    identity::{client_address, RateLimitKey},
    quota::{QuotaClass, QuotaConfig},
    rate_limit::{middleware::QuotaPolicy, BucketStore, Decision, RateLimitLayer, StoreConfig},
    stack::Governance,
};
