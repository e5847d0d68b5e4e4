#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Request governance for `tower` HTTP services: who may call, how often, and
//! whether the response needs to be sent at all.
//!
//! ## Features
//!
//! - **Authentication gates** backed by a pluggable [`SessionOracle`](auth::SessionOracle)
//! - **Token-bucket rate limiting** per client address or per principal, with
//!   named quota classes and a self-stopping cleanup sweeper
//! - **Conditional caching** with content-hash `ETag`s and `304 Not Modified`
//! - **Route policies** composing the layers in the right order
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::prelude::*;
//! use bytes::Bytes;
//! use http::{Request, Response, StatusCode};
//! use http_body_util::Full;
//! use std::convert::Infallible;
//! use std::sync::Arc;
//! use tower::{service_fn, ServiceExt};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let sessions = BearerSessions::new();
//! sessions.insert("s3cret", Principal::new("user-42", Role::User));
//! let governance = Governance::new(Arc::new(sessions));
//!
//! let handler = service_fn(|req: Request<Full<Bytes>>| async move {
//!     let user = req
//!         .headers()
//!         .get("x-user-id")
//!         .and_then(|v| v.to_str().ok())
//!         .unwrap_or_default()
//!         .to_owned();
//!     Ok::<_, Infallible>(Response::new(Full::<Bytes>::from(user)))
//! });
//! let svc = governance.protected_write(handler);
//!
//! let anonymous = svc.clone().oneshot(Request::new(Full::default())).await.unwrap();
//! assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
//!
//! let signed_in = Request::builder()
//!     .header("authorization", "Bearer s3cret")
//!     .body(Full::default())
//!     .unwrap();
//! let res = svc.oneshot(signed_in).await.unwrap();
//! assert_eq!(res.status(), StatusCode::OK);
//! assert_eq!(res.headers()["x-ratelimit-remaining"], "59");
//! # }
//! ```

pub mod auth;
pub mod cache;
pub mod clock;
pub mod error;
pub mod identity;
pub mod prelude;
pub mod quota;
pub mod rate_limit;
pub mod stack;

// Re-exports
pub use auth::{AuthLayer, AuthService, BearerSessions, Principal, Role, SessionError, SessionOracle};
pub use cache::{ConditionalCacheLayer, ConditionalCacheService};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{GovernanceError, Rejection};
pub use quota::{QuotaClass, QuotaConfig, QuotaConfigError};
pub use rate_limit::{BucketStore, Decision, RateLimitLayer, RateLimitService, StoreConfig};
pub use stack::Governance;
