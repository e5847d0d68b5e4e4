use crate::error::{Rejection, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
use crate::identity::{resolve_key, verified_principal};
use crate::quota::QuotaClass;
use crate::rate_limit::{BucketStore, Decision};
use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::HeaderValue;
use http::{Request, Response, StatusCode};
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::debug;

/// How the layer picks the quota class for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPolicy {
    /// Always the same class.
    Fixed(QuotaClass),
    /// Authenticated-write for requests carrying a verified principal, anonymous-write
    /// otherwise.
    Adaptive,
}

impl QuotaPolicy {
    /// Class that applies to `request`.
    pub fn class_for<B>(self, request: &Request<B>) -> QuotaClass {
        match self {
            QuotaPolicy::Fixed(class) => class,
            QuotaPolicy::Adaptive if verified_principal(request).is_some() => {
                QuotaClass::AuthenticatedWrite
            }
            QuotaPolicy::Adaptive => QuotaClass::AnonymousWrite,
        }
    }
}

/// A layer that enforces a quota using a shared [`BucketStore`].
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    store: BucketStore,
    policy: QuotaPolicy,
}

impl RateLimitLayer {
    /// Enforce `class` on every request.
    pub fn new(store: BucketStore, class: QuotaClass) -> Self {
        Self { store, policy: QuotaPolicy::Fixed(class) }
    }

    /// Pick the write class from the caller's verification state.
    ///
    /// Must sit beneath an authentication gate to ever see a principal.
    pub fn adaptive(store: BucketStore) -> Self {
        Self { store, policy: QuotaPolicy::Adaptive }
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, store: self.store.clone(), policy: self.policy }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Clone, Debug)]
pub struct RateLimitService<S> {
    inner: S,
    store: BucketStore,
    policy: QuotaPolicy,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<Bytes> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let store = self.store.clone();
        let policy = self.policy;
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let class = policy.class_for(&req);
            let key = resolve_key(&req, class).to_string();
            let decision = store.admit_class(&key, class);
            match decision {
                Decision::Refused { retry_after, limit, .. } => {
                    debug!(
                        key = %key,
                        class = %class,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "rate limit exceeded"
                    );
                    let rejection = Rejection::QuotaExceeded {
                        retry_after,
                        reset_at_secs: decision.reset_at_secs(),
                        limit,
                    };
                    Ok(rejection.into_response())
                }
                Decision::Admitted { remaining, .. } => {
                    debug!(key = %key, class = %class, remaining, "request admitted");
                    // The token stays consumed even if the handler fails.
                    let mut response = inner.call(req).await?;
                    stamp(&mut response, &decision);
                    Ok(response)
                }
            }
        })
    }
}

/// Add quota headers to successful responses (2xx and 304).
fn stamp<B>(response: &mut Response<B>, decision: &Decision) {
    let status = response.status();
    if !status.is_success() && status != StatusCode::NOT_MODIFIED {
        return;
    }
    let headers = response.headers_mut();
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining()));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_secs()));
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit()));
}
