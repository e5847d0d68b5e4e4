//! Error types for the governance layers
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{Response, StatusCode};
use std::fmt;
use std::time::Duration;

/// Boxed error used for response-body failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Remaining whole tokens in the caller's bucket.
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
/// Unix seconds at which the bucket resets.
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";
/// Bucket capacity.
pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";

/// Why a gate refused to run the wrapped handler.
///
/// Every variant renders as a small JSON body with a stable `error` message and
/// no internal detail.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// No principal, or a principal with an empty id.
    #[error("Authentication required")]
    Unauthenticated,
    /// Valid principal without the required role.
    #[error("{0}")]
    Unauthorized(String),
    /// The caller's token bucket is empty.
    #[error("Too many requests. Please try again later.")]
    QuotaExceeded {
        /// Time until one token is available.
        retry_after: Duration,
        /// Unix seconds of the reset point.
        reset_at_secs: u64,
        /// Bucket capacity.
        limit: u32,
    },
}

impl Rejection {
    /// HTTP status for this rejection.
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::Unauthenticated => StatusCode::UNAUTHORIZED,
            Rejection::Unauthorized(_) => StatusCode::FORBIDDEN,
            Rejection::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// `Retry-After` in whole seconds, never below one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Rejection::QuotaExceeded { retry_after, .. } => {
                let millis = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
                Some(millis.div_ceil(1000).max(1))
            }
            _ => None,
        }
    }

    /// Render the rejection as a JSON response.
    pub fn into_response<B: From<Bytes>>(self) -> Response<B> {
        let body = serde_json::json!({ "error": self.to_string() }).to_string();
        let mut response = Response::new(B::from(Bytes::from(body)));
        *response.status_mut() = self.status();
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Rejection::QuotaExceeded { reset_at_secs, limit, .. } = &self {
            if let Some(secs) = self.retry_after_secs() {
                headers.insert(RETRY_AFTER, HeaderValue::from(secs));
            }
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(*limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from_static("0"));
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(*reset_at_secs));
        }
        response
    }
}

/// Service error of the conditional-cache layer.
#[derive(Debug)]
pub enum GovernanceError<E> {
    /// Reading the handler's response body failed.
    Body(BoxError),
    /// The wrapped handler failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GovernanceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Body(e) => write!(f, "failed to read response body: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GovernanceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Body(e) => Some(&**e),
            Self::Inner(e) => Some(e),
        }
    }
}

impl<E> GovernanceError<E> {
    /// Check if this error wraps a handler error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Check if this error came from reading the body.
    pub fn is_body(&self) -> bool {
        matches!(self, Self::Body(_))
    }

    /// Get the handler error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Body(_) => None,
        }
    }

    /// Borrow the handler error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Body(_) => None,
        }
    }
}
