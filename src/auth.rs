//! Authentication and authorization gates.
//!
//! The gate asks a [`SessionOracle`] who is calling. Unknown callers are answered
//! with 401 (and callers without the admin role with 403 when the admin variant is
//! used) before the wrapped service ever runs. Verified callers are forwarded with
//! an `x-user-id` header and a typed [`Principal`] extension.

use crate::error::Rejection;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{HeaderValue, AUTHORIZATION};
use http::request::Parts;
use http::{Request, Response};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tower::Service;
use tracing::{debug, warn};

/// Header carrying the verified principal id to downstream handlers.
pub const X_USER_ID: &str = "x-user-id";

const ADMIN_REQUIRED: &str = "Admin access required";

/// Caller role as issued by the session backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Role {
    User,
    Admin,
}

/// Verified identity of the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Errors reported by a session oracle.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum SessionError {
    /// The credentials could not be parsed.
    #[error("malformed credentials: {0}")]
    Malformed(String),
    /// The session backend could not be reached.
    #[error("session backend unavailable: {0}")]
    Unavailable(String),
}

/// Pluggable session verification.
///
/// Implementations look at the request head (cookies, `Authorization`, ...) and
/// return the principal it belongs to, or `None` for anonymous requests.
#[async_trait]
pub trait SessionOracle: Send + Sync {
    async fn verify_session(&self, request: &Parts) -> Result<Option<Principal>, SessionError>;
}

/// In-memory oracle mapping `Authorization: Bearer <token>` values to principals.
#[derive(Debug, Default, Clone)]
pub struct BearerSessions {
    sessions: Arc<RwLock<HashMap<String, Principal>>>,
}

impl BearerSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the principal behind `token`.
    pub fn insert(&self, token: impl Into<String>, principal: Principal) {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner).insert(token.into(), principal);
    }

    /// Revoke a token, returning the principal it belonged to.
    pub fn revoke(&self, token: &str) -> Option<Principal> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner).remove(token)
    }
}

#[async_trait]
impl SessionOracle for BearerSessions {
    async fn verify_session(&self, request: &Parts) -> Result<Option<Principal>, SessionError> {
        let Some(value) = request.headers.get(AUTHORIZATION) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .map_err(|_| SessionError::Malformed("authorization header is not visible ASCII".into()))?;
        let Some(token) = value.strip_prefix("Bearer ").map(str::trim) else {
            return Ok(None);
        };
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(sessions.get(token).cloned())
    }
}

/// What the gate demands of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Any verified principal.
    Authenticated,
    /// A verified principal with [`Role::Admin`].
    Admin,
}

/// Forward `request` as `principal`: sets `x-user-id` (overwriting anything the
/// client sent) and inserts the typed [`Principal`] extension.
pub fn attach_principal<B>(request: Request<B>, principal: Principal) -> Request<B> {
    let (mut parts, body) = request.into_parts();
    match HeaderValue::from_str(&principal.id) {
        Ok(value) => {
            parts.headers.insert(X_USER_ID, value);
        }
        Err(_) => {
            parts.headers.remove(X_USER_ID);
            warn!("principal id is not a valid header value; x-user-id omitted");
        }
    }
    parts.extensions.insert(principal);
    Request::from_parts(parts, body)
}

async fn verify(
    oracle: &dyn SessionOracle,
    requirement: Requirement,
    parts: &Parts,
) -> Result<Principal, Rejection> {
    let principal = match oracle.verify_session(parts).await {
        Ok(Some(principal)) if !principal.id.is_empty() => principal,
        Ok(_) => {
            debug!(path = %parts.uri.path(), "no session; rejecting");
            return Err(Rejection::Unauthenticated);
        }
        Err(error) => {
            warn!(%error, path = %parts.uri.path(), "session verification failed");
            return Err(Rejection::Unauthenticated);
        }
    };
    if requirement == Requirement::Admin && !principal.is_admin() {
        debug!(principal = %principal.id, "admin role required; rejecting");
        return Err(Rejection::Unauthorized(ADMIN_REQUIRED.into()));
    }
    Ok(principal)
}

/// Layer that gates a service behind session verification.
#[derive(Clone)]
pub struct AuthLayer {
    oracle: Arc<dyn SessionOracle>,
    requirement: Requirement,
}

impl AuthLayer {
    /// Require any verified principal.
    pub fn new(oracle: Arc<dyn SessionOracle>) -> Self {
        Self { oracle, requirement: Requirement::Authenticated }
    }

    /// Require a verified principal with the admin role.
    pub fn admin(oracle: Arc<dyn SessionOracle>) -> Self {
        Self { oracle, requirement: Requirement::Admin }
    }

    pub fn requirement(&self) -> Requirement {
        self.requirement
    }
}

impl<S> tower_layer::Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService { inner, oracle: self.oracle.clone(), requirement: self.requirement }
    }
}

/// Service that verifies the caller before forwarding.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    oracle: Arc<dyn SessionOracle>,
    requirement: Requirement,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AuthService<S>
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

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let oracle = self.oracle.clone();
        let requirement = self.requirement;
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let principal = match verify(oracle.as_ref(), requirement, &parts).await {
                Ok(principal) => principal,
                Err(rejection) => return Ok(rejection.into_response()),
            };
            let request = attach_principal(Request::from_parts(parts, body), principal);
            inner.call(request).await
        })
    }
}
