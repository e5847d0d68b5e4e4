//! Conditional GET support through content-hash validators.
//!
//! [`ConditionalCacheLayer`] buffers each `200 OK` body, derives a weak `ETag` from
//! its bytes and answers `304 Not Modified` when the client already holds that
//! representation. Other statuses pass through untouched.

use crate::error::{BoxError, GovernanceError};
use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{
    HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_NONE_MATCH,
};
use http::{Request, Response, StatusCode};
use http_body::Body;
use http_body_util::BodyExt;
use md5::{Digest, Md5};
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::debug;

/// `Cache-Control` attached to every response that carries a validator.
pub const CACHE_CONTROL_POLICY: &str = "public, max-age=60, stale-while-revalidate=300";

/// Weak validator for `body`: `W/"<md5 hex>"`.
///
/// A function of the exact bytes only. Two serializations of the same data get
/// different validators.
pub fn etag_for(body: &[u8]) -> String {
    format!("W/\"{}\"", hex::encode(Md5::digest(body)))
}

/// Whether an `If-None-Match` value matches `etag` under weak comparison.
///
/// The value may list several validators separated by commas; `*` matches any.
pub fn if_none_match_matches(header: &str, etag: &str) -> bool {
    let ours = opaque_tag(etag);
    header
        .split(',')
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .any(|candidate| candidate == "*" || opaque_tag(candidate) == ours)
}

fn opaque_tag(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

/// Layer adding `ETag` negotiation to a service.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConditionalCacheLayer;

impl ConditionalCacheLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for ConditionalCacheLayer {
    type Service = ConditionalCacheService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConditionalCacheService { inner }
    }
}

/// Service produced by [`ConditionalCacheLayer`].
#[derive(Clone, Debug)]
pub struct ConditionalCacheService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ConditionalCacheService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Body<Data = Bytes> + From<Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<ResBody>;
    type Error = GovernanceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GovernanceError::Inner)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let validators: Vec<HeaderValue> =
            req.headers().get_all(IF_NONE_MATCH).iter().cloned().collect();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let response = inner.call(req).await.map_err(GovernanceError::Inner)?;
            if response.status() != StatusCode::OK {
                return Ok(response);
            }

            let (mut parts, body) = response.into_parts();
            let bytes = body.collect().await.map_err(|e| GovernanceError::Body(e.into()))?.to_bytes();
            let etag = etag_for(&bytes);
            let Ok(tag) = HeaderValue::from_str(&etag) else {
                return Ok(Response::from_parts(parts, ResBody::from(bytes)));
            };
            parts.headers.insert(ETAG, tag);
            parts.headers.insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_POLICY));

            let fresh = validators
                .iter()
                .filter_map(|value| value.to_str().ok())
                .any(|value| if_none_match_matches(value, &etag));
            if fresh {
                debug!(etag = %etag, "validator matched; not modified");
                parts.status = StatusCode::NOT_MODIFIED;
                parts.headers.remove(CONTENT_LENGTH);
                parts.headers.remove(CONTENT_TYPE);
                return Ok(Response::from_parts(parts, ResBody::from(Bytes::new())));
            }
            Ok(Response::from_parts(parts, ResBody::from(bytes)))
        })
    }
}
