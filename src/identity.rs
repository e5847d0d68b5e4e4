//! Who is calling: client address extraction and rate-limit key derivation.

use crate::auth::Principal;
use crate::quota::QuotaClass;
use http::{HeaderMap, Request};
use std::fmt;
use tracing::warn;

/// Header carrying the proxy chain; the first entry is the original client.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Single-address header set by some proxies.
pub const X_REAL_IP: &str = "x-real-ip";
/// Address used when the request carries no usable address metadata.
pub const LOOPBACK_SENTINEL: &str = "127.0.0.1";

/// Best available client address: first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then [`LOOPBACK_SENTINEL`]. Never fails.
pub fn client_address(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|addr| !addr.is_empty());
    let real_ip = || {
        headers
            .get(X_REAL_IP)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
    };
    forwarded.or_else(real_ip).unwrap_or(LOOPBACK_SENTINEL).to_string()
}

/// Identity a bucket is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    /// Anonymous traffic, keyed by client address.
    Address(String),
    /// Verified principal, keyed per quota class so each class has its own budget.
    Principal { id: String, class: QuotaClass },
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitKey::Address(addr) => write!(f, "ip:{addr}"),
            RateLimitKey::Principal { id, class } => write!(f, "user:{id}:{class}"),
        }
    }
}

/// The principal attached by an upstream authentication gate, if any.
///
/// Only the typed extension is trusted; a client can send any `x-user-id`
/// header it likes.
pub fn verified_principal<B>(request: &Request<B>) -> Option<&Principal> {
    request.extensions().get::<Principal>().filter(|p| !p.id.is_empty())
}

/// Derive the bucket key for `request` under `class`.
pub fn resolve_key<B>(request: &Request<B>, class: QuotaClass) -> RateLimitKey {
    if class.is_authenticated() {
        if let Some(principal) = verified_principal(request) {
            return RateLimitKey::Principal { id: principal.id.clone(), class };
        }
        warn!(
            class = %class,
            "authenticated quota class used without an authentication gate; keying by address"
        );
    }
    RateLimitKey::Address(client_address(request.headers()))
}
