//! Quota configuration: the capacity/refill pair and the named classes that
//! routes are limited by.

use std::fmt;
use std::str::FromStr;

/// Immutable token-bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawQuotaConfig", into = "RawQuotaConfig"))]
pub struct QuotaConfig {
    max_tokens: u32,
    refill_per_second: f64,
}

/// Errors produced when validating a quota configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum QuotaConfigError {
    /// Capacity must be at least one token.
    #[error("max_tokens must be >= 1 (got {provided})")]
    InvalidCapacity {
        /// Value provided by caller.
        provided: u32,
    },
    /// Refill rate must be finite and strictly positive.
    #[error("refill_per_second must be finite and > 0 (got {provided})")]
    InvalidRefillRate {
        /// Value provided by caller.
        provided: f64,
    },
}

impl QuotaConfig {
    /// Validate and build a quota.
    pub fn new(max_tokens: u32, refill_per_second: f64) -> Result<Self, QuotaConfigError> {
        if max_tokens == 0 {
            return Err(QuotaConfigError::InvalidCapacity { provided: max_tokens });
        }
        if !refill_per_second.is_finite() || refill_per_second <= 0.0 {
            return Err(QuotaConfigError::InvalidRefillRate { provided: refill_per_second });
        }
        Ok(Self { max_tokens, refill_per_second })
    }

    /// `max_tokens` requests per minute, refilled continuously.
    pub fn per_minute(max_tokens: u32) -> Result<Self, QuotaConfigError> {
        Self::new(max_tokens, f64::from(max_tokens) / 60.0)
    }

    // Presets are known-valid, so they skip validation.
    const fn preset(max_tokens: u32, refill_per_second: f64) -> Self {
        Self { max_tokens, refill_per_second }
    }

    /// Bucket capacity.
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    /// Continuous refill rate in tokens per second.
    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }

    /// Milliseconds an empty bucket needs to refill completely.
    pub fn millis_to_full(&self) -> u64 {
        (f64::from(self.max_tokens) / self.refill_per_second * 1000.0).ceil() as u64
    }

    /// Identity of this config inside the bucket map. `f64` is not `Hash`, so
    /// the rate participates through its bit pattern.
    pub(crate) fn fingerprint(&self) -> (u32, u64) {
        (self.max_tokens, self.refill_per_second.to_bits())
    }
}

#[cfg(feature = "serde")]
#[derive(serde::Serialize, serde::Deserialize)]
struct RawQuotaConfig {
    max_tokens: u32,
    refill_per_second: f64,
}

#[cfg(feature = "serde")]
impl TryFrom<RawQuotaConfig> for QuotaConfig {
    type Error = QuotaConfigError;

    fn try_from(raw: RawQuotaConfig) -> Result<Self, Self::Error> {
        QuotaConfig::new(raw.max_tokens, raw.refill_per_second)
    }
}

#[cfg(feature = "serde")]
impl From<QuotaConfig> for RawQuotaConfig {
    fn from(cfg: QuotaConfig) -> Self {
        Self { max_tokens: cfg.max_tokens, refill_per_second: cfg.refill_per_second }
    }
}

/// General traffic: 60 requests per minute per address.
pub const DEFAULT: QuotaConfig = QuotaConfig::preset(60, 1.0);
/// Login/registration endpoints: 5 requests per minute per address.
pub const AUTH: QuotaConfig = QuotaConfig::preset(5, 5.0 / 60.0);
/// Review and photo uploads: 10 requests per minute per address.
pub const REVIEW: QuotaConfig = QuotaConfig::preset(10, 10.0 / 60.0);
/// Writes by signed-in users: 60 per minute per user.
pub const AUTHENTICATED_WRITE: QuotaConfig = QuotaConfig::preset(60, 1.0);
/// Writes by anonymous clients: 20 per minute per address.
pub const ANONYMOUS_WRITE: QuotaConfig = QuotaConfig::preset(20, 20.0 / 60.0);

/// Named quota classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum QuotaClass {
    Default,
    Auth,
    Review,
    AuthenticatedWrite,
    AnonymousWrite,
}

impl QuotaClass {
    /// Every class, in declaration order.
    pub const ALL: [QuotaClass; 5] = [
        QuotaClass::Default,
        QuotaClass::Auth,
        QuotaClass::Review,
        QuotaClass::AuthenticatedWrite,
        QuotaClass::AnonymousWrite,
    ];

    /// Stable name, used in bucket keys and log fields.
    pub fn name(self) -> &'static str {
        match self {
            QuotaClass::Default => "default",
            QuotaClass::Auth => "auth",
            QuotaClass::Review => "review",
            QuotaClass::AuthenticatedWrite => "authenticated-write",
            QuotaClass::AnonymousWrite => "anonymous-write",
        }
    }

    /// The preset quota for this class.
    pub fn config(self) -> QuotaConfig {
        match self {
            QuotaClass::Default => DEFAULT,
            QuotaClass::Auth => AUTH,
            QuotaClass::Review => REVIEW,
            QuotaClass::AuthenticatedWrite => AUTHENTICATED_WRITE,
            QuotaClass::AnonymousWrite => ANONYMOUS_WRITE,
        }
    }

    /// Whether buckets of this class are keyed by verified principal rather
    /// than by client address.
    pub fn is_authenticated(self) -> bool {
        matches!(self, QuotaClass::AuthenticatedWrite)
    }
}

impl fmt::Display for QuotaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned by [`QuotaClass::from_str`] for unknown names.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown quota class '{0}'")]
pub struct UnknownQuotaClass(pub String);

impl FromStr for QuotaClass {
    type Err = UnknownQuotaClass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QuotaClass::ALL
            .into_iter()
            .find(|class| class.name() == s)
            .ok_or_else(|| UnknownQuotaClass(s.to_string()))
    }
}
