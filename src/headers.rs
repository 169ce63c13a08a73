//! Extraction of rate-limit metadata from response headers.

use http::HeaderMap;
use std::fmt;
use std::time::Duration;

pub(crate) const BUCKET: &str = "x-ratelimit-bucket";
pub(crate) const LIMIT: &str = "x-ratelimit-limit";
pub(crate) const REMAINING: &str = "x-ratelimit-remaining";
pub(crate) const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub(crate) const GLOBAL: &str = "x-ratelimit-global";
pub(crate) const SCOPE: &str = "x-ratelimit-scope";
pub(crate) const RETRY_AFTER: &str = "retry-after";
pub(crate) const VIA: &str = "via";

/// The scope a 429 applies to, from `X-RateLimit-Scope`.
///
/// Only `Shared` changes behavior (log severity); the others are carried for
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The caller's own per-bucket limit.
    User,
    /// A limit shared with other traffic to the resource; not the caller's
    /// fault, so never logged above info.
    Shared,
    /// The account-wide limit.
    Global,
    /// A scope this client does not recognize.
    Other,
}

impl Scope {
    fn parse(value: &str) -> Self {
        match value {
            "user" => Self::User,
            "shared" => Self::Shared,
            "global" => Self::Global,
            _ => Self::Other,
        }
    }
}

/// A response's rate-limit headers, decoded.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RateLimitHeaders {
    pub bucket: Option<String>,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_after: Option<Duration>,
    pub retry_after: Option<Duration>,
    pub global: bool,
    pub scope: Option<Scope>,
    /// Whether a `Via` header was present. A 429 that never passed through
    /// the platform's proxy came from the edge and is treated as global.
    pub proxied: bool,
}

impl RateLimitHeaders {
    /// Decode the rate-limit headers out of `headers`.
    ///
    /// Absent headers decode to `None`; present-but-malformed headers are an
    /// error, which the caller swallows and logs (the response is then
    /// treated as carrying no bucket information).
    pub fn parse(headers: &HeaderMap) -> Result<Self, HeaderError> {
        Ok(Self {
            bucket: str_header(headers, BUCKET)?.map(str::to_owned),
            limit: int_header(headers, LIMIT)?,
            remaining: int_header(headers, REMAINING)?,
            reset_after: seconds_header(headers, RESET_AFTER)?,
            retry_after: seconds_header(headers, RETRY_AFTER)?,
            global: bool_header(headers, GLOBAL)?,
            scope: str_header(headers, SCOPE)?.map(Scope::parse),
            proxied: headers.contains_key(VIA),
        })
    }

    pub fn has_bucket_update(&self) -> bool {
        self.limit.is_some() || self.remaining.is_some() || self.reset_after.is_some()
    }
}

fn str_header<'h>(headers: &'h HeaderMap, name: &'static str) -> Result<Option<&'h str>, HeaderError> {
    match headers.get(name) {
        Some(value) => value.to_str().map(Some).map_err(|_| HeaderError::new(name)),
        None => Ok(None),
    }
}

fn int_header(headers: &HeaderMap, name: &'static str) -> Result<Option<u64>, HeaderError> {
    str_header(headers, name)?
        .map(|v| v.trim().parse::<u64>().map_err(|_| HeaderError::new(name)))
        .transpose()
}

/// Durations arrive as float seconds, e.g. `Reset-After: 1.5`.
fn seconds_header(headers: &HeaderMap, name: &'static str) -> Result<Option<Duration>, HeaderError> {
    str_header(headers, name)?
        .map(|v| {
            v.trim()
                .parse::<f64>()
                .ok()
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64)
                .ok_or_else(|| HeaderError::new(name))
        })
        .transpose()
}

fn bool_header(headers: &HeaderMap, name: &'static str) -> Result<bool, HeaderError> {
    Ok(matches!(str_header(headers, name)?, Some(v) if v.trim().eq_ignore_ascii_case("true")))
}

/// A rate-limit header was present but unreadable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeaderError {
    header: &'static str,
}

impl HeaderError {
    fn new(header: &'static str) -> Self {
        Self { header }
    }
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed {} header", self.header)
    }
}

impl std::error::Error for HeaderError {}
