//! Rate-limit response headers

use reqwest::header::HeaderMap;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET: &str = "x-ratelimit-reset";
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const BUCKET: &str = "x-ratelimit-bucket";
pub const GLOBAL: &str = "x-ratelimit-global";
pub const SCOPE: &str = "x-ratelimit-scope";
pub const RETRY_AFTER: &str = "retry-after";

/// Everything the server said about rate limits on one response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub bucket: Option<String>,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    /// Absolute reset, seconds since the epoch
    pub reset_epoch: Option<f64>,
    pub global: bool,
    pub scope: Option<String>,
    pub retry_after: Option<Duration>,
}

/// Complete per-bucket information from one response
#[derive(Debug, Clone, PartialEq)]
pub struct BucketInfo<'a> {
    pub hash: &'a str,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

impl RateLimitHeaders {
    pub fn parse(headers: &HeaderMap) -> Self {
        Self {
            bucket: text(headers, BUCKET).map(str::to_owned),
            limit: number(headers, LIMIT),
            remaining: number(headers, REMAINING),
            reset_after: seconds(headers, RESET_AFTER),
            reset_epoch: number(headers, RESET),
            global: text(headers, GLOBAL).is_some_and(|v| v.eq_ignore_ascii_case("true")),
            scope: text(headers, SCOPE).map(str::to_owned),
            retry_after: seconds(headers, RETRY_AFTER),
        }
    }

    /// Time until the window resets; prefers the relative header and
    /// falls back to the absolute one against the local clock.
    pub fn reset_in(&self, now: SystemTime) -> Option<Duration> {
        self.reset_after.or_else(|| {
            let now = now.duration_since(UNIX_EPOCH).ok()?.as_secs_f64();
            Duration::try_from_secs_f64((self.reset_epoch? - now).max(0.0)).ok()
        })
    }

    /// `None` unless the hash, limit, remaining and reset are all present.
    pub fn bucket_info(&self) -> Option<BucketInfo<'_>> {
        Some(BucketInfo {
            hash: self.bucket.as_deref()?,
            limit: self.limit?,
            remaining: self.remaining?,
            reset_after: self.reset_in(SystemTime::now())?,
        })
    }
}

/// 429 response body
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RateLimitBody {
    /// Seconds
    pub retry_after: f64,
    #[serde(default)]
    pub global: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Wait and scope for a 429, combining body and headers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimited {
    pub retry_after: Duration,
    pub global: bool,
}

impl RateLimited {
    /// A missing or unreadable body falls back to `Retry-After`, then one second.
    pub fn from_response(headers: &RateLimitHeaders, body: &[u8]) -> Self {
        let parsed = serde_json::from_slice::<RateLimitBody>(body).ok();
        let retry_after = parsed
            .as_ref()
            .and_then(|b| Duration::try_from_secs_f64(b.retry_after.max(0.0)).ok())
            .or(headers.retry_after)
            .or(headers.reset_after)
            .unwrap_or(Duration::from_secs(1));
        let global = parsed.as_ref().is_some_and(|b| b.global) || headers.global;
        Self { retry_after, global }
    }
}

fn text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok().map(str::trim)
}

fn number<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    text(headers, name)?.parse().ok()
}

fn seconds(headers: &HeaderMap, name: &str) -> Option<Duration> {
    let value: f64 = number(headers, name)?;
    Duration::try_from_secs_f64(value.max(0.0)).ok()
}
