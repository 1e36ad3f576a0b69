//! Domain error types for the Arrakis client
//!
//! Two taxonomies live here: [`GatewayError`] for shard sessions and the
//! shard manager, [`RestError`] for the REST executor.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns one of the typed errors below.

use crate::codec::DecodeError;
use std::time::Duration;
use thiserror::Error;

/// Boxed source error used at transport seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Gateway domain errors
///
/// Every variant carries the shard it happened on. Most of them are handled
/// inside the shard session (reconnect with backoff) and only reach callers as
/// status changes; [`GatewayError::is_fatal`] marks the ones that stop the
/// whole client.
///
/// Example log output:
/// ```text
/// GatewayError::TransportClosed { shard_id: 3, code: Some(4000), resumable: true }
/// → "shard 3 transport closed (code Some(4000), resumable: true)"
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No HELLO arrived within the handshake window
    #[error("shard {shard_id} received no HELLO within {waited:?}")]
    HandshakeTimeout { shard_id: u32, waited: Duration },

    /// A frame could not be decoded (corrupt stream or malformed payload)
    #[error("shard {shard_id} failed to decode gateway frame")]
    Decode {
        shard_id: u32,
        #[source]
        source: DecodeError,
    },

    /// The transport closed, with or without a close frame
    #[error("shard {shard_id} transport closed (code {code:?}, resumable: {resumable})")]
    TransportClosed {
        shard_id: u32,
        code: Option<u16>,
        resumable: bool,
    },

    /// Opening, reading or writing the transport failed
    #[error("shard {shard_id} transport failed")]
    TransportFailed {
        shard_id: u32,
        #[source]
        source: BoxError,
    },

    /// The gateway rejected our token (fatal)
    #[error("shard {shard_id} authentication rejected by gateway")]
    AuthRejected { shard_id: u32 },

    /// The gateway closed with a code that retrying cannot fix (fatal)
    #[error("shard {shard_id} closed with fatal code {code}: {reason}")]
    FatalClose {
        shard_id: u32,
        code: u16,
        reason: String,
    },

    /// The first frame after connecting was not HELLO
    #[error("shard {shard_id} expected {expected} but received opcode {op}")]
    UnexpectedPayload {
        shard_id: u32,
        expected: &'static str,
        op: u8,
    },

    /// A heartbeat went unacknowledged for a full interval
    #[error("shard {shard_id} stopped acknowledging heartbeats")]
    Zombied { shard_id: u32 },

    /// The gateway (or a REST hint) asked for a reconnect
    #[error("shard {shard_id} was asked to reconnect")]
    ReconnectRequested { shard_id: u32 },

    /// The gateway invalidated the session
    #[error("shard {shard_id} session invalidated (resumable: {resumable})")]
    SessionInvalidated { shard_id: u32, resumable: bool },

    /// The downstream event sink was dropped (fatal)
    #[error("shard {shard_id} event sink closed")]
    SinkClosed { shard_id: u32 },

    /// A shard index outside the range owned by this manager
    #[error("shard {shard_id} is outside the managed range {start}..{end}")]
    UnknownShard { shard_id: u32, start: u32, end: u32 },

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// Prometheus recorder could not be installed
    #[error("metrics recorder installation failed")]
    MetricsInstall(#[source] BoxError),
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::HandshakeTimeout { .. } => "handshake_timeout",
            Self::Decode { .. } => "decode",
            Self::TransportClosed { .. } => "transport_closed",
            Self::TransportFailed { .. } => "transport_failed",
            Self::AuthRejected { .. } => "auth_rejected",
            Self::FatalClose { .. } => "fatal_close",
            Self::UnexpectedPayload { .. } => "unexpected_payload",
            Self::Zombied { .. } => "zombied",
            Self::ReconnectRequested { .. } => "reconnect_requested",
            Self::SessionInvalidated { .. } => "session_invalidated",
            Self::SinkClosed { .. } => "sink_closed",
            Self::UnknownShard { .. } => "unknown_shard",
            Self::Config(_) => "config",
            Self::MetricsInstall(_) => "metrics_install",
        }
    }

    /// Fatal errors stop every shard and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthRejected { .. }
                | Self::FatalClose { .. }
                | Self::SinkClosed { .. }
                | Self::Config(_)
        )
    }

    /// Whether the session id may still be used to resume after this error.
    ///
    /// `false` closes the resume gate and forces a fresh IDENTIFY.
    pub fn allows_resume(&self) -> bool {
        match self {
            Self::TransportClosed { resumable, .. }
            | Self::SessionInvalidated { resumable, .. } => *resumable,
            other => !other.is_fatal(),
        }
    }
}

/// REST domain errors
///
/// Transport failures, 5xx responses and 429s are retried inside the
/// executor; callers only see them once retries are exhausted.
#[derive(Error, Debug)]
pub enum RestError {
    /// Network-level failure (connect, TLS, timeout, body read)
    #[error("transport error on {route}")]
    Transport {
        route: String,
        #[source]
        source: reqwest::Error,
    },

    /// Rate limited for longer than the caller is willing to wait
    #[error("rate limited on {route} for {retry_after:?} (global: {global})")]
    RateLimited {
        route: String,
        retry_after: Duration,
        global: bool,
    },

    /// 4xx other than 429, never retried
    #[error("{route} returned client error {status}: {body}")]
    ClientError {
        route: String,
        status: u16,
        body: String,
    },

    /// 5xx that persisted through every retry
    #[error("{route} returned server error {status} after {attempts} attempts")]
    ServerError {
        route: String,
        status: u16,
        body: String,
        attempts: u32,
    },

    /// Transport failures persisted through every retry
    #[error("{route} failed after {attempts} attempts")]
    RetryExhausted {
        route: String,
        attempts: u32,
        #[source]
        last: Box<RestError>,
    },

    /// Response body did not match the expected shape
    #[error("failed to decode response body from {route}")]
    Decode {
        route: String,
        #[source]
        source: serde_json::Error,
    },

    /// Route template parameter was not supplied
    #[error("route {template} is missing parameter '{param}'")]
    MissingParam {
        template: &'static str,
        param: String,
    },

    /// Base URL or compiled path did not form a valid URL
    #[error("invalid REST url")]
    InvalidUrl(#[from] url::ParseError),

    /// HTTP client could not be constructed
    #[error("failed to build HTTP client")]
    ClientBuild(#[source] reqwest::Error),

    /// Token contains bytes that cannot go in a header
    #[error("token is not a valid header value")]
    InvalidToken,
}

impl RestError {
    /// Returns a static label string suitable for Prometheus metrics.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::RateLimited { .. } => "rate_limited",
            Self::ClientError { .. } => "client_error",
            Self::ServerError { .. } => "server_error",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Decode { .. } => "decode",
            Self::MissingParam { .. } => "missing_param",
            Self::InvalidUrl(_) => "invalid_url",
            Self::ClientBuild(_) => "client_build",
            Self::InvalidToken => "invalid_token",
        }
    }

    /// Whether the executor retries this failure on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::ServerError { .. } | Self::RateLimited { .. }
        )
    }

    /// HTTP status of the response that produced this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ClientError { status, .. } | Self::ServerError { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}
