//! Arrakis client - Discord gateway shards and rate-limited REST
//!
//! Two independent halves share this crate:
//! - [`shard`]: one state machine per gateway shard (connect, identify or
//!   resume, heartbeat, reconnect) supervised by a [`shard::ShardManager`]
//! - [`rest`]: every HTTP call passes a global throttle and a per-route
//!   bucket, learned from response headers, before it leaves the process

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod rest;
pub mod shard;

pub use error::{GatewayError, RestError};
