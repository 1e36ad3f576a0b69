//! Event handling module
//!
//! Provides the event envelope and the bounded sink shards deliver into.

pub mod dispatch;
pub mod serialize;

pub use dispatch::{channel, run_dispatcher, EventHandler};
pub use serialize::{event_type, GatewayEvent};
