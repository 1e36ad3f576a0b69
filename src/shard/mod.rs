//! Shard management module
//!
//! One [`ShardSession`] per shard, driven and supervised by a [`ShardManager`].
//! Everything observable about a shard is mirrored into [`ShardState`].

mod backoff;
mod heartbeat;
mod identify;
mod manager;
mod session;
mod state;
pub mod transport;

pub use backoff::Backoff;
pub use heartbeat::{HeartbeatState, HeartbeatTimer};
pub use identify::{IdentifyThrottle, DEFAULT_IDENTIFY_WINDOW};
pub use manager::ShardManager;
pub use session::{CycleOutcome, SessionState, ShardCommand, ShardId, ShardSession};
pub use state::{ShardSnapshot, ShardState, ShardStatus, ShardStatusEvent};
pub use transport::{CloseFrame, Transport, TransportOpener, WebSocketOpener, WireMessage};
