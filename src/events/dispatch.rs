//! Event sink and dispatcher
//!
//! Shards push into a bounded channel; a full channel makes them wait, so a
//! slow consumer slows the shards instead of losing events. The dispatcher
//! drains the channel in order and hands each event to an [`EventHandler`].

use super::GatewayEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// Downstream consumer of gateway events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: GatewayEvent);
}

/// Bounded sink shared by every shard
pub fn channel(capacity: usize) -> (mpsc::Sender<GatewayEvent>, mpsc::Receiver<GatewayEvent>) {
    mpsc::channel(capacity.max(1))
}

/// Drains `events` into `handler` until every sender is gone.
///
/// Returns the number of events handled.
pub async fn run_dispatcher<H>(mut events: mpsc::Receiver<GatewayEvent>, handler: H) -> u64
where
    H: EventHandler,
{
    let mut handled = 0u64;
    while let Some(event) = events.recv().await {
        handler.handle(event).await;
        handled += 1;
    }
    debug!(handled, "Event dispatcher stopped");
    handled
}
