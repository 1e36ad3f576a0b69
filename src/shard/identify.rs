//! IDENTIFY admission
//!
//! The gateway allows `max_concurrency` IDENTIFYs per window. Shards are
//! bucketed by `shard_id % max_concurrency`; each bucket admits one IDENTIFY
//! per window, first come first served.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Window the gateway enforces between IDENTIFYs in one bucket.
pub const DEFAULT_IDENTIFY_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct IdentifyThrottle {
    window: Duration,
    buckets: Vec<Mutex<Option<Instant>>>,
}

impl IdentifyThrottle {
    pub fn new(max_concurrency: u32, window: Duration) -> Self {
        let buckets = (0..max_concurrency.max(1)).map(|_| Mutex::new(None)).collect();
        Self { window, buckets }
    }

    pub fn max_concurrency(&self) -> u32 {
        self.buckets.len() as u32
    }

    /// Waits until `shard_id` may IDENTIFY and claims the slot.
    ///
    /// Cancel safe: a caller dropped while waiting does not consume the slot.
    pub async fn acquire(&self, shard_id: u32) {
        let index = (shard_id % self.max_concurrency()) as usize;
        let mut last = self.buckets[index].lock().await;

        if let Some(previous) = *last {
            let ready_at = previous + self.window;
            if ready_at > Instant::now() {
                debug!(
                    shard_id,
                    bucket = index,
                    wait_ms = ready_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "Waiting for identify slot"
                );
                sleep_until(ready_at).await;
            }
        }

        *last = Some(Instant::now());
    }
}
