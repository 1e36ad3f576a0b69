//! Shard state tracking
//!
//! Observable mirror of every shard's session: lifecycle status, current
//! session state, last sequence and counters. Sessions write, everyone else
//! reads. Status transitions are also published on a broadcast channel so
//! callers can follow the lifecycle stream without polling.

use super::session::SessionState;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Capacity of the lifecycle broadcast; slow subscribers see `Lagged`.
const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Coarse lifecycle status for a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    /// First connection attempt in progress
    Connecting,
    /// Session established and dispatching events
    Ready,
    /// Lost the connection, waiting out backoff or re-handshaking
    Reconnecting,
    /// Stopped on request
    Disconnected,
    /// Stopped on an unrecoverable error
    Fatal,
}

impl ShardStatus {
    pub const ALL: [ShardStatus; 5] = [
        ShardStatus::Connecting,
        ShardStatus::Ready,
        ShardStatus::Reconnecting,
        ShardStatus::Disconnected,
        ShardStatus::Fatal,
    ];

    /// Returns true if the shard is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, ShardStatus::Ready | ShardStatus::Reconnecting)
    }

    /// Returns true if the shard is ready to receive events
    pub fn is_ready(&self) -> bool {
        matches!(self, ShardStatus::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::Connecting => "connecting",
            ShardStatus::Ready => "ready",
            ShardStatus::Reconnecting => "reconnecting",
            ShardStatus::Disconnected => "disconnected",
            ShardStatus::Fatal => "fatal",
        }
    }
}

/// One entry on the lifecycle stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardStatusEvent {
    pub shard_id: u32,
    pub previous: ShardStatus,
    pub status: ShardStatus,
}

/// State for a single shard
#[derive(Debug)]
pub struct ShardStateEntry {
    pub status: ShardStatus,
    pub session_state: SessionState,
    pub sequence: Option<u64>,
    pub session_id: Option<String>,
    pub events_received: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_heartbeat_ack: Option<Instant>,
    pub heartbeat_latency: Option<Duration>,
    pub connected_at: Option<Instant>,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            status: ShardStatus::Disconnected,
            session_state: SessionState::Disconnected,
            sequence: None,
            session_id: None,
            events_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_heartbeat_ack: None,
            heartbeat_latency: None,
            connected_at: None,
        }
    }
}

/// Point-in-time copy of one shard's entry
#[derive(Debug, Clone, PartialEq)]
pub struct ShardSnapshot {
    pub shard_id: u32,
    pub status: ShardStatus,
    pub session_state: SessionState,
    pub sequence: Option<u64>,
    pub session_id: Option<String>,
    pub events_received: u64,
    pub reconnects: u64,
    pub heartbeat_latency: Option<Duration>,
}

/// Shared state across all shards owned by one manager
#[derive(Debug, Clone)]
pub struct ShardState {
    inner: Arc<ShardStateInner>,
}

#[derive(Debug)]
struct ShardStateInner {
    shards: DashMap<u32, ShardStateEntry>,
    total_shards: u32,
    status_tx: broadcast::Sender<ShardStatusEvent>,
}

impl ShardState {
    /// Create a new shard state tracker
    pub fn new(shard_ids: impl Iterator<Item = u32>, total_shards: u32) -> Self {
        let shards = DashMap::new();
        for shard_id in shard_ids {
            shards.insert(shard_id, ShardStateEntry::default());
        }
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(ShardStateInner {
                shards,
                total_shards,
                status_tx,
            }),
        }
    }

    /// Get total shards across the cluster
    pub fn total_shards(&self) -> u32 {
        self.inner.total_shards
    }

    /// Subscribe to lifecycle transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ShardStatusEvent> {
        self.inner.status_tx.subscribe()
    }

    /// Update shard status; publishes only on an actual change
    pub fn set_status(&self, shard_id: u32, status: ShardStatus) {
        let previous = {
            let Some(mut entry) = self.inner.shards.get_mut(&shard_id) else {
                return;
            };
            let previous = entry.status;
            if previous == status {
                return;
            }
            entry.status = status;
            if status == ShardStatus::Ready {
                entry.connected_at = Some(Instant::now());
            }
            previous
        };

        crate::metrics::record_shard_status(shard_id, status);
        // No subscribers is fine.
        let _ = self.inner.status_tx.send(ShardStatusEvent {
            shard_id,
            previous,
            status,
        });
    }

    pub fn set_session_state(&self, shard_id: u32, state: SessionState) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.session_state = state;
        }
    }

    /// Mirror the session's resume data
    pub fn set_session(&self, shard_id: u32, session_id: Option<String>, sequence: Option<u64>) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.session_id = session_id;
            entry.sequence = sequence;
        }
    }

    /// Record a dispatched event and its sequence
    pub fn record_event(&self, shard_id: u32, sequence: u64) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
            entry.sequence = Some(sequence);
        }
    }

    pub fn record_reconnect(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record heartbeat acknowledgement
    pub fn record_heartbeat(&self, shard_id: u32, latency: Option<Duration>) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.last_heartbeat_ack = Some(Instant::now());
            if latency.is_some() {
                entry.heartbeat_latency = latency;
            }
        }
    }

    /// Get status for a specific shard
    pub fn status(&self, shard_id: u32) -> Option<ShardStatus> {
        self.inner.shards.get(&shard_id).map(|e| e.status)
    }

    pub fn snapshot(&self, shard_id: u32) -> Option<ShardSnapshot> {
        self.inner.shards.get(&shard_id).map(|e| ShardSnapshot {
            shard_id,
            status: e.status,
            session_state: e.session_state,
            sequence: e.sequence,
            session_id: e.session_id.clone(),
            events_received: e.events_received.load(Ordering::Relaxed),
            reconnects: e.reconnects.load(Ordering::Relaxed),
            heartbeat_latency: e.heartbeat_latency,
        })
    }

    /// Snapshots of every shard, ordered by shard id
    pub fn snapshots(&self) -> Vec<ShardSnapshot> {
        let mut ids: Vec<u32> = self.inner.shards.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| self.snapshot(id)).collect()
    }

    /// Get total events received across all shards
    pub fn total_events_received(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.events_received.load(Ordering::Relaxed))
            .sum()
    }

    /// Get count of ready shards
    pub fn ready_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.status.is_ready())
            .count()
    }

    /// Get count of healthy shards (ready or reconnecting)
    pub fn healthy_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.status.is_healthy())
            .count()
    }

    /// Count of shards stopped on a fatal error
    pub fn fatal_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.status == ShardStatus::Fatal)
            .count()
    }

    /// Get shard count owned by this tracker
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Check if at least one shard is ready and none died
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0 && self.fatal_shards() == 0
    }

    /// Check if every shard is healthy
    pub fn is_healthy(&self) -> bool {
        self.healthy_shards() == self.shard_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_shards_start_disconnected() {
        let state = ShardState::new(0..3, 3);
        assert_eq!(state.shard_count(), 3);
        assert_eq!(state.status(1), Some(ShardStatus::Disconnected));
        assert!(!state.is_ready());
    }

    #[test]
    fn unknown_shard_updates_are_ignored() {
        let state = ShardState::new(0..1, 1);
        state.set_status(7, ShardStatus::Ready);
        state.record_event(7, 1);
        assert_eq!(state.status(7), None);
        assert_eq!(state.total_events_received(), 0);
    }

    #[tokio::test]
    async fn status_changes_are_broadcast_once() {
        let state = ShardState::new(0..2, 2);
        let mut rx = state.subscribe();

        state.set_status(0, ShardStatus::Connecting);
        state.set_status(0, ShardStatus::Connecting);
        state.set_status(0, ShardStatus::Ready);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.previous, ShardStatus::Disconnected);
        assert_eq!(first.status, ShardStatus::Connecting);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.status, ShardStatus::Ready);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn readiness_requires_no_fatal_shards() {
        let state = ShardState::new(0..2, 2);
        state.set_status(0, ShardStatus::Ready);
        assert!(state.is_ready());
        assert!(!state.is_healthy());

        state.set_status(1, ShardStatus::Fatal);
        assert!(!state.is_ready());
        assert_eq!(state.fatal_shards(), 1);
    }

    #[test]
    fn snapshot_reflects_events_and_session() {
        let state = ShardState::new(0..1, 1);
        state.set_session(0, Some("abc".to_string()), Some(1));
        state.record_event(0, 2);
        state.record_event(0, 3);
        state.record_reconnect(0);
        state.record_heartbeat(0, Some(Duration::from_millis(42)));

        let snapshot = state.snapshot(0).unwrap();
        assert_eq!(snapshot.session_id.as_deref(), Some("abc"));
        assert_eq!(snapshot.sequence, Some(3));
        assert_eq!(snapshot.events_received, 2);
        assert_eq!(snapshot.reconnects, 1);
        assert_eq!(snapshot.heartbeat_latency, Some(Duration::from_millis(42)));
    }
}
