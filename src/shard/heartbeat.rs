//! Heartbeat scheduling and acknowledgement tracking
//!
//! The first beat goes out after `interval * jitter` (jitter in `[0, 1)`),
//! then every `interval`. A tick that finds the previous beat unacknowledged
//! means the connection is a zombie.

use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Ack bookkeeping for one connection
#[derive(Debug)]
pub struct HeartbeatState {
    interval: Duration,
    acked: bool,
    last_sent: Option<Instant>,
    last_ack: Option<Instant>,
    latency: Option<Duration>,
}

impl HeartbeatState {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            acked: true,
            last_sent: None,
            last_ack: None,
            latency: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// False while a sent heartbeat is waiting for its ack.
    pub fn is_acked(&self) -> bool {
        self.acked
    }

    pub fn record_sent(&mut self, now: Instant) {
        self.acked = false;
        self.last_sent = Some(now);
    }

    /// Marks the outstanding beat acknowledged and returns its round trip.
    pub fn record_ack(&mut self, now: Instant) -> Option<Duration> {
        self.acked = true;
        self.last_ack = Some(now);
        self.latency = self.last_sent.map(|sent| now.saturating_duration_since(sent));
        self.latency
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }
}

/// Tick source for one connection
#[derive(Debug)]
pub struct HeartbeatTimer {
    interval: Interval,
}

impl HeartbeatTimer {
    /// `jitter` is clamped to `[0, 1]`.
    pub fn new(period: Duration, jitter: f64) -> Self {
        let first = Instant::now() + period.mul_f64(jitter.clamp(0.0, 1.0));
        let mut interval = interval_at(first, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub fn with_random_jitter(period: Duration) -> Self {
        Self::new(period, rand::random::<f64>())
    }

    /// Cancel safe.
    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}
