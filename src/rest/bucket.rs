//! Rate-limit bucket
//!
//! One bucket tracks the quota of every route the server groups under the
//! same bucket hash and major parameter. Admission is FIFO: callers queue on
//! `gate` and only the head of the queue waits for quota.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

/// Result of waiting on one bucket
#[derive(Debug)]
pub enum Admission {
    Granted,
    /// The bucket was merged while we waited; retry on the target
    Redirect(Arc<RateLimitBucket>),
    /// Admission would take longer than the caller allows
    TooLong(Duration),
}

enum Wait {
    Until(Instant),
    /// Provisional bucket with its first request still outstanding
    InFlight,
    Merged(Arc<RateLimitBucket>),
}

#[derive(Debug)]
struct BucketState {
    provisional: bool,
    unlimited: bool,
    limit: u32,
    remaining: u32,
    reset_at: Option<Instant>,
    period: Duration,
    blocked_until: Option<Instant>,
    in_flight: u32,
    merged_into: Option<Arc<RateLimitBucket>>,
    last_used: Instant,
}

impl BucketState {
    fn try_admit(&mut self, now: Instant) -> Result<(), Wait> {
        if let Some(target) = &self.merged_into {
            return Err(Wait::Merged(Arc::clone(target)));
        }

        match self.blocked_until {
            Some(until) if now < until => return Err(Wait::Until(until)),
            Some(_) => self.blocked_until = None,
            None => {}
        }

        if self.unlimited {
            self.admit(now);
            return Ok(());
        }

        if self.provisional {
            // Limits are unknown until the first response: one request at a time.
            if self.in_flight > 0 {
                return Err(Wait::InFlight);
            }
            self.admit(now);
            return Ok(());
        }

        let window_over = match self.reset_at {
            Some(reset) => now >= reset,
            None => self.remaining == 0,
        };
        if window_over {
            self.remaining = self.limit;
            self.reset_at = (!self.period.is_zero()).then(|| now + self.period);
        }

        if self.remaining > 0 {
            self.remaining -= 1;
            self.admit(now);
            return Ok(());
        }

        match self.reset_at {
            Some(reset) => Err(Wait::Until(reset)),
            None => Err(Wait::InFlight),
        }
    }

    fn admit(&mut self, now: Instant) {
        self.in_flight += 1;
        self.last_used = now;
    }

    fn window_end(&self) -> Instant {
        [self.reset_at, self.blocked_until]
            .into_iter()
            .flatten()
            .fold(self.last_used, Instant::max)
    }
}

/// Point-in-time view of a bucket
#[derive(Debug, Clone, PartialEq)]
pub struct BucketSnapshot {
    pub key: String,
    pub provisional: bool,
    pub unlimited: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_in: Option<Duration>,
    pub in_flight: u32,
}

#[derive(Debug)]
pub struct RateLimitBucket {
    key: Mutex<String>,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<BucketState>,
    changed: Notify,
}

impl RateLimitBucket {
    /// A bucket whose limits are not known yet
    pub fn provisional(key: impl Into<String>) -> Self {
        Self {
            key: Mutex::new(key.into()),
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(BucketState {
                provisional: true,
                unlimited: false,
                limit: 1,
                remaining: 1,
                reset_at: None,
                period: Duration::ZERO,
                blocked_until: None,
                in_flight: 0,
                merged_into: None,
                last_used: Instant::now(),
            }),
            changed: Notify::new(),
        }
    }

    pub fn key(&self) -> String {
        self.key.lock().clone()
    }

    pub(crate) fn rename(&self, key: String) {
        *self.key.lock() = key;
    }

    /// Wait for quota, in FIFO order with other callers of this bucket.
    pub async fn acquire(&self, max_wait: Duration) -> Admission {
        let _turn = self.gate.lock().await;
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let now = Instant::now();
            let admitted = self.state.lock().try_admit(now);
            match admitted {
                Ok(()) => return Admission::Granted,
                Err(Wait::Merged(target)) => return Admission::Redirect(target),
                Err(Wait::Until(deadline)) => {
                    let wait = deadline.saturating_duration_since(now);
                    if wait > max_wait {
                        return Admission::TooLong(wait);
                    }
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = &mut changed => {}
                    }
                }
                Err(Wait::InFlight) => changed.await,
            }
        }
    }

    /// Take authoritative limits from a response for a request admitted here.
    ///
    /// Other requests still in flight are charged against the reported
    /// remaining quota; within the same window the lower estimate wins.
    pub fn apply(&self, limit: u32, remaining: u32, reset_after: Duration) {
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            let others = state.in_flight.saturating_sub(1);
            let reported = remaining.saturating_sub(others);
            let same_window = !state.provisional && state.reset_at.is_some_and(|reset| now < reset);

            state.remaining = if same_window { state.remaining.min(reported) } else { reported };
            state.limit = limit.max(1);
            state.period = reset_after;
            state.reset_at = Some(now + reset_after);
            state.provisional = false;
            state.unlimited = false;
        }
        self.changed.notify_waiters();
    }

    /// Server said 429: nothing is admitted until `retry_after` passes.
    pub fn block_for(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        {
            let mut state = self.state.lock();
            state.remaining = 0;
            state.reset_at = Some(until);
            state.blocked_until = Some(state.blocked_until.map_or(until, |b| b.max(until)));
        }
        self.changed.notify_waiters();
    }

    pub(crate) fn block_until(&self, until: Instant) {
        self.state.lock().blocked_until = Some(until);
    }

    /// Successful response without any rate-limit headers
    pub fn mark_unlimited(&self) {
        {
            let mut state = self.state.lock();
            if !state.provisional {
                return;
            }
            state.provisional = false;
            state.unlimited = true;
        }
        self.changed.notify_waiters();
    }

    /// A request admitted here has finished.
    pub fn release(&self) {
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.last_used = Instant::now();
        }
        self.changed.notify_waiters();
    }

    /// Fold this bucket into `target`.
    ///
    /// Requests in flight here are charged to `target`, so its next response
    /// accounts for them; waiters here are woken and move over.
    pub fn merge_into(&self, target: &Arc<RateLimitBucket>) {
        {
            let mut state = self.state.lock();
            let carried = std::mem::take(&mut state.in_flight);
            target.state.lock().in_flight += carried;
            state.merged_into = Some(Arc::clone(target));
        }
        self.changed.notify_waiters();
    }

    /// The bucket that now holds this one's accounting
    pub fn current(self: &Arc<Self>) -> Arc<Self> {
        let mut bucket = Arc::clone(self);
        loop {
            let next = bucket.state.lock().merged_into.clone();
            match next {
                Some(next) => bucket = next,
                None => return bucket,
            }
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.state.lock().provisional
    }

    pub fn in_flight(&self) -> u32 {
        self.state.lock().in_flight
    }

    /// End of the current window, or the last use for buckets without one
    pub(crate) fn window_end(&self) -> Instant {
        self.state.lock().window_end()
    }

    /// Last use of the bucket
    pub(crate) fn last_used(&self) -> Instant {
        self.state.lock().last_used
    }

    /// Unused, with no request in flight, and its window over for `expire_after`
    pub(crate) fn is_expired(&self, now: Instant, expire_after: Duration) -> bool {
        let state = self.state.lock();
        state.in_flight == 0 && state.window_end() + expire_after <= now
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let now = Instant::now();
        let key = self.key();
        let state = self.state.lock();
        BucketSnapshot {
            key,
            provisional: state.provisional,
            unlimited: state.unlimited,
            limit: state.limit,
            remaining: state.remaining,
            reset_in: state.reset_at.map(|reset| reset.saturating_duration_since(now)),
            in_flight: state.in_flight,
        }
    }
}
