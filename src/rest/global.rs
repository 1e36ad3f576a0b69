//! Global request throttle
//!
//! Token bucket shared by every REST call, refilled continuously at
//! `rate` requests per second with a burst of `rate`. A global 429 drains it
//! and holds it shut for the server's `retry_after`.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[derive(Debug)]
struct TokenState {
    tokens: f64,
    refilled_at: Instant,
    blocked_until: Option<Instant>,
}

#[derive(Debug)]
pub struct GlobalThrottle {
    rate: f64,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<TokenState>,
}

impl GlobalThrottle {
    /// `per_second == 0` disables the token bucket; global 429s still block.
    pub fn new(per_second: u32) -> Self {
        let rate = f64::from(per_second);
        Self {
            rate,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(TokenState {
                tokens: rate,
                refilled_at: Instant::now(),
                blocked_until: None,
            }),
        }
    }

    /// Wait for one token. Callers are served in arrival order.
    pub async fn acquire(&self) {
        let _turn = self.gate.lock().await;
        loop {
            let wait = self.try_take(Instant::now());
            match wait {
                None => return,
                Some(wait) => sleep(wait).await,
            }
        }
    }

    fn try_take(&self, now: Instant) -> Option<Duration> {
        let mut state = self.state.lock();

        if let Some(until) = state.blocked_until {
            if now < until {
                return Some(until - now);
            }
            state.blocked_until = None;
            state.tokens = self.rate;
            state.refilled_at = now;
        }

        if self.rate <= 0.0 {
            return None;
        }

        let elapsed = now.saturating_duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.rate);
        state.refilled_at = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - state.tokens) / self.rate))
        }
    }

    /// Global 429: stop everything for `retry_after`.
    pub fn throttle(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut state = self.state.lock();
        state.tokens = 0.0;
        state.blocked_until = Some(state.blocked_until.map_or(until, |b| b.max(until)));
    }

    pub fn is_throttled(&self) -> bool {
        self.state
            .lock()
            .blocked_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Requests per second, 0 when unbounded
    pub fn rate(&self) -> u32 {
        self.rate as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test(start_paused = true)]
    async fn burst_then_refill_at_rate() {
        let throttle = GlobalThrottle::new(2);
        throttle.acquire().await;
        throttle.acquire().await;

        let mut third = task::spawn(throttle.acquire());
        assert_pending!(third.poll());

        tokio::time::advance(Duration::from_millis(501)).await;
        assert_ready!(third.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn global_rate_limit_blocks_until_retry_after() {
        let throttle = GlobalThrottle::new(50);
        throttle.throttle(Duration::from_secs(2));
        assert!(throttle.is_throttled());

        let mut call = task::spawn(throttle.acquire());
        assert_pending!(call.poll());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_pending!(call.poll());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(call.is_woken());
        assert_ready!(call.poll());
        assert!(!throttle.is_throttled());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_only_honours_global_blocks() {
        let throttle = GlobalThrottle::new(0);
        tokio::time::timeout(Duration::from_millis(1), async {
            for _ in 0..1_000 {
                throttle.acquire().await;
            }
        })
        .await
        .expect("unbounded throttle never waits");
        assert_eq!(throttle.rate(), 0);

        throttle.throttle(Duration::from_secs(1));
        let mut blocked = task::spawn(throttle.acquire());
        assert_pending!(blocked.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_in_order() {
        let throttle = GlobalThrottle::new(1);
        throttle.acquire().await;

        let mut first = task::spawn(throttle.acquire());
        let mut second = task::spawn(throttle.acquire());
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_pending!(second.poll());
        assert_ready!(first.poll());
        assert_pending!(second.poll());
    }
}
