//! Bucket registry
//!
//! Maps routes to buckets. A route starts on a provisional per-route bucket;
//! once a response names its bucket hash the route is remapped, and a
//! provisional bucket whose hash is already known elsewhere is merged into
//! the existing one.

use super::bucket::{Admission, BucketSnapshot, RateLimitBucket};
use super::headers::RateLimitHeaders;
use super::route::{CompiledRoute, Route};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Admission on one bucket, released when the response is settled or the
/// permit is dropped.
#[derive(Debug)]
pub struct BucketPermit {
    bucket: Option<Arc<RateLimitBucket>>,
    waited: Duration,
}

impl BucketPermit {
    /// Time spent waiting for admission
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Key of the bucket the request is charged to
    pub fn bucket_key(&self) -> Option<String> {
        self.bucket.as_ref().map(|b| b.current().key())
    }

    fn into_bucket(mut self) -> Option<Arc<RateLimitBucket>> {
        self.bucket.take().map(|b| b.current())
    }
}

impl Drop for BucketPermit {
    fn drop(&mut self) {
        if let Some(bucket) = self.bucket.take() {
            bucket.current().release();
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    route_hashes: HashMap<Route, String>,
    buckets: HashMap<String, Arc<RateLimitBucket>>,
    /// Reset instants of evicted buckets whose window had not ended
    tombstones: HashMap<String, Instant>,
}

impl RegistryInner {
    fn key_for(&self, route: &CompiledRoute) -> String {
        match self.route_hashes.get(route.route()) {
            Some(hash) => route.bucket_key(hash),
            None => route.provisional_key(),
        }
    }

    /// Drop the least recently used idle bucket.
    fn evict_one(&mut self, now: Instant) -> bool {
        let victim = self
            .buckets
            .iter()
            .filter(|(_, bucket)| Arc::strong_count(bucket) == 1 && bucket.in_flight() == 0)
            .min_by_key(|(_, bucket)| bucket.last_used())
            .map(|(key, _)| key.clone());

        let Some(key) = victim else {
            return false;
        };
        if let Some(bucket) = self.buckets.remove(&key) {
            let window_end = bucket.window_end();
            if window_end > now {
                self.tombstones.insert(key.clone(), window_end);
            }
            trace!(bucket = %key, "Evicted rate limit bucket");
        }
        true
    }
}

pub struct BucketRegistry {
    inner: Mutex<RegistryInner>,
    max_rate_limit: Duration,
    capacity: usize,
}

impl BucketRegistry {
    /// `max_rate_limit` bounds how long `acquire` may wait; `capacity` bounds
    /// the number of live buckets.
    pub fn new(max_rate_limit: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_rate_limit,
            capacity: capacity.max(1),
        }
    }

    /// Wait for admission on the route's bucket.
    ///
    /// Returns the required wait instead when it exceeds `max_rate_limit`.
    pub async fn acquire(&self, route: &CompiledRoute) -> Result<BucketPermit, Duration> {
        let started = Instant::now();
        let mut bucket = self.bucket_for(route);
        loop {
            match bucket.acquire(self.max_rate_limit).await {
                Admission::Granted => {
                    return Ok(BucketPermit {
                        bucket: Some(bucket),
                        waited: started.elapsed(),
                    })
                }
                Admission::Redirect(next) => bucket = next,
                Admission::TooLong(wait) => return Err(wait),
            }
        }
    }

    fn bucket_for(&self, route: &CompiledRoute) -> Arc<RateLimitBucket> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let key = inner.key_for(route);
        if let Some(bucket) = inner.buckets.get(&key) {
            return Arc::clone(bucket);
        }

        if inner.buckets.len() >= self.capacity && !inner.evict_one(now) {
            warn!(
                buckets = inner.buckets.len(),
                capacity = self.capacity,
                "Rate limit bucket capacity exceeded, every bucket is busy"
            );
        }

        let bucket = Arc::new(RateLimitBucket::provisional(key.clone()));
        if let Some(reset) = inner.tombstones.remove(&key) {
            if reset > now {
                // Quota of the evicted window is unknown; assume it is spent.
                bucket.block_until(reset);
            }
        }
        debug!(bucket = %key, route = %route.route(), "Created rate limit bucket");
        inner.buckets.insert(key, Arc::clone(&bucket));
        bucket
    }

    /// Settle a completed request from its response headers.
    pub fn update(&self, route: &CompiledRoute, permit: BucketPermit, limits: &RateLimitHeaders, success: bool) {
        let Some(bucket) = permit.into_bucket() else {
            return;
        };
        let bucket = self.settle(route, bucket, limits);
        if success && limits.limit.is_none() && limits.bucket.is_none() {
            bucket.mark_unlimited();
        }
        bucket.release();
    }

    /// Settle a 429: the bucket admits nothing for `retry_after`.
    pub fn throttle(
        &self,
        route: &CompiledRoute,
        permit: BucketPermit,
        limits: &RateLimitHeaders,
        retry_after: Duration,
    ) {
        let Some(bucket) = permit.into_bucket() else {
            return;
        };
        let bucket = self.settle(route, bucket, limits);
        bucket.block_for(retry_after);
        bucket.release();
        warn!(
            route = %route.route(),
            bucket = %bucket.key(),
            retry_after_ms = retry_after.as_millis() as u64,
            "Bucket rate limited"
        );
    }

    /// Remap the route and move the request's accounting to the bucket the
    /// server named, then apply the reported limits there.
    fn settle(
        &self,
        route: &CompiledRoute,
        bucket: Arc<RateLimitBucket>,
        limits: &RateLimitHeaders,
    ) -> Arc<RateLimitBucket> {
        let Some(info) = limits.bucket_info() else {
            return bucket;
        };
        let key = route.bucket_key(info.hash);

        let target = {
            let mut inner = self.inner.lock();
            let known = inner.route_hashes.get(route.route()).map(String::as_str);
            if known != Some(info.hash) {
                debug!(route = %route.route(), previous = ?known, bucket = info.hash, "Route mapped to bucket");
                inner.route_hashes.insert(route.route().clone(), info.hash.to_owned());
            }

            let current_key = bucket.key();
            if current_key == key {
                bucket
            } else {
                if inner.buckets.get(&current_key).is_some_and(|b| Arc::ptr_eq(b, &bucket)) {
                    inner.buckets.remove(&current_key);
                }
                match inner.buckets.get(&key).cloned() {
                    Some(existing) => {
                        bucket.merge_into(&existing);
                        debug!(from = %current_key, into = %key, "Merged rate limit buckets");
                        existing
                    }
                    None => {
                        inner.tombstones.remove(&key);
                        bucket.rename(key.clone());
                        inner.buckets.insert(key, Arc::clone(&bucket));
                        bucket
                    }
                }
            }
        };

        target.apply(info.limit, info.remaining, info.reset_after);
        target
    }

    /// Drop buckets idle for `expire_after` past the end of their window.
    pub fn collect_garbage(&self, expire_after: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.buckets.len();
        inner
            .buckets
            .retain(|_, bucket| Arc::strong_count(bucket) > 1 || !bucket.is_expired(now, expire_after));
        inner.tombstones.retain(|_, reset| *reset > now);
        before - inner.buckets.len()
    }

    /// Run [`BucketRegistry::collect_garbage`] every `period` until cancelled.
    pub fn spawn_gc(
        self: &Arc<Self>,
        period: Duration,
        expire_after: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.collect_garbage(expire_after);
                        let live = registry.len();
                        crate::metrics::set_rest_buckets(live);
                        trace!(removed, live, "Bucket GC pass");
                    }
                }
            }
        })
    }

    /// Live buckets
    pub fn len(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key the route would be charged to right now
    pub fn bucket_key(&self, route: &CompiledRoute) -> String {
        self.inner.lock().key_for(route)
    }

    /// Bucket hash learned for a route template
    pub fn route_hash(&self, route: &Route) -> Option<String> {
        self.inner.lock().route_hashes.get(route).cloned()
    }

    pub fn snapshot(&self, route: &CompiledRoute) -> Option<BucketSnapshot> {
        let inner = self.inner.lock();
        let key = inner.key_for(route);
        inner.buckets.get(&key).map(|bucket| bucket.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::route::{GET_CHANNEL, GET_CHANNEL_MESSAGES, POST_CHANNEL_TYPING};
    use tokio_test::{assert_pending, assert_ready, task};

    fn limits(hash: &str, limit: u32, remaining: u32, reset_after_secs: u64) -> RateLimitHeaders {
        RateLimitHeaders {
            bucket: Some(hash.to_string()),
            limit: Some(limit),
            remaining: Some(remaining),
            reset_after: Some(Duration::from_secs(reset_after_secs)),
            ..RateLimitHeaders::default()
        }
    }

    fn registry() -> BucketRegistry {
        BucketRegistry::new(Duration::from_secs(300), 64)
    }

    fn channel(route: &Route, id: &str) -> CompiledRoute {
        route.compile(&[("channel_id", id)]).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn first_request_on_unknown_route_goes_straight_through() {
        let registry = registry();
        let route = channel(&GET_CHANNEL, "1");

        let permit = registry.acquire(&route).await.unwrap();
        assert_eq!(permit.waited(), Duration::ZERO);
        assert_eq!(permit.bucket_key().unwrap(), "UNKNOWN;GET /channels/{channel_id};1");

        registry.update(&route, permit, &limits("abc", 5, 4, 10), true);
        assert_eq!(registry.bucket_key(&route), "abc;1");
        assert_eq!(registry.route_hash(&GET_CHANNEL), Some("abc".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_call_waits_for_reset_after_five_admitted() {
        let registry = registry();
        let route = channel(&GET_CHANNEL_MESSAGES, "1");
        let opener = registry.acquire(&route).await.unwrap();
        registry.update(&route, opener, &limits("h", 5, 5, 10), true);

        let mut permits = Vec::new();
        for _ in 0..5 {
            let mut call = task::spawn(registry.acquire(&route));
            permits.push(assert_ready!(call.poll()).unwrap());
        }

        let mut sixth = task::spawn(registry.acquire(&route));
        assert_pending!(sixth.poll());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_pending!(sixth.poll());

        tokio::time::advance(Duration::from_millis(1001)).await;
        let permit = assert_ready!(sixth.poll()).unwrap();
        assert!(permit.waited() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_admits_exactly_limit_after_reset() {
        let registry = registry();
        let route = channel(&GET_CHANNEL_MESSAGES, "1");
        let opener = registry.acquire(&route).await.unwrap();
        registry.update(&route, opener, &limits("h", 3, 0, 2), true);

        let mut first = task::spawn(registry.acquire(&route));
        assert_pending!(first.poll());
        tokio::time::advance(Duration::from_millis(2001)).await;
        drop(assert_ready!(first.poll()).unwrap());

        for _ in 0..2 {
            let mut call = task::spawn(registry.acquire(&route));
            drop(assert_ready!(call.poll()).unwrap());
        }

        let mut fourth = task::spawn(registry.acquire(&route));
        assert_pending!(fourth.poll());
        tokio::time::advance(Duration::from_millis(2001)).await;
        assert_ready!(fourth.poll()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_response_overrides_local_remaining() {
        let registry = registry();
        let route = channel(&GET_CHANNEL, "7");
        let opener = registry.acquire(&route).await.unwrap();
        registry.update(&route, opener, &limits("h", 5, 4, 30), true);

        let permit = registry.acquire(&route).await.unwrap();
        registry.throttle(&route, permit, &RateLimitHeaders::default(), Duration::from_secs(3));
        assert_eq!(registry.snapshot(&route).unwrap().remaining, 0);

        let mut next = task::spawn(registry.acquire(&route));
        assert_pending!(next.poll());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_pending!(next.poll());
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_ready!(next.poll()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn merged_routes_share_one_limit() {
        let registry = registry();
        let messages = channel(&GET_CHANNEL_MESSAGES, "1");
        let typing = channel(&POST_CHANNEL_TYPING, "1");

        // Both openers go out before either route's bucket is known.
        let a = registry.acquire(&messages).await.unwrap();
        let b = registry.acquire(&typing).await.unwrap();

        registry.update(&messages, a, &limits("shared", 2, 1, 10), true);
        registry.update(&typing, b, &limits("shared", 2, 0, 10), true);

        assert_eq!(registry.bucket_key(&messages), "shared;1");
        assert_eq!(registry.bucket_key(&typing), "shared;1");
        assert_eq!(registry.len(), 1);

        // Two requests were admitted in this window; the limit is two.
        let mut via_messages = task::spawn(registry.acquire(&messages));
        let mut via_typing = task::spawn(registry.acquire(&typing));
        assert_pending!(via_messages.poll());
        assert_pending!(via_typing.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn merge_charges_requests_still_in_flight() {
        let registry = registry();
        let messages = channel(&GET_CHANNEL_MESSAGES, "1");
        let typing = channel(&POST_CHANNEL_TYPING, "1");

        let opener = registry.acquire(&messages).await.unwrap();
        registry.update(&messages, opener, &limits("shared", 3, 2, 10), true);
        let in_flight = registry.acquire(&messages).await.unwrap();

        // The server has seen the opener and this request, not `in_flight`.
        let other = registry.acquire(&typing).await.unwrap();
        registry.update(&typing, other, &limits("shared", 3, 1, 10), true);

        let snapshot = registry.snapshot(&messages).unwrap();
        assert_eq!(snapshot.remaining, 0);
        assert_eq!(snapshot.in_flight, 1);

        let mut fourth = task::spawn(registry.acquire(&typing));
        assert_pending!(fourth.poll());
        drop(in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_on_a_merged_bucket_move_to_the_shared_one() {
        let registry = registry();
        let messages = channel(&GET_CHANNEL_MESSAGES, "1");
        let typing = channel(&POST_CHANNEL_TYPING, "1");

        let opener = registry.acquire(&typing).await.unwrap();
        registry.update(&typing, opener, &limits("shared", 5, 4, 10), true);

        let first = registry.acquire(&messages).await.unwrap();
        let mut second = task::spawn(registry.acquire(&messages));
        assert_pending!(second.poll());

        registry.update(&messages, first, &limits("shared", 5, 3, 10), true);
        assert!(second.is_woken());
        let permit = assert_ready!(second.poll()).unwrap();
        assert_eq!(permit.bucket_key().unwrap(), "shared;1");

        let snapshot = registry.snapshot(&messages).unwrap();
        assert_eq!(snapshot.remaining, 2);
        assert_eq!(snapshot.in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_permit_lets_the_next_request_through() {
        let registry = registry();
        let route = channel(&GET_CHANNEL, "1");

        let first = registry.acquire(&route).await.unwrap();
        let mut second = task::spawn(registry.acquire(&route));
        assert_pending!(second.poll());

        drop(first);
        assert!(second.is_woken());
        assert_ready!(second.poll()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_admitted_in_arrival_order() {
        let registry = registry();
        let route = channel(&GET_CHANNEL, "1");
        let opener = registry.acquire(&route).await.unwrap();
        registry.update(&route, opener, &limits("h", 1, 0, 5), true);

        let mut first = task::spawn(registry.acquire(&route));
        let mut second = task::spawn(registry.acquire(&route));
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        tokio::time::advance(Duration::from_millis(5001)).await;
        assert_pending!(second.poll());
        assert_ready!(first.poll()).unwrap();
        assert_pending!(second.poll());

        tokio::time::advance(Duration::from_millis(5001)).await;
        assert_ready!(second.poll()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_bucket_comes_back_empty_until_its_reset() {
        let registry = BucketRegistry::new(Duration::from_secs(300), 1);
        let first = channel(&GET_CHANNEL, "1");
        let second = channel(&GET_CHANNEL, "2");

        let opener = registry.acquire(&first).await.unwrap();
        registry.update(&first, opener, &limits("h", 5, 4, 10), true);

        // Capacity one: channel 2 evicts channel 1 while its window is open.
        drop(registry.acquire(&second).await.unwrap());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.bucket_key(&second), "h;2");

        let mut again = task::spawn(registry.acquire(&first));
        assert_pending!(again.poll());
        tokio::time::advance(Duration::from_millis(10_001)).await;
        assert_ready!(again.poll()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_collection_skips_busy_and_fresh_buckets() {
        let registry = registry();
        let idle = channel(&GET_CHANNEL, "1");
        let busy = channel(&GET_CHANNEL, "2");

        let opener = registry.acquire(&idle).await.unwrap();
        registry.update(&idle, opener, &limits("h", 5, 4, 1), true);
        let held = registry.acquire(&busy).await.unwrap();

        assert_eq!(registry.collect_garbage(Duration::from_secs(10)), 0);

        tokio::time::advance(Duration::from_secs(12)).await;
        assert_eq!(registry.collect_garbage(Duration::from_secs(10)), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.snapshot(&busy).is_some());
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_response_without_headers_marks_route_unlimited() {
        let registry = registry();
        let route = channel(&GET_CHANNEL, "1");
        let opener = registry.acquire(&route).await.unwrap();
        registry.update(&route, opener, &RateLimitHeaders::default(), true);

        let held: Vec<_> = (0..3)
            .map(|_| {
                let mut call = task::spawn(registry.acquire(&route));
                assert_ready!(call.poll()).unwrap()
            })
            .collect();
        assert!(registry.snapshot(&route).unwrap().unlimited);
        assert_eq!(held.len(), 3);
    }
}
