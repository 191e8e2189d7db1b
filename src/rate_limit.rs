//! Per-source token-bucket rate limiter with idle eviction (spec §4.J).
//!
//! Grounded on the scraper's adaptive rate limiter
//! (`scrapers/rate_limiter/mod.rs`'s `Arc<RwLock<HashMap<..>>>` domain-state
//! map), simplified down to the spec's plain token bucket and ported onto a
//! concurrent map so per-bucket updates don't serialize unrelated sources.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::time::interval;

/// How long a bucket may sit unused before the sweep evicts it.
const IDLE_EVICTION: Duration = Duration::from_secs(5 * 60);
/// How often the eviction sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Bucket {
    /// Tokens available, scaled by 1000 for integer-friendly fractional refill.
    tokens_milli: AtomicI64,
    last_seen_millis: AtomicU64,
}

/// `rate` requests/sec refill, `burst` bucket capacity. `rate == 0` disables
/// limiting entirely — every `allow()` call succeeds without touching the map.
pub struct RateLimiter {
    rate: u32,
    burst: u32,
    buckets: DashMap<String, Bucket>,
    started_at: Instant,
}

impl RateLimiter {
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            rate,
            burst,
            buckets: DashMap::new(),
            started_at: Instant::now(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.rate > 0
    }

    /// Refills `source`'s bucket by elapsed time and consumes one token.
    /// Returns `false` if the bucket is empty (request should be denied).
    pub fn allow(&self, source: &str) -> bool {
        if !self.enabled() {
            return true;
        }
        let now_millis = self.started_at.elapsed().as_millis() as u64;
        let capacity_milli = self.burst.max(1) as i64 * 1000;
        let rate_milli_per_sec = self.rate as i64 * 1000;

        let bucket = self.buckets.entry(source.to_string()).or_insert_with(|| Bucket {
            tokens_milli: AtomicI64::new(capacity_milli),
            last_seen_millis: AtomicU64::new(now_millis),
        });

        let last = bucket.last_seen_millis.swap(now_millis, Ordering::AcqRel);
        let elapsed_millis = now_millis.saturating_sub(last);
        let refill = (elapsed_millis as i64 * rate_milli_per_sec) / 1000;

        let mut current = bucket.tokens_milli.load(Ordering::Acquire);
        loop {
            let refilled = (current + refill).min(capacity_milli);
            if refilled < 1000 {
                bucket.tokens_milli.store(refilled, Ordering::Release);
                return false;
            }
            let next = refilled - 1000;
            match bucket.tokens_milli.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn evict_idle(&self) {
        let now_millis = self.started_at.elapsed().as_millis() as u64;
        let idle_millis = IDLE_EVICTION.as_millis() as u64;
        self.buckets.retain(|_, bucket| {
            now_millis.saturating_sub(bucket.last_seen_millis.load(Ordering::Acquire)) < idle_millis
        });
    }

    /// Background sweep task; runs until `shutdown` resolves (spec §4.J,
    /// §5's "rate limiter's cleanup stops on shutdown").
    pub async fn run_eviction_sweep(self: std::sync::Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut tick = interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => self.evict_idle(),
                _ = shutdown.changed() => break,
            }
        }
    }
}
