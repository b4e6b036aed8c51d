//! Per-key rate limiting: request token buckets plus concurrent-stream
//! semaphores.
//!
//! Keys are created lazily with the configured defaults and garbage
//! collected once idle with no streams held. The bucket refills
//! continuously at `rps` up to `rps * burst_multiplier`.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with continuous refill.
struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
    }

    fn allow_n(&self, n: f64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Time until one token becomes available. Zero when one already is.
    fn next_delay(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let wait = (1.0 - state.tokens) / self.rate;
        if wait.is_finite() {
            Duration::from_secs_f64(wait)
        } else {
            // A zero-rate bucket never refills; poll slowly.
            Duration::from_secs(1)
        }
    }
}

/// Counting semaphore for concurrent streams. `release` saturates at zero.
struct StreamSemaphore {
    max: AtomicU32,
    active: AtomicU32,
}

impl StreamSemaphore {
    fn new(max: u32) -> Self {
        Self {
            max: AtomicU32::new(max),
            active: AtomicU32::new(0),
        }
    }

    fn acquire(&self) -> bool {
        loop {
            let active = self.active.load(Ordering::Acquire);
            if active >= self.max.load(Ordering::Acquire) {
                return false;
            }
            if self
                .active
                .compare_exchange(active, active + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release(&self) {
        loop {
            let active = self.active.load(Ordering::Acquire);
            if active == 0 {
                return;
            }
            if self
                .active
                .compare_exchange(active, active - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn active(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }
}

/// Bucket + semaphore + idle tracking for one key.
struct ClientLimiter {
    bucket: TokenBucket,
    streams: StreamSemaphore,
    last_access_ms: AtomicI64,
}

impl ClientLimiter {
    fn touch(&self) {
        self.last_access_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Per-key statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyStats {
    pub rps: f64,
    pub burst: f64,
    pub active_streams: u32,
    pub max_streams: u32,
}

/// Limiter-wide statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStats {
    pub total_keys: usize,
    pub active_streams: u32,
}

/// Per-key rate limiter.
pub struct RateLimiter {
    limiters: RwLock<HashMap<String, Arc<ClientLimiter>>>,
    default_rps: u32,
    default_max_streams: u32,
    burst_multiplier: f64,
    cleanup_interval: Duration,
}

impl RateLimiter {
    pub fn new(
        default_rps: u32,
        default_max_streams: u32,
        burst_multiplier: f64,
        cleanup_interval: Duration,
    ) -> Self {
        let burst_multiplier = if burst_multiplier < 1.0 {
            2.0
        } else {
            burst_multiplier
        };
        Self {
            limiters: RwLock::new(HashMap::new()),
            default_rps,
            default_max_streams,
            burst_multiplier,
            cleanup_interval,
        }
    }

    /// Consume one token for the key. Lazily creates the key with defaults.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1)
    }

    /// Consume `n` tokens at once, all or nothing.
    pub fn allow_n(&self, key: &str, n: u32) -> bool {
        let limiter = self.get_or_create(key, self.default_rps, self.default_max_streams);
        limiter.touch();
        limiter.bucket.allow_n(n as f64)
    }

    /// Block until a token is admitted or `cancel` fires. Returns whether a
    /// token was consumed.
    pub async fn wait(&self, key: &str, cancel: &CancellationToken) -> bool {
        let limiter = self.get_or_create(key, self.default_rps, self.default_max_streams);
        limiter.touch();
        loop {
            if limiter.bucket.allow_n(1.0) {
                return true;
            }
            let delay = limiter.bucket.next_delay().max(Duration::from_millis(1));
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Admit one concurrent stream if the key has capacity. The
    /// caller-provided `max_streams` only applies on first touch; later
    /// calls reuse the existing semaphore.
    pub fn acquire_stream(&self, key: &str, max_streams: u32) -> bool {
        let limiter = self.get_or_create(key, self.default_rps, max_streams);
        limiter.touch();
        limiter.streams.acquire()
    }

    /// Release one stream slot. Saturates at zero; unknown keys are a no-op.
    pub fn release_stream(&self, key: &str) {
        let limiter = self.limiters.read().get(key).cloned();
        if let Some(limiter) = limiter {
            limiter.streams.release();
        }
    }

    /// Replace the limits for a key. Existing active-stream counts carry
    /// over so releases stay balanced.
    pub fn set_limit(&self, key: &str, rps: u32, max_streams: u32) {
        let burst = rps as f64 * self.burst_multiplier;
        let mut limiters = self.limiters.write();
        match limiters.get(key) {
            Some(existing) => {
                let active = existing.streams.active();
                let replacement = Arc::new(ClientLimiter {
                    bucket: TokenBucket::new(rps as f64, burst),
                    streams: StreamSemaphore::new(max_streams),
                    last_access_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
                });
                replacement.streams.active.store(active, Ordering::Release);
                limiters.insert(key.to_string(), replacement);
            }
            None => {
                limiters.insert(
                    key.to_string(),
                    Arc::new(ClientLimiter {
                        bucket: TokenBucket::new(rps as f64, burst),
                        streams: StreamSemaphore::new(max_streams),
                        last_access_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
                    }),
                );
            }
        }
    }

    pub fn key_stats(&self, key: &str) -> Option<KeyStats> {
        let limiter = self.limiters.read().get(key).cloned()?;
        Some(KeyStats {
            rps: limiter.bucket.rate,
            burst: limiter.bucket.burst,
            active_streams: limiter.streams.active(),
            max_streams: limiter.streams.max.load(Ordering::Acquire),
        })
    }

    pub fn stats(&self) -> LimiterStats {
        let limiters = self.limiters.read();
        LimiterStats {
            total_keys: limiters.len(),
            active_streams: limiters.values().map(|l| l.streams.active()).sum(),
        }
    }

    /// Remove keys idle for twice the cleanup interval with no streams held.
    /// Returns the number of keys removed.
    pub fn gc_pass(&self) -> usize {
        let cutoff =
            chrono::Utc::now().timestamp_millis() - 2 * self.cleanup_interval.as_millis() as i64;
        let mut limiters = self.limiters.write();
        let before = limiters.len();
        limiters.retain(|_, limiter| {
            limiter.last_access_ms.load(Ordering::Relaxed) >= cutoff
                || limiter.streams.active() > 0
        });
        let removed = before - limiters.len();
        if removed > 0 {
            debug!(removed, "rate limiter GC removed idle keys");
        }
        removed
    }

    /// Periodic GC loop; exits when `cancel` fires.
    pub async fn run_gc(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.gc_pass();
                }
            }
        }
    }

    fn get_or_create(&self, key: &str, rps: u32, max_streams: u32) -> Arc<ClientLimiter> {
        if let Some(limiter) = self.limiters.read().get(key) {
            return limiter.clone();
        }

        let mut limiters = self.limiters.write();
        // Double-check: another caller may have won the race.
        if let Some(limiter) = limiters.get(key) {
            return limiter.clone();
        }

        let limiter = Arc::new(ClientLimiter {
            bucket: TokenBucket::new(rps as f64, rps as f64 * self.burst_multiplier),
            streams: StreamSemaphore::new(max_streams),
            last_access_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
        });
        limiters.insert(key.to_string(), limiter.clone());
        limiter
    }
}
