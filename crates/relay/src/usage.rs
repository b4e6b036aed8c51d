//! Usage accounting.
//!
//! Counters are buffered in memory per `(tenant, key)` and folded into the
//! repository's daily rows on a flush interval. A separate running
//! requests-per-day total backs the daily-quota check at the session
//! boundary; it resets when the UTC date rolls over.

use chrono::{NaiveDate, Utc};
use common::UsageDelta;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::repo::Repository;

#[derive(Default)]
struct UsageBuffer {
    requests: AtomicI64,
    messages: AtomicI64,
    errors: AtomicI64,
    peak_streams: AtomicI32,
    latency_sum_ms: AtomicI64,
    latency_count: AtomicI64,
    /// Running total for the current UTC day; survives flushes.
    daily_requests: AtomicI64,
}

impl UsageBuffer {
    /// Swap the flushable counters out, leaving the daily total in place.
    fn take_delta(&self) -> UsageDelta {
        let latency_sum = self.latency_sum_ms.swap(0, Ordering::AcqRel);
        let latency_count = self.latency_count.swap(0, Ordering::AcqRel);
        UsageDelta {
            requests: self.requests.swap(0, Ordering::AcqRel),
            messages: self.messages.swap(0, Ordering::AcqRel),
            errors: self.errors.swap(0, Ordering::AcqRel),
            peak_streams: self.peak_streams.swap(0, Ordering::AcqRel),
            avg_latency_ms: (latency_count > 0)
                .then(|| latency_sum as f64 / latency_count as f64),
        }
    }
}

/// Buffered usage collector.
pub struct UsageCollector {
    repo: Arc<dyn Repository>,
    buffers: RwLock<HashMap<(i64, i64), Arc<UsageBuffer>>>,
    day: Mutex<NaiveDate>,
    flush_interval: Duration,
}

impl UsageCollector {
    pub fn new(repo: Arc<dyn Repository>, flush_interval: Duration) -> Self {
        Self {
            repo,
            buffers: RwLock::new(HashMap::new()),
            day: Mutex::new(Utc::now().date_naive()),
            flush_interval,
        }
    }

    pub fn record_request(&self, tenant_id: i64, key_id: i64) {
        self.roll_day_if_needed();
        let buf = self.buffer(tenant_id, key_id);
        buf.requests.fetch_add(1, Ordering::Relaxed);
        buf.daily_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self, tenant_id: i64, key_id: i64) {
        self.buffer(tenant_id, key_id)
            .messages
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, tenant_id: i64, key_id: i64) {
        self.buffer(tenant_id, key_id)
            .errors
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, tenant_id: i64, key_id: i64, latency_ms: i64) {
        let buf = self.buffer(tenant_id, key_id);
        buf.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        buf.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Raise the peak concurrent-stream watermark if `current` exceeds it.
    pub fn update_peak_streams(&self, tenant_id: i64, key_id: i64, current: i32) {
        let buf = self.buffer(tenant_id, key_id);
        let mut peak = buf.peak_streams.load(Ordering::Acquire);
        while current > peak {
            match buf.peak_streams.compare_exchange(
                peak,
                current,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }

    /// Requests recorded against the key so far today.
    pub fn daily_requests(&self, tenant_id: i64, key_id: i64) -> i64 {
        self.roll_day_if_needed();
        self.buffers
            .read()
            .get(&(tenant_id, key_id))
            .map(|buf| buf.daily_requests.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Fold all buffered counters into the repository. Failures are logged
    /// and the delta dropped; usage accounting is best-effort.
    pub async fn flush(&self) {
        let date = *self.day.lock();
        let snapshot: Vec<((i64, i64), Arc<UsageBuffer>)> = self
            .buffers
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        for ((tenant_id, key_id), buf) in snapshot {
            let delta = buf.take_delta();
            if delta.is_empty() {
                continue;
            }
            if let Err(err) = self
                .repo
                .increment_usage(tenant_id, key_id, date, delta)
                .await
            {
                warn!(tenant_id, key_id, %err, "usage flush failed, dropping delta");
            }
        }
    }

    /// Periodic flush loop; performs a final flush when `cancel` fires.
    pub async fn run_flush(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.flush().await;
                    return;
                }
                _ = ticker.tick() => self.flush().await,
            }
        }
    }

    fn buffer(&self, tenant_id: i64, key_id: i64) -> Arc<UsageBuffer> {
        let key = (tenant_id, key_id);
        if let Some(buf) = self.buffers.read().get(&key) {
            return buf.clone();
        }
        let mut buffers = self.buffers.write();
        buffers.entry(key).or_default().clone()
    }

    fn roll_day_if_needed(&self) {
        let today = Utc::now().date_naive();
        let mut day = self.day.lock();
        if *day != today {
            debug!(%today, "resetting daily usage totals");
            *day = today;
            for buf in self.buffers.read().values() {
                buf.daily_requests.store(0, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use common::AuthRecord;
    use crate::repo::RepoError;

    #[derive(Default)]
    struct RecordingRepo {
        flushed: Mutex<Vec<(i64, i64, NaiveDate, UsageDelta)>>,
    }

    #[async_trait]
    impl Repository for RecordingRepo {
        async fn find_auth_by_hash(&self, _hash: &str) -> Result<AuthRecord, RepoError> {
            Err(RepoError::NotFound)
        }

        async fn touch_last_used(&self, _key_id: i64, _ts: DateTime<Utc>) -> Result<(), RepoError> {
            Ok(())
        }

        async fn increment_usage(
            &self,
            tenant_id: i64,
            key_id: i64,
            date: NaiveDate,
            delta: UsageDelta,
        ) -> Result<(), RepoError> {
            self.flushed.lock().push((tenant_id, key_id, date, delta));
            Ok(())
        }
    }

    #[tokio::test]
    async fn flush_folds_counters_and_resets() {
        let repo = Arc::new(RecordingRepo::default());
        let collector = UsageCollector::new(repo.clone(), Duration::from_secs(60));

        collector.record_request(1, 10);
        collector.record_request(1, 10);
        collector.record_message(1, 10);
        collector.record_error(1, 10);
        collector.record_latency(1, 10, 4);
        collector.record_latency(1, 10, 8);
        collector.update_peak_streams(1, 10, 3);

        collector.flush().await;

        let flushed = repo.flushed.lock();
        assert_eq!(flushed.len(), 1);
        let (tenant, key, _, delta) = &flushed[0];
        assert_eq!((*tenant, *key), (1, 10));
        assert_eq!(delta.requests, 2);
        assert_eq!(delta.messages, 1);
        assert_eq!(delta.errors, 1);
        assert_eq!(delta.peak_streams, 3);
        assert_eq!(delta.avg_latency_ms, Some(6.0));
        drop(flushed);

        // Counters were swapped out; an immediate reflush is a no-op.
        collector.flush().await;
        assert_eq!(repo.flushed.lock().len(), 1);
    }

    #[tokio::test]
    async fn daily_total_survives_flush() {
        let repo = Arc::new(RecordingRepo::default());
        let collector = UsageCollector::new(repo, Duration::from_secs(60));

        collector.record_request(1, 10);
        collector.record_request(1, 10);
        collector.flush().await;
        collector.record_request(1, 10);

        assert_eq!(collector.daily_requests(1, 10), 3);
        assert_eq!(collector.daily_requests(9, 9), 0);
    }

    #[test]
    fn peak_streams_is_monotonic() {
        let repo = Arc::new(RecordingRepo::default());
        let collector = UsageCollector::new(repo, Duration::from_secs(60));

        collector.update_peak_streams(1, 10, 3);
        collector.update_peak_streams(1, 10, 2);
        collector.update_peak_streams(1, 10, 5);

        let buffers = collector.buffers.read();
        let peak = buffers
            .get(&(1, 10))
            .unwrap()
            .peak_streams
            .load(Ordering::Acquire);
        assert_eq!(peak, 5);
    }
}
