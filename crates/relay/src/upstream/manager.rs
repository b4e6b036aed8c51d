//! Upstream manager.
//!
//! Owns the active gateway connection and one ingest task per subscribed
//! symbol. Streams reconnect independently with jittered exponential
//! backoff; the health loop watches ping round-trips, data liveness, and
//! the decode error rate, and fails over to the next gateway by priority
//! when the active one goes bad.

use chrono::Utc;
use common::{GatewayEndpoint, MarketDataUpdate, StreamStatus, Symbol};
use futures::StreamExt;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UpstreamConfig;
use crate::gateway::{GatewayClient, GatewayConn, GatewayError, UpdateStream};

/// Ping must answer within this long to count as healthy.
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// An active stream with no data for this long marks the gateway unhealthy.
const DATA_LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Sliding window for the ingest error rate.
const ERROR_WINDOW: Duration = Duration::from_secs(60);

/// Error-rate threshold above which the gateway is unhealthy.
const ERROR_RATE_THRESHOLD: f64 = 0.05;

/// Minimum samples before the error rate is meaningful.
const ERROR_RATE_MIN_SAMPLES: usize = 20;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no gateways configured")]
    NoGatewaysConfigured,

    #[error("manager is stopped")]
    Stopped,
}

/// Non-blocking callback invoked for every decoded frame.
pub type DataSink = Arc<dyn Fn(MarketDataUpdate) + Send + Sync>;

/// Sliding ok/error window over ingest and ping outcomes.
struct ErrorWindow {
    events: Mutex<VecDeque<(Instant, bool)>>,
}

impl ErrorWindow {
    fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
        }
    }

    fn record(&self, ok: bool) {
        let mut events = self.events.lock();
        events.push_back((Instant::now(), ok));
        Self::prune(&mut events);
    }

    fn unhealthy(&self) -> bool {
        let mut events = self.events.lock();
        Self::prune(&mut events);
        let total = events.len();
        if total < ERROR_RATE_MIN_SAMPLES {
            return false;
        }
        let errors = events.iter().filter(|(_, ok)| !ok).count();
        errors as f64 / total as f64 > ERROR_RATE_THRESHOLD
    }

    fn prune(events: &mut VecDeque<(Instant, bool)>) {
        let Some(cutoff) = Instant::now().checked_sub(ERROR_WINDOW) else {
            return;
        };
        while events.front().is_some_and(|(at, _)| *at < cutoff) {
            events.pop_front();
        }
    }
}

struct ActiveGateway {
    endpoint: GatewayEndpoint,
    conn: Arc<dyn GatewayConn>,
}

/// Per-symbol ingest state, owned exclusively by the manager.
struct StreamState {
    symbol: Symbol,
    status: RwLock<StreamStatus>,
    last_update_ms: AtomicI64,
    reconnect_count: AtomicU32,
    cancel: CancellationToken,
}

impl StreamState {
    fn new(symbol: &str, cancel: CancellationToken) -> Self {
        Self {
            symbol: symbol.to_string(),
            status: RwLock::new(StreamStatus::Connecting),
            last_update_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            reconnect_count: AtomicU32::new(0),
            cancel,
        }
    }

    fn set_status(&self, status: StreamStatus) {
        *self.status.write() = status;
    }

    fn status(&self) -> StreamStatus {
        *self.status.read()
    }
}

/// Public view of one stream's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub symbol: Symbol,
    pub status: StreamStatus,
    pub last_update_ms: i64,
    pub reconnect_count: u32,
}

/// Manager statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamStats {
    pub active_gateway: Option<String>,
    pub active_streams: usize,
    pub stream_reconnects: u64,
    pub gateway_failovers: u64,
}

/// Upstream connection and ingest-stream owner.
pub struct Manager {
    /// Self-handle for spawning stream and health tasks.
    weak: Weak<Manager>,
    client: Arc<dyn GatewayClient>,
    gateways: Vec<GatewayEndpoint>,
    base_delay: Duration,
    max_delay: Duration,
    health_interval: Duration,
    sink: DataSink,
    active: RwLock<Option<ActiveGateway>>,
    last_ping_ms: AtomicI64,
    streams: RwLock<HashMap<Symbol, Arc<StreamState>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    reconnecting: AtomicBool,
    started: AtomicBool,
    ever_connected: AtomicBool,
    gateway_failovers: AtomicU64,
    health: ErrorWindow,
}

impl Manager {
    pub fn new(config: &UpstreamConfig, client: Arc<dyn GatewayClient>, sink: DataSink) -> Arc<Self> {
        let mut gateways = config.gateways.clone();
        gateways.sort_by_key(|gw| gw.priority);

        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            client,
            gateways,
            base_delay: config.reconnect_base_delay(),
            max_delay: config.reconnect_max_delay(),
            health_interval: config.health_check_interval(),
            sink,
            active: RwLock::new(None),
            last_ping_ms: AtomicI64::new(0),
            streams: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            reconnecting: AtomicBool::new(false),
            started: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            gateway_failovers: AtomicU64::new(0),
            health: ErrorWindow::new(),
        })
    }

    /// Connect to the preferred gateway and start the health loop.
    ///
    /// An unreachable gateway at startup is not fatal: the health loop keeps
    /// sweeping the list. An empty gateway list is.
    pub async fn start(&self) -> Result<(), UpstreamError> {
        if self.gateways.is_empty() {
            return Err(UpstreamError::NoGatewaysConfigured);
        }
        let Some(mgr) = self.weak.upgrade() else {
            return Err(UpstreamError::Stopped);
        };
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.failover().await;
        if self.active.read().is_none() {
            warn!("no gateway reachable at startup, retrying from the health loop");
        }

        let handle = tokio::spawn(async move { mgr.health_loop().await });
        self.tasks.lock().push(handle);
        Ok(())
    }

    /// Ensure an ingest stream exists for the symbol. Idempotent; the
    /// connection itself is established asynchronously.
    pub fn subscribe(&self, symbol: &str) -> Result<(), UpstreamError> {
        if self.cancel.is_cancelled() {
            return Err(UpstreamError::Stopped);
        }
        let Some(mgr) = self.weak.upgrade() else {
            return Err(UpstreamError::Stopped);
        };

        {
            let mut streams = self.streams.write();
            if streams.contains_key(symbol) {
                return Ok(());
            }
            let state = Arc::new(StreamState::new(symbol, self.cancel.child_token()));
            streams.insert(symbol.to_string(), state.clone());

            let handle = tokio::spawn(async move { mgr.run_stream(state).await });
            self.tasks.lock().push(handle);
        }

        counter!("relay_stream_subscribes_total", "action" => "subscribe").increment(1);
        gauge!("relay_upstream_streams").set(self.streams.read().len() as f64);
        info!(symbol, "upstream subscribe");
        Ok(())
    }

    /// Tear down the symbol's ingest stream. Idempotent.
    pub fn unsubscribe(&self, symbol: &str) {
        let removed = self.streams.write().remove(symbol);
        // Cancel outside the map lock: the stream task may be mid-cleanup.
        if let Some(state) = removed {
            state.cancel.cancel();
            counter!("relay_stream_subscribes_total", "action" => "unsubscribe").increment(1);
            gauge!("relay_upstream_streams").set(self.streams.read().len() as f64);
            info!(symbol, "upstream unsubscribe");
        }
    }

    /// Cancel every stream and wait briefly for in-flight work.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let states: Vec<Arc<StreamState>> = self.streams.write().drain().map(|(_, s)| s).collect();
        for state in &states {
            state.cancel.cancel();
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            futures::future::join_all(handles),
        )
        .await;
        info!("upstream manager stopped");
    }

    pub fn active_symbols(&self) -> Vec<Symbol> {
        self.streams.read().keys().cloned().collect()
    }

    pub fn stream_info(&self, symbol: &str) -> Option<StreamInfo> {
        self.streams.read().get(symbol).map(|state| StreamInfo {
            symbol: state.symbol.clone(),
            status: state.status(),
            last_update_ms: state.last_update_ms.load(Ordering::Relaxed),
            reconnect_count: state.reconnect_count.load(Ordering::Relaxed),
        })
    }

    pub fn active_gateway(&self) -> Option<String> {
        self.active.read().as_ref().map(|a| a.endpoint.endpoint.clone())
    }

    pub fn stats(&self) -> UpstreamStats {
        let streams = self.streams.read();
        UpstreamStats {
            active_gateway: self.active.read().as_ref().map(|a| a.endpoint.endpoint.clone()),
            active_streams: streams.len(),
            stream_reconnects: streams
                .values()
                .map(|s| s.reconnect_count.load(Ordering::Relaxed) as u64)
                .sum(),
            gateway_failovers: self.gateway_failovers.load(Ordering::Relaxed),
        }
    }

    async fn health_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => self.health_check().await,
            }
        }
    }

    async fn health_check(&self) {
        let conn = self.active.read().as_ref().map(|a| a.conn.clone());
        let Some(conn) = conn else {
            self.failover().await;
            return;
        };

        let ping_ok = matches!(
            tokio::time::timeout(PING_TIMEOUT, conn.ping()).await,
            Ok(Ok(()))
        );
        self.health.record(ping_ok);
        if !ping_ok {
            warn!("gateway ping failed, failing over");
            counter!("relay_upstream_errors_total", "kind" => "ping").increment(1);
            self.failover().await;
            return;
        }
        self.last_ping_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        let liveness_cutoff =
            Utc::now().timestamp_millis() - DATA_LIVENESS_TIMEOUT.as_millis() as i64;
        let stalled = self.streams.read().values().any(|state| {
            state.status() == StreamStatus::Active
                && state.last_update_ms.load(Ordering::Relaxed) < liveness_cutoff
        });
        if stalled {
            warn!("active stream has gone silent, failing over");
            counter!("relay_upstream_errors_total", "kind" => "liveness").increment(1);
            self.failover().await;
            return;
        }

        if self.health.unhealthy() {
            warn!("upstream error rate over threshold, failing over");
            counter!("relay_upstream_errors_total", "kind" => "error_rate").increment(1);
            self.failover().await;
        }
    }

    /// Sweep the gateway list in priority order and adopt the first one
    /// that answers. Single-flight: concurrent callers return immediately.
    async fn failover(&self) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut adopted = false;
        for endpoint in &self.gateways {
            match self.client.connect(endpoint).await {
                Ok(conn) => {
                    info!(endpoint = %endpoint.endpoint, priority = endpoint.priority, "gateway connected");
                    *self.active.write() = Some(ActiveGateway {
                        endpoint: endpoint.clone(),
                        conn,
                    });
                    self.last_ping_ms
                        .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                    // The first adoption is a plain connect, not a failover.
                    if self.ever_connected.swap(true, Ordering::SeqCst) {
                        self.gateway_failovers.fetch_add(1, Ordering::Relaxed);
                        counter!("relay_upstream_reconnects_total").increment(1);
                    }
                    gauge!("relay_upstream_connected").set(1.0);
                    adopted = true;
                    break;
                }
                Err(err) => {
                    warn!(endpoint = %endpoint.endpoint, %err, "gateway connect failed");
                }
            }
        }

        if !adopted {
            warn!("all gateways failed, staying in reconnect");
            *self.active.write() = None;
            gauge!("relay_upstream_connected").set(0.0);
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    async fn run_stream(self: Arc<Self>, state: Arc<StreamState>) {
        loop {
            if state.cancel.is_cancelled() {
                break;
            }

            let conn = self.active.read().as_ref().map(|a| a.conn.clone());
            let Some(conn) = conn else {
                // No gateway yet: back off and let the health loop reconnect.
                state.set_status(StreamStatus::Reconnecting);
                if !self.backoff(&state).await {
                    break;
                }
                continue;
            };

            match conn.updates(&state.symbol, state.cancel.child_token()).await {
                Ok(mut updates) => {
                    state.set_status(StreamStatus::Active);
                    debug!(symbol = %state.symbol, "stream connected");
                    if !self.pump(&state, &mut updates).await {
                        break;
                    }
                }
                Err(err) => {
                    warn!(symbol = %state.symbol, %err, "stream open failed");
                    self.health.record(false);
                }
            }

            if state.cancel.is_cancelled() {
                break;
            }
            state.set_status(StreamStatus::Reconnecting);
            state.reconnect_count.fetch_add(1, Ordering::Relaxed);
            counter!("relay_stream_reconnects_total").increment(1);
            if !self.backoff(&state).await {
                break;
            }
        }
        state.set_status(StreamStatus::Closed);
        debug!(symbol = %state.symbol, "stream task exited");
    }

    /// Read the stream until it ends or the symbol is cancelled. Returns
    /// whether the caller should reconnect.
    async fn pump(&self, state: &StreamState, updates: &mut UpdateStream) -> bool {
        loop {
            tokio::select! {
                _ = state.cancel.cancelled() => return false,
                item = updates.next() => match item {
                    Some(Ok(update)) => {
                        state
                            .last_update_ms
                            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                        self.health.record(true);
                        counter!("relay_upstream_messages_total", "symbol" => state.symbol.clone())
                            .increment(1);
                        (self.sink)(update);
                    }
                    Some(Err(GatewayError::Decode(err))) => {
                        // Bad frame: drop it and keep the stream alive.
                        warn!(symbol = %state.symbol, %err, "decode error, dropping frame");
                        counter!("relay_upstream_errors_total", "kind" => "decode").increment(1);
                        self.health.record(false);
                    }
                    Some(Err(err)) => {
                        warn!(symbol = %state.symbol, %err, "stream error");
                        counter!("relay_upstream_errors_total", "kind" => "stream").increment(1);
                        self.health.record(false);
                        return true;
                    }
                    None => {
                        info!(symbol = %state.symbol, "stream disconnected");
                        return true;
                    }
                }
            }
        }
    }

    /// Sleep the jittered exponential backoff for the stream's attempt
    /// count. Returns false when cancelled mid-sleep.
    async fn backoff(&self, state: &StreamState) -> bool {
        let attempt = state.reconnect_count.load(Ordering::Relaxed).max(1);
        let delay = backoff_delay(self.base_delay, self.max_delay, attempt);
        tokio::select! {
            _ = state.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// `min(base * 2^(attempt-1), max)`, perturbed by a uniform ±10% jitter.
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt.min(32) as i32 - 1);
    let capped = exp.min(max.as_secs_f64());
    let jitter = 1.0 + rand::thread_rng().gen_range(-0.1..0.1);
    Duration::from_secs_f64(capped * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::{OrderbookSnapshot, UpdateKind};
    use futures::stream;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn update(symbol: &str, sequence: i64) -> MarketDataUpdate {
        MarketDataUpdate::from_orderbook(
            OrderbookSnapshot {
                symbol: symbol.to_string(),
                timestamp: Utc::now(),
                sequence,
                asks: vec![],
                bids: vec![],
            },
            true,
        )
    }

    /// Scripted gateway: endpoints containing "bad" refuse to connect;
    /// streams yield `frames` updates and then stay open.
    struct MockGateway {
        frames: usize,
        connects: AtomicUsize,
    }

    struct MockConn {
        frames: usize,
    }

    #[async_trait]
    impl GatewayConn for MockConn {
        async fn ping(&self) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn updates(
            &self,
            symbol: &str,
            _cancel: CancellationToken,
        ) -> Result<UpdateStream, GatewayError> {
            let symbol = symbol.to_string();
            let frames: Vec<Result<MarketDataUpdate, GatewayError>> = (0..self.frames)
                .map(|i| Ok(update(&symbol, i as i64 + 1)))
                .collect();
            Ok(Box::pin(stream::iter(frames).chain(stream::pending())))
        }
    }

    #[async_trait]
    impl GatewayClient for MockGateway {
        async fn connect(
            &self,
            endpoint: &GatewayEndpoint,
        ) -> Result<Arc<dyn GatewayConn>, GatewayError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if endpoint.endpoint.contains("bad") {
                return Err(GatewayError::Connect {
                    endpoint: endpoint.endpoint.clone(),
                    reason: "refused".into(),
                });
            }
            Ok(Arc::new(MockConn {
                frames: self.frames,
            }))
        }
    }

    fn config(endpoints: &[(&str, i32)]) -> UpstreamConfig {
        UpstreamConfig {
            gateways: endpoints
                .iter()
                .map(|(endpoint, priority)| GatewayEndpoint {
                    endpoint: endpoint.to_string(),
                    priority: *priority,
                    region: String::new(),
                })
                .collect(),
            health_check_interval_secs: 1,
            reconnect_base_delay_ms: 5,
            reconnect_max_delay_secs: 1,
        }
    }

    fn manager_with_sink(
        config: &UpstreamConfig,
        client: Arc<dyn GatewayClient>,
    ) -> (Arc<Manager>, mpsc::UnboundedReceiver<MarketDataUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: DataSink = Arc::new(move |update| {
            let _ = tx.send(update);
        });
        (Manager::new(config, client, sink), rx)
    }

    #[tokio::test]
    async fn start_requires_gateways() {
        let (manager, _rx) = manager_with_sink(
            &config(&[]),
            Arc::new(MockGateway {
                frames: 0,
                connects: AtomicUsize::new(0),
            }),
        );
        assert!(matches!(
            manager.start().await,
            Err(UpstreamError::NoGatewaysConfigured)
        ));
    }

    #[tokio::test]
    async fn connects_to_lowest_priority_gateway() {
        let client = Arc::new(MockGateway {
            frames: 0,
            connects: AtomicUsize::new(0),
        });
        let cfg = config(&[("wss://standby", 2), ("wss://primary", 1)]);
        let (manager, _rx) = manager_with_sink(&cfg, client);

        manager.start().await.unwrap();
        assert_eq!(manager.active_gateway().as_deref(), Some("wss://primary"));
        manager.stop().await;
    }

    #[tokio::test]
    async fn falls_through_to_standby_when_primary_refuses() {
        let client = Arc::new(MockGateway {
            frames: 0,
            connects: AtomicUsize::new(0),
        });
        let cfg = config(&[("wss://bad-primary", 1), ("wss://standby", 2)]);
        let (manager, _rx) = manager_with_sink(&cfg, client);

        manager.start().await.unwrap();
        assert_eq!(manager.active_gateway().as_deref(), Some("wss://standby"));
        manager.stop().await;
    }

    #[tokio::test]
    async fn ingests_frames_into_sink() {
        let client = Arc::new(MockGateway {
            frames: 3,
            connects: AtomicUsize::new(0),
        });
        let cfg = config(&[("wss://primary", 1)]);
        let (manager, mut rx) = manager_with_sink(&cfg, client);

        manager.start().await.unwrap();
        manager.subscribe("ETH").unwrap();

        for expected in 1..=3 {
            let update = rx.recv().await.unwrap();
            assert_eq!(update.symbol, "ETH");
            assert_eq!(update.sequence, expected);
            assert_eq!(update.kind, UpdateKind::Orderbook);
        }

        let info = manager.stream_info("ETH").unwrap();
        assert_eq!(info.status, StreamStatus::Active);
        assert_eq!(info.reconnect_count, 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let client = Arc::new(MockGateway {
            frames: 0,
            connects: AtomicUsize::new(0),
        });
        let cfg = config(&[("wss://primary", 1)]);
        let (manager, _rx) = manager_with_sink(&cfg, client);

        manager.start().await.unwrap();
        manager.subscribe("ETH").unwrap();
        manager.subscribe("ETH").unwrap();
        assert_eq!(manager.active_symbols().len(), 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn unsubscribe_tears_down_stream() {
        let client = Arc::new(MockGateway {
            frames: 1,
            connects: AtomicUsize::new(0),
        });
        let cfg = config(&[("wss://primary", 1)]);
        let (manager, mut rx) = manager_with_sink(&cfg, client);

        manager.start().await.unwrap();
        manager.subscribe("ETH").unwrap();
        let _ = rx.recv().await;

        manager.unsubscribe("ETH");
        manager.unsubscribe("ETH");
        assert!(manager.stream_info("ETH").is_none());
        assert!(manager.active_symbols().is_empty());
        manager.stop().await;
    }

    #[tokio::test]
    async fn subscribe_after_stop_is_rejected() {
        let client = Arc::new(MockGateway {
            frames: 0,
            connects: AtomicUsize::new(0),
        });
        let cfg = config(&[("wss://primary", 1)]);
        let (manager, _rx) = manager_with_sink(&cfg, client);

        manager.start().await.unwrap();
        manager.stop().await;
        assert!(matches!(
            manager.subscribe("ETH"),
            Err(UpstreamError::Stopped)
        ));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(30);

        let first = backoff_delay(base, max, 1);
        assert!(first >= Duration::from_millis(90) && first <= Duration::from_millis(110));

        let fourth = backoff_delay(base, max, 4);
        assert!(fourth >= Duration::from_millis(720) && fourth <= Duration::from_millis(880));

        let huge = backoff_delay(base, max, 30);
        assert!(huge <= Duration::from_secs(33));
        assert!(huge >= Duration::from_secs(27));
    }

    #[test]
    fn error_window_needs_samples_and_threshold() {
        let window = ErrorWindow::new();
        for _ in 0..10 {
            window.record(false);
        }
        assert!(!window.unhealthy(), "below the minimum sample count");

        for _ in 0..15 {
            window.record(true);
        }
        // 10 errors / 25 samples = 40% > 5%.
        assert!(window.unhealthy());

        let healthy = ErrorWindow::new();
        for _ in 0..100 {
            healthy.record(true);
        }
        healthy.record(false);
        // 1 / 101 < 5%.
        assert!(!healthy.unhealthy());
    }
}
