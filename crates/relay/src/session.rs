//! The relay's library surface for transport layers.
//!
//! Every ingress request runs auth gate → rate limiter → cache or hub. A
//! streaming client gets a [`StreamSession`]: one concurrent-stream slot,
//! per-symbol subscriptions with the cached snapshot delivered out-of-band,
//! and a queue to pump until the hub closes it. Dropping the session
//! releases the slot and all subscriptions.

use common::{AuthRecord, MarketDataUpdate, OrderbookSnapshot, Symbol, Trade, UpdateKind};
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::auth::AuthGate;
use crate::cache::MarketCache;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::fanout::{Hub, Subscriber, SubscriberId, UpdateReceiver};
use crate::ratelimit::RateLimiter;
use crate::upstream::{DataSink, Manager};
use crate::usage::UsageCollector;

/// Hard cap on trades returned from one request.
const MAX_TRADE_COUNT: usize = 1000;

/// Build the ingest callback wired into the upstream manager: cache update
/// first, then hub publish. Never blocks.
pub fn ingest_sink(cache: Arc<MarketCache>, hub: Arc<Hub>) -> DataSink {
    Arc::new(move |update: MarketDataUpdate| {
        let symbol = update.symbol.clone();
        match update.kind {
            UpdateKind::Orderbook => {
                let Some(snapshot) = update.orderbook.clone() else {
                    return;
                };
                // A stale snapshot is not republished either; subscribers
                // see the same monotonic sequence the cache keeps.
                if cache.update_orderbook(snapshot) {
                    hub.publish(&symbol, Arc::new(update));
                }
            }
            UpdateKind::Trade => {
                if let Some(trade) = update.trade.clone() {
                    cache.add_trade(trade);
                }
                hub.publish(&symbol, Arc::new(update));
            }
        }
    })
}

/// The assembled relay core.
pub struct Relay {
    config: RelayConfig,
    auth: Arc<AuthGate>,
    limiter: Arc<RateLimiter>,
    cache: Arc<MarketCache>,
    hub: Arc<Hub>,
    upstream: Arc<Manager>,
    usage: Arc<UsageCollector>,
}

impl Relay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RelayConfig,
        auth: Arc<AuthGate>,
        limiter: Arc<RateLimiter>,
        cache: Arc<MarketCache>,
        hub: Arc<Hub>,
        upstream: Arc<Manager>,
        usage: Arc<UsageCollector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            auth,
            limiter,
            cache,
            hub,
            upstream,
            usage,
        })
    }

    pub fn auth(&self) -> &Arc<AuthGate> {
        &self.auth
    }

    pub fn cache(&self) -> &Arc<MarketCache> {
        &self.cache
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn upstream(&self) -> &Arc<Manager> {
        &self.upstream
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn usage(&self) -> &Arc<UsageCollector> {
        &self.usage
    }

    /// Spawn the maintenance tasks: limiter GC, auth cache scrub, usage
    /// flush, cache cleanup, and the hub zombie sweep. All exit when
    /// `cancel` fires. The upstream health loop belongs to the manager.
    pub fn start_background(&self, cancel: &CancellationToken) {
        tokio::spawn(self.limiter.clone().run_gc(cancel.clone()));
        tokio::spawn(self.auth.clone().run_scrub(cancel.clone()));
        tokio::spawn(self.usage.clone().run_flush(cancel.clone()));

        {
            let cache = self.cache.clone();
            let interval = self.config.cache.cleanup_interval();
            let stale_after = self.config.cache.stale_after();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            cache.cleanup(stale_after);
                        }
                    }
                }
            });
        }

        {
            let hub = self.hub.clone();
            let interval = self.config.fanout.zombie_timeout();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            hub.cleanup_zombies();
                        }
                    }
                }
            });
        }
    }

    /// Authenticated snapshot read. A cache miss triggers an upstream
    /// subscription as a side effect so a retry can succeed once data
    /// arrives.
    pub async fn orderbook(
        &self,
        credential: &str,
        symbol: &str,
        depth: Option<usize>,
    ) -> Result<OrderbookSnapshot, RelayError> {
        self.admit(credential).await?;

        match self.cache.orderbook(symbol) {
            Some(mut snapshot) => {
                counter!("relay_cache_hits_total").increment(1);
                if let Some(depth) = depth {
                    snapshot.asks.truncate(depth);
                    snapshot.bids.truncate(depth);
                }
                Ok(snapshot)
            }
            None => {
                counter!("relay_cache_misses_total").increment(1);
                if let Err(err) = self.upstream.subscribe(symbol) {
                    warn!(symbol, %err, "upstream subscribe on cache miss failed");
                }
                Err(RelayError::Unavailable(format!(
                    "no orderbook for {symbol} yet, retry shortly"
                )))
            }
        }
    }

    /// Authenticated recent-trades read, oldest first.
    pub async fn recent_trades(
        &self,
        credential: &str,
        symbol: &str,
        count: usize,
    ) -> Result<Vec<Trade>, RelayError> {
        self.admit(credential).await?;
        Ok(self.cache.recent_trades(symbol, count.min(MAX_TRADE_COUNT)))
    }

    /// Symbols with cached state.
    pub async fn symbols(&self, credential: &str) -> Result<Vec<Symbol>, RelayError> {
        self.admit(credential).await?;
        Ok(self.cache.symbols())
    }

    /// Open a streaming session, consuming one concurrent-stream slot.
    pub async fn open_stream(&self, credential: &str) -> Result<StreamSession, RelayError> {
        let auth = self.admit(credential).await?;
        let key = auth.key_id.to_string();

        if !self
            .limiter
            .acquire_stream(&key, auth.max_concurrent_streams.max(0) as u32)
        {
            counter!("relay_ratelimit_hits_total", "kind" => "streams").increment(1);
            self.usage.record_error(auth.tenant_id, auth.key_id);
            return Err(RelayError::QuotaExceededStreams);
        }

        let active = self
            .limiter
            .key_stats(&key)
            .map(|stats| stats.active_streams)
            .unwrap_or(0);
        self.usage
            .update_peak_streams(auth.tenant_id, auth.key_id, active as i32);

        let (subscriber, rx) =
            self.hub
                .create_subscriber(Uuid::new_v4(), auth.tenant_id, auth.key_id);
        Ok(StreamSession {
            hub: self.hub.clone(),
            limiter: self.limiter.clone(),
            cache: self.cache.clone(),
            upstream: self.upstream.clone(),
            usage: self.usage.clone(),
            auth,
            key,
            subscriber,
            rx,
            symbols: HashSet::new(),
        })
    }

    /// Auth gate → quota checks → one request token.
    async fn admit(&self, credential: &str) -> Result<AuthRecord, RelayError> {
        let auth = self.auth.authenticate(credential).await?;
        let key = auth.key_id.to_string();

        // Bind the plan's quotas to the limiter on first sight of the key.
        if self.limiter.key_stats(&key).is_none() {
            self.limiter.set_limit(
                &key,
                auth.max_rps.max(0) as u32,
                auth.max_concurrent_streams.max(0) as u32,
            );
        }

        if let Some(max_daily) = auth.max_daily_requests {
            if self.usage.daily_requests(auth.tenant_id, auth.key_id) >= max_daily {
                counter!("relay_ratelimit_hits_total", "kind" => "daily").increment(1);
                self.usage.record_error(auth.tenant_id, auth.key_id);
                return Err(RelayError::QuotaExceededDaily);
            }
        }

        if !self.limiter.allow(&key) {
            counter!("relay_ratelimit_hits_total", "kind" => "rps").increment(1);
            self.usage.record_error(auth.tenant_id, auth.key_id);
            return Err(RelayError::QuotaExceededRps);
        }

        self.usage.record_request(auth.tenant_id, auth.key_id);
        Ok(auth)
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession").finish_non_exhaustive()
    }
}

/// One streaming client's slot, subscriptions, and queue.
pub struct StreamSession {
    hub: Arc<Hub>,
    limiter: Arc<RateLimiter>,
    cache: Arc<MarketCache>,
    upstream: Arc<Manager>,
    usage: Arc<UsageCollector>,
    auth: AuthRecord,
    key: String,
    subscriber: Arc<Subscriber>,
    rx: UpdateReceiver,
    symbols: HashSet<Symbol>,
}

impl StreamSession {
    pub fn id(&self) -> SubscriberId {
        self.subscriber.id
    }

    pub fn auth(&self) -> &AuthRecord {
        &self.auth
    }

    /// Subscribe to a symbol. Ensures upstream ingest, registers with the
    /// hub, and returns the cached snapshot (if any) for out-of-band
    /// delivery before streamed updates.
    pub fn subscribe(&mut self, symbol: &str) -> Result<Option<OrderbookSnapshot>, RelayError> {
        if self.symbols.contains(symbol) {
            return Ok(self.cache.orderbook(symbol));
        }

        // The plan's symbol budget shares the streams quota code: the
        // taxonomy has no dedicated symbol-cap error.
        if self.symbols.len() >= self.auth.max_symbols.max(0) as usize {
            counter!("relay_ratelimit_hits_total", "kind" => "symbols").increment(1);
            return Err(RelayError::QuotaExceededStreams);
        }

        self.upstream
            .subscribe(symbol)
            .map_err(|err| RelayError::Unavailable(err.to_string()))?;
        self.hub.subscribe(symbol, self.subscriber.clone());
        self.symbols.insert(symbol.to_string());

        Ok(self.cache.orderbook(symbol))
    }

    /// Drop one symbol subscription. Idempotent.
    pub fn unsubscribe(&mut self, symbol: &str) {
        if self.symbols.remove(symbol) {
            self.hub.unsubscribe(symbol, self.subscriber.id);
        }
    }

    /// Next update, or `None` once the hub has closed the queue.
    pub async fn recv(&mut self) -> Option<Arc<MarketDataUpdate>> {
        let update = self.rx.recv().await;
        if update.is_some() {
            self.usage
                .record_message(self.auth.tenant_id, self.auth.key_id);
        }
        update
    }

    /// Whether the hub has evicted this subscriber.
    pub fn is_evicted(&self) -> bool {
        self.subscriber.is_closed()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        for symbol in self.symbols.drain() {
            self.hub.unsubscribe(&symbol, self.subscriber.id);
        }
        self.limiter.release_stream(&self.key);
    }
}
