//! Per-symbol market-data cache.
//!
//! Holds the latest order-book snapshot and a bounded ring of recent trades
//! for every ingested symbol. This is where new subscribers get their
//! initial state from.
//!
//! Locking: the book map and the trade-ring map take their own
//! reader/writer locks; each ring has an inner lock that is never held
//! across a map mutation (map lock before ring lock, always).

use chrono::Utc;
use common::{OrderbookSnapshot, Symbol, Trade};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Fixed-capacity ring of recent trades, oldest overwritten first.
struct TradeRing {
    buf: Vec<Trade>,
    cap: usize,
    /// Next write position.
    head: usize,
    len: usize,
}

impl TradeRing {
    fn new(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
            cap,
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, trade: Trade) {
        if self.buf.len() < self.cap {
            self.buf.push(trade);
        } else {
            self.buf[self.head] = trade;
        }
        self.head = (self.head + 1) % self.cap;
        if self.len < self.cap {
            self.len += 1;
        }
    }

    /// The `n` most recent trades, oldest first.
    fn recent(&self, n: usize) -> Vec<Trade> {
        let n = n.min(self.len);
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let idx = (self.head + self.cap - n + i) % self.cap;
            out.push(self.buf[idx].clone());
        }
        out
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub orderbook_count: usize,
    pub trade_symbols: usize,
    pub snapshot_updates: u64,
    pub trades_recorded: u64,
}

/// Thread-safe cache of the latest per-symbol state.
pub struct MarketCache {
    books: RwLock<HashMap<Symbol, OrderbookSnapshot>>,
    trades: RwLock<HashMap<Symbol, Arc<Mutex<TradeRing>>>>,
    max_depth: usize,
    trade_history: usize,
    snapshot_updates: AtomicU64,
    trades_recorded: AtomicU64,
}

impl MarketCache {
    pub fn new(max_depth: usize, trade_history: usize) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            trades: RwLock::new(HashMap::new()),
            max_depth,
            trade_history,
            snapshot_updates: AtomicU64::new(0),
            trades_recorded: AtomicU64::new(0),
        }
    }

    /// Replace the stored snapshot for the symbol.
    ///
    /// Sides are truncated to the configured depth, keeping the best levels.
    /// A snapshot whose sequence regresses behind the cached one is dropped,
    /// which keeps the per-symbol sequence monotonic. Returns whether the
    /// snapshot was stored.
    pub fn update_orderbook(&self, mut snapshot: OrderbookSnapshot) -> bool {
        snapshot.asks.truncate(self.max_depth);
        snapshot.bids.truncate(self.max_depth);

        let mut books = self.books.write();
        if let Some(existing) = books.get(&snapshot.symbol) {
            if existing.sequence > snapshot.sequence {
                debug!(
                    symbol = %snapshot.symbol,
                    cached = existing.sequence,
                    incoming = snapshot.sequence,
                    "dropping stale orderbook snapshot"
                );
                return false;
            }
        }
        books.insert(snapshot.symbol.clone(), snapshot);
        drop(books);

        self.snapshot_updates.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Independent copy of the latest snapshot, if one is cached.
    pub fn orderbook(&self, symbol: &str) -> Option<OrderbookSnapshot> {
        self.books.read().get(symbol).cloned()
    }

    /// Append a trade to the symbol's ring, creating it lazily.
    pub fn add_trade(&self, trade: Trade) {
        let ring = {
            let trades = self.trades.read();
            trades.get(&trade.symbol).cloned()
        };
        let ring = match ring {
            Some(ring) => ring,
            None => {
                let mut trades = self.trades.write();
                trades
                    .entry(trade.symbol.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(TradeRing::new(self.trade_history))))
                    .clone()
            }
        };

        ring.lock().push(trade);
        self.trades_recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// The `n` most recent trades for the symbol, oldest first.
    pub fn recent_trades(&self, symbol: &str, n: usize) -> Vec<Trade> {
        let ring = self.trades.read().get(symbol).cloned();
        match ring {
            Some(ring) => ring.lock().recent(n),
            None => Vec::new(),
        }
    }

    /// Symbols with a cached order book.
    pub fn symbols(&self) -> Vec<Symbol> {
        self.books.read().keys().cloned().collect()
    }

    /// Drop symbols whose snapshot is older than `stale_after`, along with
    /// their trade rings. Returns the number of symbols removed.
    pub fn cleanup(&self, stale_after: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::hours(1));

        let stale: Vec<Symbol> = {
            let books = self.books.read();
            books
                .iter()
                .filter(|(_, snapshot)| snapshot.timestamp < cutoff)
                .map(|(symbol, _)| symbol.clone())
                .collect()
        };
        if stale.is_empty() {
            return 0;
        }

        {
            let mut books = self.books.write();
            for symbol in &stale {
                books.remove(symbol);
            }
        }
        {
            let mut trades = self.trades.write();
            for symbol in &stale {
                trades.remove(symbol);
            }
        }

        debug!(removed = stale.len(), "cache cleanup removed stale symbols");
        stale.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            orderbook_count: self.books.read().len(),
            trade_symbols: self.trades.read().len(),
            snapshot_updates: self.snapshot_updates.load(Ordering::Relaxed),
            trades_recorded: self.trades_recorded.load(Ordering::Relaxed),
        }
    }
}
