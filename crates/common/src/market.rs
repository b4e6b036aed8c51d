//! Canonical market-data records.
//!
//! Upstream wire dialects are decoded into these types at the gateway seam;
//! the cache, hub, and subscribers only ever see this schema.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Instrument identifier. Scoping key for all per-symbol state.
pub type Symbol = String;

/// A single price level of one order-book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Point-in-time snapshot of an order book.
///
/// Invariants: `asks` strictly ascending and `bids` strictly descending by
/// price; `sequence` never regresses for a given symbol once cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub sequence: i64,
    /// Sorted by price ascending.
    pub asks: Vec<PriceLevel>,
    /// Sorted by price descending.
    pub bids: Vec<PriceLevel>,
}

impl OrderbookSnapshot {
    /// Best (lowest) ask, if any.
    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// Best (highest) bid, if any.
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    /// Whether both sides satisfy their sort invariant.
    pub fn is_sorted(&self) -> bool {
        self.asks.windows(2).all(|w| w[0].price < w[1].price)
            && self.bids.windows(2).all(|w| w[0].price > w[1].price)
    }
}

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// A single executed trade. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: Symbol,
    pub trade_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

/// Which payload variant a [`MarketDataUpdate`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Orderbook,
    Trade,
}

/// Envelope for one decoded upstream frame.
///
/// Exactly one of `orderbook` / `trade` is populated, matching `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataUpdate {
    pub kind: UpdateKind,
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub sequence: i64,
    #[serde(default)]
    pub is_snapshot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orderbook: Option<OrderbookSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade: Option<Trade>,
}

impl MarketDataUpdate {
    /// Wrap an order-book snapshot.
    pub fn from_orderbook(snapshot: OrderbookSnapshot, is_snapshot: bool) -> Self {
        Self {
            kind: UpdateKind::Orderbook,
            symbol: snapshot.symbol.clone(),
            timestamp: snapshot.timestamp,
            sequence: snapshot.sequence,
            is_snapshot,
            orderbook: Some(snapshot),
            trade: None,
        }
    }

    /// Wrap a trade.
    pub fn from_trade(trade: Trade, sequence: i64) -> Self {
        Self {
            kind: UpdateKind::Trade,
            symbol: trade.symbol.clone(),
            timestamp: trade.timestamp,
            sequence,
            is_snapshot: false,
            orderbook: None,
            trade: Some(trade),
        }
    }
}

/// Lifecycle of a per-symbol upstream ingest stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Connecting,
    Active,
    Reconnecting,
    Closed,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Connecting => "connecting",
            StreamStatus::Active => "active",
            StreamStatus::Reconnecting => "reconnecting",
            StreamStatus::Closed => "closed",
        }
    }
}

/// A configured upstream gateway. Lower `priority` is preferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEndpoint {
    pub endpoint: String,
    pub priority: i32,
    #[serde(default)]
    pub region: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal) -> PriceLevel {
        PriceLevel {
            price,
            size: dec!(1),
        }
    }

    #[test]
    fn snapshot_sort_invariant() {
        let snapshot = OrderbookSnapshot {
            symbol: "ETH".into(),
            timestamp: Utc::now(),
            sequence: 1,
            asks: vec![level(dec!(100.1)), level(dec!(100.2)), level(dec!(100.3))],
            bids: vec![level(dec!(100.0)), level(dec!(99.9))],
        };
        assert!(snapshot.is_sorted());
        assert_eq!(snapshot.best_ask().unwrap().price, dec!(100.1));
        assert_eq!(snapshot.best_bid().unwrap().price, dec!(100.0));
    }

    #[test]
    fn snapshot_detects_unsorted_side() {
        let snapshot = OrderbookSnapshot {
            symbol: "ETH".into(),
            timestamp: Utc::now(),
            sequence: 1,
            asks: vec![level(dec!(100.2)), level(dec!(100.1))],
            bids: vec![],
        };
        assert!(!snapshot.is_sorted());

        // Equal prices violate the strict ordering too.
        let snapshot = OrderbookSnapshot {
            symbol: "ETH".into(),
            timestamp: Utc::now(),
            sequence: 1,
            asks: vec![],
            bids: vec![level(dec!(99.9)), level(dec!(99.9))],
        };
        assert!(!snapshot.is_sorted());
    }

    #[test]
    fn update_envelope_round_trip() {
        let trade = Trade {
            symbol: "BTC".into(),
            trade_id: "t-1".into(),
            price: dec!(61000.5),
            size: dec!(0.25),
            side: Side::Sell,
            timestamp: Utc::now(),
        };
        let update = MarketDataUpdate::from_trade(trade, 42);
        assert_eq!(update.kind, UpdateKind::Trade);
        assert!(update.orderbook.is_none());

        let json = serde_json::to_string(&update).unwrap();
        let back: MarketDataUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
        assert!(json.contains(r#""side":"sell""#));
    }
}
