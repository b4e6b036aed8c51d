//! Shared schema types for the market-data relay.
//!
//! Everything that crosses a component boundary lives here: the canonical
//! market-data records produced by upstream decoders and fanned out to
//! subscribers, and the tenant/key/plan records the auth gate resolves
//! credentials into.

pub mod auth;
pub mod market;

pub use auth::{AuthRecord, KeyStatus, TenantStatus, UsageDelta};
pub use market::{
    GatewayEndpoint, MarketDataUpdate, OrderbookSnapshot, PriceLevel, Side, StreamStatus, Symbol,
    Trade, UpdateKind,
};
