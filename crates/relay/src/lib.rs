//! Multi-tenant market-data relay.
//!
//! Maintains a small number of connections to an upstream market-data
//! gateway, caches the latest per-symbol state, and fans updates out to
//! many authenticated subscribers with per-key rate and concurrency
//! budgets.
//!
//! ## Architecture
//!
//! ```text
//! gateway (primary/standby)
//!         ↓ per-symbol streams
//! upstream::Manager (failover, health, backoff)
//!         ↓ ingest sink
//! cache::MarketCache ── fanout::Hub
//!         ↓                  ↓ bounded queues, drop + evict
//! session::Relay  ←── auth::AuthGate + ratelimit::RateLimiter
//!         ↓
//! transport layer (out of scope)
//! ```
//!
//! ## Back-pressure
//!
//! Subscriber queue capacity is the only knob: publishes are `try_send`,
//! overflow is counted and, past the slow-consumer threshold, the
//! subscriber is evicted and its queue closed exactly once.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod ratelimit;
pub mod repo;
pub mod session;
pub mod upstream;
pub mod usage;

pub use auth::AuthGate;
pub use cache::MarketCache;
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use fanout::Hub;
pub use gateway::{GatewayClient, GatewayConn, GatewayError, UpdateStream};
pub use ratelimit::RateLimiter;
pub use repo::{RepoError, Repository, SqlRepository};
pub use session::{ingest_sink, Relay, StreamSession};
pub use upstream::{Manager, WsGatewayClient};
pub use usage::UsageCollector;
