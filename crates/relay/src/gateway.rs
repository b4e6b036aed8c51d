//! Upstream gateway transport seam.
//!
//! The relay treats the upstream wire dialect as opaque: a [`GatewayConn`]
//! decodes whatever the gateway speaks into canonical
//! [`MarketDataUpdate`](common::MarketDataUpdate) records. The manager only
//! ever dials through [`GatewayClient`], which keeps failover and health
//! checking testable against scripted connections.

use async_trait::async_trait;
use common::{GatewayEndpoint, MarketDataUpdate};
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors from the upstream transport.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("ping failed: {0}")]
    Ping(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("connection closed")]
    Closed,
}

/// Per-symbol stream of decoded updates. Ends on upstream disconnect or when
/// the cancellation token supplied to [`GatewayConn::updates`] fires.
pub type UpdateStream = BoxStream<'static, Result<MarketDataUpdate, GatewayError>>;

/// A live connection to one gateway endpoint.
#[async_trait]
pub trait GatewayConn: Send + Sync {
    /// Round-trip liveness probe. The health loop bounds this with its own
    /// timeout.
    async fn ping(&self) -> Result<(), GatewayError>;

    /// Open the decoded update stream for one symbol.
    async fn updates(
        &self,
        symbol: &str,
        cancel: CancellationToken,
    ) -> Result<UpdateStream, GatewayError>;
}

/// Dials gateway endpoints.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn connect(
        &self,
        endpoint: &GatewayEndpoint,
    ) -> Result<Arc<dyn GatewayConn>, GatewayError>;
}
