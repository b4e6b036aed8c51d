//! Relay service entry point.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay::upstream::{Manager, WsGatewayClient};
use relay::{
    ingest_sink, AuthGate, Hub, MarketCache, RateLimiter, Relay, RelayConfig, SqlRepository,
    UsageCollector,
};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = match env::var("RELAY_CONFIG") {
        Ok(path) => RelayConfig::load(&path).with_context(|| format!("loading {path}"))?,
        Err(_) => {
            let mut config = RelayConfig::default();
            config.apply_env();
            config
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone())),
        )
        .init();

    info!("starting market-data relay");
    info!(gateways = config.upstream.gateways.len(), "configuration loaded");

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.telemetry.metrics_port))
        .install()
        .context("starting prometheus exporter")?;
    info!(port = config.telemetry.metrics_port, "metrics exporter listening");

    // Postgres is required: auth and usage flow through it.
    let repo = Arc::new(
        SqlRepository::connect(&config.database)
            .await
            .context("connecting to postgres")?,
    );
    info!("connected to postgres");

    // Redis is optional: without it the auth gate runs on the in-process
    // cache alone.
    let redis = match &config.redis.url {
        Some(url) => match redis::Client::open(url.as_str()) {
            Ok(client) => {
                info!(url, "distributed auth cache enabled");
                Some(client)
            }
            Err(err) => {
                warn!(%err, "invalid redis url, continuing without distributed cache");
                None
            }
        },
        None => None,
    };

    let auth = Arc::new(AuthGate::new(repo.clone(), redis, config.auth.cache_ttl()));
    let limiter = Arc::new(RateLimiter::new(
        config.rate.default_rps,
        config.rate.default_max_streams,
        config.rate.burst_multiplier,
        config.rate.cleanup_interval(),
    ));
    let cache = Arc::new(MarketCache::new(
        config.cache.max_orderbook_depth,
        config.cache.trade_history_size,
    ));
    let hub = Arc::new(Hub::new(
        config.fanout.subscriber_buffer_size,
        config.fanout.slow_consumer_threshold,
        config.fanout.zombie_timeout(),
    ));
    let usage = Arc::new(UsageCollector::new(
        repo.clone(),
        config.usage.flush_interval(),
    ));

    let upstream = Manager::new(
        &config.upstream,
        Arc::new(WsGatewayClient::new()),
        ingest_sink(cache.clone(), hub.clone()),
    );
    upstream.start().await.context("starting upstream manager")?;
    info!("upstream manager started");

    let cancel = CancellationToken::new();
    let relay = Relay::new(
        config,
        auth,
        limiter,
        cache,
        hub.clone(),
        upstream.clone(),
        usage.clone(),
    );
    relay.start_background(&cancel);
    info!("relay core running");

    shutdown_signal().await;
    info!("shutting down");

    cancel.cancel();
    upstream.stop().await;
    hub.shutdown();
    usage.flush().await;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received terminate signal"),
    }
}
