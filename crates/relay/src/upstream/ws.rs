//! WebSocket gateway client.
//!
//! Speaks the relay's canonical JSON frames over a TLS WebSocket: one
//! connection per symbol stream, opened with a `subscribe` op, decoded
//! straight into [`MarketDataUpdate`] records.

use async_trait::async_trait;
use common::{GatewayEndpoint, MarketDataUpdate};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::protocol::Message, Connector, MaybeTlsStream,
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::gateway::{GatewayClient, GatewayConn, GatewayError, UpdateStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    op: &'static str,
    symbol: &'a str,
}

/// Dials gateway endpoints over (optionally TLS) WebSockets.
pub struct WsGatewayClient;

impl WsGatewayClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WsGatewayClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayClient for WsGatewayClient {
    async fn connect(
        &self,
        endpoint: &GatewayEndpoint,
    ) -> Result<Arc<dyn GatewayConn>, GatewayError> {
        // Validate the endpoint and prove it reachable before adopting it.
        let socket = dial(&endpoint.endpoint).await?;
        drop(socket);
        Ok(Arc::new(WsGatewayConn {
            url: endpoint.endpoint.clone(),
        }))
    }
}

/// One adopted gateway endpoint. Streams and pings each use their own
/// short-lived socket, so a wedged symbol stream cannot poison the probe.
struct WsGatewayConn {
    url: String,
}

#[async_trait]
impl GatewayConn for WsGatewayConn {
    async fn ping(&self) -> Result<(), GatewayError> {
        let mut socket = dial(&self.url)
            .await
            .map_err(|err| GatewayError::Ping(err.to_string()))?;
        socket
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|err| GatewayError::Ping(err.to_string()))?;

        while let Some(msg) = socket.next().await {
            match msg {
                Ok(Message::Pong(_)) => {
                    let _ = socket.send(Message::Close(None)).await;
                    return Ok(());
                }
                Ok(_) => continue,
                Err(err) => return Err(GatewayError::Ping(err.to_string())),
            }
        }
        Err(GatewayError::Ping("socket closed before pong".into()))
    }

    async fn updates(
        &self,
        symbol: &str,
        cancel: CancellationToken,
    ) -> Result<UpdateStream, GatewayError> {
        let mut socket = dial(&self.url).await?;

        let frame = serde_json::to_string(&SubscribeFrame {
            op: "subscribe",
            symbol,
        })
        .map_err(|err| GatewayError::Stream(err.to_string()))?;
        socket
            .send(Message::Text(frame))
            .await
            .map_err(|err| GatewayError::Stream(err.to_string()))?;

        let (tx, rx) = mpsc::channel::<Result<MarketDataUpdate, GatewayError>>(
            STREAM_CHANNEL_CAPACITY,
        );
        let symbol = symbol.to_string();

        tokio::spawn(async move {
            let (mut write, mut read) = socket.split();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let item = decode_update(text.as_bytes());
                            if tx.send(item).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            let item = decode_update(&data);
                            if tx.send(item).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            debug!(symbol, ?frame, "gateway closed stream");
                            break;
                        }
                        Some(Err(err)) => {
                            warn!(symbol, %err, "gateway socket error");
                            let _ = tx.send(Err(GatewayError::Stream(err.to_string()))).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn decode_update(payload: &[u8]) -> Result<MarketDataUpdate, GatewayError> {
    serde_json::from_slice(payload).map_err(|err| GatewayError::Decode(err.to_string()))
}

/// Dial a `ws://` or `wss://` URL: resolve, prefer IPv4, TCP with a bounded
/// timeout, then TLS + WebSocket handshake.
async fn dial(
    url_str: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, GatewayError> {
    let connect_err = |reason: String| GatewayError::Connect {
        endpoint: url_str.to_string(),
        reason,
    };

    let url = Url::parse(url_str).map_err(|err| connect_err(err.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| connect_err("no host in url".into()))?;
    let tls = url.scheme() == "wss";
    let port = url.port().unwrap_or(if tls { 443 } else { 80 });
    let addr_str = format!("{host}:{port}");

    let addrs: Vec<SocketAddr> = addr_str
        .to_socket_addrs()
        .map_err(|err| connect_err(format!("dns resolution failed: {err}")))?
        .collect();

    // IPv4 first: some gateway deployments publish AAAA records that
    // blackhole from inside the cluster.
    let mut sorted: Vec<SocketAddr> = addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
    sorted.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());

    let mut tcp_stream = None;
    for addr in &sorted {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                tcp_stream = Some(stream);
                break;
            }
            Ok(Err(err)) => debug!(%addr, %err, "tcp connect failed"),
            Err(_) => debug!(%addr, "tcp connect timed out"),
        }
    }
    let tcp_stream =
        tcp_stream.ok_or_else(|| connect_err("all addresses unreachable".into()))?;

    let connector = if tls {
        let mut root_store = rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            let _ = root_store.add(cert);
        }
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|err| connect_err(format!("tls config: {err}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
        Connector::Rustls(Arc::new(config))
    } else {
        Connector::Plain
    };

    let (socket, response) =
        client_async_tls_with_config(url_str, tcp_stream, None, Some(connector))
            .await
            .map_err(|err| connect_err(err.to_string()))?;
    debug!(url = url_str, status = ?response.status(), "websocket handshake complete");
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::UpdateKind;

    #[test]
    fn subscribe_frame_shape() {
        let frame = serde_json::to_string(&SubscribeFrame {
            op: "subscribe",
            symbol: "ETH",
        })
        .unwrap();
        assert_eq!(frame, r#"{"op":"subscribe","symbol":"ETH"}"#);
    }

    #[test]
    fn decodes_canonical_update() {
        let update = MarketDataUpdate {
            kind: UpdateKind::Orderbook,
            symbol: "ETH".into(),
            timestamp: Utc::now(),
            sequence: 7,
            is_snapshot: true,
            orderbook: Some(common::OrderbookSnapshot {
                symbol: "ETH".into(),
                timestamp: Utc::now(),
                sequence: 7,
                asks: vec![],
                bids: vec![],
            }),
            trade: None,
        };
        let payload = serde_json::to_vec(&update).unwrap();
        let decoded = decode_update(&payload).unwrap();
        assert_eq!(decoded.symbol, "ETH");
        assert_eq!(decoded.sequence, 7);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            decode_update(b"not json"),
            Err(GatewayError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn dial_rejects_bad_urls() {
        assert!(matches!(
            dial("not a url").await,
            Err(GatewayError::Connect { .. })
        ));
        assert!(matches!(
            dial("wss:///nohost").await,
            Err(GatewayError::Connect { .. })
        ));
    }
}
