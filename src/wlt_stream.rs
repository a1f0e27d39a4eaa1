//! Weft Layered Transport - Direct Stream Connection
//!
//! Outbound TCP+upgrade connection straight to the peer: dials
//! `ws://<peer_ip>:<port>/direct` for each configured candidate port until
//! one accepts. Messages travel as JSON text frames; the shared liveness
//! probe rides the same channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::wlt_netinfo::{NetworkInfo, NetworkType};
use crate::wlt_transport::{
    Connection, ConnectionFactory, ConnectionKind, ConnectionStatus, Inbox, LinkHealth, Message,
    TransportConfig, TransportError, TransportResult, KIND_PING, KIND_PONG,
};

// =============================================================================
// Constants
// =============================================================================

/// Handshake timeout per candidate port.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Quality reported right after the upgrade completes.
const INITIAL_QUALITY: u8 = 85;

/// Depth of the outbound frame queue between `send` and the socket writer.
const OUTBOUND_QUEUE: usize = 64;

// =============================================================================
// Factory
// =============================================================================

/// Creates direct stream connections.
pub struct DirectStreamFactory;

#[async_trait]
impl ConnectionFactory for DirectStreamFactory {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::DirectStream
    }

    fn priority(&self) -> u8 {
        ConnectionKind::DirectStream.default_priority()
    }

    fn estimate_success(&self, _peer_id: &str, info: &NetworkInfo) -> u8 {
        if info.peer_ip.as_deref().is_some_and(|ip| !ip.is_empty()) {
            match info.network_type {
                NetworkType::Lan => 85,
                NetworkType::Internet => 40,
                _ => 65,
            }
        } else {
            20
        }
    }

    async fn create(
        &self,
        cancel: CancellationToken,
        peer_id: &str,
        info: &NetworkInfo,
        config: &TransportConfig,
    ) -> TransportResult<Arc<dyn Connection>> {
        let peer_ip = match info.peer_ip.as_deref() {
            Some(ip) if !ip.is_empty() => ip.to_string(),
            _ => {
                return Err(TransportError::Fatal(
                    "peer IP required for direct stream connection".into(),
                ))
            }
        };

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let conn = Arc::new(DirectStreamConnection {
            peer_id: peer_id.to_string(),
            local_id: config.local_peer_id.clone(),
            peer_ip,
            ports: config.direct_ports.clone(),
            health: LinkHealth::new(ConnectionKind::DirectStream),
            inbox: Inbox::new(),
            outbound,
            cancel: cancel.child_token(),
        });

        tokio::spawn(Arc::clone(&conn).connect(outbound_rx));
        Ok(conn)
    }
}

// =============================================================================
// Connection
// =============================================================================

pub struct DirectStreamConnection {
    peer_id: String,
    local_id: String,
    peer_ip: String,
    ports: Vec<u16>,
    health: LinkHealth,
    inbox: Inbox,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl DirectStreamConnection {
    /// Tries each candidate port in order; the first accepted upgrade wins.
    async fn connect(self: Arc<Self>, outbound_rx: mpsc::Receiver<String>) {
        for port in &self.ports {
            if self.cancel.is_cancelled() {
                self.health.set_status(ConnectionStatus::Disconnected).await;
                self.inbox.close();
                return;
            }

            let url = format!("ws://{}:{}/direct", self.peer_ip, port);
            log::debug!("dialing {url}");
            let ws = match tokio::time::timeout(DIAL_TIMEOUT, connect_async(&url)).await {
                Ok(Ok((ws, _))) => ws,
                Ok(Err(e)) => {
                    log::debug!("dial {url} failed: {e}");
                    continue;
                }
                Err(_) => {
                    log::debug!("dial {url} timed out");
                    continue;
                }
            };

            self.health.mark_connected(INITIAL_QUALITY).await;
            log::info!("direct stream to {} established on port {port}", self.peer_id);
            self.clone().pump(ws, outbound_rx).await;
            return;
        }

        log::warn!(
            "all direct stream ports refused for {} at {}",
            self.peer_id,
            self.peer_ip
        );
        self.health.set_status(ConnectionStatus::Failed).await;
        self.inbox.close();
    }

    /// Runs the writer, reader and probe loops until the socket or the
    /// cancellation token ends the connection.
    async fn pump(
        self: Arc<Self>,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        mut outbound_rx: mpsc::Receiver<String>,
    ) {
        let (mut sink, mut source) = ws.split();

        let writer_cancel = self.cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                    frame = outbound_rx.recv() => match frame {
                        Some(text) => {
                            if sink.send(WsMessage::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let prober = {
            let conn = Arc::clone(&self);
            tokio::spawn(async move {
                let mut cadence =
                    tokio::time::interval(ConnectionKind::DirectStream.probe_cadence());
                cadence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                cadence.tick().await;
                loop {
                    tokio::select! {
                        _ = conn.cancel.cancelled() => break,
                        _ = cadence.tick() => {
                            let ping = Message::ping(&conn.local_id);
                            if conn.queue_frame(&ping).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = source.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.accept_frame(&text).await,
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }

        self.health.set_status(ConnectionStatus::Disconnected).await;
        self.inbox.close();
        self.cancel.cancel();
        prober.abort();
        let _ = writer.await;
    }

    async fn accept_frame(&self, text: &str) {
        let msg: Message = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("undecodable frame from {}: {e}", self.peer_id);
                return;
            }
        };

        match msg.kind.as_str() {
            KIND_PING => {
                let pong = Message::pong(&msg, &self.local_id);
                if self.queue_frame(&pong).await.is_err() {
                    log::debug!("pong to {} not queued", self.peer_id);
                }
            }
            KIND_PONG => {
                if let Some(ts) = msg.probe_timestamp() {
                    self.health.record_pong(ts).await;
                }
            }
            _ => self.inbox.push("direct-stream", msg),
        }
    }

    async fn queue_frame(&self, msg: &Message) -> TransportResult<()> {
        let text = serde_json::to_string(msg)?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| TransportError::SendFailed("stream writer gone".into()))
    }
}

#[async_trait]
impl Connection for DirectStreamConnection {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::DirectStream
    }

    async fn send(&self, msg: Message) -> TransportResult<()> {
        if self.health.status().await != ConnectionStatus::Connected {
            return Err(TransportError::NotConnected(self.peer_id.clone()));
        }
        self.queue_frame(&msg).await
    }

    fn take_incoming(&self) -> Option<mpsc::Receiver<Message>> {
        self.inbox.take()
    }

    async fn status(&self) -> ConnectionStatus {
        self.health.status().await
    }

    async fn quality(&self) -> u8 {
        self.health.quality().await
    }

    async fn latency(&self) -> Duration {
        self.health.latency().await
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.health.set_status(ConnectionStatus::Disconnected).await;
        self.inbox.close();
    }
}

// =============================================================================
// Tests
// =============================================================================
