//! Weft Layered Transport - LAN Broadcast Connection
//!
//! Last-resort transport for peers on the same segment: one UDP socket
//! listens on a fixed port and broadcasts outbound messages to the
//! broadcast address of every qualifying interface. A `discovery` beacon
//! goes out every 10 s; peers unseen for two minutes are evicted.
//!
//! Datagrams are single JSON envelopes and must stay under the usual MTU.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::wlt_netinfo::{broadcast_addresses, NetworkInfo, NetworkType};
use crate::wlt_transport::{
    latency_quality, Connection, ConnectionFactory, ConnectionKind, ConnectionStatus, Inbox,
    LinkHealth, Message, TransportConfig, TransportError, TransportResult, KIND_DISCOVERY,
    KIND_PING, KIND_PONG,
};

// =============================================================================
// Constants
// =============================================================================

/// Peers unseen for this long are dropped from the roster.
const PEER_TTL: Duration = Duration::from_secs(120);

/// Discovery beacon cadence.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// Largest datagram we are willing to emit.
const MAX_DATAGRAM: usize = 1400;

/// Quality reported right after the socket binds.
const INITIAL_QUALITY: u8 = 70;

// =============================================================================
// Wire Types
// =============================================================================

/// Single-datagram envelope.
#[derive(Debug, Serialize, Deserialize)]
struct BroadcastEnvelope {
    peer_id: String,
    message: Message,
}

#[derive(Clone, Debug)]
struct PeerSighting {
    addr: IpAddr,
    last_seen: Instant,
}

// =============================================================================
// Factory
// =============================================================================

/// Creates LAN broadcast connections.
pub struct LanBroadcastFactory;

#[async_trait]
impl ConnectionFactory for LanBroadcastFactory {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::LanBroadcast
    }

    fn priority(&self) -> u8 {
        ConnectionKind::LanBroadcast.default_priority()
    }

    fn estimate_success(&self, _peer_id: &str, info: &NetworkInfo) -> u8 {
        match info.network_type {
            NetworkType::Lan => 80,
            NetworkType::Wifi => 70,
            NetworkType::Internet => 0,
            NetworkType::Unknown => {
                if info.on_private_network() {
                    75
                } else {
                    50
                }
            }
        }
    }

    async fn create(
        &self,
        cancel: CancellationToken,
        peer_id: &str,
        _info: &NetworkInfo,
        config: &TransportConfig,
    ) -> TransportResult<Arc<dyn Connection>> {
        Ok(LanBroadcastConnection::bind(cancel, peer_id, config).await)
    }
}

// =============================================================================
// Connection
// =============================================================================

pub struct LanBroadcastConnection {
    peer_id: String,
    local_id: String,
    broadcast_port: u16,
    health: LinkHealth,
    inbox: Inbox,
    cancel: CancellationToken,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    /// Live peers on the segment, by peer id.
    peers: RwLock<HashMap<String, PeerSighting>>,
    packets_sent: AtomicU64,
    packets_recv: AtomicU64,
}

impl LanBroadcastConnection {
    /// Binds the listening socket and starts the read and beacon loops. A
    /// bind failure is fatal for this family: the connection is born
    /// `Failed` and the supervisor treats it as an ordinary failure.
    pub(crate) async fn bind(
        cancel: CancellationToken,
        peer_id: &str,
        config: &TransportConfig,
    ) -> Arc<Self> {
        let conn = Arc::new(LanBroadcastConnection {
            peer_id: peer_id.to_string(),
            local_id: config.local_peer_id.clone(),
            broadcast_port: config.lan_broadcast_port,
            health: LinkHealth::new(ConnectionKind::LanBroadcast),
            inbox: Inbox::new(),
            cancel: cancel.child_token(),
            socket: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            packets_sent: AtomicU64::new(0),
            packets_recv: AtomicU64::new(0),
        });

        match UdpSocket::bind(("0.0.0.0", config.lan_listen_port)).await {
            Ok(socket) => {
                if let Err(e) = socket.set_broadcast(true) {
                    log::warn!("LAN socket cannot broadcast: {e}");
                    conn.health.set_status(ConnectionStatus::Failed).await;
                    conn.inbox.close();
                    return conn;
                }
                log::info!(
                    "LAN broadcast listening on {}",
                    socket.local_addr().map(|a| a.to_string()).unwrap_or_default()
                );
                *conn.socket.write().await = Some(Arc::new(socket));
                conn.health.mark_connected(INITIAL_QUALITY).await;
                tokio::spawn(Arc::clone(&conn).run());
            }
            Err(e) => {
                log::warn!("LAN listen bind failed: {e}");
                conn.health.set_status(ConnectionStatus::Failed).await;
                conn.inbox.close();
            }
        }

        conn
    }

    /// Local port the socket actually bound, for callers that configured 0.
    pub async fn bound_port(&self) -> Option<u16> {
        let socket = self.socket.read().await;
        socket.as_ref().and_then(|s| s.local_addr().ok()).map(|a| a.port())
    }

    async fn run(self: Arc<Self>) {
        let socket = match self.socket.read().await.clone() {
            Some(s) => s,
            None => return,
        };

        let beaconer = {
            let conn = Arc::clone(&self);
            tokio::spawn(async move {
                let mut beacon = tokio::time::interval(DISCOVERY_INTERVAL);
                beacon.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = conn.cancel.cancelled() => break,
                        _ = beacon.tick() => {
                            conn.send_discovery().await;
                            conn.send_ping().await;
                            conn.update_quality().await;
                        }
                    }
                }
            })
        };

        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, src)) => self.accept_datagram(&buf[..n], src).await,
                    Err(e) => {
                        log::debug!("LAN read error: {e}");
                    }
                },
            }
        }

        beaconer.abort();
        self.health.set_status(ConnectionStatus::Disconnected).await;
        self.inbox.close();
    }

    async fn accept_datagram(&self, data: &[u8], src: SocketAddr) {
        let envelope: BroadcastEnvelope = match serde_json::from_slice(data) {
            Ok(env) => env,
            Err(e) => {
                log::debug!("undecodable LAN datagram from {src}: {e}");
                return;
            }
        };

        // Broadcasts loop back to us; drop our own.
        if envelope.peer_id == self.local_id {
            return;
        }

        self.packets_recv.fetch_add(1, Ordering::Relaxed);
        self.peers.write().await.insert(
            envelope.peer_id.clone(),
            PeerSighting {
                addr: src.ip(),
                last_seen: Instant::now(),
            },
        );

        let msg = envelope.message;
        match msg.kind.as_str() {
            KIND_PING => {
                // Unicast the pong back to where the ping came from.
                let pong = Message::pong(&msg, &self.local_id);
                if let Err(e) = self.send_unicast(&pong, src).await {
                    log::debug!("LAN pong to {src} failed: {e}");
                }
            }
            KIND_PONG => {
                if msg.to.is_empty() || msg.to == self.local_id {
                    if let Some(ts) = msg.probe_timestamp() {
                        self.health.record_pong(ts).await;
                    }
                }
            }
            KIND_DISCOVERY => {
                log::debug!("discovery beacon from {} at {src}", envelope.peer_id);
            }
            _ => {
                if msg.to.is_empty() || msg.to == self.local_id {
                    self.inbox.push("lan-broadcast", msg);
                }
            }
        }
    }

    async fn send_discovery(&self) {
        let mut discovery = Message::new(KIND_DISCOVERY, Bytes::from_static(b"ping"));
        discovery.from = self.local_id.clone();
        if let Err(e) = self.broadcast(&discovery).await {
            log::debug!("discovery broadcast failed: {e}");
        }
    }

    async fn send_ping(&self) {
        let ping = Message::ping(&self.local_id);
        if let Err(e) = self.broadcast(&ping).await {
            log::debug!("LAN ping failed: {e}");
        }
    }

    async fn broadcast(&self, msg: &Message) -> TransportResult<()> {
        let socket = self
            .socket
            .read()
            .await
            .clone()
            .ok_or_else(|| TransportError::NotConnected(self.peer_id.clone()))?;

        let data = encode_envelope(&self.local_id, msg)?;

        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        for addr in broadcast_addresses() {
            let target = SocketAddr::from((addr, self.broadcast_port));
            if let Err(e) = socket.send_to(&data, target).await {
                log::debug!("broadcast to {target} failed: {e}");
            }
        }
        Ok(())
    }

    async fn send_unicast(&self, msg: &Message, target: SocketAddr) -> TransportResult<()> {
        let socket = self
            .socket
            .read()
            .await
            .clone()
            .ok_or_else(|| TransportError::NotConnected(self.peer_id.clone()))?;
        let data = encode_envelope(&self.local_id, msg)?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        socket.send_to(&data, target).await?;
        Ok(())
    }

    /// Evicts stale peers, then recomputes quality from latency, roster
    /// size and the send/receive ratio.
    async fn update_quality(&self) {
        let active = {
            let mut peers = self.peers.write().await;
            evict_stale(&mut peers, Instant::now(), PEER_TTL);
            peers.len()
        };

        let latency_ms = self.health.latency().await.as_millis();
        let quality = compute_quality(
            latency_ms,
            active,
            self.packets_sent.load(Ordering::Relaxed),
            self.packets_recv.load(Ordering::Relaxed),
        );
        if self.health.status().await == ConnectionStatus::Connected {
            self.health.set_quality(quality).await;
        }
    }
}

fn encode_envelope(local_id: &str, msg: &Message) -> TransportResult<Vec<u8>> {
    let data = serde_json::to_vec(&BroadcastEnvelope {
        peer_id: local_id.to_string(),
        message: msg.clone(),
    })?;
    if data.len() > MAX_DATAGRAM {
        return Err(TransportError::SendFailed(format!(
            "datagram of {} bytes exceeds broadcast MTU",
            data.len()
        )));
    }
    Ok(data)
}

fn evict_stale(peers: &mut HashMap<String, PeerSighting>, now: Instant, ttl: Duration) {
    peers.retain(|peer_id, sighting| {
        let live = now.duration_since(sighting.last_seen) <= ttl;
        if !live {
            log::debug!("evicting silent LAN peer {peer_id}");
        }
        live
    });
}

/// Latency table adjusted by roster size and the send/receive ratio.
fn compute_quality(latency_ms: u128, active_peers: usize, sent: u64, recv: u64) -> u8 {
    let mut quality = latency_quality(ConnectionKind::LanBroadcast, latency_ms) as i32;

    if active_peers >= 4 {
        quality += 10;
    } else if active_peers == 0 {
        quality -= 20;
    }

    if sent > 0 && recv > 0 {
        let ratio = recv as f64 / sent as f64;
        if ratio < 0.5 {
            quality -= 20;
        } else if ratio > 0.8 {
            quality += 5;
        }
    }

    quality.clamp(0, 100) as u8
}

#[async_trait]
impl Connection for LanBroadcastConnection {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::LanBroadcast
    }

    async fn send(&self, msg: Message) -> TransportResult<()> {
        if self.health.status().await != ConnectionStatus::Connected {
            return Err(TransportError::NotConnected(self.peer_id.clone()));
        }
        self.broadcast(&msg).await
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
        self.socket.write().await.take();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    use crate::wlt_transport::KIND_CHAT;

    const WAIT: Duration = Duration::from_secs(5);

    async fn connect() -> (Arc<LanBroadcastConnection>, u16) {
        let config = TransportConfig {
            local_peer_id: "me".to_string(),
            lan_listen_port: 0,
            lan_broadcast_port: 0,
            ..Default::default()
        };
        let conn = LanBroadcastConnection::bind(CancellationToken::new(), "peer-b", &config).await;
        assert_eq!(conn.status().await, ConnectionStatus::Connected);
        let port = conn.bound_port().await.unwrap();
        (conn, port)
    }

    async fn fake_peer() -> UdpSocket {
        UdpSocket::bind(("127.0.0.1", 0)).await.unwrap()
    }

    fn datagram(peer_id: &str, msg: Message) -> Vec<u8> {
        serde_json::to_vec(&BroadcastEnvelope {
            peer_id: peer_id.to_string(),
            message: msg,
        })
        .unwrap()
    }

    #[test]
    fn success_estimates() {
        let mut info = NetworkInfo::default();
        assert_eq!(LanBroadcastFactory.estimate_success("p", &info), 50);
        info.local_ip = Some("192.168.1.4".into());
        assert_eq!(LanBroadcastFactory.estimate_success("p", &info), 75);
        info.network_type = NetworkType::Lan;
        assert_eq!(LanBroadcastFactory.estimate_success("p", &info), 80);
        info.network_type = NetworkType::Wifi;
        assert_eq!(LanBroadcastFactory.estimate_success("p", &info), 70);
        info.network_type = NetworkType::Internet;
        assert_eq!(LanBroadcastFactory.estimate_success("p", &info), 0);
    }

    #[test]
    fn quality_adjustments() {
        // Quiet segment: latency table minus the empty-roster penalty.
        assert_eq!(compute_quality(0, 0, 0, 0), 60);
        // Busy segment with four live peers.
        assert_eq!(compute_quality(0, 4, 0, 0), 90);
        // Heavy loss halves the score contribution.
        assert_eq!(compute_quality(0, 1, 10, 2), 60);
        // Healthy two-way traffic earns the small bonus.
        assert_eq!(compute_quality(0, 1, 10, 9), 85);
    }

    #[test]
    fn eviction_honors_ttl() {
        let mut peers = HashMap::new();
        let now = Instant::now() + Duration::from_secs(200);
        peers.insert(
            "old".to_string(),
            PeerSighting { addr: "127.0.0.1".parse().unwrap(), last_seen: now - Duration::from_secs(150) },
        );
        peers.insert(
            "fresh".to_string(),
            PeerSighting { addr: "127.0.0.1".parse().unwrap(), last_seen: now },
        );
        evict_stale(&mut peers, now, PEER_TTL);
        assert!(peers.contains_key("fresh"));
        assert!(!peers.contains_key("old"));
    }

    #[test]
    fn oversize_datagrams_are_refused() {
        let msg = Message::new(KIND_CHAT, Bytes::from(vec![b'x'; 2000]));
        assert!(matches!(
            encode_envelope("me", &msg),
            Err(TransportError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn delivers_foreign_datagrams_and_ignores_own() {
        let (conn, port) = connect().await;
        let mut incoming = conn.take_incoming().unwrap();
        let peer = fake_peer().await;

        // Our own peer id must be ignored.
        let mut own = Message::new(KIND_CHAT, Bytes::from_static(b"self"));
        own.from = "me".into();
        peer.send_to(&datagram("me", own), ("127.0.0.1", port)).await.unwrap();

        let mut other = Message::new(KIND_CHAT, Bytes::from_static(b"hello"));
        other.from = "peer-b".into();
        peer.send_to(&datagram("peer-b", other), ("127.0.0.1", port)).await.unwrap();

        let got = timeout(WAIT, incoming.recv()).await.unwrap().unwrap();
        assert_eq!(got.payload.as_ref(), b"hello");
        conn.close().await;
    }

    #[tokio::test]
    async fn pings_are_answered_with_unicast_pongs() {
        let (conn, port) = connect().await;
        let peer = fake_peer().await;

        let ping = Message::ping("peer-b");
        let ts = ping.probe_timestamp().unwrap();
        peer.send_to(&datagram("peer-b", ping), ("127.0.0.1", port)).await.unwrap();

        let mut buf = [0u8; 4096];
        let (n, _) = timeout(WAIT, peer.recv_from(&mut buf)).await.unwrap().unwrap();
        let envelope: BroadcastEnvelope = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(envelope.peer_id, "me");
        assert_eq!(envelope.message.kind, KIND_PONG);
        assert_eq!(envelope.message.probe_timestamp(), Some(ts));
        conn.close().await;
    }

    #[tokio::test]
    async fn pong_updates_latency() {
        let (conn, port) = connect().await;
        let peer = fake_peer().await;

        let mut pong = Message::new(KIND_PONG, Bytes::new());
        pong.from = "peer-b".into();
        pong.to = "me".into();
        pong.metadata.insert(
            crate::wlt_transport::PROBE_TS_KEY.into(),
            serde_json::json!(
                crate::wlt_transport::unix_nanos() - Duration::from_millis(40).as_nanos() as i64
            ),
        );
        peer.send_to(&datagram("peer-b", pong), ("127.0.0.1", port)).await.unwrap();

        timeout(WAIT, async {
            while conn.latency().await == Duration::ZERO {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(conn.latency().await >= Duration::from_millis(40));
        conn.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_stream() {
        let (conn, _port) = connect().await;
        let mut incoming = conn.take_incoming().unwrap();
        conn.close().await;
        conn.close().await;
        assert_eq!(conn.status().await, ConnectionStatus::Disconnected);
        assert!(timeout(WAIT, incoming.recv()).await.unwrap().is_none());
        let mut msg = Message::new(KIND_CHAT, Bytes::from_static(b"x"));
        msg.from = "me".into();
        assert!(conn.send(msg).await.is_err());
    }
}
