//! Weft Layered Transport - Core Abstractions
//!
//! Defines the contracts shared by every connection family:
//! - Message envelope carried by all transports
//! - Connection trait (send / incoming stream / status / quality / latency)
//! - Connection factory trait and the priority-ordered factory registry
//! - Liveness probe primitives (ping/pong) and per-kind quality tables
//! - Transport configuration and the shared error taxonomy

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::wlt_netinfo::NetworkInfo;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error)]
pub enum TransportError {
    /// A single attempt failed (one dial, one request). Retried internally,
    /// never surfaced past the owning connection.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("no route to peer: {0}")]
    NoRoute(String),

    #[error("not connected to peer: {0}")]
    NotConnected(String),

    #[error("already connecting to peer: {0}")]
    AlreadyConnecting(String),

    #[error("connection attempt timed out")]
    Timeout,

    /// Unrecoverable (port bind failure, bad credentials). The connection
    /// reaches `Failed` at construction.
    #[error("fatal transport failure: {0}")]
    Fatal(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

// =============================================================================
// Constants
// =============================================================================

/// Reserved message kinds.
pub const KIND_PING: &str = "ping";
pub const KIND_PONG: &str = "pong";
pub const KIND_CHAT: &str = "chat";
pub const KIND_SIGNAL: &str = "signal";
pub const KIND_DISCOVERY: &str = "discovery";

/// Metadata key carrying the nanosecond probe timestamp.
pub const PROBE_TS_KEY: &str = "ts";

/// Per-connection inbound queue depth.
pub const INBOUND_QUEUE: usize = 100;

/// Interval at which the supervisor polls a pending connection's status.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-rank delay before a lower-priority factory starts its attempt.
pub const STAGGER_STEP: Duration = Duration::from_millis(500);

/// Health monitor cadence.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Samples retained in the rolling latency/quality histories.
pub const HISTORY_DEPTH: usize = 10;

// =============================================================================
// Connection Kind & Status
// =============================================================================

/// The five connection families, ordered by descending default priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    MediaStun,
    MediaRelay,
    DirectStream,
    HttpPolling,
    LanBroadcast,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::MediaStun => "media-stun",
            ConnectionKind::MediaRelay => "media-relay",
            ConnectionKind::DirectStream => "direct-stream",
            ConnectionKind::HttpPolling => "http-polling",
            ConnectionKind::LanBroadcast => "lan-broadcast",
        }
    }

    /// Fixed registration priority for this family.
    pub fn default_priority(&self) -> u8 {
        match self {
            ConnectionKind::MediaStun => 100,
            ConnectionKind::MediaRelay => 80,
            ConnectionKind::DirectStream => 60,
            ConnectionKind::HttpPolling => 40,
            ConnectionKind::LanBroadcast => 20,
        }
    }

    /// Liveness probe cadence for this family.
    pub fn probe_cadence(&self) -> Duration {
        match self {
            ConnectionKind::MediaStun | ConnectionKind::DirectStream => Duration::from_secs(5),
            ConnectionKind::HttpPolling | ConnectionKind::LanBroadcast => Duration::from_secs(10),
            ConnectionKind::MediaRelay => Duration::from_secs(15),
        }
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection lifecycle. `Failed` is terminal; `Connecting` carries quality 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Disconnected | ConnectionStatus::Failed)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Message Envelope
// =============================================================================

/// Envelope carried by every transport. Value object, never mutated after
/// creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Bytes::is_empty")]
    pub payload: Bytes,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: i64,
}

impl Message {
    pub fn new(kind: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            from: String::new(),
            to: String::new(),
            kind: kind.into(),
            payload: payload.into(),
            metadata: HashMap::new(),
            timestamp: unix_seconds(),
        }
    }

    /// Liveness probe carrying the current nanosecond timestamp in metadata.
    pub fn ping(from: impl Into<String>) -> Self {
        let mut msg = Message::new(KIND_PING, Bytes::new());
        msg.from = from.into();
        msg.metadata
            .insert(PROBE_TS_KEY.to_string(), serde_json::json!(unix_nanos()));
        msg
    }

    /// Probe response echoing the ping's timestamp.
    pub fn pong(ping: &Message, from: impl Into<String>) -> Self {
        let mut msg = Message::new(KIND_PONG, Bytes::new());
        msg.from = from.into();
        msg.to = ping.from.clone();
        if let Some(ts) = ping.metadata.get(PROBE_TS_KEY) {
            msg.metadata.insert(PROBE_TS_KEY.to_string(), ts.clone());
        }
        msg
    }

    /// Nanosecond timestamp carried by a probe message, if present.
    pub fn probe_timestamp(&self) -> Option<i64> {
        self.metadata.get(PROBE_TS_KEY).and_then(|v| v.as_i64())
    }

    pub fn is_probe(&self) -> bool {
        self.kind == KIND_PING || self.kind == KIND_PONG
    }
}

/// Unix time in whole seconds.
pub fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Unix time in nanoseconds, used by the liveness probe.
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Relay server credentials for the relayed media family.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub password: String,
}

/// Options recognized by the transport stack. All fields have working
/// defaults; `max_retries`/`retry_delay` are accepted but not consulted by
/// the current arbitration algorithm.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// This node's own peer id, stamped on probes and used to ignore
    /// echoes of our own traffic.
    pub local_peer_id: String,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    pub direct_ports: Vec<u16>,
    pub poll_interval: Duration,
    /// Overrides the polling room; defaults to `peer-<peer_id>`.
    pub poll_room: Option<String>,
    pub lan_broadcast_port: u16,
    pub lan_listen_port: u16,
    pub connection_timeout: Duration,
    /// Signaling hub used to bootstrap media connections, e.g.
    /// `ws://host:port/ws`.
    pub signaling_url: Option<String>,
    /// Room joined on the signaling hub; defaults to a pair room derived
    /// from the two peer ids.
    pub signaling_room: Option<String>,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            local_peer_id: String::new(),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            direct_ports: vec![9000, 8080, 80, 443],
            poll_interval: Duration::from_secs(2),
            poll_room: None,
            lan_broadcast_port: 9999,
            lan_listen_port: 9998,
            connection_timeout: Duration::from_secs(30),
            signaling_url: None,
            signaling_room: None,
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

// =============================================================================
// Connection & Factory Contracts
// =============================================================================

/// A single connection to a peer. Implementations are safe for concurrent
/// calls from multiple tasks; `send` serializes internally. A terminal
/// status is published before the incoming stream ends.
#[async_trait]
pub trait Connection: Send + Sync {
    fn peer_id(&self) -> &str;

    fn kind(&self) -> ConnectionKind;

    async fn send(&self, msg: Message) -> TransportResult<()>;

    /// Takes the incoming message stream. Yields `None` after the first
    /// call; the stream is finite and closes once the connection reaches a
    /// terminal status.
    fn take_incoming(&self) -> Option<mpsc::Receiver<Message>>;

    async fn status(&self) -> ConnectionStatus;

    /// Quality score in `[0, 100]`; 0 while connecting.
    async fn quality(&self) -> u8;

    /// Duration of the last measured round trip; zero if never measured.
    async fn latency(&self) -> Duration;

    /// Idempotent. Releases sockets and closes the incoming stream.
    async fn close(&self);
}

/// Constructor for one connection family.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    fn kind(&self) -> ConnectionKind;

    fn can_create(&self, kind: ConnectionKind) -> bool {
        kind == self.kind()
    }

    /// Higher wins. Fixed per family, see [`ConnectionKind::default_priority`].
    fn priority(&self) -> u8;

    /// Self-reported probability (0-100) that `create` reaches `Connected`
    /// given the supplied network info.
    fn estimate_success(&self, peer_id: &str, info: &NetworkInfo) -> u8;

    /// Begins a connection attempt and returns a connection in
    /// `Connecting`. The attempt honors `cancel`; cancellation transitions
    /// the connection to `Disconnected`.
    async fn create(
        &self,
        cancel: CancellationToken,
        peer_id: &str,
        info: &NetworkInfo,
        config: &TransportConfig,
    ) -> TransportResult<Arc<dyn Connection>>;
}

// =============================================================================
// Factory Registry
// =============================================================================

/// Priority-ordered factory sequence. Registration is rare; queries are
/// snapshot reads.
pub struct FactoryRegistry {
    factories: RwLock<Vec<Arc<dyn ConnectionFactory>>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(Vec::new()),
        }
    }

    /// Inserts before the first factory of strictly lower priority, so
    /// equal priorities keep registration order.
    pub async fn register(&self, factory: Arc<dyn ConnectionFactory>) {
        let mut factories = self.factories.write().await;
        let pos = factories
            .iter()
            .position(|f| f.priority() < factory.priority())
            .unwrap_or(factories.len());
        log::info!(
            "registered {} factory (priority {})",
            factory.kind(),
            factory.priority()
        );
        factories.insert(pos, factory);
    }

    pub async fn snapshot(&self) -> Vec<Arc<dyn ConnectionFactory>> {
        self.factories.read().await.clone()
    }
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Link Health (shared status/quality/latency state)
// =============================================================================

/// Mutable health state embedded by every concrete connection. Carries the
/// per-kind latency-to-quality table so the probe loop stays identical
/// across families.
pub struct LinkHealth {
    kind: ConnectionKind,
    status: RwLock<ConnectionStatus>,
    quality: RwLock<u8>,
    latency: RwLock<Duration>,
}

impl LinkHealth {
    pub fn new(kind: ConnectionKind) -> Self {
        Self {
            kind,
            status: RwLock::new(ConnectionStatus::Connecting),
            quality: RwLock::new(0),
            latency: RwLock::new(Duration::ZERO),
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub async fn status(&self) -> ConnectionStatus {
        *self.status.read().await
    }

    pub async fn quality(&self) -> u8 {
        *self.quality.read().await
    }

    pub async fn latency(&self) -> Duration {
        *self.latency.read().await
    }

    /// Transitions status. `Failed` is terminal: once set, later transitions
    /// are ignored.
    pub async fn set_status(&self, next: ConnectionStatus) {
        let mut status = self.status.write().await;
        if *status == ConnectionStatus::Failed {
            return;
        }
        *status = next;
        if next == ConnectionStatus::Connecting {
            *self.quality.write().await = 0;
        }
    }

    pub async fn mark_connected(&self, initial_quality: u8) {
        self.set_status(ConnectionStatus::Connected).await;
        *self.quality.write().await = initial_quality;
    }

    pub async fn set_quality(&self, quality: u8) {
        *self.quality.write().await = quality.min(100);
    }

    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.write().await = latency;
    }

    /// Records a pong echoing `echoed_nanos`, updating latency and the
    /// table-derived quality.
    pub async fn record_pong(&self, echoed_nanos: i64) {
        let elapsed = unix_nanos().saturating_sub(echoed_nanos).max(0);
        let latency = Duration::from_nanos(elapsed as u64);
        *self.latency.write().await = latency;
        *self.quality.write().await = latency_quality(self.kind, latency.as_millis());
    }
}

/// Latency-to-quality mapping per connection family.
pub fn latency_quality(kind: ConnectionKind, latency_ms: u128) -> u8 {
    let table: [u8; 6] = match kind {
        ConnectionKind::MediaStun => [95, 95, 85, 70, 50, 20],
        ConnectionKind::MediaRelay => [80, 80, 70, 60, 40, 20],
        ConnectionKind::DirectStream => [90, 85, 75, 60, 40, 40],
        ConnectionKind::HttpPolling => [70, 70, 60, 60, 50, 30],
        ConnectionKind::LanBroadcast => [80, 80, 75, 65, 55, 40],
    };
    let idx = match latency_ms {
        0..=20 => 0,
        21..=50 => 1,
        51..=100 => 2,
        101..=200 => 3,
        201..=500 => 4,
        _ => 5,
    };
    table[idx]
}

// =============================================================================
// Inbox (bounded incoming queue)
// =============================================================================

/// Bounded queue between a connection's reader task and the manager's
/// message pump. A full queue drops the enqueue and logs; closing the inbox
/// ends the stream.
pub struct Inbox {
    tx: std::sync::Mutex<Option<mpsc::Sender<Message>>>,
    rx: std::sync::Mutex<Option<mpsc::Receiver<Message>>>,
}

impl Inbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            rx: std::sync::Mutex::new(Some(rx)),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Message>> {
        self.tx.lock().map(|g| g.clone()).unwrap_or(None)
    }

    pub fn push(&self, label: &str, msg: Message) {
        let Some(tx) = self.sender() else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(msg) {
            log::warn!("inbound queue full on {label}, dropping message");
        }
    }

    pub fn take(&self) -> Option<mpsc::Receiver<Message>> {
        self.rx.lock().ok().and_then(|mut g| g.take())
    }

    /// Drops the producer side so the stream terminates once drained.
    pub fn close(&self) {
        if let Ok(mut g) = self.tx.lock() {
            g.take();
        }
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
