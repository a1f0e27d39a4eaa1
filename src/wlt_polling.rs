//! Weft Layered Transport - HTTP Polling Connection
//!
//! Treats a reachable HTTP endpoint as a bidirectional channel:
//! - outbound messages POST to `<base>/send`
//! - inbound messages arrive by periodically GETting `<base>/history` with
//!   a monotone `since` cursor
//!
//! The endpoint is validated with a probe request before the connection
//! reports `Connected`. Five consecutive polling errors fail the
//! connection.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::wlt_netinfo::NetworkInfo;
use crate::wlt_transport::{
    latency_quality, unix_nanos, Connection, ConnectionFactory, ConnectionKind, ConnectionStatus,
    Inbox, LinkHealth, Message, TransportConfig, TransportError, TransportResult, KIND_CHAT,
    KIND_PING, KIND_PONG, PROBE_TS_KEY,
};

// =============================================================================
// Constants
// =============================================================================

/// Per-request timeout on the polling HTTP client.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive poll errors tolerated before the connection fails.
const MAX_POLL_ERRORS: u32 = 5;

/// Conventional port used when only the peer's IP is known.
const DEFAULT_HTTP_PORT: u16 = 8080;

/// Quality reported right after the probe succeeds, before any round trip.
const INITIAL_QUALITY: u8 = 60;

// =============================================================================
// Wire Types
// =============================================================================

/// One entry of the peer's `history` endpoint.
#[derive(Debug, Deserialize)]
struct HistoryEntry {
    peer_id: String,
    text: String,
    timestamp: i64,
}

// =============================================================================
// Factory
// =============================================================================

/// Creates HTTP polling connections.
pub struct HttpPollingFactory {
    client: reqwest::Client,
}

impl HttpPollingFactory {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpPollingFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionFactory for HttpPollingFactory {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::HttpPolling
    }

    fn priority(&self) -> u8 {
        ConnectionKind::HttpPolling.default_priority()
    }

    fn estimate_success(&self, _peer_id: &str, info: &NetworkInfo) -> u8 {
        if info.peer_http_url.as_deref().is_some_and(|u| !u.is_empty()) {
            90
        } else if info.peer_ip.as_deref().is_some_and(|ip| !ip.is_empty()) {
            75
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
        let base_url = match (&info.peer_http_url, &info.peer_ip) {
            (Some(url), _) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            (_, Some(ip)) if !ip.is_empty() => format!("http://{ip}:{DEFAULT_HTTP_PORT}"),
            _ => {
                return Err(TransportError::Fatal(
                    "peer HTTP URL or IP required for polling connection".into(),
                ))
            }
        };

        let room = config
            .poll_room
            .clone()
            .unwrap_or_else(|| format!("peer-{peer_id}"));

        let conn = Arc::new(HttpPollingConnection {
            peer_id: peer_id.to_string(),
            local_id: config.local_peer_id.clone(),
            base_url,
            room,
            client: self.client.clone(),
            poll_interval: config.poll_interval,
            health: LinkHealth::new(ConnectionKind::HttpPolling),
            inbox: Inbox::new(),
            cancel: cancel.child_token(),
            cursor: AtomicI64::new(0),
            poll_errors: AtomicU32::new(0),
        });

        tokio::spawn(Arc::clone(&conn).run());
        Ok(conn)
    }
}

// =============================================================================
// Connection
// =============================================================================

pub struct HttpPollingConnection {
    /// Remote peer this connection targets.
    peer_id: String,
    /// Our own peer id, used to skip echoes of our own posts.
    local_id: String,
    base_url: String,
    room: String,
    client: reqwest::Client,
    poll_interval: Duration,
    health: LinkHealth,
    inbox: Inbox,
    cancel: CancellationToken,
    /// Largest history timestamp seen; never decreases.
    cursor: AtomicI64,
    poll_errors: AtomicU32,
}

impl HttpPollingConnection {
    /// Current `since` cursor. Monotone over the connection's lifetime.
    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::Acquire)
    }

    async fn run(self: Arc<Self>) {
        if let Err(e) = self.probe_endpoint().await {
            log::warn!("polling probe for {} failed: {e}", self.peer_id);
            self.health.set_status(ConnectionStatus::Failed).await;
            self.inbox.close();
            return;
        }

        self.health.mark_connected(INITIAL_QUALITY).await;
        log::info!("polling connection to {} established via {}", self.peer_id, self.base_url);

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut probe = tokio::time::interval(ConnectionKind::HttpPolling.probe_cadence());
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        probe.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.health.set_status(ConnectionStatus::Disconnected).await;
                    break;
                }
                _ = poll.tick() => {
                    self.poll_once().await;
                    if self.health.status().await == ConnectionStatus::Failed {
                        break;
                    }
                }
                _ = probe.tick() => {
                    let ping = Message::ping(&self.local_id);
                    if let Err(e) = self.post_message(&ping).await {
                        log::debug!("polling ping to {} failed: {e}", self.peer_id);
                    }
                }
            }
        }
        self.inbox.close();
    }

    /// Validates the endpoint before the connection reports `Connected`.
    async fn probe_endpoint(&self) -> TransportResult<()> {
        let response = self
            .client
            .get(format!("{}/history", self.base_url))
            .query(&[("room", self.room.as_str()), ("since", "0")])
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Transient(format!(
                "unexpected status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn poll_once(&self) {
        let since = self.cursor.load(Ordering::Acquire);
        let since_param = since.to_string();
        let started = tokio::time::Instant::now();

        let result = self
            .client
            .get(format!("{}/history", self.base_url))
            .query(&[("room", self.room.as_str()), ("since", since_param.as_str())])
            .send()
            .await;

        let response = match result {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                self.record_poll_error(&format!("status {}", r.status())).await;
                return;
            }
            Err(e) => {
                self.record_poll_error(&e.to_string()).await;
                return;
            }
        };

        let entries: Vec<HistoryEntry> = match response.json().await {
            Ok(entries) => entries,
            Err(e) => {
                self.record_poll_error(&e.to_string()).await;
                return;
            }
        };

        self.poll_errors.store(0, Ordering::Release);
        self.health.set_latency(started.elapsed()).await;

        for entry in entries {
            if entry.timestamp <= since {
                continue;
            }
            self.cursor.fetch_max(entry.timestamp, Ordering::AcqRel);
            if entry.peer_id == self.local_id {
                // Our own posts come back through history; skip them.
                continue;
            }
            self.accept_entry(entry).await;
        }

        self.update_quality().await;
    }

    async fn accept_entry(&self, entry: HistoryEntry) {
        if let Some((kind, ts)) = parse_probe_text(&entry.text) {
            match kind {
                ProbeKind::Ping => {
                    let mut pong = Message::new(KIND_PONG, Bytes::new());
                    pong.from = self.local_id.clone();
                    pong.metadata.insert(PROBE_TS_KEY.into(), serde_json::json!(ts));
                    if let Err(e) = self.post_message(&pong).await {
                        log::debug!("polling pong to {} failed: {e}", self.peer_id);
                    }
                }
                ProbeKind::Pong => {
                    self.health.record_pong(ts).await;
                    self.update_quality().await;
                }
            }
            return;
        }

        let mut msg = Message::new(KIND_CHAT, Bytes::from(entry.text.into_bytes()));
        msg.from = entry.peer_id;
        msg.timestamp = entry.timestamp;
        self.inbox.push("http-polling", msg);
    }

    async fn record_poll_error(&self, reason: &str) {
        let errors = self.poll_errors.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("poll error {errors} for {}: {reason}", self.peer_id);
        self.update_quality().await;
        if errors >= MAX_POLL_ERRORS {
            log::warn!("{errors} consecutive poll errors for {}, giving up", self.peer_id);
            self.health.set_status(ConnectionStatus::Failed).await;
        }
    }

    /// Quality = latency table, raised or lowered by poll rate, minus 10
    /// per consecutive error.
    async fn update_quality(&self) {
        if self.health.status().await != ConnectionStatus::Connected {
            return;
        }
        let latency_ms = self.health.latency().await.as_millis();
        let mut quality = latency_quality(ConnectionKind::HttpPolling, latency_ms) as i32;

        let rate_ms = self.poll_interval.as_millis();
        if rate_ms <= 1000 {
            quality += 10;
        } else if rate_ms >= 5000 {
            quality -= 10;
        }

        quality -= 10 * self.poll_errors.load(Ordering::Acquire) as i32;
        self.health.set_quality(quality.clamp(0, 100) as u8).await;
    }

    async fn post_message(&self, msg: &Message) -> TransportResult<()> {
        let text = if msg.is_probe() {
            probe_text(msg)
        } else {
            String::from_utf8_lossy(&msg.payload).into_owned()
        };

        let body = serde_json::json!({
            "room": self.room,
            "peer_id": if msg.from.is_empty() { self.local_id.as_str() } else { msg.from.as_str() },
            "text": text,
        });

        let response = self
            .client
            .post(format!("{}/send", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::SendFailed(format!(
                "send returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for HttpPollingConnection {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::HttpPolling
    }

    async fn send(&self, msg: Message) -> TransportResult<()> {
        if self.health.status().await != ConnectionStatus::Connected {
            return Err(TransportError::NotConnected(self.peer_id.clone()));
        }
        self.post_message(&msg).await
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
// Probe Encoding
// =============================================================================

enum ProbeKind {
    Ping,
    Pong,
}

/// Probes ride the `send` endpoint encoded in the text field.
fn probe_text(msg: &Message) -> String {
    serde_json::json!({
        "type": msg.kind,
        PROBE_TS_KEY: msg.probe_timestamp().unwrap_or_else(unix_nanos),
    })
    .to_string()
}

fn parse_probe_text(text: &str) -> Option<(ProbeKind, i64)> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let ts = value.get(PROBE_TS_KEY)?.as_i64()?;
    match value.get("type")?.as_str()? {
        KIND_PING => Some((ProbeKind::Ping, ts)),
        KIND_PONG => Some((ProbeKind::Pong, ts)),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
