//! Weft Layered Transport - Signaling Relay
//!
//! Room-scoped fan-out of opaque control envelopes between peers:
//! - WebSocket hub with per-client reader/writer tasks
//! - Join notifications to pre-existing members
//! - Targeted unicast and sender-excluding broadcast
//! - Envelope persistence to the message log before fan-out
//!
//! The hub never interprets envelope payloads; media connections use it to
//! exchange offers, answers and ICE candidates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async, connect_async};
use tokio_util::sync::CancellationToken;

use crate::wlt_storage::MessageStore;
use crate::wlt_transport::KIND_SIGNAL;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("hub closed")]
    HubClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type SignalResult<T> = Result<T, SignalError>;

// =============================================================================
// Constants
// =============================================================================

/// Per-client outbound queue depth. Overflow on a broadcast path
/// disconnects the slow client; overflow on a targeted path drops the
/// envelope.
pub const OUTBOUND_QUEUE: usize = 256;

/// Low-level keepalive cadence on idle hub connections.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Notification kind emitted by the hub itself.
pub const KIND_PEER_JOINED: &str = "peer_joined";

// =============================================================================
// Wire Types
// =============================================================================

/// Control envelope relayed between peers. `payload` is opaque to the hub.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: String,
}

/// Everything a signaling client can receive.
#[derive(Clone, Debug, PartialEq)]
pub enum SignalEvent {
    /// Hub notification that a new peer joined the room.
    PeerJoined { peer_id: String, room: String },
    /// A relayed envelope from another peer.
    Envelope(SignalEnvelope),
}

impl SignalEvent {
    /// Parses a raw text frame from the hub.
    pub fn parse(raw: &str) -> SignalResult<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if value.get("type").and_then(|v| v.as_str()) == Some(KIND_PEER_JOINED) {
            return Ok(SignalEvent::PeerJoined {
                peer_id: value
                    .get("peer_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                room: value
                    .get("room")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(SignalEvent::Envelope(serde_json::from_value(value)?))
    }
}

// =============================================================================
// Hub
// =============================================================================

#[derive(Clone)]
struct ClientHandle {
    tx: mpsc::Sender<String>,
}

/// Room-scoped relay hub. A room exists exactly while it has members.
pub struct SignalHub {
    rooms: RwLock<HashMap<String, HashMap<String, ClientHandle>>>,
    store: Option<MessageStore>,
}

impl SignalHub {
    pub fn new(store: Option<MessageStore>) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            store,
        })
    }

    /// Accept loop. Runs until `cancel` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        log::info!(
            "signaling hub listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".into())
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("signaling connection from {addr}");
                        let hub = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = hub.handle_socket(stream).await {
                                log::debug!("signaling client from {addr} ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("signaling accept error: {e}");
                    }
                },
            }
        }
        log::info!("signaling hub stopped");
    }

    async fn handle_socket(self: Arc<Self>, stream: TcpStream) -> SignalResult<()> {
        let mut params: Option<(String, String)> = None;
        let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
            match parse_upgrade_query(req.uri().query()) {
                Some(p) => {
                    params = Some(p);
                    Ok(resp)
                }
                None => {
                    let mut reject =
                        ErrorResponse::new(Some("room and peer_id parameters are required".into()));
                    *reject.status_mut() = StatusCode::BAD_REQUEST;
                    Err(reject)
                }
            }
        })
        .await
        .map_err(|e| SignalError::HandshakeFailed(e.to_string()))?;

        let (room, peer_id) = params.ok_or_else(|| {
            SignalError::HandshakeFailed("upgrade callback did not run".to_string())
        })?;

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.register(&room, &peer_id, ClientHandle { tx }).await;

        let (sink, mut source) = ws.split();
        let writer = tokio::spawn(write_pump(sink, rx));

        while let Some(frame) = source.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => self.relay(&room, &peer_id, text).await,
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }

        self.unregister(&room, &peer_id).await;
        writer.abort();
        Ok(())
    }

    /// Adds the client and notifies every pre-existing member. The joining
    /// peer learns about the others from their responses, not from the hub.
    async fn register(&self, room: &str, peer_id: &str, handle: ClientHandle) {
        let notification = serde_json::json!({
            "type": KIND_PEER_JOINED,
            "peer_id": peer_id,
            "room": room,
        })
        .to_string();

        let existing: Vec<(String, ClientHandle)> = {
            let mut rooms = self.rooms.write().await;
            let members = rooms.entry(room.to_string()).or_default();
            let existing = members
                .iter()
                .filter(|(id, _)| id.as_str() != peer_id)
                .map(|(id, h)| (id.clone(), h.clone()))
                .collect();
            members.insert(peer_id.to_string(), handle);
            existing
        };

        log::info!("peer {peer_id} joined room {room} ({} present)", existing.len());
        for (member, handle) in existing {
            if handle.tx.try_send(notification.clone()).is_err() {
                log::warn!("join notification to {member} dropped");
            }
        }
    }

    async fn unregister(&self, room: &str, peer_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            if members.remove(peer_id).is_some() {
                log::info!("peer {peer_id} left room {room}");
            }
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Persists the raw envelope, then unicasts or fans out.
    async fn relay(&self, room: &str, sender: &str, raw: String) {
        let envelope: SignalEnvelope = match serde_json::from_str(&raw) {
            Ok(env) => env,
            Err(e) => {
                log::warn!("invalid signal json from {sender}: {e}");
                return;
            }
        };

        if let Some(store) = &self.store {
            if let Err(e) = store
                .append(room, sender, KIND_SIGNAL, raw.as_bytes(), None)
                .await
            {
                log::warn!("failed to persist signaling envelope: {e}");
            }
        }

        match envelope.target_peer_id.as_deref() {
            Some(target) => {
                let handle = {
                    let rooms = self.rooms.read().await;
                    rooms.get(room).and_then(|m| m.get(target)).cloned()
                };
                match handle {
                    Some(handle) => {
                        if handle.tx.try_send(raw).is_err() {
                            log::warn!("send buffer full for {target}, dropping targeted envelope");
                        }
                    }
                    None => log::debug!("targeted envelope for absent peer {target} in {room}"),
                }
            }
            None => {
                let members: Vec<(String, ClientHandle)> = {
                    let rooms = self.rooms.read().await;
                    rooms
                        .get(room)
                        .map(|m| {
                            m.iter()
                                .filter(|(id, _)| id.as_str() != sender)
                                .map(|(id, h)| (id.clone(), h.clone()))
                                .collect()
                        })
                        .unwrap_or_default()
                };
                for (member, handle) in members {
                    if handle.tx.try_send(raw.clone()).is_err() {
                        log::warn!("send buffer full, dropping client {member} in room {room}");
                        self.unregister(room, &member).await;
                    }
                }
            }
        }
    }

    /// Number of members currently in `room`; 0 when the room is gone.
    pub async fn room_size(&self, room: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

/// Drains a client's outbound queue onto its socket, interleaving protocol
/// keepalives. Channel closure (client removed from its room) closes the
/// socket.
async fn write_pump(
    mut sink: futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<TcpStream>,
        WsMessage,
    >,
    mut rx: mpsc::Receiver<String>,
) {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await;
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(text) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            _ = keepalive.tick() => {
                if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn parse_upgrade_query(query: Option<&str>) -> Option<(String, String)> {
    let query = query?;
    let mut room = None;
    let mut peer_id = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("room", v)) if !v.is_empty() => room = Some(v.to_string()),
            Some(("peer_id", v)) if !v.is_empty() => peer_id = Some(v.to_string()),
            _ => {}
        }
    }
    Some((room?, peer_id?))
}

// =============================================================================
// Client
// =============================================================================

/// Client side of the hub protocol. Incoming events arrive on the receiver
/// returned by [`SignalClient::connect`]; the stream ends when the hub or
/// the connection goes away.
pub struct SignalClient {
    peer_id: String,
    outbound: mpsc::Sender<SignalEnvelope>,
    cancel: CancellationToken,
}

impl SignalClient {
    /// Connects and joins `room` as `peer_id`.
    pub async fn connect(
        url: &str,
        room: &str,
        peer_id: &str,
    ) -> SignalResult<(Self, mpsc::Receiver<SignalEvent>)> {
        let endpoint = format!("{url}?room={room}&peer_id={peer_id}");
        let (ws, _) = connect_async(&endpoint)
            .await
            .map_err(|e| SignalError::HandshakeFailed(e.to_string()))?;
        log::debug!("signaling client {peer_id} joined {room} via {url}");

        let (mut sink, mut source) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<SignalEnvelope>(OUTBOUND_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let cancel = CancellationToken::new();

        let write_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_cancel.cancelled() => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                    item = outbound_rx.recv() => match item {
                        Some(envelope) => {
                            let text = match serde_json::to_string(&envelope) {
                                Ok(t) => t,
                                Err(e) => {
                                    log::warn!("unencodable signal envelope: {e}");
                                    continue;
                                }
                            };
                            if sink.send(WsMessage::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let read_cancel = cancel.clone();
        let client_id = peer_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = read_cancel.cancelled() => break,
                    frame = source.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => match SignalEvent::parse(&text) {
                            Ok(event) => {
                                if events_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("bad frame from hub for {client_id}: {e}"),
                        },
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                }
            }
        });

        Ok((
            Self {
                peer_id: peer_id.to_string(),
                outbound,
                cancel,
            },
            events_rx,
        ))
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn send(&self, envelope: SignalEnvelope) -> SignalResult<()> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| SignalError::HubClosed)
    }

    /// Sends a targeted envelope to one peer in the room.
    pub async fn send_to(
        &self,
        target: &str,
        kind: impl Into<String>,
        payload: impl Into<String>,
    ) -> SignalResult<()> {
        self.send(SignalEnvelope {
            peer_id: self.peer_id.clone(),
            target_peer_id: Some(target.to_string()),
            kind: kind.into(),
            payload: payload.into(),
        })
        .await
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SignalClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(300);

    async fn start_hub(store: Option<MessageStore>) -> (Arc<SignalHub>, String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let hub = SignalHub::new(store);
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&hub).serve(listener, cancel.clone()));
        (hub, url, cancel)
    }

    async fn expect_event(rx: &mut mpsc::Receiver<SignalEvent>) -> SignalEvent {
        timeout(WAIT, rx.recv()).await.expect("event").expect("open stream")
    }

    async fn expect_quiet(rx: &mut mpsc::Receiver<SignalEvent>) {
        if let Ok(Some(event)) = timeout(QUIET, rx.recv()).await {
            panic!("expected no event, got {event:?}");
        }
    }

    #[tokio::test]
    async fn targeted_relay_reaches_only_target() {
        let (_hub, url, _cancel) = start_hub(None).await;
        let (a, mut a_rx) = SignalClient::connect(&url, "room", "a").await.unwrap();
        let (_b, mut b_rx) = SignalClient::connect(&url, "room", "b").await.unwrap();

        // A learns about B joining.
        assert_eq!(
            expect_event(&mut a_rx).await,
            SignalEvent::PeerJoined { peer_id: "b".into(), room: "room".into() }
        );

        let (_c, mut c_rx) = SignalClient::connect(&url, "room", "c").await.unwrap();
        // C's join notifies A and B, never C itself.
        assert_eq!(
            expect_event(&mut a_rx).await,
            SignalEvent::PeerJoined { peer_id: "c".into(), room: "room".into() }
        );
        assert_eq!(
            expect_event(&mut b_rx).await,
            SignalEvent::PeerJoined { peer_id: "c".into(), room: "room".into() }
        );

        a.send_to("b", "offer", "sdp-blob").await.unwrap();

        match expect_event(&mut b_rx).await {
            SignalEvent::Envelope(env) => {
                assert_eq!(env.peer_id, "a");
                assert_eq!(env.kind, "offer");
                assert_eq!(env.payload, "sdp-blob");
            }
            other => panic!("expected envelope, got {other:?}"),
        }
        expect_quiet(&mut c_rx).await;
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let (_hub, url, _cancel) = start_hub(None).await;
        let (a, mut a_rx) = SignalClient::connect(&url, "room", "a").await.unwrap();
        let (_b, mut b_rx) = SignalClient::connect(&url, "room", "b").await.unwrap();
        let (_c, mut c_rx) = SignalClient::connect(&url, "room", "c").await.unwrap();

        // Drain join notifications before the broadcast.
        expect_event(&mut a_rx).await;
        expect_event(&mut a_rx).await;
        expect_event(&mut b_rx).await;

        a.send(SignalEnvelope {
            peer_id: "a".into(),
            target_peer_id: None,
            kind: "hello".into(),
            payload: String::new(),
        })
        .await
        .unwrap();

        for rx in [&mut b_rx, &mut c_rx] {
            match expect_event(rx).await {
                SignalEvent::Envelope(env) => assert_eq!(env.kind, "hello"),
                other => panic!("expected envelope, got {other:?}"),
            }
        }
        expect_quiet(&mut a_rx).await;
    }

    #[tokio::test]
    async fn upgrade_requires_room_and_peer_id() {
        let (_hub, url, _cancel) = start_hub(None).await;
        assert!(connect_async(&url).await.is_err());
        assert!(connect_async(&format!("{url}?room=only")).await.is_err());
        assert!(connect_async(&format!("{url}?room=r&peer_id=p")).await.is_ok());
    }

    #[tokio::test]
    async fn envelopes_are_persisted_before_fanout() {
        let store = MessageStore::open_in_memory().await.unwrap();
        let (_hub, url, _cancel) = start_hub(Some(store.clone())).await;
        let (a, mut a_rx) = SignalClient::connect(&url, "room", "a").await.unwrap();
        let (_b, mut b_rx) = SignalClient::connect(&url, "room", "b").await.unwrap();

        // B's join notification doubles as proof that B is registered.
        expect_event(&mut a_rx).await;
        a.send_to("b", "offer", "x").await.unwrap();
        expect_event(&mut b_rx).await;

        let entries = store.read("room", KIND_SIGNAL, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].peer_id, "a");
        let env: SignalEnvelope = serde_json::from_slice(&entries[0].payload).unwrap();
        assert_eq!(env.kind, "offer");
    }

    #[tokio::test]
    async fn room_exists_only_while_populated() {
        let (hub, url, _cancel) = start_hub(None).await;
        assert_eq!(hub.room_size("room").await, 0);
        let (a, _a_rx) = SignalClient::connect(&url, "room", "a").await.unwrap();

        timeout(WAIT, async {
            while hub.room_size("room").await != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        a.close();
        timeout(WAIT, async {
            while hub.room_size("room").await != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn upgrade_query_parsing() {
        assert_eq!(
            parse_upgrade_query(Some("room=r&peer_id=p")),
            Some(("r".into(), "p".into()))
        );
        assert_eq!(
            parse_upgrade_query(Some("peer_id=p&room=r&extra=1")),
            Some(("r".into(), "p".into()))
        );
        assert_eq!(parse_upgrade_query(Some("room=r")), None);
        assert_eq!(parse_upgrade_query(Some("room=&peer_id=p")), None);
        assert_eq!(parse_upgrade_query(None), None);
    }
}
