//! Weft Layered Transport - Media Channel Connections
//!
//! The two highest-priority families ride WebRTC data channels:
//! - `media-stun` negotiates a direct channel using unrelayed rendezvous
//!   servers only
//! - `media-relay` routes through credentialed relay servers, trading
//!   initial quality for reachability on hostile NATs
//!
//! Offer/answer exchange goes through the signaling hub. The peer with the
//! lexicographically smaller id initiates; descriptions are sent after ICE
//! gathering completes so a single envelope carries the full candidate set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::wlt_netinfo::{NatType, NetworkInfo};
use crate::wlt_signaling::{SignalClient, SignalEnvelope, SignalEvent};
use crate::wlt_transport::{
    Connection, ConnectionFactory, ConnectionKind, ConnectionStatus, Inbox, LinkHealth, Message,
    TransportConfig, TransportError, TransportResult, KIND_PING, KIND_PONG,
};

// =============================================================================
// Constants
// =============================================================================

/// Label of the single data channel both families use.
const DATA_CHANNEL_LABEL: &str = "data";

/// Signaling envelope kinds used during negotiation.
const SIGNAL_OFFER: &str = "offer";
const SIGNAL_ANSWER: &str = "answer";
const SIGNAL_ICE: &str = "ice";

/// Quality reported on `Connected`, before any round trip.
const STUN_INITIAL_QUALITY: u8 = 90;
const RELAY_INITIAL_QUALITY: u8 = 75;

// =============================================================================
// Factories
// =============================================================================

/// Creates direct media channels bootstrapped by unrelayed rendezvous
/// servers.
pub struct MediaStunFactory {
    stun_servers: Vec<String>,
}

impl MediaStunFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

#[async_trait]
impl ConnectionFactory for MediaStunFactory {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::MediaStun
    }

    fn priority(&self) -> u8 {
        ConnectionKind::MediaStun.default_priority()
    }

    fn estimate_success(&self, _peer_id: &str, info: &NetworkInfo) -> u8 {
        match info.nat_type {
            NatType::Open => 95,
            NatType::Cone => 85,
            NatType::Symmetric => 40,
            NatType::Blocked => 10,
            NatType::Unknown => 70,
        }
    }

    async fn create(
        &self,
        cancel: CancellationToken,
        peer_id: &str,
        _info: &NetworkInfo,
        config: &TransportConfig,
    ) -> TransportResult<Arc<dyn Connection>> {
        let ice_servers = if self.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }]
        };
        let conn = MediaConnection::dial(
            ConnectionKind::MediaStun,
            ice_servers,
            STUN_INITIAL_QUALITY,
            cancel,
            peer_id,
            config,
        )
        .await?;
        Ok(conn)
    }
}

/// Creates relayed media channels using credentialed relay servers.
pub struct MediaRelayFactory {
    turn_servers: Vec<crate::wlt_transport::TurnServer>,
}

impl MediaRelayFactory {
    pub fn new(turn_servers: Vec<crate::wlt_transport::TurnServer>) -> Self {
        Self { turn_servers }
    }
}

#[async_trait]
impl ConnectionFactory for MediaRelayFactory {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::MediaRelay
    }

    fn priority(&self) -> u8 {
        ConnectionKind::MediaRelay.default_priority()
    }

    fn estimate_success(&self, _peer_id: &str, info: &NetworkInfo) -> u8 {
        // Relay allocation is exactly what symmetric NAT needs, so it
        // ranks above cone here.
        match info.nat_type {
            NatType::Open => 85,
            NatType::Cone => 90,
            NatType::Symmetric => 95,
            NatType::Blocked => 85,
            NatType::Unknown => 90,
        }
    }

    async fn create(
        &self,
        cancel: CancellationToken,
        peer_id: &str,
        _info: &NetworkInfo,
        config: &TransportConfig,
    ) -> TransportResult<Arc<dyn Connection>> {
        let ice_servers = self
            .turn_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: vec![server.url.clone()],
                username: server.username.clone(),
                credential: server.password.clone(),
                ..Default::default()
            })
            .collect();
        let conn = MediaConnection::dial(
            ConnectionKind::MediaRelay,
            ice_servers,
            RELAY_INITIAL_QUALITY,
            cancel,
            peer_id,
            config,
        )
        .await?;
        Ok(conn)
    }
}

// =============================================================================
// Connection
// =============================================================================

pub struct MediaConnection {
    peer_id: String,
    local_id: String,
    kind: ConnectionKind,
    health: Arc<LinkHealth>,
    inbox: Arc<Inbox>,
    cancel: CancellationToken,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
}

impl MediaConnection {
    async fn dial(
        kind: ConnectionKind,
        ice_servers: Vec<RTCIceServer>,
        initial_quality: u8,
        cancel: CancellationToken,
        peer_id: &str,
        config: &TransportConfig,
    ) -> TransportResult<Arc<Self>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Fatal(e.to_string()))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::Fatal(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| TransportError::Fatal(e.to_string()))?,
        );

        let conn = Arc::new(Self {
            peer_id: peer_id.to_string(),
            local_id: config.local_peer_id.clone(),
            kind,
            health: Arc::new(LinkHealth::new(kind)),
            inbox: Arc::new(Inbox::new()),
            cancel: cancel.child_token(),
            pc,
            channel: Arc::new(RwLock::new(None)),
        });

        Arc::clone(&conn).install_state_handlers(initial_quality);

        // The smaller peer id owns the channel and the offer; the other
        // side answers and adopts the announced channel.
        if conn.local_id < conn.peer_id {
            let dc = conn
                .pc
                .create_data_channel(DATA_CHANNEL_LABEL, None)
                .await
                .map_err(|e| TransportError::Fatal(e.to_string()))?;
            Arc::clone(&conn).adopt_channel(dc).await;
        }

        match &config.signaling_url {
            Some(url) => {
                let room = config
                    .signaling_room
                    .clone()
                    .unwrap_or_else(|| pair_room(&conn.local_id, &conn.peer_id));
                tokio::spawn(Arc::clone(&conn).negotiate(url.clone(), room));
            }
            None => {
                log::debug!(
                    "no signaling hub configured; {kind} to {peer_id} cannot negotiate"
                );
            }
        }

        Ok(conn)
    }

    fn install_state_handlers(self: Arc<Self>, initial_quality: u8) {
        let health = Arc::clone(&self.health);
        let inbox = Arc::clone(&self.inbox);
        let peer_id = self.peer_id.clone();
        let kind = self.kind;
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let health = Arc::clone(&health);
                let inbox = Arc::clone(&inbox);
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Connected => {
                            log::info!("{kind} channel to {peer_id} established");
                            health.mark_connected(initial_quality).await;
                        }
                        RTCPeerConnectionState::Disconnected => {
                            health.set_status(ConnectionStatus::Disconnected).await;
                        }
                        RTCPeerConnectionState::Failed => {
                            health.set_status(ConnectionStatus::Failed).await;
                            inbox.close();
                        }
                        RTCPeerConnectionState::Closed => {
                            health.set_status(ConnectionStatus::Disconnected).await;
                            inbox.close();
                        }
                        _ => {}
                    }
                })
            }));

        let conn = Arc::clone(&self);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let conn = Arc::clone(&conn);
                Box::pin(async move {
                    log::debug!("data channel '{}' announced by {}", dc.label(), conn.peer_id);
                    conn.adopt_channel(dc).await;
                })
            }));
    }

    /// Wires message and probe handling onto a channel and makes it the
    /// send path.
    async fn adopt_channel(self: Arc<Self>, dc: Arc<RTCDataChannel>) {
        {
            let weak = Arc::downgrade(&self);
            let dc_open = Arc::clone(&dc);
            dc.on_open(Box::new(move || {
                let weak = weak.clone();
                let dc_open = Arc::clone(&dc_open);
                Box::pin(async move {
                    log::debug!("data channel '{}' open", dc_open.label());
                    if let Some(conn) = weak.upgrade() {
                        tokio::spawn(conn.probe_loop(dc_open));
                    }
                })
            }));
        }

        {
            let weak = Arc::downgrade(&self);
            dc.on_message(Box::new(move |frame: DataChannelMessage| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(conn) = weak.upgrade() else {
                        return;
                    };
                    conn.accept_frame(&frame.data).await;
                })
            }));
        }

        *self.channel.write().await = Some(dc);
    }

    /// Periodic ping over the data channel, for as long as both the
    /// channel and the connection live.
    async fn probe_loop(self: Arc<Self>, dc: Arc<RTCDataChannel>) {
        let mut cadence = tokio::time::interval(self.kind.probe_cadence());
        cadence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        cadence.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = cadence.tick() => {
                    let ping = Message::ping(&self.local_id);
                    if self.send_on(&dc, &ping).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn accept_frame(&self, data: &[u8]) {
        let msg: Message = match serde_json::from_slice(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("undecodable media frame from {}: {e}", self.peer_id);
                return;
            }
        };

        match msg.kind.as_str() {
            KIND_PING => {
                let pong = Message::pong(&msg, &self.local_id);
                let channel = self.channel.read().await.clone();
                if let Some(dc) = channel {
                    if let Err(e) = self.send_on(&dc, &pong).await {
                        log::debug!("media pong to {} failed: {e}", self.peer_id);
                    }
                }
            }
            KIND_PONG => {
                if let Some(ts) = msg.probe_timestamp() {
                    self.health.record_pong(ts).await;
                }
            }
            _ => self.inbox.push(self.kind.as_str(), msg),
        }
    }

    async fn send_on(&self, dc: &Arc<RTCDataChannel>, msg: &Message) -> TransportResult<()> {
        let data = serde_json::to_vec(msg)?;
        dc.send(&Bytes::from(data))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Negotiation
    // -------------------------------------------------------------------------

    async fn negotiate(self: Arc<Self>, url: String, room: String) {
        let (client, mut events) = match SignalClient::connect(&url, &room, &self.local_id).await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("signaling hub unreachable for {}: {e}", self.peer_id);
                self.health.set_status(ConnectionStatus::Failed).await;
                self.inbox.close();
                return;
            }
        };

        let initiator = self.local_id < self.peer_id;
        if initiator {
            if let Err(e) = self.send_description(&client, SIGNAL_OFFER).await {
                log::warn!("initial offer to {} failed: {e}", self.peer_id);
            }
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    None => break,
                    Some(SignalEvent::PeerJoined { peer_id, .. }) => {
                        // The peer came online after our first offer went
                        // nowhere; repeat it.
                        if initiator && peer_id == self.peer_id {
                            if let Err(e) = self.send_description(&client, SIGNAL_OFFER).await {
                                log::warn!("re-offer to {} failed: {e}", self.peer_id);
                            }
                        }
                    }
                    Some(SignalEvent::Envelope(env)) => {
                        if env.peer_id != self.peer_id {
                            continue;
                        }
                        if let Err(e) = self.handle_signal(&client, env).await {
                            log::warn!("negotiation with {} failed: {e}", self.peer_id);
                        }
                    }
                },
            }
        }
        client.close();
    }

    /// Creates and publishes our description with the complete candidate
    /// set (ICE gathering finishes before the envelope leaves).
    async fn send_description(&self, client: &SignalClient, which: &str) -> TransportResult<()> {
        let description = match which {
            SIGNAL_OFFER => self
                .pc
                .create_offer(None)
                .await
                .map_err(|e| TransportError::Transient(e.to_string()))?,
            _ => self
                .pc
                .create_answer(None)
                .await
                .map_err(|e| TransportError::Transient(e.to_string()))?,
        };

        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        let _ = gathered.recv().await;

        let sdp = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Transient("no local description".into()))?
            .sdp;

        client
            .send_to(&self.peer_id, which, sdp)
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))
    }

    async fn handle_signal(
        &self,
        client: &SignalClient,
        envelope: SignalEnvelope,
    ) -> TransportResult<()> {
        match envelope.kind.as_str() {
            SIGNAL_OFFER => {
                let offer = RTCSessionDescription::offer(envelope.payload)
                    .map_err(|e| TransportError::Transient(e.to_string()))?;
                self.pc
                    .set_remote_description(offer)
                    .await
                    .map_err(|e| TransportError::Transient(e.to_string()))?;
                self.send_description(client, SIGNAL_ANSWER).await
            }
            SIGNAL_ANSWER => {
                let answer = RTCSessionDescription::answer(envelope.payload)
                    .map_err(|e| TransportError::Transient(e.to_string()))?;
                self.pc
                    .set_remote_description(answer)
                    .await
                    .map_err(|e| TransportError::Transient(e.to_string()))
            }
            SIGNAL_ICE => {
                // Tolerated for peers that trickle; our own descriptions
                // already carry every candidate.
                let candidate: RTCIceCandidateInit = serde_json::from_str(&envelope.payload)?;
                self.pc
                    .add_ice_candidate(candidate)
                    .await
                    .map_err(|e| TransportError::Transient(e.to_string()))
            }
            other => {
                log::debug!("ignoring signal kind {other} from {}", envelope.peer_id);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Connection for MediaConnection {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn kind(&self) -> ConnectionKind {
        self.kind
    }

    async fn send(&self, msg: Message) -> TransportResult<()> {
        if self.health.status().await != ConnectionStatus::Connected {
            return Err(TransportError::NotConnected(self.peer_id.clone()));
        }
        let channel = self.channel.read().await.clone();
        match channel {
            Some(dc) => self.send_on(&dc, &msg).await,
            None => Err(TransportError::NotConnected(self.peer_id.clone())),
        }
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
        if let Err(e) = self.pc.close().await {
            log::debug!("peer connection close error: {e}");
        }
        self.health.set_status(ConnectionStatus::Disconnected).await;
        self.inbox.close();
    }
}

/// Deterministic room for a peer pair when no explicit signaling room is
/// configured.
fn pair_room(a: &str, b: &str) -> String {
    if a < b {
        format!("pair-{a}-{b}")
    } else {
        format!("pair-{b}-{a}")
    }
}

// =============================================================================
// Tests
// =============================================================================
