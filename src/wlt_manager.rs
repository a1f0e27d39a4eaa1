//! Weft Layered Transport - Layered Connection Manager
//!
//! The arbitration core: launches every registered factory against a peer
//! with rank-staggered starts, promotes the first connection to reach
//! `Connected` to primary, retains later winners as warm backups, and runs
//! a per-peer health monitor that fails over to the best backup when the
//! primary dies. The transport façade at the bottom of the module binds
//! the manager to the application.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::wlt_lan::LanBroadcastFactory;
use crate::wlt_media::{MediaRelayFactory, MediaStunFactory};
use crate::wlt_netinfo::{local_ipv4, probe_nat, NatType, NetworkInfo, NetworkType};
use crate::wlt_polling::HttpPollingFactory;
use crate::wlt_stream::DirectStreamFactory;
use crate::wlt_transport::{
    unix_seconds, Connection, ConnectionFactory, ConnectionKind, ConnectionStatus, FactoryRegistry,
    Message, TransportConfig, TransportError, TransportResult, HEALTH_CHECK_INTERVAL,
    HISTORY_DEPTH, STAGGER_STEP, STATUS_POLL_INTERVAL,
};

// =============================================================================
// Constants
// =============================================================================

/// Factories whose success estimate falls below this skip their attempt.
const MIN_SUCCESS_ESTIMATE: u8 = 10;

// =============================================================================
// Event Handlers
// =============================================================================

pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;
pub type ConnectionHandler = Arc<dyn Fn(&str, Arc<dyn Connection>) + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn(&str, ConnectionKind) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_message: RwLock<Option<MessageHandler>>,
    on_connection: RwLock<Option<ConnectionHandler>>,
    on_disconnect: RwLock<Option<DisconnectHandler>>,
}

// =============================================================================
// Peer State
// =============================================================================

struct PeerLinkState {
    /// Every live connection, keyed by kind. The primary also appears here
    /// under its own kind.
    links: HashMap<ConnectionKind, Arc<dyn Connection>>,
    primary: Option<Arc<dyn Connection>>,
    is_connected: bool,
    last_message: Option<Instant>,
    latency_history: VecDeque<Duration>,
    quality_history: VecDeque<u8>,
}

/// All connection state for one peer. Owned by the manager's peer map.
struct PeerLink {
    peer_id: String,
    state: RwLock<PeerLinkState>,
    cancel: CancellationToken,
}

impl PeerLink {
    fn new(peer_id: &str) -> Arc<Self> {
        Arc::new(Self {
            peer_id: peer_id.to_string(),
            state: RwLock::new(PeerLinkState {
                links: HashMap::new(),
                primary: None,
                is_connected: false,
                last_message: None,
                latency_history: VecDeque::new(),
                quality_history: VecDeque::new(),
            }),
            cancel: CancellationToken::new(),
        })
    }
}

/// Outcome of one factory's attempt.
enum AttemptOutcome {
    Connected(Arc<dyn Connection>),
    Failed(ConnectionKind),
    Skipped(ConnectionKind),
    Cancelled(ConnectionKind),
}

// =============================================================================
// Snapshots
// =============================================================================

/// Point-in-time view of one connection, for diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionSnapshot {
    pub kind: ConnectionKind,
    pub status: ConnectionStatus,
    pub quality: u8,
    pub latency_ms: u64,
}

/// Point-in-time view of everything the manager holds for a peer.
#[derive(Clone, Debug, Serialize)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub connected: bool,
    pub primary: Option<ConnectionSnapshot>,
    pub links: Vec<ConnectionSnapshot>,
}

async fn snapshot_connection(conn: &Arc<dyn Connection>) -> ConnectionSnapshot {
    ConnectionSnapshot {
        kind: conn.kind(),
        status: conn.status().await,
        quality: conn.quality().await,
        latency_ms: conn.latency().await.as_millis() as u64,
    }
}

// =============================================================================
// Layered Connection Manager
// =============================================================================

struct ManagerInner {
    registry: FactoryRegistry,
    peers: DashMap<String, Arc<PeerLink>>,
    config: TransportConfig,
    handlers: Handlers,
}

/// Manages layered connection attempts and failover for every peer.
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct LayeredConnectionManager {
    inner: Arc<ManagerInner>,
}

impl LayeredConnectionManager {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: FactoryRegistry::new(),
                peers: DashMap::new(),
                config,
                handlers: Handlers::default(),
            }),
        }
    }

    pub async fn register_factory(&self, factory: Arc<dyn ConnectionFactory>) {
        self.inner.registry.register(factory).await;
    }

    pub async fn set_message_handler(&self, handler: MessageHandler) {
        *self.inner.handlers.on_message.write().await = Some(handler);
    }

    pub async fn set_connection_handler(&self, handler: ConnectionHandler) {
        *self.inner.handlers.on_connection.write().await = Some(handler);
    }

    pub async fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        *self.inner.handlers.on_disconnect.write().await = Some(handler);
    }

    /// Starts a layered connection attempt and returns immediately. Fails
    /// when an attempt (or live connection) for the peer already exists.
    pub async fn connect_to_peer(&self, peer_id: &str, info: NetworkInfo) -> TransportResult<()> {
        let link = match self.inner.peers.entry(peer_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::AlreadyConnecting(peer_id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let link = PeerLink::new(peer_id);
                vacant.insert(Arc::clone(&link));
                link
            }
        };

        log::info!("starting layered connection attempt to {peer_id}");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            supervise(inner, link, info).await;
        });
        Ok(())
    }

    /// Sends through the peer's primary connection. Never falls back to a
    /// backup here; failover belongs to the health monitor so per-transport
    /// ordering stays stable.
    pub async fn send(&self, peer_id: &str, msg: Message) -> TransportResult<()> {
        let link = self
            .inner
            .peers
            .get(peer_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::NoRoute(peer_id.to_string()))?;

        let primary = { link.state.read().await.primary.clone() };
        match primary {
            Some(primary) => primary.send(msg).await,
            None => Err(TransportError::NotConnected(peer_id.to_string())),
        }
    }

    /// Diagnostic snapshot for one peer.
    pub async fn connection_info(&self, peer_id: &str) -> Option<PeerSnapshot> {
        let link = self
            .inner
            .peers
            .get(peer_id)
            .map(|entry| Arc::clone(entry.value()))?;

        let (primary, links, connected) = {
            let state = link.state.read().await;
            (
                state.primary.clone(),
                state.links.values().cloned().collect::<Vec<_>>(),
                state.is_connected,
            )
        };

        let mut link_snapshots = Vec::with_capacity(links.len());
        for conn in &links {
            link_snapshots.push(snapshot_connection(conn).await);
        }
        let primary_snapshot = match &primary {
            Some(conn) => Some(snapshot_connection(conn).await),
            None => None,
        };

        Some(PeerSnapshot {
            peer_id: peer_id.to_string(),
            connected,
            primary: primary_snapshot,
            links: link_snapshots,
        })
    }

    /// Closes every connection of every peer. Idempotent.
    pub async fn close(&self) {
        let peer_ids: Vec<String> = self
            .inner
            .peers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for peer_id in peer_ids {
            self.inner.remove_peer(&peer_id).await;
        }
    }
}

impl ManagerInner {
    async fn on_message(&self) -> Option<MessageHandler> {
        self.handlers.on_message.read().await.clone()
    }

    async fn on_connection(&self) -> Option<ConnectionHandler> {
        self.handlers.on_connection.read().await.clone()
    }

    async fn on_disconnect(&self) -> Option<DisconnectHandler> {
        self.handlers.on_disconnect.read().await.clone()
    }

    /// Removes the peer entry and closes everything it owned.
    async fn remove_peer(&self, peer_id: &str) {
        let Some((_, link)) = self.peers.remove(peer_id) else {
            return;
        };
        link.cancel.cancel();
        let links: Vec<Arc<dyn Connection>> = {
            let mut state = link.state.write().await;
            state.primary = None;
            state.is_connected = false;
            state.links.drain().map(|(_, conn)| conn).collect()
        };
        for conn in links {
            conn.close().await;
        }
        log::info!("removed peer {peer_id}");
    }

    /// Retains a freshly connected link as primary (first winner) or
    /// backup, replacing and closing any earlier backup of the same kind.
    async fn adopt_connection(self: Arc<Self>, link: &Arc<PeerLink>, conn: Arc<dyn Connection>) {
        // The peer may have been torn down while this attempt was still
        // converging; a late winner must not outlive its entry.
        if link.cancel.is_cancelled() {
            conn.close().await;
            return;
        }
        let kind = conn.kind();
        let (promoted, displaced) = {
            let mut state = link.state.write().await;
            let displaced = state.links.insert(kind, Arc::clone(&conn));
            let promoted = if state.primary.is_none() {
                state.primary = Some(Arc::clone(&conn));
                state.is_connected = true;
                true
            } else {
                false
            };
            (promoted, displaced)
        };

        if let Some(old) = displaced {
            old.close().await;
        }

        if promoted {
            log::info!("primary connection to {} established via {kind}", link.peer_id);
            if let Some(handler) = self.on_connection().await {
                handler(&link.peer_id, Arc::clone(&conn));
            }
        } else {
            log::info!("backup connection to {} established via {kind}", link.peer_id);
        }

        tokio::spawn(Arc::clone(&self).pump_messages(Arc::clone(link), conn));
    }

    /// Drains one connection's incoming stream into the application
    /// callback. Backups pump too, so the receive path survives failover.
    async fn pump_messages(self: Arc<Self>, link: Arc<PeerLink>, conn: Arc<dyn Connection>) {
        let Some(mut incoming) = conn.take_incoming() else {
            return;
        };
        while let Some(msg) = incoming.recv().await {
            {
                let mut state = link.state.write().await;
                state.last_message = Some(Instant::now());
            }
            if msg.is_probe() {
                continue;
            }
            if let Some(handler) = self.on_message().await {
                handler(msg);
            }
        }
        log::debug!(
            "incoming stream from {} via {} ended",
            link.peer_id,
            conn.kind()
        );
    }

    /// One health-monitor tick. Returns false when the peer entry is gone
    /// and the monitor should stop.
    async fn check_health(self: Arc<Self>, link: &Arc<PeerLink>) -> bool {
        let primary = { link.state.read().await.primary.clone() };
        let Some(primary) = primary else {
            return false;
        };

        if primary.status().await != ConnectionStatus::Connected {
            log::warn!(
                "primary {} to {} is down, attempting failover",
                primary.kind(),
                link.peer_id
            );

            let candidates: Vec<Arc<dyn Connection>> = {
                let state = link.state.read().await;
                state
                    .links
                    .values()
                    .filter(|c| c.kind() != primary.kind())
                    .cloned()
                    .collect()
            };

            let mut best: Option<(u8, Arc<dyn Connection>)> = None;
            for candidate in candidates {
                if candidate.status().await != ConnectionStatus::Connected {
                    continue;
                }
                let quality = candidate.quality().await;
                if best.as_ref().map(|(q, _)| quality > *q).unwrap_or(true) {
                    best = Some((quality, candidate));
                }
            }

            match best {
                Some((quality, backup)) => {
                    {
                        let mut state = link.state.write().await;
                        state.links.remove(&primary.kind());
                        state.primary = Some(Arc::clone(&backup));
                    }
                    primary.close().await;
                    log::info!(
                        "failed over {} to {} (quality {quality})",
                        link.peer_id,
                        backup.kind()
                    );
                    if let Some(handler) = self.on_connection().await {
                        handler(&link.peer_id, backup);
                    }
                }
                None => {
                    log::warn!("no live backups for {}", link.peer_id);
                    {
                        let mut state = link.state.write().await;
                        state.is_connected = false;
                    }
                    if let Some(handler) = self.on_disconnect().await {
                        handler(&link.peer_id, primary.kind());
                    }
                    self.remove_peer(&link.peer_id).await;
                    return false;
                }
            }
        }

        // Roll the quality metrics of whatever is primary now.
        let primary = { link.state.read().await.primary.clone() };
        if let Some(primary) = primary {
            let latency = primary.latency().await;
            let quality = primary.quality().await;
            let mut state = link.state.write().await;
            state.latency_history.push_back(latency);
            state.quality_history.push_back(quality);
            while state.latency_history.len() > HISTORY_DEPTH {
                state.latency_history.pop_front();
            }
            while state.quality_history.len() > HISTORY_DEPTH {
                state.quality_history.pop_front();
            }
        }
        true
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Runs every factory against the peer with staggered starts, arbitrates
/// the outcomes, and hands the surviving entry to the health monitor.
async fn supervise(inner: Arc<ManagerInner>, link: Arc<PeerLink>, info: NetworkInfo) {
    let factories = inner.registry.snapshot().await;
    if factories.is_empty() {
        log::warn!("no factories registered; dropping attempt to {}", link.peer_id);
        inner.remove_peer(&link.peer_id).await;
        return;
    }

    let attempts_cancel = link.cancel.child_token();
    let (outcome_tx, mut outcome_rx) = mpsc::channel(factories.len());

    for (rank, factory) in factories.into_iter().enumerate() {
        let tx = outcome_tx.clone();
        let cancel = attempts_cancel.child_token();
        let peer_id = link.peer_id.clone();
        let info = info.clone();
        let config = inner.config.clone();
        tokio::spawn(async move {
            let outcome = attempt(factory, rank, cancel, &peer_id, &info, &config).await;
            let _ = tx.send(outcome).await;
        });
    }
    drop(outcome_tx);

    let deadline = tokio::time::sleep(inner.config.connection_timeout);
    tokio::pin!(deadline);

    let mut last_failure: Option<ConnectionKind> = None;
    let mut any_failure = false;
    loop {
        tokio::select! {
            outcome = outcome_rx.recv() => {
                let Some(outcome) = outcome else { break };
                match outcome {
                    AttemptOutcome::Connected(conn) => {
                        Arc::clone(&inner).adopt_connection(&link, conn).await;
                    }
                    AttemptOutcome::Failed(kind) => {
                        any_failure = true;
                        last_failure = Some(kind);
                    }
                    AttemptOutcome::Skipped(_) | AttemptOutcome::Cancelled(_) => {}
                }
            }
            _ = &mut deadline => {
                let has_primary = { link.state.read().await.primary.is_some() };
                if !has_primary {
                    log::warn!("connection attempt to {} timed out", link.peer_id);
                    inner.remove_peer(&link.peer_id).await;
                    return;
                }
                // Keep what we have; stop the stragglers.
                attempts_cancel.cancel();
                break;
            }
        }
    }

    let has_primary = { link.state.read().await.primary.is_some() };
    if !has_primary {
        log::warn!("all connection attempts to {} failed", link.peer_id);
        if any_failure && inner.peers.contains_key(&link.peer_id) {
            if let Some(handler) = inner.on_disconnect().await {
                handler(&link.peer_id, last_failure.unwrap_or(ConnectionKind::MediaStun));
            }
        }
        inner.remove_peer(&link.peer_id).await;
        return;
    }

    // The supervisor's job ends here; the health monitor owns the entry
    // for the rest of its life.
    let monitor_inner = Arc::clone(&inner);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = link.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !Arc::clone(&monitor_inner).check_health(&link).await {
                        break;
                    }
                }
            }
        }
    });
}

/// One factory's attempt: stagger, estimate gate, create, then poll the
/// connection's status until it resolves or the attempt is cancelled.
async fn attempt(
    factory: Arc<dyn ConnectionFactory>,
    rank: usize,
    cancel: CancellationToken,
    peer_id: &str,
    info: &NetworkInfo,
    config: &TransportConfig,
) -> AttemptOutcome {
    let kind = factory.kind();

    let stagger = STAGGER_STEP * rank as u32;
    if !stagger.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(stagger) => {}
            _ = cancel.cancelled() => return AttemptOutcome::Cancelled(kind),
        }
    }

    let estimate = factory.estimate_success(peer_id, info);
    if estimate < MIN_SUCCESS_ESTIMATE {
        log::info!("skipping {kind} to {peer_id}: success estimate {estimate}%");
        return AttemptOutcome::Skipped(kind);
    }

    log::info!("attempting {kind} to {peer_id} (priority {}, estimate {estimate}%)", factory.priority());
    let conn = match factory.create(cancel.clone(), peer_id, info, config).await {
        Ok(conn) => conn,
        Err(e) => {
            log::warn!("{kind} attempt to {peer_id} failed to start: {e}");
            return AttemptOutcome::Failed(kind);
        }
    };

    let mut poll = tokio::time::interval(STATUS_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                conn.close().await;
                return AttemptOutcome::Cancelled(kind);
            }
            _ = poll.tick() => match conn.status().await {
                ConnectionStatus::Connected => return AttemptOutcome::Connected(conn),
                status if status.is_terminal() => {
                    conn.close().await;
                    return AttemptOutcome::Failed(kind);
                }
                _ => {}
            },
        }
    }
}

// =============================================================================
// Transport Façade
// =============================================================================

/// Application-facing wrapper: registers the five stock factories, stamps
/// outbound messages, and enriches network info with probe results.
pub struct TransportManager {
    manager: LayeredConnectionManager,
    peer_id: String,
    config: TransportConfig,
}

impl TransportManager {
    pub async fn new(peer_id: &str, mut config: TransportConfig) -> Self {
        config.local_peer_id = peer_id.to_string();
        let manager = LayeredConnectionManager::new(config.clone());

        log::info!("registering connection factories");
        manager
            .register_factory(Arc::new(MediaStunFactory::new(config.stun_servers.clone())))
            .await;
        manager
            .register_factory(Arc::new(MediaRelayFactory::new(config.turn_servers.clone())))
            .await;
        manager.register_factory(Arc::new(DirectStreamFactory)).await;
        manager.register_factory(Arc::new(HttpPollingFactory::new())).await;
        manager.register_factory(Arc::new(LanBroadcastFactory)).await;

        Self {
            manager,
            peer_id: peer_id.to_string(),
            config,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn connect_to_peer(&self, peer_id: &str, info: NetworkInfo) -> TransportResult<()> {
        self.manager.connect_to_peer(peer_id, info).await
    }

    /// Builds and sends a message through the peer's primary connection.
    pub async fn send_message(
        &self,
        peer_id: &str,
        kind: &str,
        payload: impl Into<bytes::Bytes>,
    ) -> TransportResult<()> {
        let mut msg = Message::new(kind, payload);
        msg.from = self.peer_id.clone();
        msg.to = peer_id.to_string();
        msg.timestamp = unix_seconds();
        self.manager.send(peer_id, msg).await
    }

    pub async fn set_message_handler(&self, handler: MessageHandler) {
        self.manager.set_message_handler(handler).await;
    }

    pub async fn set_connection_handler(&self, handler: ConnectionHandler) {
        self.manager.set_connection_handler(handler).await;
    }

    pub async fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        self.manager.set_disconnect_handler(handler).await;
    }

    pub async fn connection_info(&self, peer_id: &str) -> Option<PeerSnapshot> {
        self.manager.connection_info(peer_id).await
    }

    /// Probes the local environment and folds the results into the
    /// advisory info handed to the factories.
    pub async fn create_network_info(
        &self,
        peer_ip: Option<&str>,
        peer_http_url: Option<&str>,
        network_type: Option<NetworkType>,
    ) -> NetworkInfo {
        let mut info = NetworkInfo::default();

        if let Some(ip) = peer_ip.filter(|ip| !ip.is_empty()) {
            info.peer_ip = Some(ip.to_string());
            info.peer_http_url = Some(format!("http://{ip}:8080"));
        }
        if let Some(url) = peer_http_url.filter(|url| !url.is_empty()) {
            info.peer_http_url = Some(url.to_string());
        }

        if let Some(local) = local_ipv4() {
            info.local_ip = Some(local.to_string());
        }

        info.network_type = match network_type {
            Some(kind) => kind,
            None if info.on_private_network() => NetworkType::Lan,
            None => NetworkType::Unknown,
        };

        // Advisory only; an inconclusive probe reads as cone.
        info.nat_type = match probe_nat(&self.config.stun_servers).await {
            NatType::Unknown => NatType::Cone,
            nat => nat,
        };

        info
    }

    pub async fn close(&self) {
        log::info!("shutting down transport manager");
        self.manager.close().await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::wlt_transport::{Inbox, LinkHealth, KIND_CHAT};

    // -------------------------------------------------------------------------
    // Mock connection machinery
    // -------------------------------------------------------------------------

    #[derive(Clone, Copy)]
    enum MockPlan {
        /// Reach `Connected` with the given quality after the delay.
        ConnectAfter(Duration, u8),
        /// Reach `Failed` after the delay.
        FailAfter(Duration),
        /// Stay `Connecting` forever.
        Stall,
    }

    struct MockConnection {
        peer_id: String,
        kind: ConnectionKind,
        health: LinkHealth,
        inbox: Inbox,
        closed: AtomicBool,
        sent: Mutex<Vec<Message>>,
    }

    impl MockConnection {
        fn spawn(kind: ConnectionKind, peer_id: &str, plan: MockPlan) -> Arc<Self> {
            let conn = Arc::new(Self {
                peer_id: peer_id.to_string(),
                kind,
                health: LinkHealth::new(kind),
                inbox: Inbox::new(),
                closed: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            });
            let driver = Arc::clone(&conn);
            tokio::spawn(async move {
                match plan {
                    MockPlan::ConnectAfter(delay, quality) => {
                        tokio::time::sleep(delay).await;
                        driver.health.mark_connected(quality).await;
                    }
                    MockPlan::FailAfter(delay) => {
                        tokio::time::sleep(delay).await;
                        driver.health.set_status(ConnectionStatus::Failed).await;
                        driver.inbox.close();
                    }
                    MockPlan::Stall => {}
                }
            });
            conn
        }

        async fn force_down(&self) {
            self.health.set_status(ConnectionStatus::Disconnected).await;
        }

        fn feed(&self, msg: Message) {
            self.inbox.push("mock", msg);
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
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
            self.sent.lock().unwrap().push(msg);
            Ok(())
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
            self.closed.store(true, Ordering::SeqCst);
            self.health.set_status(ConnectionStatus::Disconnected).await;
            self.inbox.close();
        }
    }

    struct MockFactory {
        kind: ConnectionKind,
        estimate: u8,
        plan: MockPlan,
        created: Mutex<Vec<Arc<MockConnection>>>,
        create_count: AtomicUsize,
    }

    impl MockFactory {
        fn new(kind: ConnectionKind, estimate: u8, plan: MockPlan) -> Arc<Self> {
            Arc::new(Self {
                kind,
                estimate,
                plan,
                created: Mutex::new(Vec::new()),
                create_count: AtomicUsize::new(0),
            })
        }

        fn latest(&self) -> Arc<MockConnection> {
            self.created.lock().unwrap().last().cloned().expect("factory never created")
        }
    }

    #[async_trait]
    impl ConnectionFactory for MockFactory {
        fn kind(&self) -> ConnectionKind {
            self.kind
        }

        fn priority(&self) -> u8 {
            self.kind.default_priority()
        }

        fn estimate_success(&self, _peer_id: &str, _info: &NetworkInfo) -> u8 {
            self.estimate
        }

        async fn create(
            &self,
            _cancel: CancellationToken,
            peer_id: &str,
            _info: &NetworkInfo,
            _config: &TransportConfig,
        ) -> TransportResult<Arc<dyn Connection>> {
            self.create_count.fetch_add(1, Ordering::SeqCst);
            let conn = MockConnection::spawn(self.kind, peer_id, self.plan);
            self.created.lock().unwrap().push(Arc::clone(&conn));
            Ok(conn)
        }
    }

    // -------------------------------------------------------------------------
    // Recording handlers
    // -------------------------------------------------------------------------

    #[derive(Default)]
    struct Events {
        connections: Mutex<Vec<ConnectionKind>>,
        disconnects: Mutex<Vec<ConnectionKind>>,
        messages: Mutex<Vec<Message>>,
    }

    async fn wire_events(manager: &LayeredConnectionManager) -> Arc<Events> {
        let events = Arc::new(Events::default());

        let sink = Arc::clone(&events);
        manager
            .set_connection_handler(Arc::new(move |_peer, conn| {
                sink.connections.lock().unwrap().push(conn.kind());
            }))
            .await;
        let sink = Arc::clone(&events);
        manager
            .set_disconnect_handler(Arc::new(move |_peer, kind| {
                sink.disconnects.lock().unwrap().push(kind);
            }))
            .await;
        let sink = Arc::clone(&events);
        manager
            .set_message_handler(Arc::new(move |msg| {
                sink.messages.lock().unwrap().push(msg);
            }))
            .await;

        events
    }

    fn test_config() -> TransportConfig {
        TransportConfig {
            local_peer_id: "me".to_string(),
            connection_timeout: Duration::from_secs(30),
            ..Default::default()
        }
    }

    async fn settle() {
        // Paused-clock tests: long enough for every stagger, poll and
        // health tick to fire, instant in wall time.
        tokio::time::sleep(Duration::from_secs(60)).await;
    }

    // -------------------------------------------------------------------------
    // Scenarios
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn preferred_transport_wins_with_stagger() {
        let manager = LayeredConnectionManager::new(test_config());
        let events = wire_events(&manager).await;

        // Every family connects 200ms after its (staggered) start; the
        // rank-0 family must win the primary slot.
        let establish = Duration::from_millis(200);
        for kind in [
            ConnectionKind::MediaStun,
            ConnectionKind::MediaRelay,
            ConnectionKind::DirectStream,
            ConnectionKind::HttpPolling,
            ConnectionKind::LanBroadcast,
        ] {
            manager
                .register_factory(MockFactory::new(kind, 90, MockPlan::ConnectAfter(establish, 80)))
                .await;
        }

        manager.connect_to_peer("peer", NetworkInfo::default()).await.unwrap();
        settle().await;

        // on_connection fired exactly once, for the preferred family.
        assert_eq!(
            events.connections.lock().unwrap().as_slice(),
            &[ConnectionKind::MediaStun]
        );
        assert!(events.disconnects.lock().unwrap().is_empty());

        let info = manager.connection_info("peer").await.unwrap();
        assert!(info.connected);
        assert_eq!(info.primary.as_ref().unwrap().kind, ConnectionKind::MediaStun);
        // Later winners are retained warm, the primary among them.
        let kinds: Vec<ConnectionKind> = info.links.iter().map(|s| s.kind).collect();
        assert_eq!(kinds.len(), 5);
        assert!(kinds.contains(&ConnectionKind::MediaRelay));
        assert!(kinds.contains(&ConnectionKind::DirectStream));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_preferred_transport_loses_the_race() {
        let manager = LayeredConnectionManager::new(test_config());
        let events = wire_events(&manager).await;

        // The preferred family needs 5s to converge; polling (rank 3,
        // stagger 1.5s) connects instantly and takes primary.
        manager
            .register_factory(MockFactory::new(
                ConnectionKind::MediaStun,
                90,
                MockPlan::ConnectAfter(Duration::from_secs(5), 90),
            ))
            .await;
        manager
            .register_factory(MockFactory::new(
                ConnectionKind::MediaRelay,
                5,
                MockPlan::Stall,
            ))
            .await;
        manager
            .register_factory(MockFactory::new(
                ConnectionKind::DirectStream,
                5,
                MockPlan::Stall,
            ))
            .await;
        manager
            .register_factory(MockFactory::new(
                ConnectionKind::HttpPolling,
                90,
                MockPlan::ConnectAfter(Duration::ZERO, 70),
            ))
            .await;

        manager.connect_to_peer("peer", NetworkInfo::default()).await.unwrap();
        settle().await;

        let fired = events.connections.lock().unwrap().clone();
        assert_eq!(fired, vec![ConnectionKind::HttpPolling]);
        let info = manager.connection_info("peer").await.unwrap();
        assert_eq!(info.primary.unwrap().kind, ConnectionKind::HttpPolling);
        // The slow preferred transport still joined as a warm backup.
        assert!(info.links.iter().any(|s| s.kind == ConnectionKind::MediaStun));
    }

    #[tokio::test(start_paused = true)]
    async fn failover_promotes_best_backup_without_disconnect() {
        let manager = LayeredConnectionManager::new(test_config());
        let events = wire_events(&manager).await;

        let stream = MockFactory::new(
            ConnectionKind::DirectStream,
            90,
            MockPlan::ConnectAfter(Duration::ZERO, 85),
        );
        let polling = MockFactory::new(
            ConnectionKind::HttpPolling,
            90,
            MockPlan::ConnectAfter(Duration::ZERO, 60),
        );
        let lan = MockFactory::new(
            ConnectionKind::LanBroadcast,
            90,
            MockPlan::ConnectAfter(Duration::ZERO, 75),
        );
        manager.register_factory(Arc::clone(&stream) as Arc<dyn ConnectionFactory>).await;
        manager.register_factory(Arc::clone(&polling) as Arc<dyn ConnectionFactory>).await;
        manager.register_factory(Arc::clone(&lan) as Arc<dyn ConnectionFactory>).await;

        manager.connect_to_peer("peer", NetworkInfo::default()).await.unwrap();
        settle().await;
        assert_eq!(
            events.connections.lock().unwrap().as_slice(),
            &[ConnectionKind::DirectStream]
        );

        // Kill the primary; the next health tick must promote the
        // highest-quality live backup (lan at 75 beats polling at 60).
        stream.latest().force_down().await;
        tokio::time::sleep(HEALTH_CHECK_INTERVAL * 2).await;

        assert_eq!(
            events.connections.lock().unwrap().as_slice(),
            &[ConnectionKind::DirectStream, ConnectionKind::LanBroadcast]
        );
        assert!(events.disconnects.lock().unwrap().is_empty());
        assert!(stream.latest().closed.load(Ordering::SeqCst));

        // Sends keep working through the new primary.
        let mut msg = Message::new(KIND_CHAT, Bytes::from_static(b"after failover"));
        msg.from = "me".into();
        manager.send("peer", msg).await.unwrap();
        assert_eq!(lan.latest().sent.lock().unwrap().len(), 1);

        let info = manager.connection_info("peer").await.unwrap();
        assert_eq!(info.primary.unwrap().kind, ConnectionKind::LanBroadcast);
        assert!(!info.links.iter().any(|s| s.kind == ConnectionKind::DirectStream));
    }

    #[tokio::test(start_paused = true)]
    async fn total_failure_removes_entry_and_fires_disconnect_once() {
        let manager = LayeredConnectionManager::new(test_config());
        let events = wire_events(&manager).await;

        for kind in [
            ConnectionKind::MediaStun,
            ConnectionKind::DirectStream,
            ConnectionKind::HttpPolling,
        ] {
            manager
                .register_factory(MockFactory::new(
                    kind,
                    90,
                    MockPlan::FailAfter(Duration::from_millis(100)),
                ))
                .await;
        }

        manager.connect_to_peer("peer", NetworkInfo::default()).await.unwrap();
        settle().await;

        assert!(events.connections.lock().unwrap().is_empty());
        assert_eq!(events.disconnects.lock().unwrap().len(), 1);
        assert!(manager.connection_info("peer").await.is_none());

        // No stale entry: a fresh attempt for the same peer is accepted.
        manager.connect_to_peer("peer", NetworkInfo::default()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_deadline_discards_silently() {
        let config = TransportConfig {
            connection_timeout: Duration::from_secs(3),
            ..test_config()
        };
        let manager = LayeredConnectionManager::new(config);
        let events = wire_events(&manager).await;

        let stall = MockFactory::new(ConnectionKind::DirectStream, 90, MockPlan::Stall);
        manager.register_factory(Arc::clone(&stall) as Arc<dyn ConnectionFactory>).await;

        manager.connect_to_peer("peer", NetworkInfo::default()).await.unwrap();
        settle().await;

        // Timeout: entry removed, the stalled connection closed, and no
        // callback of either flavor.
        assert!(manager.connection_info("peer").await.is_none());
        assert!(events.connections.lock().unwrap().is_empty());
        assert!(events.disconnects.lock().unwrap().is_empty());
        assert!(stall.latest().closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_connect_is_rejected() {
        let manager = LayeredConnectionManager::new(test_config());
        manager
            .register_factory(MockFactory::new(
                ConnectionKind::DirectStream,
                90,
                MockPlan::ConnectAfter(Duration::ZERO, 80),
            ))
            .await;

        manager.connect_to_peer("peer", NetworkInfo::default()).await.unwrap();
        let second = manager.connect_to_peer("peer", NetworkInfo::default()).await;
        assert!(matches!(second, Err(TransportError::AlreadyConnecting(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn send_errors_name_the_failure() {
        let manager = LayeredConnectionManager::new(test_config());
        manager
            .register_factory(MockFactory::new(ConnectionKind::DirectStream, 90, MockPlan::Stall))
            .await;

        let msg = Message::new(KIND_CHAT, Bytes::from_static(b"x"));
        assert!(matches!(
            manager.send("nobody", msg.clone()).await,
            Err(TransportError::NoRoute(_))
        ));

        manager.connect_to_peer("peer", NetworkInfo::default()).await.unwrap();
        // Entry exists but nothing has connected yet.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(
            manager.send("peer", msg).await,
            Err(TransportError::NotConnected(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn low_estimates_skip_the_attempt() {
        let manager = LayeredConnectionManager::new(test_config());
        let skipped = MockFactory::new(
            ConnectionKind::MediaStun,
            MIN_SUCCESS_ESTIMATE - 1,
            MockPlan::ConnectAfter(Duration::ZERO, 90),
        );
        let taken = MockFactory::new(
            ConnectionKind::HttpPolling,
            90,
            MockPlan::ConnectAfter(Duration::ZERO, 70),
        );
        manager.register_factory(Arc::clone(&skipped) as Arc<dyn ConnectionFactory>).await;
        manager.register_factory(Arc::clone(&taken) as Arc<dyn ConnectionFactory>).await;

        manager.connect_to_peer("peer", NetworkInfo::default()).await.unwrap();
        settle().await;

        assert_eq!(skipped.create_count.load(Ordering::SeqCst), 0);
        assert_eq!(taken.create_count.load(Ordering::SeqCst), 1);
        let info = manager.connection_info("peer").await.unwrap();
        assert_eq!(info.primary.unwrap().kind, ConnectionKind::HttpPolling);
    }

    #[tokio::test(start_paused = true)]
    async fn incoming_messages_reach_the_application() {
        let manager = LayeredConnectionManager::new(test_config());
        let events = wire_events(&manager).await;

        let factory = MockFactory::new(
            ConnectionKind::DirectStream,
            90,
            MockPlan::ConnectAfter(Duration::ZERO, 80),
        );
        manager.register_factory(Arc::clone(&factory) as Arc<dyn ConnectionFactory>).await;
        manager.connect_to_peer("peer", NetworkInfo::default()).await.unwrap();
        settle().await;

        let mut chat = Message::new(KIND_CHAT, Bytes::from_static(b"hello"));
        chat.from = "peer".into();
        factory.latest().feed(chat);
        // Probes are consumed below the application boundary.
        factory.latest().feed(Message::ping("peer"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let messages = events.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload.as_ref(), b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn quality_history_is_ring_bounded() {
        let manager = LayeredConnectionManager::new(test_config());
        manager
            .register_factory(MockFactory::new(
                ConnectionKind::DirectStream,
                90,
                MockPlan::ConnectAfter(Duration::ZERO, 80),
            ))
            .await;
        manager.connect_to_peer("peer", NetworkInfo::default()).await.unwrap();

        // Far more health ticks than the ring holds.
        tokio::time::sleep(HEALTH_CHECK_INTERVAL * 25).await;

        let link = manager.inner.peers.get("peer").map(|e| Arc::clone(e.value())).unwrap();
        let state = link.state.read().await;
        assert!(state.quality_history.len() <= HISTORY_DEPTH);
        assert!(state.latency_history.len() <= HISTORY_DEPTH);
        assert!(!state.quality_history.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_tears_everything_down_idempotently() {
        let manager = LayeredConnectionManager::new(test_config());
        let factory = MockFactory::new(
            ConnectionKind::DirectStream,
            90,
            MockPlan::ConnectAfter(Duration::ZERO, 80),
        );
        manager.register_factory(Arc::clone(&factory) as Arc<dyn ConnectionFactory>).await;
        manager.connect_to_peer("peer", NetworkInfo::default()).await.unwrap();
        settle().await;

        manager.close().await;
        manager.close().await;

        assert!(factory.latest().closed.load(Ordering::SeqCst));
        assert!(manager.connection_info("peer").await.is_none());
        let msg = Message::new(KIND_CHAT, Bytes::from_static(b"x"));
        assert!(matches!(
            manager.send("peer", msg).await,
            Err(TransportError::NoRoute(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn managers_are_independent() {
        // Two managers in one process must not share peer state.
        let left = LayeredConnectionManager::new(test_config());
        let right = LayeredConnectionManager::new(test_config());
        left.register_factory(MockFactory::new(
            ConnectionKind::DirectStream,
            90,
            MockPlan::ConnectAfter(Duration::ZERO, 80),
        ))
        .await;

        left.connect_to_peer("peer", NetworkInfo::default()).await.unwrap();
        settle().await;

        assert!(left.connection_info("peer").await.is_some());
        assert!(right.connection_info("peer").await.is_none());
    }
}
