//! Task router: the realm's end-to-end message flow
//!
//! Client path: frame in, admission check, shard selection, envelope stamping,
//! shard-bound queue. Reply path: shard frame in, authentication, client
//! lookup by correlation id, token stripped, client-bound queue.
//!
//! Every handler returns a [`ConnAction`] for the connection it was called on.
//! Nothing a single connection sends can close or fail any other connection.

use crate::admission::{self, Admission, AdmissionController};
use crate::auth::{AuthGate, Verdict};
use crate::backpressure::{BackpressureQueue, Delivery, Direction};
use crate::config::{RealmConfig, SelectionPolicy};
use crate::registry::{ClientRegistry, ShardRegistry};
use crate::transport::{decode_frame, ConnectionHandle};
use log::{debug, error, info, warn};
use shared::{CloseReason, ConnId, Mode, Packet, TokenAuthority};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// What the connection's task should do after a handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAction {
    Continue,
    Close(CloseReason),
}

/// Lifecycle of one shard connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Connecting,
    Authenticating,
    Registered,
    Closed,
}

/// Per-connection state held by a shard connection's task
#[derive(Debug)]
pub struct ShardSession {
    pub handle: ConnectionHandle,
    pub addr: SocketAddr,
    pub state: ShardState,
}

impl ShardSession {
    pub fn id(&self) -> &ConnId {
        self.handle.id()
    }
}

pub struct Router {
    selection: SelectionPolicy,
    gate: AuthGate,
    shards: Mutex<ShardRegistry>,
    clients: RwLock<ClientRegistry>,
    admission: Arc<Mutex<AdmissionController>>,
    to_shards: Mutex<BackpressureQueue>,
    to_clients: Mutex<BackpressureQueue>,
}

impl Router {
    pub fn new(config: &RealmConfig, authority: TokenAuthority) -> Self {
        Self {
            selection: config.selection,
            gate: AuthGate::new(authority),
            shards: Mutex::new(ShardRegistry::new()),
            clients: RwLock::new(ClientRegistry::new()),
            admission: Arc::new(Mutex::new(AdmissionController::new(config.rate_limit))),
            to_shards: Mutex::new(BackpressureQueue::new(Direction::ToShards, config.gate)),
            to_clients: Mutex::new(BackpressureQueue::new(Direction::ToClients, config.gate)),
        }
    }

    /// Starts the rate-limit decay and penalty sweeps
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        admission::spawn_maintenance(Arc::clone(&self.admission))
    }

    // Client side

    pub async fn client_connected(&self, handle: ConnectionHandle, addr: SocketAddr) {
        let id = handle.id().clone();
        self.clients.write().await.insert(handle, addr);
        self.admission.lock().await.track(id);
    }

    pub async fn client_message(&self, id: &ConnId, frame: &Message) -> ConnAction {
        let packet = match decode_frame(frame) {
            Ok(Some(packet)) => packet,
            Ok(None) => return ConnAction::Continue,
            Err(e) => {
                warn!("Client {} sent an invalid packet: {}", id, e);
                return ConnAction::Close(CloseReason::InvalidPacket);
            }
        };

        let admission = self.admission.lock().await.admit(id, Instant::now());
        if admission == Admission::Limited {
            self.deliver_to_client(id.as_str(), Packet::rate_limited()).await;
            return ConnAction::Continue;
        }

        let Some(shard) = self.shards.lock().await.select_next(self.selection) else {
            warn!("No shard available for client {}", id);
            return ConnAction::Close(CloseReason::NoServers);
        };

        let task = Packet {
            mode: Some(Mode::DistributedTask),
            id: Some(id.to_string()),
            ..packet
        };
        let frame = match self.gate.stamp(task).map(|task| task.encode()) {
            Ok(Ok(text)) => Message::text(text),
            Ok(Err(e)) => {
                error!("Failed to encode task for client {}: {}", id, e);
                return ConnAction::Continue;
            }
            Err(e) => {
                error!("Failed to seal task for client {}: {}", id, e);
                return ConnAction::Continue;
            }
        };

        let delivery = self.to_shards.lock().await.try_send(&shard, frame);
        match delivery {
            Delivery::Sent => debug!("Task from {} dispatched to shard {}", id, shard.id()),
            Delivery::Buffered => debug!("Task from {} buffered for shard {}", id, shard.id()),
            Delivery::Dropped => warn!(
                "Shard {} closed before task from {} could be sent",
                shard.id(),
                id
            ),
        }
        ConnAction::Continue
    }

    pub async fn client_disconnected(&self, id: &ConnId) {
        self.clients.write().await.remove(id);
        self.admission.lock().await.forget(id);

        let handles = self.clients.read().await.handles();
        let report = self
            .to_clients
            .lock()
            .await
            .on_close(id, |target| handles.get(target));
        if report.dropped > 0 {
            debug!("Discarded {} replies for departed client {}", report.dropped, id);
        }
    }

    async fn deliver_to_client(&self, id: &str, packet: Packet) {
        let Some(handle) = self.clients.read().await.get(id).cloned() else {
            debug!("Client {} is gone, dropping reply", id);
            return;
        };

        let text = match packet.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode reply for client {}: {}", id, e);
                return;
            }
        };

        if self.to_clients.lock().await.try_send(&handle, Message::text(text)) == Delivery::Dropped
        {
            debug!("Client {} closed before its reply was sent", id);
        }
    }

    // Shard side

    pub fn shard_connected(&self, handle: ConnectionHandle, addr: SocketAddr) -> ShardSession {
        debug!("Shard connection {} opened from {}", handle.id(), addr);
        ShardSession {
            handle,
            addr,
            state: ShardState::Connecting,
        }
    }

    pub async fn shard_message(&self, session: &mut ShardSession, frame: &Message) -> ConnAction {
        let packet = match decode_frame(frame) {
            Ok(Some(packet)) => packet,
            Ok(None) => return ConnAction::Continue,
            Err(e) => {
                warn!("Shard {} sent an invalid packet: {}", session.id(), e);
                return ConnAction::Close(CloseReason::InvalidPacket);
            }
        };

        if session.state == ShardState::Connecting {
            session.state = ShardState::Authenticating;
        }

        if let Verdict::Rejected(reason) = self.gate.authenticate(&packet) {
            warn!("Shard {} failed authentication: {}", session.id(), reason);
            if let Err(e) = session.handle.send_packet(&Packet::auth_error(&reason)).await {
                error!("Failed to encode auth error: {}", e);
            }
            return ConnAction::Close(reason);
        }

        if packet.mode == Some(Mode::Proxy) {
            return self.route_reply(packet).await;
        }

        if session.state != ShardState::Registered {
            self.register(session, &packet).await;
        }
        if let Some(stats) = packet.stats {
            self.shards.lock().await.update_stats(session.id(), stats);
        }
        ConnAction::Continue
    }

    async fn register(&self, session: &mut ShardSession, packet: &Packet) {
        let welcome = match self.gate.welcome(session.id()) {
            Ok(welcome) => welcome,
            Err(e) => {
                error!("Failed to seal welcome for shard {}: {}", session.id(), e);
                return;
            }
        };

        self.shards
            .lock()
            .await
            .insert(session.handle.clone(), session.addr);
        session.state = ShardState::Registered;

        if let Some(ip) = packet.extra.get("ip").and_then(|ip| ip.as_str()) {
            info!("Shard {} advertises {}", session.id(), ip.trim());
        }

        if let Err(e) = session.handle.send_packet(&welcome).await {
            error!("Failed to encode welcome: {}", e);
        }
    }

    async fn route_reply(&self, packet: Packet) -> ConnAction {
        let Some(client_id) = packet.correlation_id().map(str::to_owned) else {
            return ConnAction::Close(CloseReason::MissingCorrelationId);
        };

        // The token was for this hop only.
        self.deliver_to_client(&client_id, packet.without_token()).await;
        ConnAction::Continue
    }

    pub async fn shard_disconnected(&self, session: &mut ShardSession) {
        if session.state == ShardState::Registered {
            self.shards.lock().await.remove(session.id());
        }
        session.state = ShardState::Closed;

        let handles = self.shards.lock().await.handles();
        let report = self
            .to_shards
            .lock()
            .await
            .on_close(session.id(), |target| handles.get(target));
        if report.dropped > 0 {
            warn!(
                "Discarded {} tasks queued for departed shard {}",
                report.dropped,
                session.id()
            );
        }
    }

    /// Flushes `direction`'s queue after connection `id` made room
    pub async fn on_drain(&self, direction: Direction, id: &ConnId) {
        let handles = match direction {
            Direction::ToShards => self.shards.lock().await.handles(),
            Direction::ToClients => self.clients.read().await.handles(),
        };
        let queue = match direction {
            Direction::ToShards => &self.to_shards,
            Direction::ToClients => &self.to_clients,
        };
        queue.lock().await.on_drain(id, |target| handles.get(target));
    }

    pub async fn shard_count(&self) -> usize {
        self.shards.lock().await.len()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn pending(&self, direction: Direction) -> usize {
        match direction {
            Direction::ToShards => self.to_shards.lock().await.pending_len(),
            Direction::ToClients => self.to_clients.lock().await.pending_len(),
        }
    }
}
