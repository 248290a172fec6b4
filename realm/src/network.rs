//! Realm network layer: the shard and client WebSocket listeners and the
//! tasks that serve each accepted connection

use crate::backpressure::Direction;
use crate::config::RealmConfig;
use crate::router::{ConnAction, Router, ShardState};
use crate::transport::{spawn_writer, ConnectionHandle};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use shared::{CloseReason, ConnId, TokenAuthority};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::{accept_async, WebSocketStream};

#[derive(Error, Debug)]
pub enum RealmError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("listener error: {0}")]
    Io(#[from] io::Error),
}

/// Aborts the periodic tasks when the server future is dropped
struct TaskSet(Vec<JoinHandle<()>>);

impl Drop for TaskSet {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Broker accepting shards on one port and clients on another
pub struct RealmServer {
    config: RealmConfig,
    router: Arc<Router>,
    shard_listener: TcpListener,
    client_listener: TcpListener,
}

impl RealmServer {
    pub async fn bind(config: RealmConfig, authority: TokenAuthority) -> Result<Self, RealmError> {
        let shard_listener = bind(&config.shard_addr()).await?;
        let client_listener = bind(&config.client_addr()).await?;
        info!(
            "Realm listening for shards on {} and clients on {}",
            shard_listener.local_addr()?,
            client_listener.local_addr()?
        );

        Ok(Self {
            router: Arc::new(Router::new(&config, authority)),
            config,
            shard_listener,
            client_listener,
        })
    }

    pub fn shard_addr(&self) -> Result<SocketAddr, RealmError> {
        Ok(self.shard_listener.local_addr()?)
    }

    pub fn client_addr(&self) -> Result<SocketAddr, RealmError> {
        Ok(self.client_listener.local_addr()?)
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// Accepts connections until the future is dropped
    pub async fn run(self) -> Result<(), RealmError> {
        let (shard_drain_tx, shard_drain_rx) = mpsc::unbounded_channel();
        let (client_drain_tx, client_drain_rx) = mpsc::unbounded_channel();

        let _tasks = TaskSet(vec![
            self.router.spawn_maintenance(),
            spawn_drain_dispatcher(self.router(), Direction::ToShards, shard_drain_rx),
            spawn_drain_dispatcher(self.router(), Direction::ToClients, client_drain_rx),
        ]);

        loop {
            tokio::select! {
                accepted = self.shard_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(serve_shard(
                            self.router(),
                            stream,
                            addr,
                            self.config.clone(),
                            shard_drain_tx.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Error accepting shard connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                accepted = self.client_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(serve_client(
                            self.router(),
                            stream,
                            addr,
                            self.config.clone(),
                            client_drain_tx.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Error accepting client connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }
    }
}

async fn bind(addr: &str) -> Result<TcpListener, RealmError> {
    TcpListener::bind(addr).await.map_err(|source| RealmError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Forwards writer drain signals to the direction's queue
fn spawn_drain_dispatcher(
    router: Arc<Router>,
    direction: Direction,
    mut drained: mpsc::UnboundedReceiver<ConnId>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(id) = drained.recv().await {
            router.on_drain(direction, &id).await;
        }
    })
}

/// Completes the WebSocket upgrade, giving up on peers that stall it
async fn upgrade(
    stream: TcpStream,
    addr: SocketAddr,
    limit: Duration,
) -> Option<WebSocketStream<TcpStream>> {
    match timeout(limit, accept_async(stream)).await {
        Ok(Ok(ws)) => Some(ws),
        Ok(Err(e)) => {
            debug!("WebSocket handshake with {} failed: {}", addr, e);
            None
        }
        Err(_) => {
            warn!("{} did not complete the WebSocket upgrade within {:?}", addr, limit);
            None
        }
    }
}

async fn serve_client(
    router: Arc<Router>,
    stream: TcpStream,
    addr: SocketAddr,
    config: RealmConfig,
    drain_tx: mpsc::UnboundedSender<ConnId>,
) {
    let Some(ws) = upgrade(stream, addr, config.handshake_timeout).await else {
        return;
    };
    let (sink, mut frames) = ws.split();

    let id = ConnId::random(ConnId::CLIENT_BYTES);
    let (handle, rx) = ConnectionHandle::channel(id.clone(), config.outbound_capacity);
    spawn_writer(sink, rx, &handle, drain_tx);
    router.client_connected(handle.clone(), addr).await;

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Client {} read error: {}", id, e);
                break;
            }
        };
        if frame.is_close() {
            break;
        }

        if let ConnAction::Close(reason) = router.client_message(&id, &frame).await {
            info!("Closing client {}: {}", id, reason);
            handle.close(reason).await;
            break;
        }
    }

    router.client_disconnected(&id).await;
}

async fn serve_shard(
    router: Arc<Router>,
    stream: TcpStream,
    addr: SocketAddr,
    config: RealmConfig,
    drain_tx: mpsc::UnboundedSender<ConnId>,
) {
    let Some(ws) = upgrade(stream, addr, config.handshake_timeout).await else {
        return;
    };
    let (sink, mut frames) = ws.split();

    let id = ConnId::random(ConnId::SHARD_BYTES);
    let (handle, rx) = ConnectionHandle::channel(id, config.outbound_capacity);
    spawn_writer(sink, rx, &handle, drain_tx);
    let mut session = router.shard_connected(handle.clone(), addr);
    let deadline = Instant::now() + config.handshake_timeout;

    loop {
        let next = if session.state == ShardState::Registered {
            frames.next().await
        } else {
            match timeout_at(deadline, frames.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(
                        "Shard {} did not authenticate within {:?}",
                        session.id(),
                        config.handshake_timeout
                    );
                    handle.close(CloseReason::HandshakeTimeout).await;
                    break;
                }
            }
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!("Shard {} read error: {}", session.id(), e);
                break;
            }
            None => break,
        };
        if frame.is_close() {
            break;
        }

        if let ConnAction::Close(reason) = router.shard_message(&mut session, &frame).await {
            info!("Closing shard {}: {}", session.id(), reason);
            handle.close(reason).await;
            break;
        }
    }

    router.shard_disconnected(&mut session).await;
}
