//! Shard network layer: dials the realm and runs the session

use crate::config::WorkerConfig;
use crate::error::ShardError;
use crate::telemetry::HostProbe;
use crate::worker::{ShardWorker, WorkerAction};
use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{CloseReason, ConnId, Packet, ProtocolError, TokenAuthority};
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

/// One shard's connection to the realm
pub struct ShardNode {
    config: WorkerConfig,
    worker: ShardWorker,
    probe: Box<dyn HostProbe>,
}

impl ShardNode {
    pub fn new(config: WorkerConfig, authority: TokenAuthority, probe: Box<dyn HostProbe>) -> Self {
        Self {
            config,
            worker: ShardWorker::new(authority),
            probe,
        }
    }

    pub fn assigned_id(&self) -> Option<&ConnId> {
        self.worker.assigned_id()
    }

    /// Connects, authenticates and serves tasks until the realm closes the
    /// connection. Returns an error if the realm is unreachable, does not
    /// answer the handshake in time, or the secret turns out to be wrong.
    pub async fn run(&mut self) -> Result<(), ShardError> {
        let url = self.config.realm_url();
        let handshake_timeout = self.config.handshake_timeout;
        info!("Connecting to the realm at {}", url);

        let (ws, _) = match timeout(handshake_timeout, connect_async(url.as_str())).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(source)) => return Err(ShardError::Connect { url, source }),
            Err(_) => return Err(ShardError::HandshakeTimeout(handshake_timeout)),
        };
        let (mut sink, mut frames) = ws.split();

        let hello = self.worker.hello(self.config.advertise_ip.as_deref())?;
        send_packet(&mut sink, &hello).await?;

        let deadline = Instant::now() + handshake_timeout;
        let mut heartbeat = interval(self.config.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                frame = frames.next() => {
                    let frame = match frame {
                        Some(frame) => frame?,
                        None => return Err(ShardError::Closed("connection dropped".to_string())),
                    };
                    if let Message::Close(close_frame) = &frame {
                        let (code, reason) = match close_frame {
                            Some(close_frame) => {
                                (u16::from(close_frame.code), close_frame.reason.to_string())
                            }
                            None => (1005, "No reason provided".to_string()),
                        };
                        info!("Disconnected - Code: {} Reason: {}", code, reason);
                        return Ok(());
                    }
                    self.on_frame(&mut sink, frame).await?;
                }
                _ = heartbeat.tick(), if self.worker.is_registered() => {
                    let beat = self.worker.heartbeat(self.probe.sample())?;
                    send_packet(&mut sink, &beat).await?;
                }
                _ = sleep_until(deadline), if !self.worker.is_registered() => {
                    warn!("Realm did not acknowledge within {:?}", handshake_timeout);
                    close(&mut sink, CloseReason::HandshakeTimeout).await;
                    return Err(ShardError::HandshakeTimeout(handshake_timeout));
                }
            }
        }
    }

    async fn on_frame<S>(&mut self, sink: &mut S, frame: Message) -> Result<(), ShardError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let packet = match frame {
            Message::Text(text) => match Packet::decode(text.as_str()) {
                Ok(packet) => packet,
                Err(e) => {
                    close(sink, CloseReason::InvalidPacket).await;
                    return Err(e.into());
                }
            },
            Message::Binary(_) => {
                close(sink, CloseReason::InvalidPacket).await;
                return Err(ProtocolError::NonTextFrame.into());
            }
            _ => return Ok(()),
        };

        match self.worker.handle(packet)? {
            WorkerAction::Registered(id) => debug!("Registered as {}", id),
            WorkerAction::Reply(reply) => send_packet(sink, &reply).await?,
            WorkerAction::Rejected(reason) => {
                close(sink, CloseReason::InvalidToken).await;
                return Err(ShardError::Rejected(reason));
            }
            WorkerAction::Terminate(reason) => {
                close(sink, reason).await;
                return Err(ShardError::Untrusted(reason));
            }
            WorkerAction::Ignore => {}
        }
        Ok(())
    }
}

async fn send_packet<S>(sink: &mut S, packet: &Packet) -> Result<(), ShardError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::text(packet.encode()?)).await?;
    Ok(())
}

async fn close<S>(sink: &mut S, reason: CloseReason)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let frame = Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: reason.as_str().into(),
    }));
    if let Err(e) = sink.send(frame).await {
        debug!("Failed to send close frame: {}", e);
    }
}
