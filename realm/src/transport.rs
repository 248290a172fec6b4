//! Per-connection outbound transport
//!
//! Each accepted socket gets a bounded frame channel drained by its own writer
//! task. The channel's capacity is the connection's send buffer: a full channel
//! is what the backpressure queue sees as "transport cannot accept now", and
//! the writer reporting progress after such a refusal is the drain signal.

use crate::backpressure::Outbound;
use futures_util::{Sink, SinkExt};
use log::debug;
use shared::{CloseReason, ConnId, Packet, ProtocolError};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Sending half of one connection. Clones share the same channel.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnId,
    tx: mpsc::Sender<Message>,
    congested: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Creates a handle and the receiver its writer task drains
    pub fn channel(id: ConnId, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            tx,
            congested: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    pub fn id(&self) -> &ConnId {
        &self.id
    }

    /// Queues a frame, waiting for buffer space. Used for control replies and
    /// close frames that belong to this connection alone.
    pub async fn send(&self, frame: Message) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    pub async fn send_packet(&self, packet: &Packet) -> Result<bool, ProtocolError> {
        Ok(self.send(Message::text(packet.encode()?)).await)
    }

    pub async fn close(&self, reason: CloseReason) -> bool {
        self.send(close_frame(reason)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn congested_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.congested)
    }
}

impl Outbound for ConnectionHandle {
    fn target(&self) -> &ConnId {
        &self.id
    }

    fn try_send(&self, frame: Message) -> Result<(), TrySendError<Message>> {
        match self.tx.try_send(frame) {
            Err(TrySendError::Full(frame)) => {
                self.congested.store(true, Ordering::SeqCst);
                // The writer may have emptied the buffer before the flag was
                // visible to it. A second refusal means a queued frame is
                // still ahead of the writer, so its drain signal will come.
                self.tx.try_send(frame)
            }
            other => other,
        }
    }
}

pub fn close_frame(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: reason.as_str().into(),
    }))
}

/// Classifies an inbound frame. Control frames yield `None`; binary frames
/// are rejected.
pub fn decode_frame(frame: &Message) -> Result<Option<Packet>, ProtocolError> {
    match frame {
        Message::Text(text) => Packet::decode(text.as_str()).map(Some),
        Message::Binary(_) => Err(ProtocolError::NonTextFrame),
        _ => Ok(None),
    }
}

/// Spawns the writer task for one connection.
///
/// After every frame written while the connection was marked congested, the
/// connection id is sent on `drain_tx` so its direction's queue can flush.
pub fn spawn_writer<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Message>,
    handle: &ConnectionHandle,
    drain_tx: mpsc::UnboundedSender<ConnId>,
) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    let id = handle.id().clone();
    let congested = handle.congested_flag();

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = matches!(frame, Message::Close(_));
            if let Err(e) = sink.send(frame).await {
                debug!("Write to {} failed: {}", id, e);
                break;
            }
            if closing {
                break;
            }
            if congested.swap(false, Ordering::SeqCst) && drain_tx.send(id.clone()).is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    })
}
