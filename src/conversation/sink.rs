//! # Outbound Sink
//!
//! The only path from a session to its client. Producers (transcript aggregator, text
//! relay, audio relay, the session loop itself) call [`OutboundSink::submit`]; one writer
//! task owns the [`ClientWriter`] and performs every write, so writes to the connection
//! are never interleaved.
//!
//! The queue is unbounded: a slow client makes packets wait, it never blocks a producer.
//! When a write fails the writer task exits, the queue closes, and every later `submit`
//! reports [`ConversationError::SinkClosed`].

use crate::conversation::messages::ServerMessage;
use crate::conversation::turn::TurnId;
use crate::error::ConversationError;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// One unit of output, tagged with the turn that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub turn_id: Option<TurnId>,
    pub frame: OutboundFrame,
}

impl OutboundPacket {
    pub fn message(turn_id: Option<TurnId>, message: &ServerMessage) -> Result<Self, ConversationError> {
        let json = serde_json::to_string(message)
            .map_err(|e| ConversationError::Internal(format!("cannot encode outbound message: {}", e)))?;
        Ok(Self {
            turn_id,
            frame: OutboundFrame::Text(json),
        })
    }

    pub fn audio(turn_id: TurnId, audio: Vec<u8>) -> Self {
        Self {
            turn_id: Some(turn_id),
            frame: OutboundFrame::Binary(audio),
        }
    }
}

/// The transport's write half, as seen by the sink's writer task.
#[async_trait]
pub trait ClientWriter: Send + 'static {
    async fn write(&mut self, packet: OutboundPacket) -> Result<(), ConversationError>;

    /// Close the client connection.
    async fn close(&mut self);
}

enum SinkCommand {
    Packet(OutboundPacket),
    /// Acknowledged once every command queued before it has been handled.
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

/// Cloneable handle producers use to reach the writer task.
#[derive(Clone)]
pub struct OutboundSink {
    tx: mpsc::UnboundedSender<SinkCommand>,
}

impl OutboundSink {
    /// Start the writer task for one session.
    pub fn spawn<W: ClientWriter>(writer: W, session_id: Uuid) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_writer(writer, rx, session_id));
        (Self { tx }, worker)
    }

    pub fn submit(&self, packet: OutboundPacket) -> Result<(), ConversationError> {
        self.tx
            .send(SinkCommand::Packet(packet))
            .map_err(|_| ConversationError::SinkClosed)
    }

    pub fn send_message(&self, turn_id: Option<TurnId>, message: ServerMessage) -> Result<(), ConversationError> {
        self.submit(OutboundPacket::message(turn_id, &message)?)
    }

    /// Wait until everything submitted before this call has been written to the client.
    pub async fn drained(&self) -> Result<(), ConversationError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(SinkCommand::Barrier(ack_tx))
            .map_err(|_| ConversationError::SinkClosed)?;
        ack_rx.await.map_err(|_| ConversationError::SinkClosed)
    }

    /// Stop accepting packets. What is already queued is still written, then the
    /// connection is closed.
    pub fn shutdown(&self) {
        let _ = self.tx.send(SinkCommand::Shutdown);
    }

    /// Resolves once the writer task has stopped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run_writer<W: ClientWriter>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<SinkCommand>,
    session_id: Uuid,
) {
    while let Some(command) = rx.recv().await {
        match command {
            SinkCommand::Packet(packet) => {
                if let Err(err) = writer.write(packet).await {
                    warn!(%session_id, "Client write failed, closing outbound sink: {}", err);
                    break;
                }
            }
            SinkCommand::Barrier(ack) => {
                let _ = ack.send(());
            }
            SinkCommand::Shutdown => {
                debug!(%session_id, "Outbound sink shutting down");
                break;
            }
        }
    }

    // Refuse new packets before the (possibly slow) close; queued barriers are dropped
    // with the receiver, which wakes their waiters with SinkClosed.
    rx.close();
    writer.close().await;
}
