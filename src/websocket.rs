//! # Voice Session WebSocket
//!
//! Clients connect to `/ws` and hold one voice conversation per connection.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the upgrade is refused with 503 when the session limit is reached
//! 2. **Audio Streaming**: binary messages carry raw audio for the current turn
//! 3. **Control**: text messages carry JSON such as `{"type":"audioEnd","conversationId":"..."}`
//! 4. **Replies**: the server streams `transcript`, `botText`, `botTextEnd` and `status`
//!    JSON messages, plus one binary message with the reply audio per turn
//!
//! ## Actor Model:
//! The actor only moves frames. Inbound frames are forwarded over a channel to the
//! session's [`SessionLoop`], which runs as an ordinary tokio task. Outbound packets come
//! back as actor messages through [`ActorWriter`], the session's [`ClientWriter`].

use crate::conversation::{ClientWriter, InboundFrame, OutboundFrame, OutboundPacket, SessionLoop, SessionSettings};
use crate::error::{AppError, ConversationError};
use crate::state::{AppState, SessionSlot};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Write one outbound frame to the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct WriteFrame(OutboundFrame);

/// Close the socket after the session has finished.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseSocket;

/// The session's handle on the socket. Each write waits for the actor to take the frame,
/// so a failed write means the connection is gone.
struct ActorWriter {
    addr: Addr<ConversationSocket>,
}

#[async_trait]
impl ClientWriter for ActorWriter {
    async fn write(&mut self, packet: OutboundPacket) -> Result<(), ConversationError> {
        self.addr
            .send(WriteFrame(packet.frame))
            .await
            .map_err(|err| ConversationError::Transport(err.to_string()))
    }

    async fn close(&mut self) {
        self.addr.do_send(CloseSocket);
    }
}

/// WebSocket actor for one voice session.
pub struct ConversationSocket {
    session_id: Uuid,
    state: web::Data<AppState>,

    /// Feeds the session loop; dropping it ends the session.
    inbound: Option<mpsc::UnboundedSender<InboundFrame>>,

    /// Reserved at upgrade time and handed to the session loop once the actor starts.
    slot: Option<SessionSlot>,

    last_heartbeat: Instant,
}

impl ConversationSocket {
    pub fn new(state: web::Data<AppState>, slot: SessionSlot) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            state,
            inbound: None,
            slot: Some(slot),
            last_heartbeat: Instant::now(),
        }
    }

    fn forward(&mut self, frame: InboundFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let delivered = self
            .inbound
            .as_ref()
            .map(|inbound| inbound.send(frame).is_ok())
            .unwrap_or(false);
        if !delivered {
            debug!(session_id = %self.session_id, "Session already ended, closing socket");
            ctx.stop();
        }
    }
}

impl Actor for ConversationSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Start the session loop and the heartbeat.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection started");

        let Some(slot) = self.slot.take() else {
            error!(session_id = %self.session_id, "Connection started without a session slot");
            ctx.stop();
            return;
        };

        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        self.inbound = Some(inbound);

        let config = self.state.get_config();
        let session = SessionLoop::new(
            self.session_id,
            ActorWriter { addr: ctx.address() },
            inbound_rx,
            self.state.services.clone(),
            SessionSettings::from_config(&config),
            slot,
        );
        let session_id = session.id();
        tokio::spawn(async move {
            if let Err(err) = session.run().await {
                debug!(%session_id, "Session ended with error: {}", err);
            }
        });

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection stopped");
        self.inbound.take();
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConversationSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.forward(InboundFrame::Text(text.to_string()), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.forward(InboundFrame::Audio(data.to_vec()), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, "WebSocket closed by client: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<WriteFrame> for ConversationSocket {
    type Result = ();

    fn handle(&mut self, msg: WriteFrame, ctx: &mut Self::Context) {
        match msg.0 {
            OutboundFrame::Text(text) => ctx.text(text),
            OutboundFrame::Binary(audio) => ctx.binary(audio),
        }
    }
}

impl Handler<CloseSocket> for ConversationSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseSocket, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Checks the session limit, then upgrades the request. The conversation itself runs
/// in the [`ConversationSocket`] actor and its session loop.
pub async fn conversation_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    // Reserved before the handshake so concurrent upgrades cannot overshoot the limit.
    // A failed handshake drops the actor, and with it the slot.
    let Some(slot) = app_state.reserve_session() else {
        warn!(
            active_sessions = app_state.metrics.active_sessions(),
            "Session limit reached, refusing WebSocket upgrade"
        );
        return Err(AppError::Unavailable("too many active voice sessions".to_string()).into());
    };

    ws::start(ConversationSocket::new(app_state, slot), &req, stream)
}
