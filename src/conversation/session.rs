//! # Session Loop
//!
//! One per client connection. The loop owns the session's turns and is the only place
//! inbound frames are interpreted:
//!
//! - **binary frames** are audio for the Listening turn. While the previous turn is still
//!   replying there is no Listening turn; the audio is held back (up to a limit) and
//!   replayed into the next turn once it opens.
//! - **text frames** are JSON control messages: `audioEnd` finalizes the spoken turn,
//!   any other type with text is typed input, `ping` is answered with `pong`.
//!
//! At most one turn is Listening and at most one is Responding. A new end-of-turn waits
//! for the Responding turn to close first, so turns never overlap on the wire.
//!
//! Bad input costs only the offending frame: it is logged, counted, and answered with an
//! `error` packet. Fatal errors (STT unrecoverable, client gone) end the loop, and teardown
//! cancels the session token so every turn task stops before the connection is closed.

use crate::config::AppConfig;
use crate::conversation::messages::{ControlAction, ControlMessage, ServerMessage};
use crate::conversation::sink::{ClientWriter, OutboundSink};
use crate::conversation::turn::{ResponseHandle, Turn, TurnController, TurnReport, TurnSettings};
use crate::conversation::Services;
use crate::error::ConversationError;
use crate::state::{ConversationMetrics, SessionSlot};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long teardown waits for queued packets to reach the client.
const SINK_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// A frame received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Audio(Vec<u8>),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub turn: TurnSettings,
    pub max_pending_audio_frames: usize,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            turn: TurnSettings::from_config(config),
            max_pending_audio_frames: config.session.max_pending_audio_frames,
        }
    }
}

pub struct SessionLoop {
    id: Uuid,
    controller: TurnController,
    sink: OutboundSink,
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
    cancel: CancellationToken,
    metrics: Arc<ConversationMetrics>,
    /// Held for the whole run; dropping it frees the place under the session limit.
    _slot: SessionSlot,
    listening: Option<Turn>,
    responding: Option<ResponseHandle>,
    pending_audio: VecDeque<Vec<u8>>,
    max_pending_audio: usize,
}

impl SessionLoop {
    /// Set up a session writing to `writer` and reading frames from `inbound`. Nothing
    /// happens until [`SessionLoop::run`]; the session counts as active from the moment
    /// `slot` was reserved until the loop is dropped.
    pub fn new<W: ClientWriter>(
        id: Uuid,
        writer: W,
        inbound: mpsc::UnboundedReceiver<InboundFrame>,
        services: Services,
        settings: SessionSettings,
        slot: SessionSlot,
    ) -> Self {
        let metrics = slot.metrics().clone();
        let (sink, _writer_task) = OutboundSink::spawn(writer, id);
        let cancel = CancellationToken::new();
        let controller = TurnController::new(
            services,
            sink.clone(),
            settings.turn,
            metrics.clone(),
            cancel.clone(),
        );

        Self {
            id,
            controller,
            sink,
            inbound,
            cancel,
            metrics,
            _slot: slot,
            listening: None,
            responding: None,
            pending_audio: VecDeque::new(),
            max_pending_audio: settings.max_pending_audio_frames,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run until the client goes away or a fatal error occurs, then tear down.
    pub async fn run(mut self) -> Result<(), ConversationError> {
        let session_id = self.id;
        info!(%session_id, "Voice session started");

        let result = self.drive().await;
        match &result {
            Ok(()) => info!(%session_id, "Client disconnected, ending session"),
            Err(err) => {
                self.metrics.fatal_error();
                error!(%session_id, code = err.code(), "Session failed: {}", err);
            }
        }

        self.teardown().await;
        info!(%session_id, "Voice session closed");
        result
    }

    async fn drive(&mut self) -> Result<(), ConversationError> {
        self.listening = Some(self.controller.start_turn().await?);

        loop {
            tokio::select! {
                biased;

                _ = self.sink.closed() => return Err(ConversationError::SinkClosed),

                report = next_response(&mut self.responding) => {
                    self.responding = None;
                    self.open_next_turn(report?).await?;
                }

                frame = self.inbound.recv() => {
                    let Some(frame) = frame else { return Ok(()) };
                    if let Err(err) = self.handle_frame(frame).await {
                        if err.is_fatal() {
                            return Err(err);
                        }
                        self.reject(err);
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: InboundFrame) -> Result<(), ConversationError> {
        match frame {
            InboundFrame::Audio(audio) => self.on_audio(audio).await,
            InboundFrame::Text(raw) => {
                let action = ControlMessage::parse(&raw)?.action()?;
                self.on_control(action).await
            }
        }
    }

    async fn on_audio(&mut self, audio: Vec<u8>) -> Result<(), ConversationError> {
        match self.listening.as_mut() {
            Some(turn) => self.controller.send_audio(turn, &audio).await,
            None => {
                self.hold_audio(audio);
                Ok(())
            }
        }
    }

    fn hold_audio(&mut self, audio: Vec<u8>) {
        if self.pending_audio.len() < self.max_pending_audio {
            self.pending_audio.push_back(audio);
            return;
        }
        self.metrics.audio_frame_rejected();
        warn!(
            session_id = %self.id,
            replying_turn = ?self.responding.as_ref().map(|r| r.turn_id()),
            bytes = audio.len(),
            "Audio backlog full while the bot is replying, dropping frame"
        );
        self.report(&ConversationError::AudioBacklogFull {
            limit: self.max_pending_audio,
        });
    }

    async fn on_control(&mut self, action: ControlAction) -> Result<(), ConversationError> {
        match action {
            ControlAction::Ping => self.sink.send_message(None, ServerMessage::Pong),
            ControlAction::EndOfAudio { conversation_id } => {
                let mut turn = self.take_listening_turn().await?;
                info!(session_id = %self.id, turn_id = turn.id(), "End of audio, compiling transcript");
                let utterance = self.controller.finalize(&mut turn).await?;
                if utterance.timed_out {
                    warn!(session_id = %self.id, turn_id = turn.id(), "Transcript may be missing its tail");
                }
                self.responding = Some(self.controller.respond(turn, utterance, conversation_id));
                Ok(())
            }
            ControlAction::TypedText { conversation_id, text } => {
                let mut turn = self.take_listening_turn().await?;
                debug!(session_id = %self.id, turn_id = turn.id(), "Typed input replaces spoken input");
                let utterance = self.controller.accept_text(&mut turn, &text).await?;
                self.responding = Some(self.controller.respond(turn, utterance, conversation_id));
                Ok(())
            }
        }
    }

    /// The Listening turn. If the previous turn is still replying, wait for it to close
    /// and for the next turn to open first.
    async fn take_listening_turn(&mut self) -> Result<Turn, ConversationError> {
        if let Some(mut previous) = self.responding.take() {
            debug!(session_id = %self.id, turn_id = previous.turn_id(), "Waiting for reply to finish before ending next turn");
            let report = previous.finish().await?;
            self.open_next_turn(report).await?;
        }
        self.listening
            .take()
            .ok_or_else(|| ConversationError::Internal("no listening turn".to_string()))
    }

    /// The previous turn has closed: open the next one and feed it the audio that
    /// arrived in between.
    async fn open_next_turn(&mut self, report: TurnReport) -> Result<(), ConversationError> {
        info!(session_id = %self.id, turn_id = report.turn_id, outcome = ?report.outcome, "Turn closed");

        let mut turn = self.controller.start_turn().await?;
        let backlog = self.pending_audio.len();
        while let Some(audio) = self.pending_audio.pop_front() {
            self.controller.send_audio(&mut turn, &audio).await?;
        }
        if backlog > 0 {
            debug!(session_id = %self.id, turn_id = turn.id(), backlog, "Replayed held-back audio");
        }
        self.listening = Some(turn);
        Ok(())
    }

    fn reject(&mut self, err: ConversationError) {
        self.metrics.message_rejected();
        warn!(session_id = %self.id, code = err.code(), "Inbound frame rejected: {}", err);
        self.report(&err);
    }

    /// Tell the client about a dropped frame or message.
    fn report(&self, err: &ConversationError) {
        if self.sink.send_message(None, ServerMessage::error(err)).is_err() {
            debug!(session_id = %self.id, "Outbound sink closed, rejection not reported");
        }
    }

    async fn teardown(&mut self) {
        self.cancel.cancel();

        if let Some(responding) = self.responding.take() {
            debug!(session_id = %self.id, turn_id = responding.turn_id(), "Aborting reply in flight");
            responding.abort().await;
        }
        if let Some(turn) = self.listening.take() {
            self.controller.discard(turn).await;
        }
        if !self.pending_audio.is_empty() {
            debug!(session_id = %self.id, frames = self.pending_audio.len(), "Dropping held-back audio");
            self.pending_audio.clear();
        }

        self.sink.shutdown();
        if tokio::time::timeout(SINK_CLOSE_GRACE, self.sink.closed()).await.is_err() {
            warn!(session_id = %self.id, "Client connection did not close in time");
        }
    }
}

async fn next_response(slot: &mut Option<ResponseHandle>) -> Result<TurnReport, ConversationError> {
    match slot {
        Some(handle) => handle.finish().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::sink::OutboundFrame;
    use crate::conversation::testing::{eventually, services, EchoSynth, RecordingWriter, ScriptedLlm, ScriptedStt};
    use crate::conversation::turn::TurnState;
    use tokio::task::JoinHandle;

    struct Harness {
        frames: mpsc::UnboundedSender<InboundFrame>,
        session: JoinHandle<Result<(), ConversationError>>,
        writer: RecordingWriter,
        stt: ScriptedStt,
        llm: ScriptedLlm,
        metrics: Arc<ConversationMetrics>,
    }

    fn settings(max_pending_audio_frames: usize) -> SessionSettings {
        SessionSettings {
            turn: TurnSettings {
                finalize_timeout: Duration::from_secs(2),
                stt_open_attempts: 2,
                stt_open_backoff: Duration::from_millis(1),
                min_speech_chars: 5,
            },
            max_pending_audio_frames,
        }
    }

    fn start_session(writer: RecordingWriter, stt: ScriptedStt, max_pending_audio_frames: usize) -> Harness {
        start_session_with(writer, stt, EchoSynth::new(), settings(max_pending_audio_frames))
    }

    fn start_session_with(
        writer: RecordingWriter,
        stt: ScriptedStt,
        tts: EchoSynth,
        settings: SessionSettings,
    ) -> Harness {
        let llm = ScriptedLlm::new();
        let metrics = Arc::new(ConversationMetrics::default());
        let slot = metrics.try_reserve_session(1).expect("session slot");
        let (frames, inbound) = mpsc::unbounded_channel();
        let session = SessionLoop::new(
            Uuid::new_v4(),
            writer.clone(),
            inbound,
            services(stt.clone(), llm.clone(), tts),
            settings,
            slot,
        );
        Harness {
            frames,
            session: tokio::spawn(session.run()),
            writer,
            stt,
            llm,
            metrics,
        }
    }

    fn audio_end(conversation_id: &str) -> InboundFrame {
        InboundFrame::Text(format!(
            r#"{{"text":"","conversationId":"{}","type":"audioEnd"}}"#,
            conversation_id
        ))
    }

    fn typed(text: &str, conversation_id: &str) -> InboundFrame {
        InboundFrame::Text(format!(
            r#"{{"text":"{}","conversationId":"{}","type":"text"}}"#,
            text, conversation_id
        ))
    }

    fn listening(turn_id: u64) -> impl Fn(&[ServerMessage]) -> bool {
        move |messages| {
            messages.contains(&ServerMessage::Status {
                turn_id,
                state: TurnState::Listening,
            })
        }
    }

    fn closed(turn_id: u64) -> impl Fn(&[ServerMessage]) -> bool {
        move |messages| {
            messages.contains(&ServerMessage::Status {
                turn_id,
                state: TurnState::Closed,
            })
        }
    }

    #[tokio::test]
    async fn test_consecutive_turns_never_interleave() {
        let h = start_session(RecordingWriter::new(), ScriptedStt::new(), 16);
        h.llm.reply("hello", &["hi", " there"]);

        h.frames.send(InboundFrame::Audio(b"hello".to_vec())).unwrap();
        h.frames.send(audio_end("c1")).unwrap();
        h.frames.send(InboundFrame::Audio(b"again".to_vec())).unwrap();
        h.frames.send(audio_end("c1")).unwrap();
        h.writer.wait_for(closed(2)).await;

        drop(h.frames);
        h.session.await.unwrap().unwrap();

        let packets = h.writer.packets();
        let last_of_first = packets.iter().rposition(|p| p.turn_id == Some(1)).unwrap();
        let first_of_second = packets.iter().position(|p| p.turn_id == Some(2)).unwrap();
        assert!(last_of_first < first_of_second);
        assert_eq!(
            packets[last_of_first].frame,
            OutboundFrame::Text(r#"{"type":"status","turnId":1,"state":"closed"}"#.to_string())
        );

        let audio: Vec<_> = packets
            .iter()
            .filter(|p| p.turn_id == Some(1) && matches!(p.frame, OutboundFrame::Binary(_)))
            .collect();
        assert_eq!(audio.len(), 1);

        assert_eq!(h.stt.received(), vec![b"hello".to_vec(), b"again".to_vec()]);
        assert_eq!(
            h.llm.calls(),
            vec![
                ("hello".to_string(), "c1".to_string()),
                ("again".to_string(), "c1".to_string())
            ]
        );
        assert_eq!(h.metrics.snapshot().turns_completed, 2);
        assert_eq!(h.metrics.snapshot().active_sessions, 0);
        assert!(h.writer.is_closed());
    }

    #[tokio::test]
    async fn test_missing_conversation_id_is_rejected_and_session_continues() {
        let h = start_session(RecordingWriter::new(), ScriptedStt::new(), 16);

        h.frames.send(typed("hi", "")).unwrap();
        h.frames.send(typed("hi again", "c9")).unwrap();
        h.writer.wait_for(closed(1)).await;

        assert_eq!(h.llm.calls(), vec![("hi again".to_string(), "c9".to_string())]);
        assert!(h.writer.messages().contains(&ServerMessage::Error {
            code: "missing_conversation_id".to_string(),
            message: "message has no conversationId".to_string(),
        }));
        assert_eq!(h.metrics.snapshot().rejected_messages, 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_and_ping() {
        let h = start_session(RecordingWriter::new(), ScriptedStt::new(), 16);

        h.frames.send(InboundFrame::Text("{nope".to_string())).unwrap();
        h.frames.send(InboundFrame::Text(r#"{"type":"ping"}"#.to_string())).unwrap();
        h.writer
            .wait_for(|messages| messages.contains(&ServerMessage::Pong))
            .await;

        assert!(h
            .writer
            .messages()
            .iter()
            .any(|m| matches!(m, ServerMessage::Error { code, .. } if code == "invalid_message")));
        assert!(h.llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_audio_during_reply_is_replayed_into_next_turn() {
        let stt = ScriptedStt::new();
        let h = start_session(RecordingWriter::new(), stt, 1);
        h.llm.reply("first", &["one", " two", " three"]);

        h.frames.send(typed("first", "c1")).unwrap();
        // Turn 1 is replying; these arrive before turn 2 exists.
        h.frames.send(InboundFrame::Audio(b"next".to_vec())).unwrap();
        h.frames.send(InboundFrame::Audio(b"overflow".to_vec())).unwrap();
        h.frames.send(audio_end("c1")).unwrap();
        h.writer.wait_for(closed(2)).await;

        let calls = h.llm.calls();
        assert_eq!(calls[0].0, "first");
        // Depending on timing the audio either went straight to turn 2 or was held back.
        // Either way turn 2 heard it, and nothing beyond the backlog limit was kept.
        let heard = &calls[1].0;
        assert!(heard == "nextoverflow" || heard == "next", "turn 2 heard {:?}", heard);
        if heard == "next" {
            assert_eq!(h.metrics.snapshot().rejected_audio_frames, 1);
        }
    }

    #[tokio::test]
    async fn test_client_write_failure_ends_session() {
        let writer = RecordingWriter::failing_after(0);
        let h = start_session(writer.clone(), ScriptedStt::new(), 16);

        let result = h.session.await.unwrap();
        assert!(matches!(result, Err(ConversationError::SinkClosed)));
        assert!(writer.is_closed());
        assert_eq!(h.metrics.snapshot().fatal_errors, 1);
    }

    #[tokio::test]
    async fn test_unrecoverable_stt_ends_session() {
        let stt = ScriptedStt::new();
        let h = start_session(RecordingWriter::new(), stt.clone(), 16);
        h.writer.wait_for(listening(1)).await;

        stt.fail_next_sends(2);
        h.frames.send(InboundFrame::Audio(b"lost".to_vec())).unwrap();

        let result = h.session.await.unwrap();
        assert!(matches!(result, Err(ConversationError::SttUnrecoverable { .. })));
        assert!(h.writer.is_closed());
    }

    #[tokio::test]
    async fn test_disconnect_mid_reply_stops_turn_tasks() {
        let tts = EchoSynth::stalled();
        let h = start_session_with(RecordingWriter::new(), ScriptedStt::new(), tts.clone(), settings(16));
        h.llm.reply_then_stall("hello", &["Hello there, friend. ", "How"]);

        h.frames.send(typed("hello", "c1")).unwrap();
        h.writer
            .wait_for(|messages| {
                messages.contains(&ServerMessage::BotText {
                    turn_id: 1,
                    text: "How".to_string(),
                })
            })
            .await;
        eventually(|| tts.in_flight() == 1).await;
        assert_eq!(h.llm.open_replies(), 1);
        assert_eq!(h.metrics.active_sessions(), 1);

        drop(h.frames);
        let result = tokio::time::timeout(Duration::from_secs(2), h.session)
            .await
            .expect("session should end promptly after disconnect")
            .unwrap();

        assert!(result.is_ok());
        assert!(h.writer.is_closed());
        assert_eq!(h.llm.open_replies(), 0);
        assert_eq!(h.metrics.active_sessions(), 0);
        eventually(|| tts.in_flight() == 0).await;
        assert!(!h.writer.messages().contains(&ServerMessage::Status {
            turn_id: 1,
            state: TurnState::Closed,
        }));
    }

    #[tokio::test]
    async fn test_fatal_error_mid_reply_stops_turn_tasks() {
        // The client takes the first few packets of the reply, then goes away.
        let writer = RecordingWriter::failing_after(4);
        let h = start_session(writer.clone(), ScriptedStt::new(), 16);
        h.llm.reply_then_stall("hello", &["a", "b", "c", "d", "e"]);

        h.frames.send(typed("hello", "c1")).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), h.session)
            .await
            .expect("session should end promptly on a failed write")
            .unwrap();

        assert!(matches!(result, Err(ConversationError::SinkClosed)));
        assert!(writer.is_closed());
        assert_eq!(h.llm.open_replies(), 0);
        assert_eq!(h.metrics.active_sessions(), 0);
        assert_eq!(h.metrics.snapshot().fatal_errors, 1);
    }

    #[tokio::test]
    async fn test_finalize_timeout_without_fragments_closes_turn_without_reply() {
        let stt = ScriptedStt::new();
        stt.ignore_flush();
        let mut settings = settings(16);
        settings.turn.finalize_timeout = Duration::from_millis(50);
        let h = start_session_with(RecordingWriter::new(), stt, EchoSynth::new(), settings);
        h.writer.wait_for(listening(1)).await;

        h.frames.send(audio_end("c1")).unwrap();
        h.writer.wait_for(closed(1)).await;
        h.writer.wait_for(listening(2)).await;

        assert!(h.llm.calls().is_empty());
        assert_eq!(h.metrics.snapshot().turns_without_reply, 1);
        assert!(!h
            .writer
            .messages()
            .iter()
            .any(|m| matches!(m, ServerMessage::BotText { .. } | ServerMessage::Error { .. })));

        // The session is still usable afterwards.
        h.frames.send(typed("still there?", "c1")).unwrap();
        h.writer.wait_for(closed(2)).await;
        assert_eq!(h.llm.calls(), vec![("still there?".to_string(), "c1".to_string())]);
    }

    #[tokio::test]
    async fn test_audio_beyond_backlog_is_reported_to_client() {
        let h = start_session(RecordingWriter::new(), ScriptedStt::new(), 1);
        h.llm.reply_then_stall("first", &["thinking"]);

        h.frames.send(typed("first", "c1")).unwrap();
        h.writer
            .wait_for(|messages| {
                messages.contains(&ServerMessage::BotText {
                    turn_id: 1,
                    text: "thinking".to_string(),
                })
            })
            .await;

        h.frames.send(InboundFrame::Audio(b"kept".to_vec())).unwrap();
        h.frames.send(InboundFrame::Audio(b"dropped".to_vec())).unwrap();
        h.writer
            .wait_for(|messages| {
                messages
                    .iter()
                    .any(|m| matches!(m, ServerMessage::Error { code, .. } if code == "audio_rejected"))
            })
            .await;

        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.rejected_audio_frames, 1);
        assert_eq!(snapshot.rejected_messages, 0);
        assert!(h.stt.received().is_empty());
    }
}
