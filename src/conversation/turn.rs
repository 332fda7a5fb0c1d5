//! # Turn Controller
//!
//! A turn is one user utterance plus the bot's reply to it. It moves through
//!
//! ```text
//! Listening ──finalize/accept_text──▶ Finalizing ──▶ Responding ──▶ Closed
//!                                          └──── (empty utterance) ───▶ Closed
//! ```
//!
//! and never goes back. Every turn owns a child [`CancellationToken`] of its session and
//! a [`JoinSet`] with its background tasks (transcript aggregator, STT event pumps), so
//! dropping a [`Turn`] stops everything it started.
//!
//! [`TurnController`] performs the transitions that need the outside world: opening and
//! reconnecting STT streams, the finalize barrier, and handing a finalized turn to a
//! responder task that streams the LLM reply into the text and audio relays.

use crate::config::AppConfig;
use crate::conversation::aggregator::{AggregatorInput, FinalizeRequest, TranscriptAggregator, Utterance};
use crate::conversation::messages::ServerMessage;
use crate::conversation::relay::{AudioRelay, SpeechBuffer, TextRelay};
use crate::conversation::sink::OutboundSink;
use crate::conversation::Services;
use crate::error::ConversationError;
use crate::services::llm::{LanguageModel, ReplyStream};
use crate::services::stt::{SttConnection, SttEvent, SttWriter};
use crate::services::tts::SpeechSynthesizer;
use crate::state::ConversationMetrics;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Turn numbers are per session and start at 1.
pub type TurnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Listening,
    Finalizing,
    Responding,
    Closed,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Listening => "listening",
            TurnState::Finalizing => "finalizing",
            TurnState::Responding => "responding",
            TurnState::Closed => "closed",
        }
    }

    fn can_advance_to(self, next: TurnState) -> bool {
        matches!(
            (self, next),
            (TurnState::Listening, TurnState::Finalizing)
                | (TurnState::Finalizing, TurnState::Responding)
                | (TurnState::Finalizing, TurnState::Closed)
                | (TurnState::Responding, TurnState::Closed)
        )
    }
}

/// Per-turn tuning, taken from the `stt`, `tts` and `session` config sections.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub finalize_timeout: Duration,
    pub stt_open_attempts: u32,
    pub stt_open_backoff: Duration,
    pub min_speech_chars: usize,
}

impl TurnSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            finalize_timeout: config.finalize_timeout(),
            stt_open_attempts: config.stt.open_attempts,
            stt_open_backoff: config.stt_open_backoff(),
            min_speech_chars: config.tts.min_chunk_chars,
        }
    }
}

pub struct Turn {
    id: TurnId,
    state: TurnState,
    stt: Option<Box<dyn SttWriter>>,
    /// Bumped on every STT reconnect, so the aggregator can tell which stream ended.
    generation: u32,
    inputs: mpsc::UnboundedSender<AggregatorInput>,
    finalize_tx: Option<oneshot::Sender<FinalizeRequest>>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl Turn {
    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    fn advance(&mut self, next: TurnState) -> Result<(), ConversationError> {
        if !self.state.can_advance_to(next) {
            return Err(ConversationError::InvalidTransition {
                turn_id: self.id,
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        debug!(turn_id = self.id, from = self.state.as_str(), to = next.as_str(), "Turn transition");
        self.state = next;
        Ok(())
    }

    fn spawn_pump(&mut self, events: BoxStream<'static, SttEvent>) {
        self.tasks.spawn(pump_stt_events(
            events,
            self.inputs.clone(),
            self.generation,
            self.cancel.clone(),
        ));
    }

    async fn close_stt(&mut self) {
        if let Some(mut writer) = self.stt.take() {
            writer.close().await;
        }
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        // The JoinSet aborts its tasks on drop; the token reaches work spawned elsewhere.
        self.cancel.cancel();
    }
}

/// Forward one STT connection's events to the aggregator, then report its end.
async fn pump_stt_events(
    mut events: BoxStream<'static, SttEvent>,
    inputs: mpsc::UnboundedSender<AggregatorInput>,
    generation: u32,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.next() => match event {
                Some(event) => {
                    if inputs.send(AggregatorInput::Event(event)).is_err() {
                        return;
                    }
                }
                None => {
                    let _ = inputs.send(AggregatorInput::StreamEnded { generation });
                    return;
                }
            }
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Replied { reply_chars: usize, audio_bytes: usize },
    /// Nothing was said; the LLM was not called.
    NoUtterance,
    /// The LLM could not be started; the client got an `error` packet.
    LlmFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    pub turn_id: TurnId,
    pub utterance: Utterance,
    pub outcome: TurnOutcome,
}

/// A turn handed to its responder task.
pub struct ResponseHandle {
    turn_id: TurnId,
    cancel: CancellationToken,
    join: JoinHandle<Result<TurnReport, ConversationError>>,
}

impl ResponseHandle {
    pub fn turn_id(&self) -> TurnId {
        self.turn_id
    }

    /// Wait for the turn to close. Must not be called again once it has returned.
    pub async fn finish(&mut self) -> Result<TurnReport, ConversationError> {
        match (&mut self.join).await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(ConversationError::Cancelled),
            Err(err) => Err(ConversationError::Internal(format!("responder task failed: {}", err))),
        }
    }

    /// Stop the reply mid-stream and wait for the task to wind down.
    pub async fn abort(mut self) {
        self.cancel.cancel();
        self.join.abort();
        let _ = (&mut self.join).await;
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        self.join.abort();
    }
}

/// Drives the turns of one session.
pub struct TurnController {
    services: Services,
    sink: OutboundSink,
    settings: TurnSettings,
    metrics: Arc<ConversationMetrics>,
    session_cancel: CancellationToken,
    last_id: TurnId,
}

impl TurnController {
    pub fn new(
        services: Services,
        sink: OutboundSink,
        settings: TurnSettings,
        metrics: Arc<ConversationMetrics>,
        session_cancel: CancellationToken,
    ) -> Self {
        Self {
            services,
            sink,
            settings,
            metrics,
            session_cancel,
            last_id: 0,
        }
    }

    /// Open a new turn in `Listening` with a fresh STT stream and aggregation buffer.
    pub async fn start_turn(&mut self) -> Result<Turn, ConversationError> {
        let id = self.last_id + 1;
        let connection = self.open_stt(id).await?;
        self.last_id = id;

        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let (finalize_tx, finalize_rx) = oneshot::channel();
        let mut turn = Turn {
            id,
            state: TurnState::Listening,
            stt: Some(connection.writer),
            generation: 0,
            inputs,
            finalize_tx: Some(finalize_tx),
            cancel: self.session_cancel.child_token(),
            tasks: JoinSet::new(),
        };

        turn.tasks.spawn(TranscriptAggregator::new(id).run(
            inputs_rx,
            finalize_rx,
            self.sink.clone(),
            turn.cancel.clone(),
        ));
        turn.spawn_pump(connection.events);

        self.sink.send_message(
            Some(id),
            ServerMessage::Status {
                turn_id: id,
                state: TurnState::Listening,
            },
        )?;
        info!(turn_id = id, "Turn listening");
        Ok(turn)
    }

    /// Open an STT stream, backing off between failed attempts.
    async fn open_stt(&self, turn_id: TurnId) -> Result<SttConnection, ConversationError> {
        let attempts = self.settings.stt_open_attempts.max(1);
        let mut delay = self.settings.stt_open_backoff;
        let mut attempt = 1;

        loop {
            match self.services.stt.open().await {
                Ok(connection) => return Ok(connection),
                Err(err) if attempt < attempts => {
                    warn!(turn_id, attempt, attempts, "STT stream failed to open, retrying in {:?}: {}", delay, err);
                    tokio::select! {
                        _ = self.session_cancel.cancelled() => return Err(ConversationError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) => {
                    error!(turn_id, attempts, "Giving up on opening an STT stream: {}", err);
                    return Err(ConversationError::SttUnrecoverable {
                        attempts,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    /// Forward one audio chunk to the turn's STT stream.
    ///
    /// A failed send gets exactly one reconnect and one resend of the same chunk. If the
    /// reconnect or the resend fails too, the error is fatal for the session.
    pub async fn send_audio(&self, turn: &mut Turn, audio: &[u8]) -> Result<(), ConversationError> {
        if turn.state != TurnState::Listening {
            return Err(ConversationError::NotListening {
                turn_id: turn.id,
                state: turn.state.as_str(),
            });
        }

        let first_error = match turn.stt.as_mut() {
            Some(writer) => match writer.send(audio).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            },
            None => ConversationError::SttSend("no open STT stream".to_string()),
        };

        warn!(turn_id = turn.id, "STT send failed, reconnecting once: {}", first_error);
        self.metrics.stt_reconnected();
        turn.close_stt().await;

        let connection = self.services.stt.open().await.map_err(|err| {
            error!(turn_id = turn.id, "STT reconnect failed: {}", err);
            ConversationError::SttUnrecoverable {
                attempts: 1,
                reason: err.to_string(),
            }
        })?;

        turn.generation += 1;
        turn.spawn_pump(connection.events);
        let writer = turn.stt.insert(connection.writer);

        writer.send(audio).await.map_err(|err| {
            error!(turn_id = turn.id, "STT resend failed after reconnect: {}", err);
            ConversationError::SttUnrecoverable {
                attempts: 1,
                reason: err.to_string(),
            }
        })?;
        info!(turn_id = turn.id, generation = turn.generation, "Audio chunk delivered on reconnected STT stream");
        Ok(())
    }

    /// End the spoken input of a turn and wait for its complete transcript.
    pub async fn finalize(&self, turn: &mut Turn) -> Result<Utterance, ConversationError> {
        turn.advance(TurnState::Finalizing)?;

        let finalize_tx = turn
            .finalize_tx
            .take()
            .ok_or_else(|| ConversationError::Internal("finalize already requested".to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = FinalizeRequest {
            deadline: Instant::now() + self.settings.finalize_timeout,
            generation: turn.generation,
            reply: reply_tx,
        };
        // Register the barrier before flushing, so the Flushed marker cannot be missed.
        if finalize_tx.send(request).is_err() {
            return Err(ConversationError::Internal("transcript aggregator has stopped".to_string()));
        }

        let flushed = match turn.stt.as_mut() {
            Some(writer) => writer.flush().await,
            None => Err(ConversationError::SttSend("no open STT stream".to_string())),
        };
        if let Err(err) = flushed {
            warn!(turn_id = turn.id, "STT flush failed, finalizing with fragments received so far: {}", err);
            let _ = turn.inputs.send(AggregatorInput::StreamEnded {
                generation: turn.generation,
            });
        }

        let utterance = reply_rx
            .await
            .map_err(|_| ConversationError::Internal("transcript aggregator stopped before finalizing".to_string()))?;
        turn.close_stt().await;

        debug!(turn_id = turn.id, timed_out = utterance.timed_out, "Transcript finalized");
        Ok(utterance)
    }

    /// Use typed text as the turn's utterance. Whatever the STT stream transcribed is
    /// discarded.
    pub async fn accept_text(&self, turn: &mut Turn, text: &str) -> Result<Utterance, ConversationError> {
        turn.advance(TurnState::Finalizing)?;
        turn.finalize_tx.take();
        turn.close_stt().await;
        Ok(Utterance::typed(text))
    }

    /// Close a turn that will never respond, e.g. on session teardown.
    pub async fn discard(&self, mut turn: Turn) {
        debug!(turn_id = turn.id, state = turn.state.as_str(), "Discarding turn");
        turn.cancel.cancel();
        turn.close_stt().await;
    }

    /// Hand a finalized turn to its responder task.
    pub fn respond(&self, turn: Turn, utterance: Utterance, conversation_id: String) -> ResponseHandle {
        let responder = Responder {
            llm: self.services.llm.clone(),
            tts: self.services.tts.clone(),
            sink: self.sink.clone(),
            metrics: self.metrics.clone(),
            min_speech_chars: self.settings.min_speech_chars,
        };
        let turn_id = turn.id;
        let cancel = turn.cancel.clone();
        let join = tokio::spawn(responder.run(turn, utterance, conversation_id));
        ResponseHandle { turn_id, cancel, join }
    }
}

struct Responder {
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn SpeechSynthesizer>,
    sink: OutboundSink,
    metrics: Arc<ConversationMetrics>,
    min_speech_chars: usize,
}

impl Responder {
    async fn run(
        self,
        mut turn: Turn,
        utterance: Utterance,
        conversation_id: String,
    ) -> Result<TurnReport, ConversationError> {
        let turn_id = turn.id;

        if utterance.is_empty() {
            turn.advance(TurnState::Closed)?;
            info!(turn_id, "Empty utterance, closing turn without a reply");
            self.metrics.turn_without_reply();
            return self.close(turn, utterance, TurnOutcome::NoUtterance).await;
        }

        turn.advance(TurnState::Responding)?;
        self.sink.send_message(
            Some(turn_id),
            ServerMessage::Status {
                turn_id,
                state: TurnState::Responding,
            },
        )?;
        info!(turn_id, %conversation_id, utterance = %utterance.text, "Generating reply");

        let outcome = match self.start_reply(turn_id, &utterance.text, &conversation_id).await {
            Ok(reply) => self.stream_reply(turn_id, turn.cancel.clone(), reply).await?,
            Err(err) => {
                self.metrics.llm_failure();
                error!(turn_id, "LLM reply could not be started: {}", err);
                self.sink.send_message(Some(turn_id), ServerMessage::error(&err))?;
                TurnOutcome::LlmFailed(err.to_string())
            }
        };

        turn.advance(TurnState::Closed)?;
        if matches!(outcome, TurnOutcome::Replied { .. }) {
            self.metrics.turn_completed();
        }
        self.close(turn, utterance, outcome).await
    }

    /// One retry: a single transient failure should not cost the user their turn.
    async fn start_reply(
        &self,
        turn_id: TurnId,
        text: &str,
        conversation_id: &str,
    ) -> Result<ReplyStream, ConversationError> {
        match self.llm.start(text, conversation_id).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                warn!(turn_id, "LLM call failed, retrying once: {}", err);
                self.llm.start(text, conversation_id).await
            }
        }
    }

    async fn stream_reply(
        &self,
        turn_id: TurnId,
        cancel: CancellationToken,
        mut reply: ReplyStream,
    ) -> Result<TurnOutcome, ConversationError> {
        let mut text = TextRelay::new(turn_id, self.sink.clone());
        let mut speech = SpeechBuffer::new(self.min_speech_chars);
        let (speech_tx, speech_rx) = mpsc::unbounded_channel();
        let synthesis = tokio::spawn(synthesize_reply(
            self.tts.clone(),
            speech_rx,
            AudioRelay::new(turn_id, self.sink.clone()),
            cancel.clone(),
            turn_id,
        ));

        let mut reply_chars = 0;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(ConversationError::Cancelled),
                next = reply.next() => next,
            };
            match next {
                Some(Ok(delta)) => {
                    reply_chars += delta.chars().count();
                    text.on_chunk(&delta)?;
                    for piece in speech.push(&delta) {
                        let _ = speech_tx.send(piece);
                    }
                }
                Some(Err(err)) => {
                    warn!(turn_id, "Reply stream broke off, keeping what arrived: {}", err);
                    break;
                }
                None => break,
            }
        }

        if let Some(rest) = speech.finish() {
            let _ = speech_tx.send(rest);
        }
        drop(speech_tx);
        text.close()?;

        let audio_bytes = synthesis
            .await
            .map_err(|err| ConversationError::Internal(format!("synthesis task failed: {}", err)))??;
        debug!(turn_id, reply_chars, audio_bytes, "Reply relayed");
        Ok(TurnOutcome::Replied { reply_chars, audio_bytes })
    }

    /// Report the closed state and wait until everything this turn submitted has been
    /// written, so the next turn's packets strictly follow.
    async fn close(
        &self,
        turn: Turn,
        utterance: Utterance,
        outcome: TurnOutcome,
    ) -> Result<TurnReport, ConversationError> {
        let turn_id = turn.id;
        self.sink.send_message(
            Some(turn_id),
            ServerMessage::Status {
                turn_id,
                state: TurnState::Closed,
            },
        )?;
        drop(turn);
        self.sink.drained().await?;

        Ok(TurnReport {
            turn_id,
            utterance,
            outcome,
        })
    }
}

/// Synthesize reply pieces in order and collect the audio for the turn.
///
/// A failed piece is skipped; the reply still reaches the client as text.
async fn synthesize_reply(
    tts: Arc<dyn SpeechSynthesizer>,
    mut pieces: mpsc::UnboundedReceiver<String>,
    mut relay: AudioRelay,
    cancel: CancellationToken,
    turn_id: TurnId,
) -> Result<usize, ConversationError> {
    let mut total = 0;
    loop {
        let piece = tokio::select! {
            _ = cancel.cancelled() => return Err(ConversationError::Cancelled),
            piece = pieces.recv() => piece,
        };
        let Some(piece) = piece else { break };

        let audio = tokio::select! {
            _ = cancel.cancelled() => return Err(ConversationError::Cancelled),
            audio = tts.synthesize(&piece) => audio,
        };
        match audio {
            Ok(audio) => {
                total += audio.len();
                relay.on_chunk(&audio);
            }
            Err(err) => warn!(turn_id, "Speech synthesis failed, piece sent as text only: {}", err),
        }
    }
    relay.close()?;
    Ok(total)
}
