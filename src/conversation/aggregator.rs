//! # Transcript Aggregator
//!
//! Collects the STT fragments of one turn into the user's utterance.
//!
//! The aggregator runs as its own task, fed by the turn's STT event pumps. Each
//! fragment is appended to the buffer and echoed to the client as a `transcript`
//! packet. Finalizing is a barrier, not a snapshot: the request is registered with the
//! task *before* the STT stream is asked to flush, and the task only answers once it has
//! seen the provider's `Flushed` marker (or the end of the stream it was flushing). Every
//! fragment the provider emitted before that marker is therefore already in the buffer.
//!
//! The wait is bounded by a deadline carried in the request. On expiry the task answers
//! with what it has and flags the utterance as timed out.

use crate::conversation::messages::ServerMessage;
use crate::conversation::sink::OutboundSink;
use crate::conversation::turn::TurnId;
use crate::services::stt::SttEvent;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceSource {
    Transcribed,
    Typed,
}

/// The finalized user text of one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
    pub source: UtteranceSource,
    /// The STT provider never confirmed its flush; `text` may be missing a tail.
    pub timed_out: bool,
}

impl Utterance {
    pub fn typed(text: impl Into<String>) -> Self {
        Self {
            text: text.into().trim().to_string(),
            source: UtteranceSource::Typed,
            timed_out: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// What the STT pumps feed the aggregator task.
#[derive(Debug)]
pub enum AggregatorInput {
    Event(SttEvent),
    /// The event stream of STT connection `generation` has ended.
    StreamEnded { generation: u32 },
}

/// Ask the aggregator task for the finished utterance.
pub struct FinalizeRequest {
    pub deadline: Instant,
    /// The STT connection that was asked to flush; its end also releases the barrier.
    pub generation: u32,
    pub reply: oneshot::Sender<Utterance>,
}

/// The aggregation buffer of one turn.
#[derive(Debug)]
pub struct TranscriptAggregator {
    turn_id: TurnId,
    buffer: String,
    fragments: usize,
}

impl TranscriptAggregator {
    pub fn new(turn_id: TurnId) -> Self {
        Self {
            turn_id,
            buffer: String::new(),
            fragments: 0,
        }
    }

    pub fn on_fragment(&mut self, text: &str) {
        self.buffer.push_str(text);
        self.fragments += 1;
    }

    /// Hand out the accumulated text and clear the buffer. The turn state machine makes
    /// sure this happens once per turn.
    pub fn finalize(&mut self, timed_out: bool) -> Utterance {
        let text = std::mem::take(&mut self.buffer).trim().to_string();
        self.fragments = 0;
        Utterance {
            text,
            source: UtteranceSource::Transcribed,
            timed_out,
        }
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    /// Run until finalized, cancelled, or the turn discards the finalize request.
    pub async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<AggregatorInput>,
        mut finalize_rx: oneshot::Receiver<FinalizeRequest>,
        sink: OutboundSink,
        cancel: CancellationToken,
    ) {
        let turn_id = self.turn_id;
        let mut pending: Option<FinalizeRequest> = None;
        let mut inputs_open = true;

        loop {
            let deadline = pending.as_ref().map(|request| request.deadline);

            tokio::select! {
                // The finalize request must win over a Flushed event that is already
                // queued behind it, so branch order matters.
                biased;

                _ = cancel.cancelled() => {
                    debug!(turn_id, "Transcript aggregator cancelled");
                    return;
                }

                request = &mut finalize_rx, if pending.is_none() => {
                    match request {
                        Ok(request) => pending = Some(request),
                        Err(_) => {
                            // The turn took typed input instead; these fragments are unused.
                            debug!(turn_id, fragments = self.fragments, "Discarding spoken transcript");
                            return;
                        }
                    }
                }

                input = inputs.recv(), if inputs_open => {
                    match input {
                        Some(AggregatorInput::Event(SttEvent::Fragment(text))) => {
                            self.on_fragment(&text);
                            let echo = ServerMessage::Transcript { turn_id, text };
                            if sink.send_message(Some(turn_id), echo).is_err() {
                                debug!(turn_id, "Outbound sink closed, transcript not echoed");
                            }
                        }
                        Some(AggregatorInput::Event(SttEvent::Flushed)) => {
                            if let Some(request) = pending.take() {
                                let _ = request.reply.send(self.finalize(false));
                                return;
                            }
                            debug!(turn_id, "Flush confirmation without a pending finalize");
                        }
                        Some(AggregatorInput::StreamEnded { generation }) => {
                            match pending.take() {
                                Some(request) if request.generation == generation => {
                                    let _ = request.reply.send(self.finalize(false));
                                    return;
                                }
                                other => pending = other,
                            }
                        }
                        None => inputs_open = false,
                    }
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(request) = pending.take() {
                        warn!(turn_id, fragments = self.fragments, "STT flush not confirmed before deadline, finalizing with what arrived");
                        let _ = request.reply.send(self.finalize(true));
                    }
                    return;
                }
            }
        }
    }
}
