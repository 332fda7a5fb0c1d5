//! # Reply Relays
//!
//! - [`TextRelay`] forwards each reply text increment to the client immediately.
//! - [`AudioRelay`] collects synthesized audio and sends it as one binary frame when
//!   closed; the client only plays audio back once it has all of it.
//! - [`SpeechBuffer`] sits in front of synthesis and cuts the reply text into
//!   sentence-sized pieces, so audio can be synthesized while the reply is still streaming.
//!
//! Each relay is owned by exactly one task of its turn and closed exactly once by it;
//! closing again is a no-op.

use crate::conversation::messages::ServerMessage;
use crate::conversation::sink::{OutboundPacket, OutboundSink};
use crate::conversation::turn::TurnId;
use crate::error::ConversationError;

pub struct TextRelay {
    turn_id: TurnId,
    sink: OutboundSink,
    closed: bool,
}

impl TextRelay {
    pub fn new(turn_id: TurnId, sink: OutboundSink) -> Self {
        Self {
            turn_id,
            sink,
            closed: false,
        }
    }

    pub fn on_chunk(&mut self, text: &str) -> Result<(), ConversationError> {
        if self.closed || text.is_empty() {
            return Ok(());
        }
        self.sink.send_message(
            Some(self.turn_id),
            ServerMessage::BotText {
                turn_id: self.turn_id,
                text: text.to_string(),
            },
        )
    }

    /// Tell the client the reply text is complete.
    pub fn close(&mut self) -> Result<(), ConversationError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.sink.send_message(
            Some(self.turn_id),
            ServerMessage::BotTextEnd { turn_id: self.turn_id },
        )
    }
}

pub struct AudioRelay {
    turn_id: TurnId,
    sink: OutboundSink,
    buffer: Vec<u8>,
    closed: bool,
}

impl AudioRelay {
    pub fn new(turn_id: TurnId, sink: OutboundSink) -> Self {
        Self {
            turn_id,
            sink,
            buffer: Vec::new(),
            closed: false,
        }
    }

    pub fn on_chunk(&mut self, audio: &[u8]) {
        if !self.closed {
            self.buffer.extend_from_slice(audio);
        }
    }

    /// Submit the collected audio as a single packet. Nothing is sent if no audio
    /// was synthesized.
    pub fn close(&mut self) -> Result<(), ConversationError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        if self.buffer.is_empty() {
            return Ok(());
        }
        let audio = std::mem::take(&mut self.buffer);
        self.sink.submit(OutboundPacket::audio(self.turn_id, audio))
    }
}

/// Cuts streamed reply text into pieces worth synthesizing.
#[derive(Debug)]
pub struct SpeechBuffer {
    pending: String,
    min_chars: usize,
}

impl SpeechBuffer {
    pub fn new(min_chars: usize) -> Self {
        Self {
            pending: String::new(),
            min_chars,
        }
    }

    /// Add a text increment; returns the pieces that are ready to synthesize.
    ///
    /// A piece ends at a sentence boundary (`.`, `!`, `?` or newline) once at least
    /// `min_chars` characters have collected.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        let mut ready = Vec::new();
        for ch in delta.chars() {
            self.pending.push(ch);
            if matches!(ch, '.' | '!' | '?' | '\n') && self.pending.trim().chars().count() >= self.min_chars {
                let piece = std::mem::take(&mut self.pending);
                ready.push(piece.trim().to_string());
            }
        }
        ready
    }

    /// Whatever is left once the reply has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}
