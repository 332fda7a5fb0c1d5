//! # Conversation Turn Orchestration
//!
//! Everything between a client connection and the speech/language providers:
//!
//! - **messages**: the JSON frames exchanged with the client
//! - **sink**: the single ordered write path to the client
//! - **aggregator**: assembles STT fragments into an utterance, with a flush barrier
//! - **relay**: forwards reply text and audio to the sink
//! - **turn**: the per-turn state machine and the controller that drives it
//! - **session**: the per-connection loop that owns the turns

pub mod aggregator;
pub mod messages;
pub mod relay;
pub mod session;
pub mod sink;
pub mod turn;

#[cfg(test)]
pub mod testing;

use crate::services::{LanguageModel, SpeechSynthesizer, SpeechToText};
use std::sync::Arc;

pub use session::{InboundFrame, SessionLoop, SessionSettings};
pub use sink::{ClientWriter, OutboundFrame, OutboundPacket};

/// The provider clients shared by every session.
#[derive(Clone)]
pub struct Services {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn SpeechSynthesizer>,
}
