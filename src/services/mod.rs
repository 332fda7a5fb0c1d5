//! # External Services
//!
//! Clients for the collaborators a voice session depends on. The turn pipeline only sees
//! the traits; the concrete clients are chosen once at startup.
//!
//! - **stt**: streaming speech-to-text ([`SpeechToText`], Deepgram live API)
//! - **llm**: streamed chat replies ([`LanguageModel`], OpenAI-compatible / Groq)
//! - **tts**: speech synthesis ([`SpeechSynthesizer`], Deepgram speak API)
//! - **history**: in-memory per-conversation message history used to prompt the LLM

pub mod history;
pub mod llm;
pub mod stt;
pub mod tts;

pub use history::ConversationHistory;
pub use llm::{GroqChat, LanguageModel};
pub use stt::{DeepgramStt, SpeechToText};
pub use tts::{DeepgramSpeak, SpeechSynthesizer};
