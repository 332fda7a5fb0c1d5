//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__HOST, APP_STT__API_KEY, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: where the HTTP/WebSocket listener binds
//! - **stt**: the streaming speech-to-text provider and its connect/retry policy
//! - **llm**: the chat-completion endpoint that writes the bot's replies
//! - **tts**: the speech synthesis endpoint and how reply text is chunked for it
//! - **session**: per-connection turn tuning (finalize timeout, audio backlog, session limit)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// The live configuration, shared by the HTTP handlers and the clients that read it on
/// every call (so runtime updates reach them).
pub type SharedConfig = Arc<RwLock<AppConfig>>;

/// Copy of the current shared configuration.
///
/// Writers only ever swap in whole, validated values, so a poisoned lock still holds a
/// usable config and the guard is recovered instead of panicking.
pub fn read_shared(config: &SharedConfig) -> AppConfig {
    config
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Main application configuration that contains all settings.
///
/// Every section derives `Serialize` as well as `Deserialize` because the
/// defaults are fed back into the `config` builder as the lowest-priority source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub session: SessionConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Streaming speech-to-text provider settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint of the provider's live transcription API
/// - `api_key`: sent as `Authorization: Token <key>`
/// - `encoding` / `sample_rate`: describe the raw audio the client streams
/// - `open_attempts`: how many times opening a stream is tried before the session gives up
/// - `open_backoff_ms`: first retry delay; doubles on every further attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub encoding: String,
    pub sample_rate: u32,
    pub open_attempts: u32,
    pub open_backoff_ms: u64,
}

/// Chat-completion (OpenAI-compatible) settings for the bot's replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
    /// Oldest messages beyond this count are dropped from a conversation's history.
    pub max_history_messages: usize,
    /// Conversations remembered at once; the least recently used one is forgotten first.
    pub max_conversations: usize,
}

/// Text-to-speech settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    /// Reply text is synthesized in sentence-sized pieces of at least this many characters.
    pub min_chunk_chars: usize,
}

/// Per-connection turn tuning.
///
/// ## Fields:
/// - `finalize_timeout_ms`: upper bound on waiting for the STT provider to flush the
///   last transcript fragments after the client signals end of audio
/// - `max_pending_audio_frames`: audio frames held back while the previous turn is
///   still replying; frames beyond this are rejected (and logged)
/// - `max_concurrent_sessions`: WebSocket upgrades beyond this are refused with 503
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub finalize_timeout_ms: u64,
    pub max_pending_audio_frames: usize,
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            stt: SttConfig {
                url: "wss://api.deepgram.com/v1/listen".to_string(),
                api_key: String::new(),
                model: "nova-2".to_string(),
                encoding: "linear16".to_string(),
                sample_rate: 16000,
                open_attempts: 3,
                open_backoff_ms: 250,
            },
            llm: LlmConfig {
                base_url: "https://api.groq.com/openai/v1".to_string(),
                api_key: String::new(),
                model: "llama-3.1-8b-instant".to_string(),
                system_prompt: "You are a friendly voice assistant. Keep answers short and conversational."
                    .to_string(),
                max_history_messages: 40,
                max_conversations: 1000,
            },
            tts: TtsConfig {
                url: "https://api.deepgram.com/v1/speak".to_string(),
                api_key: String::new(),
                model: "aura-asteria-en".to_string(),
                min_chunk_chars: 40,
            },
            session: SessionConfig {
                finalize_timeout_ms: 5000,
                max_pending_audio_frames: 512,
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_SESSION__FINALIZE_TIMEOUT_MS=8000`: Sections and keys are separated by a double underscore
    /// - `DEEPGRAM_API_KEY` / `GROQ_API_KEY`: Provider keys under their usual names
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").prefix_separator("_").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // Deepgram serves both transcription and speech, so one key covers both
        if let Ok(key) = env::var("DEEPGRAM_API_KEY") {
            settings = settings
                .set_override("stt.api_key", key.clone())?
                .set_override("tts.api_key", key)?;
        }

        if let Ok(key) = env::var("GROQ_API_KEY") {
            settings = settings.set_override("llm.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - The STT stream is tried at least once
    /// - The finalize barrier has a non-zero bound
    /// - At least one session is allowed
    /// - At least one conversation can be remembered
    ///
    /// Missing API keys are not an error here: the server still starts and the
    /// providers report the failure when a session first uses them.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.stt.open_attempts == 0 {
            return Err(anyhow::anyhow!("STT open attempts must be greater than 0"));
        }

        if self.stt.sample_rate == 0 {
            return Err(anyhow::anyhow!("STT sample rate must be greater than 0"));
        }

        if self.session.finalize_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Finalize timeout must be greater than 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.llm.max_conversations == 0 {
            return Err(anyhow::anyhow!("Max conversations must be greater than 0"));
        }

        Ok(())
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.session.finalize_timeout_ms)
    }

    pub fn stt_open_backoff(&self) -> Duration {
        Duration::from_millis(self.stt.open_backoff_ms)
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only fields present in the JSON are changed, e.g. `{"session": {"finalize_timeout_ms": 8000}}`.
    /// Session, STT retry and TTS chunking values take effect for connections opened after
    /// the update; the LLM prompt and history limits apply from the next reply on.
    ///
    /// The listen address, provider endpoints and API keys are fixed at startup. Asking to
    /// change the address is an error rather than a silent no-op.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if server.get("host").is_some() || server.get("port").is_some() {
                return Err(anyhow::anyhow!(
                    "server.host and server.port are fixed at startup; restart the server to change them"
                ));
            }
        }

        if let Some(stt) = partial_config.get("stt") {
            if let Some(attempts) = stt.get("open_attempts").and_then(|v| v.as_u64()) {
                self.stt.open_attempts = u32::try_from(attempts)
                    .map_err(|_| anyhow::anyhow!("STT open attempts {} is out of range", attempts))?;
            }
            if let Some(backoff) = stt.get("open_backoff_ms").and_then(|v| v.as_u64()) {
                self.stt.open_backoff_ms = backoff;
            }
        }

        if let Some(llm) = partial_config.get("llm") {
            if let Some(prompt) = llm.get("system_prompt").and_then(|v| v.as_str()) {
                self.llm.system_prompt = prompt.to_string();
            }
            if let Some(max) = llm.get("max_history_messages").and_then(|v| v.as_u64()) {
                self.llm.max_history_messages = to_usize(max, "llm.max_history_messages")?;
            }
            if let Some(max) = llm.get("max_conversations").and_then(|v| v.as_u64()) {
                self.llm.max_conversations = to_usize(max, "llm.max_conversations")?;
            }
        }

        if let Some(tts) = partial_config.get("tts") {
            if let Some(chars) = tts.get("min_chunk_chars").and_then(|v| v.as_u64()) {
                self.tts.min_chunk_chars = to_usize(chars, "tts.min_chunk_chars")?;
            }
        }

        if let Some(session) = partial_config.get("session") {
            if let Some(timeout) = session.get("finalize_timeout_ms").and_then(|v| v.as_u64()) {
                self.session.finalize_timeout_ms = timeout;
            }
            if let Some(frames) = session.get("max_pending_audio_frames").and_then(|v| v.as_u64()) {
                self.session.max_pending_audio_frames = to_usize(frames, "session.max_pending_audio_frames")?;
            }
            if let Some(sessions) = session.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.session.max_concurrent_sessions = to_usize(sessions, "session.max_concurrent_sessions")?;
            }
        }

        self.validate()?;
        Ok(())
    }
}

fn to_usize(value: u64, field: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| anyhow::anyhow!("{} value {} is out of range", field, value))
}
