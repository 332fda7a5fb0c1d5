//! # Error Handling
//!
//! Two error types live here:
//!
//! - [`AppError`]: errors returned by the REST handlers, converted to JSON HTTP responses.
//! - [`ConversationError`]: errors raised inside a voice session (STT, LLM, TTS, transport).
//!   [`ConversationError::is_fatal`] decides whether the session must be torn down or
//!   whether the offending frame or turn is dropped and the session carries on.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the HTTP API.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: The server is at capacity (503 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    ConfigError(String),
    ValidationError(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses with a consistent JSON body:
///
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Finalize timeout must be greater than 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::Unavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Errors raised while running a voice session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConversationError {
    /// Opening a speech-to-text stream failed.
    #[error("STT connect error: {0}")]
    SttConnect(String),

    /// Writing audio or a control directive to an open STT stream failed.
    #[error("STT send error: {0}")]
    SttSend(String),

    /// The STT stream could not be (re)established within the retry policy.
    #[error("STT stream unrecoverable after {attempts} attempt(s): {reason}")]
    SttUnrecoverable { attempts: u32, reason: String },

    /// Starting or reading the language model response failed.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Speech synthesis failed.
    #[error("TTS error: {0}")]
    Tts(String),

    /// An inbound text frame could not be understood.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// An inbound control message carried no conversation id.
    #[error("message has no conversationId")]
    MissingConversationId,

    /// A turn was asked to move to a state it cannot reach from where it is.
    #[error("turn {turn_id}: cannot go from {from} to {to}")]
    InvalidTransition {
        turn_id: u64,
        from: &'static str,
        to: &'static str,
    },

    /// Audio arrived for a turn that is no longer taking input.
    #[error("turn {turn_id} is {state}, not accepting audio")]
    NotListening { turn_id: u64, state: &'static str },

    /// Audio arrived while a reply was playing and the hold-back buffer was already full.
    #[error("audio backlog of {limit} frame(s) is full, frame dropped")]
    AudioBacklogFull { limit: usize },

    /// Writing to the client connection failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The outbound sink stopped accepting packets.
    #[error("outbound sink closed")]
    SinkClosed,

    /// The turn or session was cancelled while work was in flight.
    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ConversationError {
    /// Whether this error ends the whole session.
    ///
    /// Malformed input, LLM/TTS failures and invalid transitions only cost the
    /// frame or the turn they happened in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConversationError::SttUnrecoverable { .. }
                | ConversationError::Transport(_)
                | ConversationError::SinkClosed
                | ConversationError::Cancelled
                | ConversationError::Internal(_)
        )
    }

    /// Short machine-readable code sent to the client in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            ConversationError::SttConnect(_)
            | ConversationError::SttSend(_)
            | ConversationError::SttUnrecoverable { .. } => "stt_error",
            ConversationError::Llm(_) => "llm_error",
            ConversationError::Tts(_) => "tts_error",
            ConversationError::MalformedMessage(_) => "invalid_message",
            ConversationError::MissingConversationId => "missing_conversation_id",
            ConversationError::InvalidTransition { .. } => "invalid_transition",
            ConversationError::NotListening { .. } => "not_listening",
            ConversationError::AudioBacklogFull { .. } => "audio_rejected",
            ConversationError::Transport(_) | ConversationError::SinkClosed => "transport_error",
            ConversationError::Cancelled => "cancelled",
            ConversationError::Internal(_) => "internal_error",
        }
    }
}

impl From<serde_json::Error> for ConversationError {
    fn from(err: serde_json::Error) -> Self {
        ConversationError::MalformedMessage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ConversationError::SinkClosed.is_fatal());
        assert!(ConversationError::SttUnrecoverable {
            attempts: 2,
            reason: "refused".to_string()
        }
        .is_fatal());
        assert!(!ConversationError::MissingConversationId.is_fatal());
        assert!(!ConversationError::Llm("timeout".to_string()).is_fatal());
        assert!(!ConversationError::SttSend("reset".to_string()).is_fatal());
        assert!(!ConversationError::AudioBacklogFull { limit: 4 }.is_fatal());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ConversationError::MissingConversationId.code(), "missing_conversation_id");
        assert_eq!(ConversationError::MalformedMessage("x".into()).code(), "invalid_message");
        assert_eq!(ConversationError::AudioBacklogFull { limit: 4 }.code(), "audio_rejected");
    }

    #[test]
    fn test_unavailable_maps_to_503() {
        let response = AppError::Unavailable("full".to_string()).error_response();
        assert_eq!(response.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);
    }
}
