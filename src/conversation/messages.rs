//! # Wire Messages
//!
//! ## Client → Server (text frames):
//! ```json
//! {"text": "", "conversationId": "abc", "type": "audioEnd"}
//! {"text": "what's the weather?", "conversationId": "abc", "type": "text"}
//! ```
//! Binary frames are raw audio and never pass through this module.
//!
//! ## Server → Client (text frames):
//! JSON objects tagged by `type`: `transcript`, `botText`, `botTextEnd`, `status`,
//! `error`, `pong`. Bot audio goes out as a single binary frame per turn.

use crate::conversation::turn::{TurnId, TurnState};
use crate::error::ConversationError;

use serde::{Deserialize, Serialize};

/// `type` value that ends the user's spoken input for the current turn.
pub const AUDIO_END: &str = "audioEnd";

/// `type` value for keep-alive pings; needs no conversation id.
pub const PING: &str = "ping";

/// Inbound control or chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// What the session loop should do with a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    /// Finalize the spoken utterance of the current turn.
    EndOfAudio { conversation_id: String },
    /// Use this text as the turn's utterance, bypassing STT.
    TypedText { conversation_id: String, text: String },
    Ping,
}

impl ControlMessage {
    pub fn parse(raw: &str) -> Result<Self, ConversationError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Classify the message. Every type except `ping` needs a conversation id, and typed
    /// input needs some text.
    pub fn action(self) -> Result<ControlAction, ConversationError> {
        if self.kind == PING {
            return Ok(ControlAction::Ping);
        }

        if self.conversation_id.trim().is_empty() {
            return Err(ConversationError::MissingConversationId);
        }

        if self.kind == AUDIO_END {
            return Ok(ControlAction::EndOfAudio {
                conversation_id: self.conversation_id,
            });
        }

        if self.text.trim().is_empty() {
            return Err(ConversationError::MalformedMessage(format!(
                "message of type '{}' has no text",
                self.kind
            )));
        }

        Ok(ControlAction::TypedText {
            conversation_id: self.conversation_id,
            text: self.text,
        })
    }
}

/// JSON frames sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// A recognised piece of the user's speech.
    #[serde(rename = "transcript", rename_all = "camelCase")]
    Transcript { turn_id: TurnId, text: String },

    /// An increment of the bot's reply text.
    #[serde(rename = "botText", rename_all = "camelCase")]
    BotText { turn_id: TurnId, text: String },

    /// The bot's reply text for this turn is complete.
    #[serde(rename = "botTextEnd", rename_all = "camelCase")]
    BotTextEnd { turn_id: TurnId },

    /// A turn changed state.
    #[serde(rename = "status", rename_all = "camelCase")]
    Status { turn_id: TurnId, state: TurnState },

    #[serde(rename = "error")]
    Error { code: String, message: String },

    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    pub fn error(err: &ConversationError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
