//! Text-to-speech: one request per piece of reply text, answered with the encoded audio.

use crate::config::TtsConfig;
use crate::error::ConversationError;

use async_trait::async_trait;
use serde::Serialize;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ConversationError>;
}

#[derive(Serialize)]
struct SpeakRequest<'a> {
    text: &'a str,
}

/// Deepgram `speak` endpoint client.
pub struct DeepgramSpeak {
    client: reqwest::Client,
    config: TtsConfig,
}

impl DeepgramSpeak {
    pub fn new(config: TtsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for DeepgramSpeak {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ConversationError> {
        let response = self
            .client
            .post(&self.config.url)
            .query(&[("model", self.config.model.as_str())])
            .header("Authorization", format!("Token {}", self.config.api_key))
            .json(&SpeakRequest { text })
            .send()
            .await
            .map_err(|e| ConversationError::Tts(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConversationError::Tts(format!("speak request failed ({}): {}", status, body)));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| ConversationError::Tts(e.to_string()))?;
        Ok(audio.to_vec())
    }
}
