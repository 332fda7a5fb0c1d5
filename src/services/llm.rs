//! # Language Model Replies
//!
//! [`LanguageModel::start`] begins a reply to one utterance and hands back a stream of
//! text increments; the end of the stream is the completion event.
//!
//! [`GroqChat`] talks to an OpenAI-compatible `/chat/completions` endpoint with
//! `stream: true` and decodes the server-sent events as they arrive. A completed reply
//! is appended to the conversation's history so the next turn has context. The model
//! settings are read from the live configuration on every call.

use crate::config::{read_shared, LlmConfig, SharedConfig};
use crate::error::ConversationError;
use crate::services::history::{ChatMessage, ConversationHistory, HistoryLimits, Role};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Text increments of one reply. `Err` items end the reply early.
pub type ReplyStream = BoxStream<'static, Result<String, ConversationError>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn start(
        &self,
        utterance: &str,
        conversation_id: &str,
    ) -> Result<ReplyStream, ConversationError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Ignore;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<ChatChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map(SseLine::Delta)
            .unwrap_or(SseLine::Ignore),
        Err(err) => {
            debug!("Skipping undecodable completion chunk: {}", err);
            SseLine::Ignore
        }
    }
}

pub struct GroqChat {
    client: reqwest::Client,
    config: SharedConfig,
    history: Arc<ConversationHistory>,
}

impl GroqChat {
    pub fn new(config: SharedConfig, history: Arc<ConversationHistory>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            history,
        }
    }

    /// System prompt, then the conversation so far, then the new utterance.
    async fn chat_messages(&self, llm: &LlmConfig, utterance: &str, conversation_id: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::new(Role::System, llm.system_prompt.clone())];
        messages.extend(
            self.history
                .messages(conversation_id, HistoryLimits::from_config(llm))
                .await,
        );
        messages.push(ChatMessage::new(Role::User, utterance));
        messages
    }
}

#[async_trait]
impl LanguageModel for GroqChat {
    async fn start(
        &self,
        utterance: &str,
        conversation_id: &str,
    ) -> Result<ReplyStream, ConversationError> {
        let llm = read_shared(&self.config).llm;
        let request = ChatRequest {
            model: &llm.model,
            messages: self.chat_messages(&llm, utterance, conversation_id).await,
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", llm.base_url.trim_end_matches('/')))
            .bearer_auth(&llm.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ConversationError::Llm(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConversationError::Llm(format!("completion request failed ({}): {}", status, body)));
        }

        let reader = SseReader {
            bytes: response
                .bytes_stream()
                .map(|chunk| {
                    chunk
                        .map(|bytes| bytes.to_vec())
                        .map_err(|e| ConversationError::Llm(e.to_string()))
                })
                .boxed(),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            reply: String::new(),
            finished: false,
            broken: false,
            history: self.history.clone(),
            limits: HistoryLimits::from_config(&llm),
            conversation_id: conversation_id.to_string(),
            utterance: utterance.to_string(),
        };

        Ok(stream::unfold(reader, SseReader::next_delta).boxed())
    }
}

struct SseReader {
    bytes: BoxStream<'static, Result<Vec<u8>, ConversationError>>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    reply: String,
    finished: bool,
    broken: bool,
    history: Arc<ConversationHistory>,
    limits: HistoryLimits,
    conversation_id: String,
    utterance: String,
}

impl SseReader {
    async fn next_delta(mut self) -> Option<(Result<String, ConversationError>, Self)> {
        loop {
            if let Some(delta) = self.pending.pop_front() {
                return Some((Ok(delta), self));
            }

            if self.finished && !self.broken {
                self.history
                    .record_exchange(&self.conversation_id, &self.utterance, &self.reply, self.limits)
                    .await;
                return None;
            }

            match self.bytes.next().await {
                Some(Ok(chunk)) => {
                    self.buffer.extend_from_slice(&chunk);
                    self.drain_lines();
                }
                Some(Err(err)) => {
                    warn!("Completion stream broke off: {}", err);
                    // Nothing after an error is trusted; end the stream without recording.
                    self.bytes = stream::empty().boxed();
                    self.broken = true;
                    return Some((Err(err), self));
                }
                None if self.broken => return None,
                None => self.finished = true,
            }
        }
    }

    /// Move every complete line out of the byte buffer. Lines are only decoded once
    /// complete, so multi-byte characters split across chunks survive.
    fn drain_lines(&mut self) {
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            match parse_sse_line(&String::from_utf8_lossy(&line)) {
                SseLine::Delta(delta) => {
                    self.reply.push_str(&delta);
                    self.pending.push_back(delta);
                }
                SseLine::Done => {
                    self.finished = true;
                    self.buffer.clear();
                    return;
                }
                SseLine::Ignore => {}
            }
        }
    }
}
