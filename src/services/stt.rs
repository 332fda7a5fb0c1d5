//! # Streaming Speech-to-Text
//!
//! The turn pipeline only needs four things from an STT provider: open a stream, push
//! audio into it, ask it to flush whatever it has buffered, and close it. Transcript
//! fragments come back as an asynchronous stream of [`SttEvent`]s.
//!
//! [`DeepgramStt`] implements this over the provider's live-transcription WebSocket.
//! A flush is Deepgram's `Finalize` control message; the provider answers it with a
//! final result flagged `from_finalize`, which is surfaced as [`SttEvent::Flushed`]
//! right after that result's fragment.

use crate::config::SttConfig;
use crate::error::ConversationError;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, SplitSink};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Something the STT stream reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// A finalized piece of transcript, in the order the provider produced it.
    Fragment(String),
    /// Every fragment produced for audio sent before the last flush has been emitted.
    Flushed,
}

/// An open STT stream: the write half plus the event stream it produces.
pub struct SttConnection {
    pub writer: Box<dyn SttWriter>,
    pub events: BoxStream<'static, SttEvent>,
}

/// Opens STT streams. One provider is shared by every session.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn open(&self) -> Result<SttConnection, ConversationError>;
}

/// Write half of an open STT stream.
#[async_trait]
pub trait SttWriter: Send {
    async fn send(&mut self, audio: &[u8]) -> Result<(), ConversationError>;

    /// Ask the provider to emit any transcript it is still holding back.
    async fn flush(&mut self) -> Result<(), ConversationError>;

    /// Close the stream. Errors are logged, never returned: by the time a stream is
    /// closed nothing useful can be done about them.
    async fn close(&mut self);
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const FINALIZE_MESSAGE: &str = r#"{"type":"Finalize"}"#;
const CLOSE_STREAM_MESSAGE: &str = r#"{"type":"CloseStream"}"#;

/// Deepgram live transcription client.
pub struct DeepgramStt {
    config: SttConfig,
}

impl DeepgramStt {
    pub fn new(config: SttConfig) -> Self {
        Self { config }
    }

    fn listen_url(&self) -> String {
        format!(
            "{}?model={}&encoding={}&sample_rate={}&channels=1&punctuate=true&interim_results=false",
            self.config.url, self.config.model, self.config.encoding, self.config.sample_rate
        )
    }
}

#[async_trait]
impl SpeechToText for DeepgramStt {
    async fn open(&self) -> Result<SttConnection, ConversationError> {
        let mut request = self
            .listen_url()
            .into_client_request()
            .map_err(|e| ConversationError::SttConnect(format!("invalid STT url: {}", e)))?;

        let auth = HeaderValue::from_str(&format!("Token {}", self.config.api_key))
            .map_err(|e| ConversationError::SttConnect(format!("invalid STT api key: {}", e)))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| ConversationError::SttConnect(e.to_string()))?;

        debug!("Connected to Deepgram live transcription");

        let (sink, source) = ws_stream.split();

        let events = stream::unfold(source, |mut source| async move {
            loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let events = parse_results(&text);
                        if !events.is_empty() {
                            return Some((stream::iter(events), source));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Deepgram closed the stream: {:?}", frame);
                        return None;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!("Deepgram stream read error: {}", err);
                        return None;
                    }
                    None => return None,
                }
            }
        })
        .flatten()
        .boxed();

        Ok(SttConnection {
            writer: Box::new(DeepgramWriter { sink }),
            events,
        })
    }
}

struct DeepgramWriter {
    sink: WsSink,
}

#[async_trait]
impl SttWriter for DeepgramWriter {
    async fn send(&mut self, audio: &[u8]) -> Result<(), ConversationError> {
        self.sink
            .send(Message::Binary(audio.to_vec()))
            .await
            .map_err(|e| ConversationError::SttSend(e.to_string()))
    }

    async fn flush(&mut self) -> Result<(), ConversationError> {
        self.sink
            .send(Message::Text(FINALIZE_MESSAGE.to_string()))
            .await
            .map_err(|e| ConversationError::SttSend(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(err) = self.sink.send(Message::Text(CLOSE_STREAM_MESSAGE.to_string())).await {
            debug!("Deepgram CloseStream not delivered: {}", err);
        }
        if let Err(err) = self.sink.close().await {
            debug!("Deepgram socket close failed: {}", err);
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeepgramResults {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    from_finalize: bool,
    channel: Option<DeepgramChannel>,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Turn one Deepgram message into the events it carries.
///
/// Fragments keep a trailing space so consecutive results concatenate into readable
/// text; the aggregator trims the finished utterance.
fn parse_results(raw: &str) -> Vec<SttEvent> {
    let results: DeepgramResults = match serde_json::from_str(raw) {
        Ok(results) => results,
        Err(err) => {
            debug!("Ignoring unrecognised Deepgram message: {}", err);
            return Vec::new();
        }
    };

    if results.kind != "Results" {
        return Vec::new();
    }

    let mut events = Vec::new();
    if results.is_final {
        let transcript = results
            .channel
            .and_then(|channel| channel.alternatives.into_iter().next())
            .map(|alternative| alternative.transcript)
            .unwrap_or_default();
        if !transcript.trim().is_empty() {
            events.push(SttEvent::Fragment(format!("{} ", transcript.trim())));
        }
    }
    if results.from_finalize {
        events.push(SttEvent::Flushed);
    }
    events
}
