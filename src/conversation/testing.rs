//! In-memory stand-ins for the client connection and the STT, LLM and TTS providers.

use crate::conversation::messages::ServerMessage;
use crate::conversation::sink::{ClientWriter, OutboundFrame, OutboundPacket};
use crate::conversation::Services;
use crate::error::ConversationError;
use crate::services::llm::{LanguageModel, ReplyStream};
use crate::services::stt::{SpeechToText, SttConnection, SttEvent, SttWriter};
use crate::services::tts::SpeechSynthesizer;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub fn services(stt: ScriptedStt, llm: ScriptedLlm, tts: EchoSynth) -> Services {
    Services {
        stt: Arc::new(stt),
        llm: Arc::new(llm),
        tts: Arc::new(tts),
    }
}

#[derive(Default)]
struct WriterLog {
    packets: Vec<OutboundPacket>,
    closed: bool,
    fail_after: Option<usize>,
}

/// Records every packet the sink writes.
#[derive(Clone, Default)]
pub struct RecordingWriter {
    log: Arc<Mutex<WriterLog>>,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `count` packets, then fail every write.
    pub fn failing_after(count: usize) -> Self {
        let writer = Self::default();
        writer.log.lock().unwrap().fail_after = Some(count);
        writer
    }

    pub fn packets(&self) -> Vec<OutboundPacket> {
        self.log.lock().unwrap().packets.clone()
    }

    /// The text packets, decoded.
    pub fn messages(&self) -> Vec<ServerMessage> {
        self.packets()
            .into_iter()
            .filter_map(|packet| match packet.frame {
                OutboundFrame::Text(json) => Some(serde_json::from_str(&json).unwrap()),
                OutboundFrame::Binary(_) => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().unwrap().closed
    }

    /// Poll until `predicate` holds for the decoded messages, or panic after two seconds.
    pub async fn wait_for(&self, predicate: impl Fn(&[ServerMessage]) -> bool) {
        let give_up = tokio::time::Instant::now() + Duration::from_secs(2);
        while !predicate(&self.messages()) {
            assert!(tokio::time::Instant::now() < give_up, "timed out, got {:?}", self.messages());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ClientWriter for RecordingWriter {
    async fn write(&mut self, packet: OutboundPacket) -> Result<(), ConversationError> {
        let mut log = self.log.lock().unwrap();
        if log.fail_after.is_some_and(|limit| log.packets.len() >= limit) {
            return Err(ConversationError::Transport("connection reset".to_string()));
        }
        log.packets.push(packet);
        Ok(())
    }

    async fn close(&mut self) {
        self.log.lock().unwrap().closed = true;
    }
}

#[derive(Default)]
struct SttScript {
    received: Vec<Vec<u8>>,
    opens: u32,
    fail_opens: u32,
    fail_sends: u32,
    fragment_delay: Duration,
    ignore_flush: bool,
}

/// Transcribes every audio chunk to its own UTF-8 text, one fragment per chunk.
#[derive(Clone, Default)]
pub struct ScriptedStt {
    script: Arc<Mutex<SttScript>>,
}

impl ScriptedStt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fragments lag behind their audio by `delay`, like a real recognizer.
    pub fn with_fragment_delay(delay: Duration) -> Self {
        let stt = Self::default();
        stt.script.lock().unwrap().fragment_delay = delay;
        stt
    }

    /// Never confirm a flush, as if the provider lost the finalize directive.
    pub fn ignore_flush(&self) {
        self.script.lock().unwrap().ignore_flush = true;
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.script.lock().unwrap().fail_opens = count;
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.script.lock().unwrap().fail_sends = count;
    }

    /// Chunks accepted across all connections.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.script.lock().unwrap().received.clone()
    }

    /// Successful opens.
    pub fn opens(&self) -> u32 {
        self.script.lock().unwrap().opens
    }
}

enum SttCommand {
    Audio(Vec<u8>),
    Flush,
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn open(&self) -> Result<SttConnection, ConversationError> {
        let (delay, ignore_flush) = {
            let mut script = self.script.lock().unwrap();
            if script.fail_opens > 0 {
                script.fail_opens -= 1;
                return Err(ConversationError::SttConnect("connection refused".to_string()));
            }
            script.opens += 1;
            (script.fragment_delay, script.ignore_flush)
        };

        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let event = match command {
                    SttCommand::Audio(audio) => {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        SttEvent::Fragment(String::from_utf8_lossy(&audio).into_owned())
                    }
                    SttCommand::Flush if ignore_flush => continue,
                    SttCommand::Flush => SttEvent::Flushed,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
        });

        Ok(SttConnection {
            writer: Box::new(ScriptedSttWriter {
                commands: Some(commands),
                script: self.script.clone(),
            }),
            events: UnboundedReceiverStream::new(event_rx).boxed(),
        })
    }
}

struct ScriptedSttWriter {
    commands: Option<mpsc::UnboundedSender<SttCommand>>,
    script: Arc<Mutex<SttScript>>,
}

impl ScriptedSttWriter {
    fn command(&self, command: SttCommand) -> Result<(), ConversationError> {
        self.commands
            .as_ref()
            .ok_or_else(|| ConversationError::SttSend("stream closed".to_string()))?
            .send(command)
            .map_err(|_| ConversationError::SttSend("stream closed".to_string()))
    }
}

#[async_trait]
impl SttWriter for ScriptedSttWriter {
    async fn send(&mut self, audio: &[u8]) -> Result<(), ConversationError> {
        {
            let mut script = self.script.lock().unwrap();
            if script.fail_sends > 0 {
                script.fail_sends -= 1;
                return Err(ConversationError::SttSend("broken pipe".to_string()));
            }
            script.received.push(audio.to_vec());
        }
        self.command(SttCommand::Audio(audio.to_vec()))
    }

    async fn flush(&mut self) -> Result<(), ConversationError> {
        self.command(SttCommand::Flush)
    }

    async fn close(&mut self) {
        self.commands = None;
    }
}

#[derive(Default)]
struct LlmScript {
    replies: HashMap<String, Vec<String>>,
    calls: Vec<(String, String)>,
    fail_starts: u32,
    stalled: HashSet<String>,
}

/// Streams canned replies; anything without a script gets `"ok"`.
#[derive(Clone, Default)]
pub struct ScriptedLlm {
    script: Arc<Mutex<LlmScript>>,
    open_replies: Arc<AtomicUsize>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, utterance: &str, deltas: &[&str]) {
        self.script
            .lock()
            .unwrap()
            .replies
            .insert(utterance.to_string(), deltas.iter().map(|d| d.to_string()).collect());
    }

    /// Stream `deltas` for `utterance`, then never finish.
    pub fn reply_then_stall(&self, utterance: &str, deltas: &[&str]) {
        self.reply(utterance, deltas);
        self.script.lock().unwrap().stalled.insert(utterance.to_string());
    }

    /// Reply streams handed out and not yet dropped.
    pub fn open_replies(&self) -> usize {
        self.open_replies.load(Ordering::SeqCst)
    }

    pub fn fail_next_starts(&self, count: u32) {
        self.script.lock().unwrap().fail_starts = count;
    }

    /// `(utterance, conversation_id)` of every start attempt.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.script.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn start(&self, utterance: &str, conversation_id: &str) -> Result<ReplyStream, ConversationError> {
        let mut script = self.script.lock().unwrap();
        script
            .calls
            .push((utterance.to_string(), conversation_id.to_string()));
        if script.fail_starts > 0 {
            script.fail_starts -= 1;
            return Err(ConversationError::Llm("503 Service Unavailable".to_string()));
        }
        let deltas = script
            .replies
            .get(utterance)
            .cloned()
            .unwrap_or_else(|| vec!["ok".to_string()]);
        let reply = stream::iter(deltas.into_iter().map(Ok));
        let guard = LiveGuard::new(&self.open_replies);
        let guarded = move |item| {
            let _live = &guard;
            item
        };
        if script.stalled.contains(utterance) {
            Ok(reply.chain(stream::pending()).map(guarded).boxed())
        } else {
            Ok(reply.map(guarded).boxed())
        }
    }
}

/// Counts itself in `live` until dropped.
struct LiveGuard {
    live: Arc<AtomicUsize>,
}

impl LiveGuard {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self { live: live.clone() }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// "Synthesizes" text into its own bytes.
#[derive(Clone, Default)]
pub struct EchoSynth {
    stalled: bool,
    in_flight: Arc<AtomicUsize>,
}

impl EchoSynth {
    pub fn new() -> Self {
        Self::default()
    }

    /// A synthesizer whose requests never complete.
    pub fn stalled() -> Self {
        Self {
            stalled: true,
            ..Self::default()
        }
    }

    /// Synthesis requests started and not yet finished or dropped.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for EchoSynth {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ConversationError> {
        let _guard = LiveGuard::new(&self.in_flight);
        if self.stalled {
            std::future::pending::<()>().await;
        }
        Ok(text.as_bytes().to_vec())
    }
}

/// Poll `condition` until it holds, or panic after two seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    let give_up = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < give_up, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
