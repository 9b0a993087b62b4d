//! Shared deterministic fakes used across test modules.
//!
//! These stand in for the remote backends and the telephony transport so
//! ordering, barge-in, and history behavior can be tested without timing
//! luck or network access.

use crate::call::{CallContext, Turn};
use crate::error::{CallError, Result};
use crate::functions::{CallFunction, FunctionSpec};
use crate::providers::{
    AudioFrame, CallControl, GenerationBackend, GeneratorEvent, MediaSink, SynthesisBackend,
    SynthesisStream, TranscriberEvent, TranscriberStream, TranscriptionBackend,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Handle for feeding one scripted transcription session.
pub struct SessionHandle {
    tx: Mutex<Option<mpsc::UnboundedSender<Result<TranscriberEvent>>>>,
}

impl SessionHandle {
    /// Send one backend event into the session.
    pub fn send(&self, event: Result<TranscriberEvent>) {
        if let Some(tx) = self.tx.lock().expect("session tx").as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Close the session stream (backend-side disconnect).
    pub fn close(&self) {
        self.tx.lock().expect("session tx").take();
    }
}

/// Transcription backend driven interactively from tests.
///
/// Each `open` call consumes the next prepared session; when none are left
/// it errors like an unreachable service. A session's stream ends when the
/// test closes it or when the audio feed is dropped (hangup), matching how
/// live transcription sockets behave.
pub struct ChannelTranscriber {
    sessions: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<TranscriberEvent>>>>,
}

impl ChannelTranscriber {
    /// Prepare `n` sessions; returns the backend and one handle per session.
    pub fn new(n: usize) -> (Self, Vec<SessionHandle>) {
        let mut receivers = VecDeque::new();
        let mut handles = Vec::new();
        for _ in 0..n {
            let (tx, rx) = mpsc::unbounded_channel();
            receivers.push_back(rx);
            handles.push(SessionHandle {
                tx: Mutex::new(Some(tx)),
            });
        }
        (
            Self {
                sessions: Mutex::new(receivers),
            },
            handles,
        )
    }
}

#[async_trait]
impl TranscriptionBackend for ChannelTranscriber {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(&self, frames: mpsc::Receiver<AudioFrame>) -> Result<TranscriberStream> {
        let Some(mut rx) = self.sessions.lock().expect("sessions").pop_front() else {
            return Err(CallError::BackendUnavailable(
                "no scripted session left".into(),
            ));
        };

        // Drain the audio feed; its closure ends the session like a real
        // socket shutting down after input stops.
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let mut frames = frames;
            while frames.recv().await.is_some() {}
            let _ = stop_tx.send(());
        });

        let stream = async_stream::stream! {
            tokio::pin!(stop_rx);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    event = rx.recv() => match event {
                        Some(event) => yield event,
                        None => break,
                    },
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Generation backend that replays prepared reply scripts in order.
///
/// A script ending in `Done` (or an error) closes its stream; otherwise the
/// stream stays open forever, which is how tests model a reply that only an
/// interrupt can end.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Vec<Result<GeneratorEvent>>>>,
    invocations: Mutex<Vec<Vec<Turn>>>,
}

impl ScriptedGenerator {
    /// Build with the given reply scripts, consumed one per invocation.
    pub fn with_replies(replies: Vec<Vec<Result<GeneratorEvent>>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// History snapshots the backend was invoked with.
    pub fn invocations(&self) -> Vec<Vec<Turn>> {
        self.invocations.lock().expect("invocations").clone()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        _system: &str,
        history: &[Turn],
        _functions: &[FunctionSpec],
    ) -> Result<crate::providers::GeneratorStream> {
        self.invocations
            .lock()
            .expect("invocations")
            .push(history.to_vec());

        let Some(script) = self.replies.lock().expect("replies").pop_front() else {
            return Err(CallError::BackendUnavailable("no scripted reply left".into()));
        };

        let closes = matches!(
            script.last(),
            Some(Ok(GeneratorEvent::Done)) | Some(Err(_))
        );
        let stream = async_stream::stream! {
            for item in script {
                yield item;
            }
            if !closes {
                futures_util::future::pending::<()>().await;
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Synthesis backend producing deterministic chunk payloads.
///
/// Fragment text `t` yields chunks `t#0`, `t#1`, … so tests can assert
/// exactly which audio went where. Per-text delays simulate out-of-order
/// completion; failures simulate a provider refusing or dying mid-stream.
pub struct ChunkedSynthesizer {
    chunks_per_fragment: usize,
    delays: HashMap<String, Duration>,
    failures: HashSet<String>,
    mid_failures: HashMap<String, usize>,
}

impl ChunkedSynthesizer {
    /// Build with a fixed chunk count per fragment.
    pub fn new(chunks_per_fragment: usize) -> Self {
        Self {
            chunks_per_fragment: chunks_per_fragment.max(1),
            delays: HashMap::new(),
            failures: HashSet::new(),
            mid_failures: HashMap::new(),
        }
    }

    /// Delay synthesis of the given text.
    pub fn with_delay(mut self, text: &str, delay: Duration) -> Self {
        self.delays.insert(text.to_owned(), delay);
        self
    }

    /// Fail synthesis of the given text outright.
    pub fn with_failure(mut self, text: &str) -> Self {
        self.failures.insert(text.to_owned());
        self
    }

    /// Fail synthesis of the given text after emitting `chunks` chunks.
    pub fn with_mid_failure(mut self, text: &str, chunks: usize) -> Self {
        self.mid_failures.insert(text.to_owned(), chunks);
        self
    }
}

#[async_trait]
impl SynthesisBackend for ChunkedSynthesizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn synthesize(&self, text: &str) -> Result<SynthesisStream> {
        if self.failures.contains(text) {
            return Err(CallError::BackendUnavailable(format!(
                "refusing to synthesize {text:?}"
            )));
        }

        let delay = self.delays.get(text).copied();
        let mid_failure = self.mid_failures.get(text).copied();
        let count = self.chunks_per_fragment;
        let text = text.to_owned();

        let stream = async_stream::stream! {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            for i in 0..count {
                if mid_failure == Some(i) {
                    yield Err(CallError::BackendUnavailable(format!(
                        "stream died at chunk {i}"
                    )));
                    return;
                }
                yield Ok(Bytes::from(format!("{text}#{i}")));
            }
        };
        Ok(Box::pin(stream))
    }
}

/// One operation observed by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOp {
    /// `send_audio` with the payload (lossy UTF-8 for readability).
    Audio(String),
    /// `clear`.
    Clear,
}

/// Media sink that records everything, with optional per-send latency.
pub struct RecordingSink {
    ops: Mutex<Vec<SinkOp>>,
    op_count: watch::Sender<usize>,
    send_delay: Option<Duration>,
}

impl RecordingSink {
    /// A sink that accepts instantly.
    pub fn new() -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            op_count: watch::channel(0).0,
            send_delay: None,
        }
    }

    /// A sink that takes `delay` to accept each payload, giving tests a
    /// window to barge in mid-delivery.
    pub fn with_send_delay(delay: Duration) -> Self {
        Self {
            send_delay: Some(delay),
            ..Self::new()
        }
    }

    /// Everything observed, in order.
    pub fn ops(&self) -> Vec<SinkOp> {
        self.ops.lock().expect("ops").clone()
    }

    /// Only the audio payloads, in order.
    pub fn audio_payloads(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SinkOp::Audio(payload) => Some(payload),
                SinkOp::Clear => None,
            })
            .collect()
    }

    fn audio_count(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, SinkOp::Audio(_)))
            .count()
    }

    /// Wait until `n` audio payloads have been accepted.
    pub async fn wait_for_audio(&self, n: usize) {
        let mut rx = self.op_count.subscribe();
        loop {
            if self.audio_count() >= n {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until a specific audio payload has been accepted.
    pub async fn wait_for_audio_matching(&self, payload: &str) {
        let mut rx = self.op_count.subscribe();
        loop {
            if self
                .ops()
                .iter()
                .any(|op| matches!(op, SinkOp::Audio(p) if p == payload))
            {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until a `clear` has been observed.
    pub async fn wait_for_clear(&self) {
        let mut rx = self.op_count.subscribe();
        loop {
            if self.ops().iter().any(|op| matches!(op, SinkOp::Clear)) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn record(&self, op: SinkOp) {
        let mut ops = self.ops.lock().expect("ops");
        ops.push(op);
        let _ = self.op_count.send(ops.len());
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSink for RecordingSink {
    async fn send_audio(&self, payload: Bytes) -> Result<()> {
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        self.record(SinkOp::Audio(
            String::from_utf8_lossy(&payload).into_owned(),
        ));
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.record(SinkOp::Clear);
        Ok(())
    }
}

/// Call control that records hangups and transfers.
#[derive(Default)]
pub struct RecordingControl {
    ends: Mutex<Vec<(String, String)>>,
    transfers: Mutex<Vec<(String, String)>>,
}

impl RecordingControl {
    /// Number of `end_call` invocations.
    pub fn ended(&self) -> usize {
        self.ends.lock().expect("ends").len()
    }

    /// Number of `transfer_call` invocations.
    pub fn transferred(&self) -> usize {
        self.transfers.lock().expect("transfers").len()
    }
}

#[async_trait]
impl CallControl for RecordingControl {
    async fn end_call(&self, call_id: &str, reason: &str) -> Result<String> {
        self.ends
            .lock()
            .expect("ends")
            .push((call_id.to_owned(), reason.to_owned()));
        Ok("status: completed".to_owned())
    }

    async fn transfer_call(&self, call_id: &str, target: &str) -> Result<String> {
        self.transfers
            .lock()
            .expect("transfers")
            .push((call_id.to_owned(), target.to_owned()));
        Ok("status: transferring".to_owned())
    }
}

/// Function that echoes its arguments back as the result.
pub struct EchoFunction {
    name: String,
}

impl EchoFunction {
    /// Build with the given function name.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }
}

#[async_trait]
impl CallFunction for EchoFunction {
    fn spec(&self) -> FunctionSpec {
        FunctionSpec {
            name: self.name.clone(),
            description: "Echo the arguments back.".to_owned(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
            say: "Let me check that for you.".to_owned(),
        }
    }

    async fn execute(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<String> {
        Ok(format!("Result: {arguments}"))
    }
}
