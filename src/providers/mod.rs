//! Capability contracts for the pluggable backends, and their factories.
//!
//! The orchestration channels only ever see these traits; which provider
//! sits behind each one is decided once, at call setup. Adding a provider
//! means implementing a trait here and extending the matching factory —
//! no orchestration code changes.

pub mod anthropic;
pub mod deepgram;
pub mod elevenlabs;
pub mod openai;
pub mod sse;

use crate::call::Turn;
use crate::config::{
    GenerationConfig, GenerationProvider, SynthesisConfig, SynthesisProvider, TranscriptionConfig,
    TranscriptionProvider,
};
use crate::error::Result;
use crate::functions::FunctionSpec;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One frame of inbound caller audio, as handed over by the telephony
/// transport. Timestamps increase monotonically within a call.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Opaque audio payload in the transport's configured encoding.
    pub payload: Bytes,
    /// Arrival timestamp.
    pub at: DateTime<Utc>,
}

impl AudioFrame {
    /// Build a frame stamped now.
    pub fn now(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            at: Utc::now(),
        }
    }
}

/// Events a transcription backend yields for a live audio stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriberEvent {
    /// Caller speech onset detected (before any text settles).
    SpeechStarted,
    /// An improving hypothesis for the in-progress utterance.
    Interim {
        /// Hypothesis text.
        text: String,
    },
    /// A finalized result segment. `endpoint` marks end of speech; segments
    /// without it are partial pieces of an utterance still going on.
    Segment {
        /// Settled segment text.
        text: String,
        /// Whether the speaker finished the utterance.
        endpoint: bool,
    },
    /// The utterance ended without an endpointed segment (silence gap).
    UtteranceEnd,
}

/// A stream of transcription events; an `Err` item means the backend
/// connection failed and the stream is over.
pub type TranscriberStream = Pin<Box<dyn Stream<Item = Result<TranscriberEvent>> + Send>>;

/// Live speech-to-text capability.
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Open a live transcription session over the given audio frames.
    ///
    /// The backend consumes frames until the sender side closes, and the
    /// returned stream ends when the session does.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be established.
    async fn open(&self, frames: mpsc::Receiver<AudioFrame>) -> Result<TranscriberStream>;
}

/// Events a generation backend yields while streaming a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorEvent {
    /// A fragment of reply text.
    TextDelta {
        /// The decoded text piece.
        text: String,
    },
    /// The model called a function. Arguments are complete.
    FunctionCall {
        /// Function name.
        name: String,
        /// Parsed arguments (empty object when the model sent none or
        /// unparseable JSON).
        arguments: serde_json::Value,
    },
    /// The reply stream finished.
    Done,
}

/// A stream of generation events; an `Err` item aborts the turn.
pub type GeneratorStream = Pin<Box<dyn Stream<Item = Result<GeneratorEvent>> + Send>>;

/// Streaming text generation capability.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Stream a reply for the given system instructions and history.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be started.
    async fn stream(
        &self,
        system: &str,
        history: &[Turn],
        functions: &[FunctionSpec],
    ) -> Result<GeneratorStream>;
}

/// A stream of synthesized audio chunks; an `Err` item fails the fragment.
pub type SynthesisStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Streaming text-to-speech capability.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Synthesize one text fragment into a stream of audio chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be started.
    async fn synthesize(&self, text: &str) -> Result<SynthesisStream>;
}

/// Outbound media transport for one call.
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Hand one ordered audio payload to the transport. May suspend under
    /// backpressure; returning is acceptance, not playout.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport connection is gone.
    async fn send_audio(&self, payload: Bytes) -> Result<()>;

    /// Discard everything queued or in flight downstream and resume
    /// accepting new audio immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport connection is gone.
    async fn clear(&self) -> Result<()>;
}

/// Telephony control collaborators for call functions.
#[async_trait]
pub trait CallControl: Send + Sync {
    /// End the call. Returns a textual result for the conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the telephony provider rejects the request.
    async fn end_call(&self, call_id: &str, reason: &str) -> Result<String>;

    /// Transfer the call to another number. Returns a textual result.
    ///
    /// # Errors
    ///
    /// Returns an error if the telephony provider rejects the request.
    async fn transfer_call(&self, call_id: &str, target: &str) -> Result<String>;
}

/// Build the configured transcription backend.
///
/// # Errors
///
/// Returns an error if the provider configuration is unusable.
pub fn build_transcription_backend(
    config: &TranscriptionConfig,
) -> Result<Arc<dyn TranscriptionBackend>> {
    match config.provider {
        TranscriptionProvider::Deepgram => Ok(Arc::new(
            deepgram::DeepgramTranscriber::new(config.clone())?,
        )),
    }
}

/// Build the configured generation backend.
///
/// # Errors
///
/// Returns an error if the provider configuration is unusable.
pub fn build_generation_backend(config: &GenerationConfig) -> Result<Arc<dyn GenerationBackend>> {
    match config.provider {
        GenerationProvider::OpenAi => Ok(Arc::new(openai::OpenAiGenerator::new(config.clone()))),
        GenerationProvider::Anthropic => {
            Ok(Arc::new(anthropic::AnthropicGenerator::new(config.clone())))
        }
    }
}

/// Build the configured synthesis backend.
///
/// # Errors
///
/// Returns an error if the provider configuration is unusable.
pub fn build_synthesis_backend(config: &SynthesisConfig) -> Result<Arc<dyn SynthesisBackend>> {
    match config.provider {
        SynthesisProvider::ElevenLabs => Ok(Arc::new(elevenlabs::ElevenLabsSynthesizer::new(
            config.clone(),
        ))),
        SynthesisProvider::Deepgram => {
            Ok(Arc::new(deepgram::DeepgramSynthesizer::new(config.clone())))
        }
    }
}
