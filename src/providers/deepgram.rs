//! Deepgram backends: live transcription over WebSocket, synthesis over HTTP.
//!
//! The live API pushes raw audio frames up a socket and receives typed JSON
//! messages back: interim and final `Results` (with `speech_final`
//! endpointing), `UtteranceEnd` gap detection, and `SpeechStarted` VAD
//! onsets — which map one-to-one onto [`TranscriberEvent`].

use crate::config::{SynthesisConfig, TranscriptionConfig};
use crate::error::{CallError, Result};
use crate::providers::{
    AudioFrame, SynthesisBackend, SynthesisStream, TranscriberEvent, TranscriberStream,
    TranscriptionBackend,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_LIVE_URL: &str = "wss://api.deepgram.com";
const DEFAULT_SPEAK_URL: &str = "https://api.deepgram.com";

/// Samples shaved off the head of synthesized audio; the first few carry a
/// click on this backend.
const SPEAK_TRIM_BYTES: usize = 80;

/// Live transcription over the Deepgram listen socket.
pub struct DeepgramTranscriber {
    config: TranscriptionConfig,
}

impl DeepgramTranscriber {
    /// Create a transcriber from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured URL does not parse.
    pub fn new(config: TranscriptionConfig) -> Result<Self> {
        let _ = live_url(&config)?;
        Ok(Self { config })
    }
}

/// Build the listen-socket URL with the streaming options.
fn live_url(config: &TranscriptionConfig) -> Result<Url> {
    let base = if config.api_url.trim().is_empty() {
        DEFAULT_LIVE_URL
    } else {
        config.api_url.trim_end_matches('/')
    };
    let mut url = Url::parse(&format!("{base}/v1/listen"))
        .map_err(|e| CallError::Config(format!("bad transcription URL: {e}")))?;
    url.query_pairs_mut()
        .append_pair("model", &config.model)
        .append_pair("language", &config.language)
        .append_pair("encoding", &config.encoding)
        .append_pair("sample_rate", &config.sample_rate.to_string())
        .append_pair("channels", "1")
        .append_pair("punctuate", "true")
        .append_pair("interim_results", "true")
        .append_pair("vad_events", "true")
        .append_pair("endpointing", &config.endpointing_ms.to_string())
        .append_pair("utterance_end_ms", &config.utterance_end_ms.to_string());
    Ok(url)
}

/// Map one JSON message from the listen socket.
pub(crate) fn parse_live_message(text: &str) -> Option<TranscriberEvent> {
    let parsed: serde_json::Value = serde_json::from_str(text).ok()?;
    match parsed.get("type").and_then(|t| t.as_str())? {
        "Results" => {
            let transcript = parsed
                .get("channel")
                .and_then(|c| c.get("alternatives"))
                .and_then(|a| a.as_array())
                .and_then(|a| a.first())
                .and_then(|alt| alt.get("transcript"))
                .and_then(|t| t.as_str())
                .unwrap_or_default();
            if transcript.trim().is_empty() {
                return None;
            }
            let is_final = parsed
                .get("is_final")
                .and_then(|f| f.as_bool())
                .unwrap_or(false);
            if is_final {
                let endpoint = parsed
                    .get("speech_final")
                    .and_then(|f| f.as_bool())
                    .unwrap_or(false);
                Some(TranscriberEvent::Segment {
                    text: transcript.to_owned(),
                    endpoint,
                })
            } else {
                Some(TranscriberEvent::Interim {
                    text: transcript.to_owned(),
                })
            }
        }
        "UtteranceEnd" => Some(TranscriberEvent::UtteranceEnd),
        "SpeechStarted" => Some(TranscriberEvent::SpeechStarted),
        other => {
            debug!(message = other, "ignoring transcription metadata");
            None
        }
    }
}

#[async_trait]
impl TranscriptionBackend for DeepgramTranscriber {
    fn name(&self) -> &str {
        "deepgram"
    }

    async fn open(&self, mut frames: mpsc::Receiver<AudioFrame>) -> Result<TranscriberStream> {
        let url = live_url(&self.config)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| CallError::BackendProtocol(format!("listen request: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Token {}", self.config.api_key)
                .parse()
                .map_err(|_| CallError::Config("API key is not header-safe".into()))?,
        );

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| CallError::BackendUnavailable(format!("listen connect: {e}")))?;
        let (mut write, mut read) = socket.split();

        // Uplink: forward caller audio; tell the service the stream is over
        // when the source closes so buffered results flush.
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if write
                    .send(Message::Binary(frame.payload.to_vec()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = write
                .send(Message::Text(r#"{"type":"CloseStream"}"#.to_owned()))
                .await;
        });

        let stream = async_stream::stream! {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_live_message(&text) {
                            yield Ok(event);
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(CallError::BackendUnavailable(format!(
                            "listen socket: {e}"
                        )));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Speech synthesis over the Deepgram speak endpoint.
pub struct DeepgramSynthesizer {
    config: SynthesisConfig,
    client: reqwest::Client,
}

impl DeepgramSynthesizer {
    /// Create a synthesizer from configuration.
    pub fn new(config: SynthesisConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn base_url(&self) -> &str {
        if self.config.api_url.trim().is_empty() {
            DEFAULT_SPEAK_URL
        } else {
            self.config.api_url.trim_end_matches('/')
        }
    }
}

/// Split an output format like `ulaw_8000` into the speak-endpoint
/// encoding/sample-rate pair.
pub(crate) fn speak_format(output_format: &str) -> (String, u32) {
    let (encoding, rate) = output_format
        .rsplit_once('_')
        .unwrap_or((output_format, ""));
    let encoding = match encoding {
        "ulaw" => "mulaw",
        other => other,
    };
    let rate = rate.parse().unwrap_or(8_000);
    (encoding.to_owned(), rate)
}

#[async_trait]
impl SynthesisBackend for DeepgramSynthesizer {
    fn name(&self) -> &str {
        "deepgram"
    }

    async fn synthesize(&self, text: &str) -> Result<SynthesisStream> {
        let (encoding, sample_rate) = speak_format(&self.config.output_format);
        let url = format!(
            "{}/v1/speak?model={}&encoding={}&sample_rate={}",
            self.base_url(),
            self.config.model,
            encoding,
            sample_rate
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.config.api_key))
            .json(&serde_json::json!({"text": text}))
            .send()
            .await
            .map_err(|e| CallError::BackendUnavailable(format!("speak request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "speak request rejected");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                CallError::BackendUnavailable(format!("speak HTTP {status}: {body}"))
            } else {
                CallError::BackendProtocol(format!("speak HTTP {status}: {body}"))
            });
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut first = true;
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(mut chunk) => {
                        if first {
                            first = false;
                            if chunk.len() > SPEAK_TRIM_BYTES {
                                chunk = chunk.slice(SPEAK_TRIM_BYTES..);
                            }
                        }
                        if !chunk.is_empty() {
                            yield Ok(chunk);
                        }
                    }
                    Err(e) => {
                        yield Err(CallError::BackendUnavailable(format!(
                            "speak stream: {e}"
                        )));
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
