//! ElevenLabs synthesis backend (streaming HTTP).
//!
//! Uses the streaming endpoint with the latency-optimized profile so audio
//! chunks flow back while synthesis is still running.

use crate::config::SynthesisConfig;
use crate::error::{CallError, Result};
use crate::providers::{SynthesisBackend, SynthesisStream};
use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::warn;

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";

/// ElevenLabs streaming synthesizer.
pub struct ElevenLabsSynthesizer {
    config: SynthesisConfig,
    client: reqwest::Client,
}

impl ElevenLabsSynthesizer {
    /// Create a synthesizer from configuration.
    pub fn new(config: SynthesisConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn base_url(&self) -> &str {
        if self.config.api_url.trim().is_empty() {
            DEFAULT_BASE_URL
        } else {
            self.config.api_url.trim_end_matches('/')
        }
    }
}

impl std::fmt::Debug for ElevenLabsSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElevenLabsSynthesizer")
            .field("voice_id", &self.config.voice_id)
            .field("output_format", &self.config.output_format)
            .finish()
    }
}

#[async_trait]
impl SynthesisBackend for ElevenLabsSynthesizer {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str) -> Result<SynthesisStream> {
        let url = format!(
            "{}/v1/text-to-speech/{}/stream",
            self.base_url(),
            self.config.voice_id
        );

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.config.api_key)
            .query(&[
                ("output_format", self.config.output_format.as_str()),
                ("optimize_streaming_latency", "4"),
            ])
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.config.model,
            }))
            .send()
            .await
            .map_err(|e| CallError::BackendUnavailable(format!("synthesis request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "synthesis request rejected");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                CallError::BackendUnavailable(format!("synthesis HTTP {status}: {body}"))
            } else {
                CallError::BackendProtocol(format!("synthesis HTTP {status}: {body}"))
            });
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        if !chunk.is_empty() {
                            yield Ok(chunk);
                        }
                    }
                    Err(e) => {
                        yield Err(CallError::BackendUnavailable(format!(
                            "synthesis stream: {e}"
                        )));
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> SynthesisConfig {
        SynthesisConfig {
            api_key: "xi-test".into(),
            api_url: server.uri(),
            voice_id: "voice-1".into(),
            model: "eleven_turbo_v2".into(),
            ..SynthesisConfig::default()
        }
    }

    #[tokio::test]
    async fn streams_audio_chunks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/text-to-speech/voice-1/stream"))
            .and(header("xi-api-key", "xi-test"))
            .and(query_param("output_format", "ulaw_8000"))
            .and(query_param("optimize_streaming_latency", "4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"audio-bytes".to_vec()))
            .mount(&server)
            .await;

        let synthesizer = ElevenLabsSynthesizer::new(config(&server));
        let mut stream = synthesizer.synthesize("Hello there.").await.expect("stream");
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.expect("chunk"));
        }
        assert_eq!(collected, b"audio-bytes");
    }

    #[tokio::test]
    async fn quota_exhaustion_is_retriable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/text-to-speech/voice-1/stream"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let synthesizer = ElevenLabsSynthesizer::new(config(&server));
        let err = synthesizer
            .synthesize("Hello.")
            .await
            .err().expect("must fail");
        assert!(matches!(err, CallError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn bad_voice_is_a_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/text-to-speech/voice-1/stream"))
            .respond_with(ResponseTemplate::new(404).set_body_string("unknown voice"))
            .mount(&server)
            .await;

        let synthesizer = ElevenLabsSynthesizer::new(config(&server));
        let err = synthesizer
            .synthesize("Hello.")
            .await
            .err().expect("must fail");
        assert!(matches!(err, CallError::BackendProtocol(_)));
    }
}
