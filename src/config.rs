//! Configuration types for the call orchestration engine.

use crate::error::{CallError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for one call agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Conversation behavior (instructions, greeting).
    pub conversation: ConversationConfig,
    /// Speech-to-text settings.
    pub transcription: TranscriptionConfig,
    /// Reply generation settings.
    pub generation: GenerationConfig,
    /// Speech synthesis settings.
    pub synthesis: SynthesisConfig,
    /// Outbound delivery ordering/pacing settings.
    pub sequencer: SequencerConfig,
    /// Call function settings (hangup/transfer grace delays).
    pub functions: FunctionConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&text).map_err(|e| CallError::Config(format!("invalid config: {e}")))
    }
}

/// Conversation behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// System instructions given to the generation backend on every turn.
    pub system_instructions: String,
    /// Greeting spoken when the call connects. Empty disables the greeting.
    pub greeting: String,
    /// Whether the call is being recorded (surfaced to the agent context).
    pub recording_enabled: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            system_instructions: "You are a helpful phone assistant. Keep replies short; \
                                  they are spoken aloud."
                .to_owned(),
            greeting: "Hello! How can I help you today?".to_owned(),
            recording_enabled: false,
        }
    }
}

/// Which transcription provider to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionProvider {
    /// Deepgram live transcription over WebSocket.
    #[default]
    Deepgram,
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Provider selection.
    pub provider: TranscriptionProvider,
    /// API key for the provider.
    pub api_key: String,
    /// Base URL override. Empty uses the provider default.
    pub api_url: String,
    /// Model identifier.
    pub model: String,
    /// Spoken language hint.
    pub language: String,
    /// Inbound audio encoding as named by the provider.
    pub encoding: String,
    /// Inbound audio sample rate in Hz.
    pub sample_rate: u32,
    /// Endpointing silence window in ms (how quickly a segment is finalized).
    pub endpointing_ms: u32,
    /// Utterance-end gap in ms (fallback end-of-speech signal).
    pub utterance_end_ms: u32,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: TranscriptionProvider::default(),
            api_key: String::new(),
            api_url: String::new(),
            model: "nova-2".to_owned(),
            language: "en-US".to_owned(),
            encoding: "mulaw".to_owned(),
            sample_rate: 8_000,
            endpointing_ms: 200,
            utterance_end_ms: 1_000,
        }
    }
}

/// Which generation provider to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationProvider {
    /// OpenAI-compatible Chat Completions streaming.
    #[default]
    OpenAi,
    /// Anthropic Messages streaming.
    Anthropic,
}

/// Reply generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Provider selection.
    pub provider: GenerationProvider,
    /// API key for the provider.
    pub api_key: String,
    /// Base URL override. Empty uses the provider default.
    pub api_url: String,
    /// Model identifier.
    pub model: String,
    /// Maximum tokens per reply.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: GenerationProvider::default(),
            api_key: String::new(),
            api_url: String::new(),
            model: "gpt-4o".to_owned(),
            max_tokens: 300,
            temperature: 0.7,
        }
    }
}

/// Which synthesis provider to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisProvider {
    /// ElevenLabs streaming synthesis.
    #[default]
    ElevenLabs,
    /// Deepgram speech synthesis.
    Deepgram,
}

/// Speech synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Provider selection.
    pub provider: SynthesisProvider,
    /// API key for the provider.
    pub api_key: String,
    /// Base URL override. Empty uses the provider default.
    pub api_url: String,
    /// Voice identifier (provider-specific).
    pub voice_id: String,
    /// Model identifier (provider-specific).
    pub model: String,
    /// Output audio format as named by the provider.
    pub output_format: String,
    /// How many fragments may synthesize concurrently.
    ///
    /// Synthesis latency per fragment routinely exceeds inter-fragment
    /// arrival time, so values below 2 serialize the reply.
    pub max_concurrent: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: SynthesisProvider::default(),
            api_key: String::new(),
            api_url: String::new(),
            voice_id: String::new(),
            model: "aura-asteria-en".to_owned(),
            output_format: "ulaw_8000".to_owned(),
            max_concurrent: 3,
        }
    }
}

/// Outbound delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Whether to pace delivery to the transport's playout rate.
    /// Disabled, chunks are delivered as soon as they are in order.
    pub pacing_enabled: bool,
    /// Playout rate of the outbound audio in bytes per second.
    /// 8000 matches single-channel mulaw at 8 kHz.
    pub bytes_per_second: u32,
    /// How far ahead of real-time playout delivery may run, in ms.
    pub lead_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            pacing_enabled: true,
            bytes_per_second: 8_000,
            lead_ms: 400,
        }
    }
}

/// Call function configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionConfig {
    /// Delay in ms between announcing a hangup and ending the call,
    /// so the goodbye finishes playing.
    pub end_call_grace_ms: u64,
    /// Delay in ms before handing the call to the transfer target.
    pub transfer_grace_ms: u64,
    /// Number transfers go to when the model does not name one.
    pub default_transfer_target: String,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            end_call_grace_ms: 5_000,
            transfer_grace_ms: 8_000,
            default_transfer_target: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AgentConfig::default();
        assert_eq!(config.transcription.sample_rate, 8_000);
        assert_eq!(config.sequencer.bytes_per_second, 8_000);
        assert!(config.synthesis.max_concurrent >= 2);
        assert!(!config.conversation.greeting.is_empty());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: AgentConfig = toml::from_str(
            r#"
            [generation]
            provider = "anthropic"
            model = "claude-3-5-sonnet-latest"

            [sequencer]
            pacing_enabled = false
            "#,
        )
        .expect("parse partial config");

        assert_eq!(parsed.generation.provider, GenerationProvider::Anthropic);
        assert_eq!(parsed.generation.model, "claude-3-5-sonnet-latest");
        assert!(!parsed.sequencer.pacing_enabled);
        // Untouched sections keep defaults.
        assert_eq!(parsed.transcription.model, "nova-2");
        assert_eq!(parsed.functions.end_call_grace_ms, 5_000);
    }

    #[test]
    fn load_rejects_bad_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "generation = 3").expect("write");
        let err = AgentConfig::load(&path).expect_err("must fail");
        assert!(matches!(err, CallError::Config(_)));
    }

    #[test]
    fn load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let mut config = AgentConfig::default();
        config.synthesis.provider = SynthesisProvider::Deepgram;
        config.synthesis.voice_id = "aura".to_owned();
        let text = toml::to_string(&config).expect("serialize");
        std::fs::write(&path, text).expect("write");

        let loaded = AgentConfig::load(&path).expect("load");
        assert_eq!(loaded.synthesis.provider, SynthesisProvider::Deepgram);
        assert_eq!(loaded.synthesis.voice_id, "aura");
    }
}
