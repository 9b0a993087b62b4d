//! Anthropic generation backend (Messages API streaming).
//!
//! Streams `POST /v1/messages` and normalizes the typed SSE events
//! (`content_block_start` / `content_block_delta` / `message_stop`, with
//! `input_json_delta` fragments for tool use) into [`GeneratorEvent`]s.
//! The Messages API requires the first message to be from the user, so a
//! greeting-first history gets a placeholder user turn prepended.

use crate::call::{Turn, TurnRole};
use crate::config::GenerationConfig;
use crate::error::{CallError, Result};
use crate::functions::FunctionSpec;
use crate::providers::openai::parse_arguments;
use crate::providers::sse::SseParser;
use crate::providers::{GenerationBackend, GeneratorEvent, GeneratorStream};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Anthropic streaming generator.
pub struct AnthropicGenerator {
    config: GenerationConfig,
    client: reqwest::Client,
}

impl AnthropicGenerator {
    /// Create a generator from configuration.
    pub fn new(config: GenerationConfig) -> Self {
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

impl std::fmt::Debug for AnthropicGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicGenerator")
            .field("model", &self.config.model)
            .field("base_url", &self.base_url())
            .finish()
    }
}

/// Build the Messages API request body.
pub(crate) fn build_request_body(
    config: &GenerationConfig,
    system: &str,
    history: &[Turn],
    functions: &[FunctionSpec],
) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = Vec::with_capacity(history.len() + 1);
    for turn in history {
        let (role, content) = match turn.role {
            TurnRole::User => ("user", turn.content.clone()),
            TurnRole::Assistant => ("assistant", turn.content.clone()),
            // Tool results go back in as user content.
            TurnRole::Function => (
                "user",
                format!(
                    "Result of {}: {}",
                    turn.function.as_deref().unwrap_or("function"),
                    turn.content
                ),
            ),
        };
        messages.push(serde_json::json!({"role": role, "content": content}));
    }
    if messages
        .first()
        .is_none_or(|m| m["role"] != "user")
    {
        messages.insert(0, serde_json::json!({"role": "user", "content": "Hello"}));
    }

    let mut body = serde_json::json!({
        "model": config.model,
        "max_tokens": config.max_tokens,
        "temperature": config.temperature,
        "system": system,
        "messages": messages,
        "stream": true,
    });
    if !functions.is_empty()
        && let Some(obj) = body.as_object_mut()
    {
        let tools: Vec<serde_json::Value> = functions
            .iter()
            .map(|f| {
                serde_json::json!({
                    "name": f.name,
                    "description": f.description,
                    "input_schema": f.parameters,
                })
            })
            .collect();
        obj.insert("tools".into(), serde_json::json!(tools));
    }
    body
}

/// Tracks in-flight tool-use content blocks by block index.
#[derive(Debug, Default)]
pub(crate) struct BlockTracker {
    tool_blocks: HashMap<u64, (String, String)>,
}

/// Parse one typed SSE event. Returns extracted events and whether the
/// message finished.
pub(crate) fn parse_event(
    event_type: &str,
    data: &str,
    tracker: &mut BlockTracker,
) -> (Vec<GeneratorEvent>, bool) {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) else {
        return (Vec::new(), false);
    };

    let mut events = Vec::new();
    match event_type {
        "content_block_start" => {
            let index = parsed.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            if let Some(block) = parsed.get("content_block")
                && block.get("type").and_then(|t| t.as_str()) == Some("tool_use")
            {
                let name = block
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_owned();
                tracker.tool_blocks.insert(index, (name, String::new()));
            }
        }
        "content_block_delta" => {
            let index = parsed.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            if let Some(delta) = parsed.get("delta") {
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(|t| t.as_str())
                            && !text.is_empty()
                        {
                            events.push(GeneratorEvent::TextDelta {
                                text: text.to_owned(),
                            });
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(fragment) =
                            delta.get("partial_json").and_then(|p| p.as_str())
                            && let Some((_, json)) = tracker.tool_blocks.get_mut(&index)
                        {
                            json.push_str(fragment);
                        }
                    }
                    _ => {}
                }
            }
        }
        "content_block_stop" => {
            let index = parsed.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            if let Some((name, json)) = tracker.tool_blocks.remove(&index)
                && !name.is_empty()
            {
                events.push(GeneratorEvent::FunctionCall {
                    name,
                    arguments: parse_arguments(&json),
                });
            }
        }
        "message_stop" => return (events, true),
        // message_start, message_delta, ping — nothing to surface.
        _ => {}
    }

    (events, false)
}

fn map_status(status: reqwest::StatusCode, body: &str) -> CallError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    if status.is_server_error() || status.as_u16() == 429 {
        CallError::BackendUnavailable(format!("generation HTTP {status}: {message}"))
    } else {
        CallError::BackendProtocol(format!("generation HTTP {status}: {message}"))
    }
}

#[async_trait]
impl GenerationBackend for AnthropicGenerator {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(
        &self,
        system: &str,
        history: &[Turn],
        functions: &[FunctionSpec],
    ) -> Result<GeneratorStream> {
        let url = format!("{}/v1/messages", self.base_url());
        let body = build_request_body(&self.config, system, history, functions);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::BackendUnavailable(format!("generation request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(status, &text));
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut parser = SseParser::new();
            let mut tracker = BlockTracker::default();

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(CallError::BackendUnavailable(format!(
                            "generation stream: {e}"
                        )));
                        return;
                    }
                };
                for event in parser.push(&chunk) {
                    let event_type = event.event_type.as_deref().unwrap_or("");
                    if event_type == "error" {
                        yield Err(CallError::BackendProtocol(format!(
                            "generation stream error: {}",
                            event.data
                        )));
                        return;
                    }
                    let (events, ended) = parse_event(event_type, &event.data, &mut tracker);
                    for event in events {
                        yield Ok(event);
                    }
                    if ended {
                        break 'read;
                    }
                }
            }

            yield Ok(GeneratorEvent::Done);
        };
        Ok(Box::pin(stream))
    }
}
