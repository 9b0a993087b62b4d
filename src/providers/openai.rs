//! OpenAI-compatible generation backend (Chat Completions streaming).
//!
//! Streams `POST /v1/chat/completions` with `stream: true` and normalizes
//! the SSE delta chunks into [`GeneratorEvent`]s. Tool-call arguments arrive
//! as JSON fragments spread over many chunks; they are accumulated per call
//! index and surfaced as one complete [`GeneratorEvent::FunctionCall`] when
//! the stream finishes with `finish_reason: "tool_calls"`.

use crate::call::{Turn, TurnRole};
use crate::config::GenerationConfig;
use crate::error::{CallError, Result};
use crate::functions::FunctionSpec;
use crate::providers::sse::SseParser;
use crate::providers::{GenerationBackend, GeneratorEvent, GeneratorStream};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI-compatible streaming generator.
pub struct OpenAiGenerator {
    config: GenerationConfig,
    client: reqwest::Client,
}

impl OpenAiGenerator {
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

impl std::fmt::Debug for OpenAiGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiGenerator")
            .field("model", &self.config.model)
            .field("base_url", &self.base_url())
            .finish()
    }
}

/// Build the Chat Completions request body.
pub(crate) fn build_request_body(
    config: &GenerationConfig,
    system: &str,
    history: &[Turn],
    functions: &[FunctionSpec],
) -> serde_json::Value {
    let mut messages = vec![serde_json::json!({"role": "system", "content": system})];
    messages.extend(history.iter().map(turn_to_message));

    let mut body = serde_json::json!({
        "model": config.model,
        "messages": messages,
        "stream": true,
        "max_tokens": config.max_tokens,
        "temperature": config.temperature,
    });
    if !functions.is_empty()
        && let Some(obj) = body.as_object_mut()
    {
        obj.insert("tools".into(), functions_to_tools(functions));
    }
    body
}

fn turn_to_message(turn: &Turn) -> serde_json::Value {
    match turn.role {
        TurnRole::User => serde_json::json!({"role": "user", "content": turn.content}),
        TurnRole::Assistant => serde_json::json!({"role": "assistant", "content": turn.content}),
        TurnRole::Function => serde_json::json!({
            "role": "function",
            "name": turn.function.as_deref().unwrap_or("function"),
            "content": turn.content,
        }),
    }
}

fn functions_to_tools(functions: &[FunctionSpec]) -> serde_json::Value {
    let tools: Vec<serde_json::Value> = functions
        .iter()
        .map(|f| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": f.name,
                    "description": f.description,
                    "parameters": f.parameters,
                }
            })
        })
        .collect();
    serde_json::json!(tools)
}

/// Collects streamed tool-call fragments keyed by call index.
#[derive(Debug, Default)]
pub(crate) struct ToolCallAccumulator {
    calls: BTreeMap<u64, (String, String)>,
}

impl ToolCallAccumulator {
    fn absorb(&mut self, index: u64, name: Option<&str>, args_fragment: Option<&str>) {
        let entry = self.calls.entry(index).or_default();
        if let Some(name) = name
            && !name.is_empty()
        {
            entry.0 = name.to_owned();
        }
        if let Some(fragment) = args_fragment {
            entry.1.push_str(fragment);
        }
    }

    /// Drain accumulated calls into complete function-call events.
    fn finish(&mut self) -> Vec<GeneratorEvent> {
        std::mem::take(&mut self.calls)
            .into_values()
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, args)| GeneratorEvent::FunctionCall {
                name,
                arguments: parse_arguments(&args),
            })
            .collect()
    }
}

/// Parse tool-call arguments, falling back to an empty object on the
/// malformed JSON models occasionally produce.
pub(crate) fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| {
        debug!("model produced unparseable function arguments, using empty object");
        serde_json::json!({})
    })
}

/// Parse one SSE data payload. Returns the extracted events and whether the
/// reply finished.
pub(crate) fn parse_chunk(
    data: &str,
    accumulator: &mut ToolCallAccumulator,
) -> (Vec<GeneratorEvent>, bool) {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) else {
        return (Vec::new(), false);
    };

    let mut events = Vec::new();
    let mut finished = false;

    let Some(choices) = parsed.get("choices").and_then(|c| c.as_array()) else {
        return (events, finished);
    };
    for choice in choices {
        if let Some(delta) = choice.get("delta") {
            if let Some(content) = delta.get("content").and_then(|c| c.as_str())
                && !content.is_empty()
            {
                events.push(GeneratorEvent::TextDelta {
                    text: content.to_owned(),
                });
            }
            if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                for call in tool_calls {
                    let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                    let function = call.get("function");
                    let name = function.and_then(|f| f.get("name")).and_then(|n| n.as_str());
                    let args = function
                        .and_then(|f| f.get("arguments"))
                        .and_then(|a| a.as_str());
                    accumulator.absorb(index, name, args);
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            if reason == "tool_calls" {
                events.extend(accumulator.finish());
            }
            finished = true;
        }
    }

    (events, finished)
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
impl GenerationBackend for OpenAiGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream(
        &self,
        system: &str,
        history: &[Turn],
        functions: &[FunctionSpec],
    ) -> Result<GeneratorStream> {
        let url = format!("{}/v1/chat/completions", self.base_url());
        let body = build_request_body(&self.config, system, history, functions);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
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
            let mut accumulator = ToolCallAccumulator::default();

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
                    if event.is_done() {
                        break 'read;
                    }
                    let (events, ended) = parse_chunk(&event.data, &mut accumulator);
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
