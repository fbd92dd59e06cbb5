// ── Opsleuth Engine: OpenAI-Compatible Provider ────────────────────────────
// Handles OpenAI, OpenRouter, Ollama, and any OpenAI-compatible REST API.
// Implements the AiProvider golden trait.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::AiProvider;
use crate::engine::http::{
    is_retryable_status, parse_retry_after, retry_delay, shared_client, CircuitBreaker,
    MAX_RETRIES,
};
use crate::engine::types::*;
use async_trait::async_trait;
use futures::StreamExt;
use log::{error, info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::LazyLock;

/// Circuit breaker shared across all OpenAI-compatible requests.
static OPENAI_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(|| CircuitBreaker::new(5, 60));

// ── Struct ─────────────────────────────────────────────────────────────────

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| config.kind.default_base_url().to_string());
        OpenAiProvider {
            client: shared_client(),
            base_url,
            api_key: config.api_key.clone(),
        }
    }

    fn format_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| {
                let mut m = json!({
                    "role": msg.role,
                    "content": msg.content,
                });
                if let Some(tc) = &msg.tool_calls {
                    m["tool_calls"] = json!(tc);
                }
                if let Some(id) = &msg.tool_call_id {
                    m["tool_call_id"] = json!(id);
                }
                if let Some(name) = &msg.name {
                    m["name"] = json!(name);
                }
                m
            })
            .collect()
    }

    fn format_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": t.tool_type,
                    "function": {
                        "name": t.function.name,
                        "description": t.function.description,
                        "parameters": t.function.parameters,
                    }
                })
            })
            .collect()
    }

    /// Parse a single SSE data line from an OpenAI-compatible stream.
    fn parse_sse_chunk(data: &str) -> Option<StreamChunk> {
        if data == "[DONE]" {
            return None;
        }

        let v: Value = serde_json::from_str(data).ok()?;

        let model = v["model"].as_str().map(|s| s.to_string());

        let choice = v["choices"].get(0)?;
        let delta = &choice["delta"];
        let finish_reason = choice["finish_reason"].as_str().map(|s| s.to_string());

        let delta_text = delta["content"].as_str().map(|s| s.to_string());

        let mut tool_calls = Vec::new();
        if let Some(tcs) = delta["tool_calls"].as_array() {
            for tc in tcs {
                let index = tc["index"].as_u64().unwrap_or(0) as usize;
                let func = &tc["function"];
                tool_calls.push(ToolCallDelta {
                    index,
                    id: tc["id"].as_str().map(|s| s.to_string()),
                    function_name: func["name"].as_str().map(|s| s.to_string()),
                    arguments_delta: func["arguments"].as_str().map(|s| s.to_string()),
                });
            }
        }

        // Usage arrives in the final chunk when stream_options.include_usage
        // is set.
        let usage = v.get("usage").and_then(|u| {
            let input = u["prompt_tokens"].as_u64().unwrap_or(0);
            let output = u["completion_tokens"].as_u64().unwrap_or(0);
            if input > 0 || output > 0 {
                Some(TokenUsage {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: u["total_tokens"].as_u64().unwrap_or(input + output),
                })
            } else {
                None
            }
        });

        Some(StreamChunk {
            delta_text,
            tool_calls,
            finish_reason,
            usage,
            model,
        })
    }
}

// ── AiProvider implementation ──────────────────────────────────────────────

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    /// Send a chat completion request with SSE streaming.
    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        temperature: Option<f64>,
    ) -> EngineResult<Vec<StreamChunk>> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut body = json!({
            "model": model,
            "messages": Self::format_messages(messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !tools.is_empty() {
            body["tools"] = json!(Self::format_tools(tools));
        }
        if let Some(temp) = temperature {
            body["temperature"] = json!(temp);
        }

        info!("[provider] OpenAI request to {} model={}", url, model);

        // Circuit breaker: reject immediately if too many recent failures
        if let Err(msg) = OPENAI_CIRCUIT.check() {
            return Err(EngineError::provider("openai", msg));
        }

        let mut last_error = String::new();
        let mut retry_after: Option<u64> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = retry_delay(attempt - 1, retry_after.take()).await;
                warn!(
                    "[provider] OpenAI retry {}/{} after {}ms",
                    attempt,
                    MAX_RETRIES,
                    delay.as_millis()
                );
            }

            let response = match self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    OPENAI_CIRCUIT.record_failure();
                    last_error = format!("HTTP request failed: {}", e);
                    if attempt < MAX_RETRIES {
                        continue;
                    }
                    return Err(EngineError::provider("openai", last_error));
                }
            };

            if !response.status().is_success() {
                let status = response.status().as_u16();
                retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                let body_text = response.text().await.unwrap_or_default();
                last_error = format!("API error {}: {}", status, truncate_utf8(&body_text, 200));
                error!(
                    "[provider] OpenAI error {}: {}",
                    status,
                    truncate_utf8(&body_text, 500)
                );

                OPENAI_CIRCUIT.record_failure();

                // Auth errors are never retried
                if status == 401 || status == 403 {
                    return Err(EngineError::provider("openai", last_error));
                }
                if is_retryable_status(status) && attempt < MAX_RETRIES {
                    continue;
                }
                return Err(EngineError::provider("openai", last_error));
            }

            // ── Read SSE stream ─────────────────────────────────────────
            let mut chunks = Vec::new();
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(result) = byte_stream.next().await {
                let bytes = result.map_err(|e| {
                    EngineError::provider("openai", format!("Stream read error: {}", e))
                })?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Process complete SSE lines
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Some(chunk) = Self::parse_sse_chunk(data) {
                            chunks.push(chunk);
                        } else if data == "[DONE]" {
                            OPENAI_CIRCUIT.record_success();
                            return Ok(chunks);
                        }
                    }
                }
            }

            OPENAI_CIRCUIT.record_success();
            return Ok(chunks);
        }

        Err(EngineError::provider("openai", last_error))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
