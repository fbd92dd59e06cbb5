// ── Opsleuth Engine: Anthropic Claude Provider ─────────────────────────────
// Implements the AiProvider golden trait.
// All Claude-specific SSE event parsing and prompt-caching logic lives here.

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

/// Circuit breaker shared across all Anthropic requests.
static ANTHROPIC_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(|| CircuitBreaker::new(5, 60));

// ── Struct ─────────────────────────────────────────────────────────────────

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| config.kind.default_base_url().to_string());
        AnthropicProvider {
            client: shared_client(),
            base_url,
            api_key: config.api_key.clone(),
        }
    }

    /// Split out the system prompt and convert the transcript to
    /// Anthropic's block format. Tool results become `tool_result`
    /// blocks on user-role messages.
    fn format_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
        let mut system = None;
        let mut formatted = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => {
                    system = Some(msg.content.clone());
                }
                Role::Tool => {
                    if let Some(tc_id) = &msg.tool_call_id {
                        formatted.push(json!({
                            "role": "user",
                            "content": [{
                                "type": "tool_result",
                                "tool_use_id": tc_id,
                                "content": msg.content,
                            }]
                        }));
                    }
                }
                Role::Assistant => {
                    if let Some(tool_calls) = &msg.tool_calls {
                        let mut content_blocks: Vec<Value> = vec![];
                        if !msg.content.is_empty() {
                            content_blocks.push(json!({"type": "text", "text": msg.content}));
                        }
                        for tc in tool_calls {
                            let input: Value =
                                serde_json::from_str(&tc.function.arguments).unwrap_or(json!({}));
                            content_blocks.push(json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": tc.function.name,
                                "input": input,
                            }));
                        }
                        formatted.push(json!({
                            "role": "assistant",
                            "content": content_blocks,
                        }));
                    } else {
                        formatted.push(json!({
                            "role": "assistant",
                            "content": msg.content,
                        }));
                    }
                }
                Role::User => {
                    formatted.push(json!({
                        "role": "user",
                        "content": msg.content,
                    }));
                }
            }
        }

        (system, formatted)
    }

    fn format_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.function.name,
                    "description": t.function.description,
                    "input_schema": t.function.parameters,
                })
            })
            .collect()
    }

    fn parse_sse_event(data: &str) -> Option<StreamChunk> {
        let v: Value = serde_json::from_str(data).ok()?;
        let event_type = v["type"].as_str()?;

        match event_type {
            "content_block_delta" => {
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => Some(StreamChunk {
                        delta_text: delta["text"].as_str().map(|s| s.to_string()),
                        ..Default::default()
                    }),
                    "input_json_delta" => {
                        let index = v["index"].as_u64().unwrap_or(0) as usize;
                        Some(StreamChunk {
                            tool_calls: vec![ToolCallDelta {
                                index,
                                id: None,
                                function_name: None,
                                arguments_delta: delta["partial_json"]
                                    .as_str()
                                    .map(|s| s.to_string()),
                            }],
                            ..Default::default()
                        })
                    }
                    _ => None,
                }
            }
            "content_block_start" => {
                let block = &v["content_block"];
                if block["type"].as_str().unwrap_or("") == "tool_use" {
                    let index = v["index"].as_u64().unwrap_or(0) as usize;
                    Some(StreamChunk {
                        tool_calls: vec![ToolCallDelta {
                            index,
                            id: block["id"].as_str().map(|s| s.to_string()),
                            function_name: block["name"].as_str().map(|s| s.to_string()),
                            arguments_delta: None,
                        }],
                        ..Default::default()
                    })
                } else {
                    None
                }
            }
            "message_delta" => {
                // Anthropic reports output usage in message_delta
                let usage = v.get("usage").and_then(|u| {
                    let output = u["output_tokens"].as_u64().unwrap_or(0);
                    if output > 0 {
                        Some(TokenUsage {
                            input_tokens: 0,
                            output_tokens: output,
                            total_tokens: output,
                        })
                    } else {
                        None
                    }
                });
                Some(StreamChunk {
                    finish_reason: v["delta"]["stop_reason"].as_str().map(|s| s.to_string()),
                    usage,
                    ..Default::default()
                })
            }
            "message_start" => {
                // message_start carries the input token count and the actual
                // model name
                let msg = v.get("message");
                let model = msg.and_then(|m| m["model"].as_str()).map(|s| s.to_string());
                let usage = msg.and_then(|m| m.get("usage")).and_then(|u| {
                    let input = u["input_tokens"].as_u64().unwrap_or(0);
                    if input > 0 {
                        Some(TokenUsage {
                            input_tokens: input,
                            output_tokens: 0,
                            total_tokens: input,
                        })
                    } else {
                        None
                    }
                });
                Some(StreamChunk {
                    usage,
                    model,
                    ..Default::default()
                })
            }
            "message_stop" => Some(StreamChunk {
                finish_reason: Some("stop".into()),
                ..Default::default()
            }),
            _ => None,
        }
    }
}

// ── AiProvider implementation ──────────────────────────────────────────────

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        temperature: Option<f64>,
    ) -> EngineResult<Vec<StreamChunk>> {
        let url = format!("{}/messages", self.base_url.trim_end_matches('/'));

        let (system, formatted_messages) = Self::format_messages(messages);

        let mut body = json!({
            "model": model,
            "messages": formatted_messages,
            "max_tokens": 8192,
            "stream": true,
        });

        // Prompt caching: send the system prompt as a content block with
        // cache_control on it, so the prefix is cached across the many
        // planner/specialist calls of one investigation.
        if let Some(sys) = system {
            body["system"] = json!([
                {
                    "type": "text",
                    "text": sys,
                    "cache_control": { "type": "ephemeral" }
                }
            ]);
        }
        if !tools.is_empty() {
            let mut tool_list = Self::format_tools(tools);
            if let Some(last) = tool_list.last_mut() {
                if let Some(obj) = last.as_object_mut() {
                    obj.insert("cache_control".into(), json!({ "type": "ephemeral" }));
                }
            }
            body["tools"] = json!(tool_list);
        }
        if let Some(temp) = temperature {
            body["temperature"] = json!(temp);
        }

        info!("[provider] Anthropic request to {} model={}", url, model);

        if let Err(msg) = ANTHROPIC_CIRCUIT.check() {
            return Err(EngineError::provider("anthropic", msg));
        }

        let mut last_error = String::new();
        let mut retry_after: Option<u64> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = retry_delay(attempt - 1, retry_after.take()).await;
                warn!(
                    "[provider] Anthropic retry {}/{} after {}ms",
                    attempt,
                    MAX_RETRIES,
                    delay.as_millis()
                );
            }

            let response = match self
                .client
                .post(&url)
                .header("anthropic-version", "2023-06-01")
                .header("Content-Type", "application/json")
                .header("x-api-key", &self.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    ANTHROPIC_CIRCUIT.record_failure();
                    last_error = format!("HTTP request failed: {}", e);
                    if attempt < MAX_RETRIES {
                        continue;
                    }
                    return Err(EngineError::provider("anthropic", last_error));
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
                    "[provider] Anthropic error {}: {}",
                    status,
                    truncate_utf8(&body_text, 500)
                );

                ANTHROPIC_CIRCUIT.record_failure();

                if status == 401 || status == 403 {
                    return Err(EngineError::provider("anthropic", last_error));
                }
                if is_retryable_status(status) && attempt < MAX_RETRIES {
                    continue;
                }
                return Err(EngineError::provider("anthropic", last_error));
            }

            // ── Read SSE stream ─────────────────────────────────────────
            let mut chunks = Vec::new();
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(result) = byte_stream.next().await {
                let bytes = result.map_err(|e| {
                    EngineError::provider("anthropic", format!("Stream read error: {}", e))
                })?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Some(chunk) = Self::parse_sse_event(data) {
                            chunks.push(chunk);
                        }
                    }
                }
            }

            ANTHROPIC_CIRCUIT.record_success();
            return Ok(chunks);
        }

        Err(EngineError::provider("anthropic", last_error))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_delta() {
        let data = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        let chunk = AnthropicProvider::parse_sse_event(data).unwrap();
        assert_eq!(chunk.delta_text.as_deref(), Some("Hi"));
    }

    #[test]
    fn test_parse_tool_use_start_and_args() {
        let start = r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"gw_sre_search_logs"}}"#;
        let chunk = AnthropicProvider::parse_sse_event(start).unwrap();
        assert_eq!(chunk.tool_calls[0].id.as_deref(), Some("toolu_1"));
        assert_eq!(
            chunk.tool_calls[0].function_name.as_deref(),
            Some("gw_sre_search_logs")
        );

        let args = r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"query\":"}}"#;
        let chunk = AnthropicProvider::parse_sse_event(args).unwrap();
        assert_eq!(chunk.tool_calls[0].index, 1);
        assert_eq!(
            chunk.tool_calls[0].arguments_delta.as_deref(),
            Some("{\"query\":")
        );
    }

    #[test]
    fn test_parse_message_stop() {
        let data = r#"{"type":"message_stop"}"#;
        let chunk = AnthropicProvider::parse_sse_event(data).unwrap();
        assert_eq!(chunk.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_system_message_splits_out() {
        let messages = vec![
            Message::text(Role::System, "persona"),
            Message::text(Role::User, "hello"),
        ];
        let (system, formatted) = AnthropicProvider::format_messages(&messages);
        assert_eq!(system.as_deref(), Some("persona"));
        assert_eq!(formatted.len(), 1);
        assert_eq!(formatted[0]["role"], "user");
    }

    #[test]
    fn test_tool_result_becomes_user_block() {
        let mut msg = Message::text(Role::Tool, "pod is healthy");
        msg.tool_call_id = Some("toolu_9".into());
        let (_, formatted) = AnthropicProvider::format_messages(&[msg]);
        assert_eq!(formatted[0]["role"], "user");
        assert_eq!(formatted[0]["content"][0]["type"], "tool_result");
        assert_eq!(formatted[0]["content"][0]["tool_use_id"], "toolu_9");
    }
}
