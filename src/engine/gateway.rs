// ── Opsleuth Engine: Tool Gateway Client ───────────────────────────────────
//
// Connects the engine to the external tool-execution layer: a JSON-RPC
// over HTTP gateway exposing `tools/list` and `tools/call`.
//
// The engine never executes tools itself — it only decides which tool
// names a persona may see (engine/tools.rs) and forwards calls here.
// Gateway tools are namespaced as `gw_{gateway_id}_{tool}` so two
// gateways can coexist without name collisions; the allow-list check
// strips that transport prefix.

use crate::atoms::constants::{GATEWAY_LOAD_MAX_RETRIES, GATEWAY_TOOL_PREFIX};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::ToolGateway;
use crate::engine::http::{retry_delay, shared_client};
use crate::engine::types::*;
use async_trait::async_trait;
use log::{info, warn};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default timeout for `tools/list` (seconds).
const LIST_TIMEOUT: u64 = 30;
/// Timeout for tool calls — tools can be slow (seconds).
const CALL_TIMEOUT: u64 = 120;

// ── Name helpers ───────────────────────────────────────────────────────────

/// Strip the `gw_{gateway_id}_` transport prefix from a tool name,
/// returning the bare tool identifier. Names without the prefix pass
/// through unchanged.
pub fn base_tool_name(name: &str) -> &str {
    let Some(rest) = name.strip_prefix(GATEWAY_TOOL_PREFIX) else {
        return name;
    };
    // `gw_{id}_{tool}` — the id itself never contains '_'
    match rest.split_once('_') {
        Some((_gateway_id, tool)) if !tool.is_empty() => tool,
        _ => name,
    }
}

/// Prefix a bare tool name for a given gateway.
pub fn prefixed_tool_name(gateway_id: &str, tool: &str) -> String {
    format!("{}{}_{}", GATEWAY_TOOL_PREFIX, gateway_id, tool)
}

// ── HTTP gateway ───────────────────────────────────────────────────────────

/// A connected JSON-RPC tool gateway.
pub struct HttpToolGateway {
    /// Short identifier used in the tool-name prefix. Must not contain '_'.
    gateway_id: String,
    endpoint: String,
    auth_token: Option<String>,
    client: reqwest::Client,
    /// Monotonically increasing request ID.
    next_id: AtomicU64,
}

impl HttpToolGateway {
    pub fn new(gateway_id: impl Into<String>, endpoint: impl Into<String>, auth_token: Option<String>) -> EngineResult<Self> {
        let gateway_id = gateway_id.into();
        if gateway_id.is_empty() || gateway_id.contains('_') {
            return Err(EngineError::Config(format!(
                "gateway id '{}' must be non-empty and must not contain '_'",
                gateway_id
            )));
        }
        Ok(HttpToolGateway {
            gateway_id,
            endpoint: endpoint.into(),
            auth_token,
            client: shared_client(),
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn rpc(&self, method: &str, params: Value, timeout_secs: u64) -> EngineResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": method,
            "params": params,
        });

        let mut req = self
            .client
            .post(&self.endpoint)
            .timeout(Duration::from_secs(timeout_secs))
            .header("Content-Type", "application/json");
        if let Some(token) = &self.auth_token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        let response = req
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Gateway(format!("{} transport: {}", method, e)))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(EngineError::Gateway(format!("{} returned HTTP {}", method, status)));
        }

        let v: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Gateway(format!("{} body: {}", method, e)))?;

        if let Some(err) = v.get("error") {
            return Err(EngineError::Gateway(format!(
                "{} failed: {} (code={})",
                method,
                err["message"].as_str().unwrap_or("unknown"),
                err["code"].as_i64().unwrap_or(0)
            )));
        }

        Ok(v.get("result").cloned().unwrap_or(Value::Null))
    }

    /// `tools/list` with bounded exponential-backoff retry. This is the
    /// one integration point where transient gateway faults are retried
    /// rather than degraded; a gateway with no tools is a dead engine.
    pub async fn load_tools(&self) -> EngineResult<Vec<ToolDefinition>> {
        let mut last_err = EngineError::Gateway("tools/list never attempted".into());
        for attempt in 0..=GATEWAY_LOAD_MAX_RETRIES {
            if attempt > 0 {
                let delay = retry_delay(attempt - 1, None).await;
                warn!(
                    "[gateway] tools/list retry {}/{} after {}ms",
                    attempt,
                    GATEWAY_LOAD_MAX_RETRIES,
                    delay.as_millis()
                );
            }
            match self.fetch_tools().await {
                Ok(tools) => {
                    info!(
                        "[gateway] Gateway '{}' exposes {} tools",
                        self.gateway_id,
                        tools.len()
                    );
                    return Ok(tools);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn fetch_tools(&self) -> EngineResult<Vec<ToolDefinition>> {
        let result = self.rpc("tools/list", json!({}), LIST_TIMEOUT).await?;
        let tools = result["tools"]
            .as_array()
            .ok_or_else(|| EngineError::Gateway("tools/list: missing tools array".into()))?;

        let mut defs = Vec::with_capacity(tools.len());
        for t in tools {
            let name = t["name"]
                .as_str()
                .ok_or_else(|| EngineError::Gateway("tools/list: tool without name".into()))?;
            defs.push(ToolDefinition::function(
                prefixed_tool_name(&self.gateway_id, name),
                t["description"].as_str().unwrap_or_default(),
                t.get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            ));
        }
        Ok(defs)
    }
}

#[async_trait]
impl ToolGateway for HttpToolGateway {
    async fn list_tools(&self) -> EngineResult<Vec<ToolDefinition>> {
        self.load_tools().await
    }

    /// Invoke one tool. Accepts the prefixed name the model saw and
    /// forwards the bare name to the gateway.
    async fn call_tool(&self, name: &str, arguments: Value) -> EngineResult<String> {
        let bare = base_tool_name(name);
        let result = self
            .rpc(
                "tools/call",
                json!({"name": bare, "arguments": arguments}),
                CALL_TIMEOUT,
            )
            .await?;

        if result["isError"].as_bool().unwrap_or(false) {
            return Err(EngineError::tool(bare, extract_text_content(&result)));
        }
        Ok(extract_text_content(&result))
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Extract text content from gateway content blocks, concatenated.
/// Falls back to the raw JSON when the result carries no text blocks.
fn extract_text_content(result: &Value) -> String {
    let Some(blocks) = result["content"].as_array() else {
        return result.to_string();
    };
    let texts: Vec<&str> = blocks
        .iter()
        .filter_map(|c| {
            if c["type"].as_str() == Some("text") {
                c["text"].as_str()
            } else {
                None
            }
        })
        .collect();
    if texts.is_empty() {
        result.to_string()
    } else {
        texts.join("\n")
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
