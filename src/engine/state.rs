// ── Opsleuth Engine: Shared State & Configuration ──────────────────────────
//
// EngineConfig is an explicitly constructed, serde-friendly value the host
// builds and hands to EngineState::new — no module-level config caches, no
// hidden process-wide state. EngineState owns the resolved provider, the
// memory adapter, the tool gateway, and the loaded tool list; the whole
// pipeline borrows it.

use crate::atoms::constants::{
    DEFAULT_INVESTIGATION_TIMEOUT_SECS, DEFAULT_MAX_TOOL_ROUNDS, DEFAULT_RECALL_LIMIT,
    DEFAULT_SPECIALIST_TIMEOUT_SECS, DEFAULT_TOOL_TIMEOUT_SECS, MAX_MEMORY_EVENT_CHARS,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::{MemoryBackend, ToolGateway};
use crate::engine::memory::MemoryStore;
use crate::engine::providers::AnyProvider;
use crate::engine::tools::shared_tools;
use crate::engine::types::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ── Model routing ──────────────────────────────────────────────────────────

/// Per-role model overrides with a shared default. Planning benefits from
/// a stronger model than the per-step specialists; both fall back to the
/// default when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRouting {
    pub default_model: String,
    #[serde(default)]
    pub planner_model: Option<String>,
    #[serde(default)]
    pub specialist_model: Option<String>,
    #[serde(default)]
    pub aggregator_model: Option<String>,
}

impl ModelRouting {
    pub fn new(default_model: impl Into<String>) -> Self {
        ModelRouting {
            default_model: default_model.into(),
            planner_model: None,
            specialist_model: None,
            aggregator_model: None,
        }
    }

    pub fn planner_model(&self) -> &str {
        self.planner_model.as_deref().unwrap_or(&self.default_model)
    }

    pub fn specialist_model(&self) -> &str {
        self.specialist_model.as_deref().unwrap_or(&self.default_model)
    }

    pub fn aggregator_model(&self) -> &str {
        self.aggregator_model.as_deref().unwrap_or(&self.default_model)
    }
}

// ── Engine configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Provider table; the engine resolves one at construction.
    pub providers: Vec<ProviderConfig>,
    /// Id of the provider to use. Unset = first in the table.
    #[serde(default)]
    pub default_provider: Option<String>,
    pub model_routing: ModelRouting,

    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_specialist_timeout")]
    pub specialist_timeout_secs: u64,
    #[serde(default = "default_investigation_timeout")]
    pub investigation_timeout_secs: u64,

    /// Max memories per category pulled into the planner's context.
    #[serde(default = "default_recall_limit")]
    pub recall_limit: usize,
    /// Auto-capture reusable facts from specialist responses.
    #[serde(default = "default_true")]
    pub auto_capture: bool,
    /// Prepend an LLM-written executive summary to the final response.
    #[serde(default = "default_true")]
    pub executive_summary: bool,
    /// Cut for persisted conversation events before the truncation marker.
    #[serde(default = "default_max_event_chars")]
    pub max_memory_event_chars: usize,
}

fn default_max_tool_rounds() -> u32 { DEFAULT_MAX_TOOL_ROUNDS }
fn default_tool_timeout() -> u64 { DEFAULT_TOOL_TIMEOUT_SECS }
fn default_specialist_timeout() -> u64 { DEFAULT_SPECIALIST_TIMEOUT_SECS }
fn default_investigation_timeout() -> u64 { DEFAULT_INVESTIGATION_TIMEOUT_SECS }
fn default_recall_limit() -> usize { DEFAULT_RECALL_LIMIT }
fn default_max_event_chars() -> usize { MAX_MEMORY_EVENT_CHARS }
fn default_true() -> bool { true }

impl EngineConfig {
    /// Minimal config: one provider table entry plus a default model.
    pub fn new(providers: Vec<ProviderConfig>, default_model: impl Into<String>) -> Self {
        EngineConfig {
            providers,
            default_provider: None,
            model_routing: ModelRouting::new(default_model),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
            specialist_timeout_secs: DEFAULT_SPECIALIST_TIMEOUT_SECS,
            investigation_timeout_secs: DEFAULT_INVESTIGATION_TIMEOUT_SECS,
            recall_limit: DEFAULT_RECALL_LIMIT,
            auto_capture: true,
            executive_summary: true,
            max_memory_event_chars: MAX_MEMORY_EVENT_CHARS,
        }
    }

    /// Resolve the provider config: the named default, else the first.
    fn resolve_provider(&self) -> EngineResult<&ProviderConfig> {
        if let Some(id) = &self.default_provider {
            return self
                .providers
                .iter()
                .find(|p| &p.id == id)
                .ok_or_else(|| EngineError::Config(format!("default provider '{}' not found", id)));
        }
        self.providers
            .first()
            .ok_or_else(|| EngineError::Config("no AI provider configured".into()))
    }
}

// ── Engine state ───────────────────────────────────────────────────────────

pub struct EngineState {
    pub config: EngineConfig,
    pub provider: AnyProvider,
    pub memory: MemoryStore,
    pub gateway: Arc<dyn ToolGateway>,
    /// Gateway tools (prefixed) + shared memory tools, loaded once.
    pub tools: Vec<ToolDefinition>,
}

impl EngineState {
    /// Wire the engine together. Loads the gateway's tool list up front —
    /// the gateway implementation owns the retry policy for that call.
    pub async fn new(
        config: EngineConfig,
        memory_backend: Option<Arc<dyn MemoryBackend>>,
        gateway: Arc<dyn ToolGateway>,
    ) -> EngineResult<Self> {
        let provider = AnyProvider::from_config(config.resolve_provider()?);

        let memory = match memory_backend {
            Some(backend) => {
                MemoryStore::new(backend).with_max_event_chars(config.max_memory_event_chars)
            }
            None => MemoryStore::uninitialized(),
        };

        let mut tools = gateway.list_tools().await?;
        tools.extend(shared_tools());
        info!(
            "[engine] Initialized: provider={} tools={} memory={}",
            provider.name(),
            tools.len(),
            if memory.is_initialized() { "on" } else { "off" }
        );

        Ok(EngineState { config, provider, memory, gateway, tools })
    }

    /// Test seam: construct with an already-built provider and tool list.
    pub fn with_parts(
        config: EngineConfig,
        provider: AnyProvider,
        memory: MemoryStore,
        gateway: Arc<dyn ToolGateway>,
        tools: Vec<ToolDefinition>,
    ) -> Self {
        EngineState { config, provider, memory, gateway, tools }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
