// ── Opsleuth Atoms: Golden Traits ──────────────────────────────────────────
// The seams the engine is built around. Concrete implementations live in
// engine/ (providers, gateway, memory store); tests substitute fakes.

use crate::atoms::error::EngineResult;
use crate::atoms::investigation_types::MemoryRecord;
use crate::atoms::types::{Message, StreamChunk, ToolDefinition};
use async_trait::async_trait;

/// An AI chat provider. One implementation per wire format; everything
/// OpenAI-compatible shares a single implementation.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Chat completion with SSE streaming, accumulated into chunks.
    /// Implementations retry transient HTTP failures internally.
    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        temperature: Option<f64>,
    ) -> EngineResult<Vec<StreamChunk>>;

    /// Short provider label for logs and error messages.
    fn name(&self) -> &'static str;
}

/// The external tool-execution layer. The engine only decides which tool
/// names a persona may see; execution happens behind this seam.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    /// Enumerate the tools the gateway currently exposes.
    async fn list_tools(&self) -> EngineResult<Vec<ToolDefinition>>;

    /// Invoke one tool by (prefixed) name with JSON arguments.
    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> EngineResult<String>;
}

/// Backing store for the memory adapter: durable append, namespace-scoped
/// search. The adapter owns namespace derivation; backends only see the
/// final namespace strings.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Append one event under a namespace; returns the new record id.
    async fn append(&self, namespace: &str, content: &str) -> EngineResult<String>;

    /// Search records whose namespace equals `namespace` or sits below it
    /// (`namespace/...`), best matches first, capped at `limit`.
    async fn search(
        &self,
        namespace: &str,
        query: &str,
        limit: usize,
    ) -> EngineResult<Vec<MemoryRecord>>;
}
