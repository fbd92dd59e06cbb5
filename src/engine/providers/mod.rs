// ── Opsleuth Engine: AI Provider Registry ──────────────────────────────────
// AnyProvider wraps Box<dyn AiProvider> so adding a new provider
// never requires modifying the factory enum — just implement the trait.

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use crate::atoms::error::EngineResult;
use crate::atoms::traits::AiProvider;
use crate::engine::types::{Message, ProviderConfig, ProviderKind, StreamChunk, ToolDefinition};

// ── Provider factory ───────────────────────────────────────────────────────

/// Type-erased AI provider. Callers hold `AnyProvider` and call
/// `.chat_stream()` without knowing which concrete backend is in use.
pub struct AnyProvider(Box<dyn AiProvider>);

impl AnyProvider {
    /// Construct the right concrete provider from a `ProviderConfig`.
    ///
    /// Anthropic has its own wire format; every other kind speaks the
    /// OpenAI-compatible dialect (OpenAI, Ollama, OpenRouter, Custom).
    pub fn from_config(config: &ProviderConfig) -> Self {
        let provider: Box<dyn AiProvider> = match config.kind {
            ProviderKind::Anthropic => Box::new(AnthropicProvider::new(config)),
            _ => Box::new(OpenAiProvider::new(config)),
        };
        AnyProvider(provider)
    }

    /// Wrap an already-built provider (tests inject fakes this way).
    pub fn from_boxed(provider: Box<dyn AiProvider>) -> Self {
        AnyProvider(provider)
    }

    /// Chat completion with SSE streaming.
    pub async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        temperature: Option<f64>,
    ) -> EngineResult<Vec<StreamChunk>> {
        self.0.chat_stream(messages, tools, model, temperature).await
    }

    /// Short label of the underlying provider.
    pub fn name(&self) -> &'static str {
        self.0.name()
    }
}
