// ── Opsleuth Atoms: Error Types ────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Provider, Config…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • Only configuration/contract violations are expected to cross component
//     boundaries; everything else is handled locally and degraded to a
//     default value or a plain-language result string.
//   • No variant carries secret material (API keys) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// AI provider HTTP or API-level failure (non-secret detail only).
    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    /// Tool execution failure.
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Tool gateway transport or protocol failure.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Engine configuration is invalid, or a caller violated an identity
    /// contract (e.g. a session-scoped memory write without a session id).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A wall-clock budget expired (specialist or investigation level).
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a provider error with name and message.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider { provider: provider.into(), message: message.into() }
    }

    /// Create a tool error with name and message.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool { tool: tool.into(), message: message.into() }
    }

    /// True for faults worth retrying at an integration boundary.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Network(_) | EngineError::Gateway(_))
    }
}

// ── String bridges ─────────────────────────────────────────────────────────
// Allow `?` on helpers still returning `Result<T, String>` inside functions
// that return `EngineResult<T>`.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations should return this type.
pub type EngineResult<T> = Result<T, EngineError>;

// ── Conversion: EngineError → String ──────────────────────────────────────
// Lets host boundaries (`Result<T, String>`) call `.map_err(EngineError::into)`.

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}
