// ── Opsleuth Engine: Memory Store Adapter ──────────────────────────────────
//
// Uniform save/retrieve interface over the namespaced long-term memory
// store. Translates (memory kind, actor, session, query) into namespace
// strings and insulates the rest of the engine from the backend's API.
//
// Failure contract: a memory outage must never abort an investigation.
// `retrieve` returns an empty list on any failure; `save` returns
// Ok(false) and logs a warning. The only error that crosses this
// boundary is a caller contract violation — a session-scoped save
// without a session id.
//
// Module layout:
//   store.rs — default SQLite backend (append-only memory_events table)
//   mod.rs   — MemoryKind namespaces, MemoryStore adapter, conversation turns

pub mod store;

pub use store::SqliteMemoryStore;

use crate::atoms::constants::{
    MAX_MEMORY_EVENT_CHARS, NS_CONVERSATIONS_ROOT, NS_INFRA_ROOT, NS_INVESTIGATIONS_ROOT,
    NS_PREFERENCES_ROOT, TRUNCATION_MARKER,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::MemoryBackend;
use crate::engine::types::*;
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ── Memory kinds and namespaces ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// User-scoped, never session-partitioned.
    Preferences,
    /// Facts about the user's systems; session-scoped on write,
    /// optionally cross-session on read.
    Infrastructure,
    /// Past investigation summaries; same scoping as Infrastructure.
    Investigations,
}

impl MemoryKind {
    /// Whether a save of this kind must name a session.
    fn session_required_for_save(&self) -> bool {
        !matches!(self, MemoryKind::Preferences)
    }

    /// Derive the namespace for this kind. Pure and deterministic:
    /// preferences ignore the session entirely; the other kinds append it
    /// when present, and omitting it yields the strictly broader
    /// cross-session scope.
    pub fn namespace(&self, actor_id: &str, session_id: Option<&str>) -> String {
        match self {
            MemoryKind::Preferences => format!("{}/{}/preferences", NS_PREFERENCES_ROOT, actor_id),
            MemoryKind::Infrastructure => match session_id {
                Some(session) => format!("{}/{}/{}", NS_INFRA_ROOT, actor_id, session),
                None => format!("{}/{}", NS_INFRA_ROOT, actor_id),
            },
            MemoryKind::Investigations => match session_id {
                Some(session) => format!("{}/{}/{}", NS_INVESTIGATIONS_ROOT, actor_id, session),
                None => format!("{}/{}", NS_INVESTIGATIONS_ROOT, actor_id),
            },
        }
    }

    fn label(&self) -> &'static str {
        match self {
            MemoryKind::Preferences => "preferences",
            MemoryKind::Infrastructure => "infrastructure",
            MemoryKind::Investigations => "investigations",
        }
    }
}

// ── Conversation events ────────────────────────────────────────────────────

/// One event of a persisted conversation turn: the user prompt, an agent's
/// final text, or a tool call/response. A turn's events are batched into a
/// single store write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub role: String,
    pub content: String,
}

impl ConversationEvent {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        ConversationEvent { role: role.into(), content: content.into() }
    }
}

// ── Adapter ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MemoryStore {
    backend: Option<Arc<dyn MemoryBackend>>,
    max_event_chars: usize,
}

impl MemoryStore {
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        MemoryStore { backend: Some(backend), max_event_chars: MAX_MEMORY_EVENT_CHARS }
    }

    /// A store with no backend: every retrieve is empty, every save is a
    /// no-op returning false. Lets the pipeline run memory-less.
    pub fn uninitialized() -> Self {
        MemoryStore { backend: None, max_event_chars: MAX_MEMORY_EVENT_CHARS }
    }

    pub fn with_max_event_chars(mut self, max: usize) -> Self {
        self.max_event_chars = max;
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.is_some()
    }

    /// Append one event. Returns Ok(false) on any backend failure (logged);
    /// raises only when a session-scoped kind is saved without a session.
    pub async fn save(
        &self,
        kind: MemoryKind,
        actor_id: &str,
        payload: &str,
        session_id: Option<&str>,
    ) -> EngineResult<bool> {
        if kind.session_required_for_save() && session_id.is_none() {
            return Err(EngineError::Config(format!(
                "memory kind '{}' requires a session id to save",
                kind.label()
            )));
        }
        let session = if kind.session_required_for_save() { session_id } else { None };
        let namespace = kind.namespace(actor_id, session);
        Ok(self.append_raw(&namespace, payload).await)
    }

    /// Search one kind's scope. Never raises: failures and the
    /// uninitialized state both come back as an empty list, which callers
    /// treat as "no information".
    pub async fn retrieve(
        &self,
        kind: MemoryKind,
        actor_id: &str,
        query: &str,
        max_results: usize,
        session_id: Option<&str>,
    ) -> Vec<MemoryRecord> {
        let Some(backend) = &self.backend else {
            return vec![];
        };
        let session = if kind.session_required_for_save() { session_id } else { None };
        let namespace = kind.namespace(actor_id, session);
        match backend.search(&namespace, query, max_results).await {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    "[memory] Retrieve failed for {} (ns={}): {} — treating as empty",
                    kind.label(),
                    namespace,
                    e
                );
                vec![]
            }
        }
    }

    /// Persist one conversation turn — the events batched into a single
    /// store write, each event truncated with an explicit marker when it
    /// exceeds the configured cap. Best-effort.
    pub async fn save_conversation_turn(
        &self,
        actor_id: &str,
        session_id: &str,
        events: &[ConversationEvent],
    ) -> bool {
        if events.is_empty() {
            return true;
        }
        let truncated: Vec<ConversationEvent> = events
            .iter()
            .map(|e| ConversationEvent {
                role: e.role.clone(),
                content: self.truncate_event(&e.content),
            })
            .collect();
        let payload = match serde_json::to_string(&truncated) {
            Ok(p) => p,
            Err(e) => {
                warn!("[memory] Failed to serialize conversation turn: {}", e);
                return false;
            }
        };
        let namespace = format!("{}/{}/{}", NS_CONVERSATIONS_ROOT, actor_id, session_id);
        self.append_raw(&namespace, &payload).await
    }

    fn truncate_event(&self, content: &str) -> String {
        if content.len() <= self.max_event_chars {
            return content.to_string();
        }
        let cut = truncate_utf8(content, self.max_event_chars);
        format!("{}{}", cut, TRUNCATION_MARKER)
    }

    async fn append_raw(&self, namespace: &str, payload: &str) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };
        match backend.append(namespace, payload).await {
            Ok(_) => true,
            Err(e) => {
                warn!("[memory] Save failed (ns={}): {} — continuing without it", namespace, e);
                false
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
