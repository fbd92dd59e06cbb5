// ── Opsleuth Atoms: Investigation Types ────────────────────────────────────
// Domain types for the investigation pipeline: the plan, the per-session
// state threaded through planner → router → specialists → aggregator, and
// the memory record shape the store adapter returns.
//
// Atoms layer rule: no I/O, no side effects, no imports from engine/.

use crate::atoms::types::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Specialist identity ────────────────────────────────────────────────────

/// Closed set of specialist personas. Identity is resolved at construction
/// time — never inferred from name-pattern matching on free strings.
/// The capability surface (allowed tools, system prompt) lives with the
/// agent runner in `engine::specialists`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialistKind {
    #[serde(rename = "kubernetes_agent")]
    Kubernetes,
    #[serde(rename = "logs_agent")]
    Logs,
    #[serde(rename = "metrics_agent")]
    Metrics,
    #[serde(rename = "runbooks_agent")]
    Runbooks,
}

impl SpecialistKind {
    pub fn all() -> [SpecialistKind; 4] {
        [
            SpecialistKind::Kubernetes,
            SpecialistKind::Logs,
            SpecialistKind::Metrics,
            SpecialistKind::Runbooks,
        ]
    }

    /// Stable machine identifier, also the wire form in plans.
    pub fn agent_id(&self) -> &'static str {
        match self {
            SpecialistKind::Kubernetes => "kubernetes_agent",
            SpecialistKind::Logs => "logs_agent",
            SpecialistKind::Metrics => "metrics_agent",
            SpecialistKind::Runbooks => "runbooks_agent",
        }
    }

    /// Human-readable persona name, the key in `agent_results`.
    pub fn display_name(&self) -> &'static str {
        match self {
            SpecialistKind::Kubernetes => "Kubernetes Infrastructure Agent",
            SpecialistKind::Logs => "Application Logs Agent",
            SpecialistKind::Metrics => "Performance Metrics Agent",
            SpecialistKind::Runbooks => "Operational Runbooks Agent",
        }
    }

    /// Tolerant parse of planner output: accepts the canonical agent id,
    /// the bare domain word, or the display name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase();
        let base = normalized.strip_suffix("_agent").unwrap_or(&normalized);
        match base {
            "kubernetes_agent" | "kubernetes" | "k8s" => Some(SpecialistKind::Kubernetes),
            "logs_agent" | "logs" | "log" => Some(SpecialistKind::Logs),
            "metrics_agent" | "metrics" | "performance" => Some(SpecialistKind::Metrics),
            "runbooks_agent" | "runbooks" | "runbook" => Some(SpecialistKind::Runbooks),
            _ => SpecialistKind::all()
                .into_iter()
                .find(|k| k.display_name().to_lowercase() == normalized),
        }
    }
}

// ── Investigation plan ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanComplexity {
    /// Single-domain lookups and status checks — execute without approval.
    Simple,
    /// Multi-domain or potentially disruptive work — gated on approval.
    Complex,
}

/// Created once per investigation by the planner; read (never mutated) by
/// the router on every step; discarded at session end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestigationPlan {
    /// Ordered free-text instructions, conceptually one per specialist hop.
    pub steps: Vec<String>,
    /// Ordered specialist sequence. May legitimately differ in length
    /// from `steps`; the router trusts this field, not `steps`.
    pub agents_sequence: Vec<SpecialistKind>,
    pub complexity: PlanComplexity,
    /// Simple plans run without confirmation; Complex plans park on an
    /// approval gate unless the caller set the auto-approve override.
    pub auto_execute: bool,
    pub reasoning: String,
    /// Opt-out of the repeated-agent safety valve for plans that
    /// intentionally revisit a specialist.
    #[serde(default)]
    pub requires_collaboration: bool,
}

// ── Memory records ─────────────────────────────────────────────────────────

/// One append-only event as returned by the memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    /// Hierarchical namespace the record was written under.
    pub namespace: String,
    /// Opaque text payload (often itself JSON).
    pub content: String,
    pub created_at: String,
}

/// Snapshot of retrieved memories, attached once by the planner and
/// read-only afterward. Empty categories mean "no information", never error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryContext {
    pub preferences: Vec<MemoryRecord>,
    pub infrastructure: Vec<MemoryRecord>,
    pub investigations: Vec<MemoryRecord>,
}

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.preferences.is_empty()
            && self.infrastructure.is_empty()
            && self.investigations.is_empty()
    }
}

// ── Trace events ───────────────────────────────────────────────────────────

/// Raw tool-call/tool-response events captured per specialist invocation.
/// Kept in metadata for debugging and formatting, not for routing decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    ToolCall { name: String, arguments: String },
    ToolResult { name: String, output: String, success: bool },
}

// ── Session state ──────────────────────────────────────────────────────────

/// Typed rendition of the investigation's mutable metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvestigationMetadata {
    /// The plan, once created. Exactly one per investigation.
    pub plan: Option<InvestigationPlan>,
    /// Cursor into `plan.agents_sequence` — the next step to route.
    pub plan_step: usize,
    /// Human-readable reasoning for the most recent routing decision.
    pub routing_reasoning: Option<String>,
    /// Set when a Complex plan is parked awaiting user approval; the
    /// aggregator renders an approval prompt instead of results.
    pub plan_pending_approval: bool,
    /// Per-agent tool traces, keyed by agent id.
    pub traces: HashMap<String, Vec<TraceEvent>>,
}

/// State for one investigation, created fresh per user turn and threaded
/// through the whole pipeline. Isolated per session — the memory store is
/// the only thing shared across investigations.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// The originating user question, fixed for the investigation's lifetime.
    pub current_query: String,
    pub user_id: String,
    pub session_id: String,
    /// Memory namespace actor. Defaults to the user id.
    pub actor_id: String,
    /// Caller override: execute Complex plans without the approval gate.
    pub auto_approve_plan: bool,
    /// Append-only ordered set of specialists already executed this
    /// investigation; drives loop detection and output ordering.
    pub agents_invoked: Vec<SpecialistKind>,
    /// Latest-wins result text per specialist display name.
    pub agent_results: HashMap<String, String>,
    /// Conversation transcript accumulated across specialist invocations.
    pub messages: Vec<Message>,
    pub memory_context: MemoryContext,
    pub metadata: InvestigationMetadata,
}

impl SessionState {
    pub fn new(
        query: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        let user_id = user_id.into();
        SessionState {
            current_query: query.into(),
            actor_id: user_id.clone(),
            user_id,
            session_id: session_id.into(),
            auto_approve_plan: false,
            agents_invoked: Vec::new(),
            agent_results: HashMap::new(),
            messages: Vec::new(),
            memory_context: MemoryContext::default(),
            metadata: InvestigationMetadata::default(),
        }
    }

    /// Override the memory actor for callers that separate actor from user.
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = actor_id.into();
        self
    }

    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve_plan = auto_approve;
        self
    }

    /// Merge a specialist's partial update. Results are latest-wins per
    /// agent; `agents_invoked` stays an ordered set.
    pub fn apply(&mut self, update: StateUpdate) {
        self.agent_results
            .insert(update.kind.display_name().to_string(), update.result_text);
        if !self.agents_invoked.contains(&update.kind) {
            self.agents_invoked.push(update.kind);
        }
        self.messages.extend(update.messages);
        self.metadata
            .traces
            .insert(update.kind.agent_id().to_string(), update.trace);
    }
}

/// Partial state update returned by one specialist invocation.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub kind: SpecialistKind,
    pub result_text: String,
    pub trace: Vec<TraceEvent>,
    pub messages: Vec<Message>,
}

// ── Tests ──────────────────────────────────────────────────────────────────
