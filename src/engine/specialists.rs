// ── Opsleuth Engine: Specialist Agents ─────────────────────────────────────
//
// The capability surface of each specialist persona (allowed tools +
// system prompt) and the wrapper that presents one persona to the
// orchestrator: a single-call contract `invoke(state) -> StateUpdate`.
//
// A specialist invocation can degrade (timeout, loop failure) but never
// fails the pipeline — the degraded outcome becomes a normal, if
// apologetic, agent result that the aggregator reports like any other.

use crate::atoms::constants::TRUNCATION_MARKER;
use crate::engine::memory::{ConversationEvent, MemoryKind};
use crate::engine::state::EngineState;
use crate::engine::tools::filter_tools_for;
use crate::engine::types::*;
use crate::engine::{agent_loop, extraction};
use log::{info, warn};
use std::time::Duration;

// ── Capability surface ─────────────────────────────────────────────────────
// Resolved at construction time from the closed enum — identity is never
// inferred from tool-name patterns at dispatch time.

impl SpecialistKind {
    /// Bare tool identifiers (gateway prefix already stripped) this
    /// persona may see, in addition to the globally shared tools.
    pub fn allowed_tools(&self) -> &'static [&'static str] {
        match self {
            SpecialistKind::Kubernetes => &[
                "get_pod_status",
                "get_deployment_status",
                "get_cluster_events",
                "get_resource_usage",
                "get_node_status",
            ],
            SpecialistKind::Logs => &[
                "search_logs",
                "get_recent_logs",
                "get_error_patterns",
                "count_log_events",
            ],
            SpecialistKind::Metrics => &[
                "get_performance_metrics",
                "get_error_rates",
                "get_resource_metrics",
                "get_availability_metrics",
                "analyze_trends",
            ],
            SpecialistKind::Runbooks => &[
                "search_runbooks",
                "get_incident_playbook",
                "get_escalation_procedures",
                "get_common_resolutions",
            ],
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            SpecialistKind::Kubernetes => {
                "You are a Kubernetes infrastructure specialist. Investigate \
                 cluster, node, deployment, and pod health for the reported \
                 issue. Use your tools to gather live state before concluding. \
                 Report concrete observations (names, namespaces, counts, \
                 statuses) and state clearly when something looks healthy."
            }
            SpecialistKind::Logs => {
                "You are an application log analysis specialist. Search and \
                 correlate log events relevant to the reported issue. Quote \
                 representative log lines with their timestamps, identify error \
                 patterns and their frequency, and distinguish symptoms from \
                 probable causes."
            }
            SpecialistKind::Metrics => {
                "You are a performance metrics specialist. Examine error rates, \
                 latency, saturation, and availability metrics around the \
                 reported issue. Always state the time window you looked at and \
                 call out anomalies against baseline."
            }
            SpecialistKind::Runbooks => {
                "You are an operational runbooks specialist. Find the relevant \
                 playbooks and procedures for the situation and produce a \
                 numbered, step-by-step remediation procedure an on-call \
                 engineer can follow. Include escalation guidance when the \
                 procedure may not suffice."
            }
        }
    }
}

// ── Wrapper ────────────────────────────────────────────────────────────────

pub struct SpecialistAgent {
    kind: SpecialistKind,
}

impl SpecialistAgent {
    pub fn new(kind: SpecialistKind) -> Self {
        SpecialistAgent { kind }
    }

    /// Build the focused sub-prompt for this invocation: the fixed query
    /// plus the routing reasoning for the current plan step, when present.
    fn build_user_prompt(&self, state: &SessionState) -> String {
        match state.metadata.routing_reasoning.as_deref() {
            Some(step) if !step.is_empty() => format!(
                "Investigate the following issue within your domain.\n\n\
                 User query: {}\n\nCurrent plan step: {}",
                state.current_query, step
            ),
            _ => format!(
                "Investigate the following issue within your domain.\n\nUser query: {}",
                state.current_query
            ),
        }
    }

    /// Run this persona to completion under its wall-clock timeout and
    /// return the partial state update. Never raises: timeouts and loop
    /// failures are synthesized into degraded result strings.
    pub async fn invoke(&self, state: &SessionState, engine: &EngineState) -> StateUpdate {
        let display = self.kind.display_name();
        let model = engine.config.model_routing.specialist_model();
        let tools = filter_tools_for(&engine.tools, self.kind.allowed_tools());

        info!(
            "[specialist] Invoking {} model={} tools={}",
            display,
            model,
            tools.len()
        );

        let mut messages = vec![
            Message::text(Role::System, self.kind.system_prompt()),
            Message::text(Role::User, self.build_user_prompt(state)),
        ];

        let timeout = Duration::from_secs(engine.config.specialist_timeout_secs);
        let outcome = tokio::time::timeout(
            timeout,
            agent_loop::run_tool_loop(
                &engine.provider,
                model,
                &mut messages,
                &tools,
                engine.gateway.as_ref(),
                &engine.memory,
                &state.actor_id,
                &state.session_id,
                engine.config.max_tool_rounds,
                engine.config.tool_timeout_secs,
                self.kind.agent_id(),
            ),
        )
        .await;

        let (result_text, trace) = match outcome {
            Ok(Ok(outcome)) if !outcome.final_text.trim().is_empty() => {
                (outcome.final_text, outcome.trace)
            }
            Ok(Ok(outcome)) => (
                format!("{} completed without producing any findings.", display),
                outcome.trace,
            ),
            Ok(Err(e)) => {
                warn!("[specialist] {} failed: {}", display, e);
                (format!("Error: {} could not complete its step: {}", display, e), vec![])
            }
            Err(_) => {
                warn!(
                    "[specialist] {} timed out after {}s",
                    display,
                    timeout.as_secs()
                );
                (
                    format!(
                        "{} timed out after {} seconds. Its findings are incomplete; \
                         the investigation continues with the results gathered so far.",
                        display,
                        timeout.as_secs()
                    ),
                    vec![],
                )
            }
        };

        // ── Best-effort side effects ──────────────────────────────────
        self.persist_turn(state, engine, &result_text, &trace).await;
        if engine.config.auto_capture {
            self.capture_facts(state, engine, &result_text).await;
        }

        // The system prompt stays local to this invocation; the rest of
        // the transcript travels with the state for debugging.
        let transcript: Vec<Message> =
            messages.into_iter().filter(|m| m.role != Role::System).collect();

        StateUpdate {
            kind: self.kind,
            result_text,
            trace,
            messages: transcript,
        }
    }

    /// Persist the invocation as one batched conversation turn: the user
    /// prompt, every tool call/response, and the final text.
    async fn persist_turn(
        &self,
        state: &SessionState,
        engine: &EngineState,
        result_text: &str,
        trace: &[TraceEvent],
    ) {
        let mut events = vec![ConversationEvent::new("user", self.build_user_prompt(state))];
        for event in trace {
            match event {
                TraceEvent::ToolCall { name, arguments } => {
                    events.push(ConversationEvent::new(
                        "tool_call",
                        format!("{} {}", name, arguments),
                    ));
                }
                TraceEvent::ToolResult { name, output, .. } => {
                    events.push(ConversationEvent::new(
                        "tool_result",
                        format!("{}: {}", name, output),
                    ));
                }
            }
        }
        events.push(ConversationEvent::new(self.kind.agent_id(), result_text));

        if !engine
            .memory
            .save_conversation_turn(&state.actor_id, &state.session_id, &events)
            .await
        {
            warn!(
                "[specialist] Conversation turn for {} not persisted",
                self.kind.agent_id()
            );
        }
    }

    /// Auto-capture reusable facts from the response text. Extraction and
    /// saves are best-effort; failures are logged, never propagated.
    async fn capture_facts(&self, state: &SessionState, engine: &EngineState, text: &str) {
        // Degraded results carry the truncation marker or error prefixes;
        // nothing worth remembering in those.
        if text.starts_with("Error:") || text.contains(TRUNCATION_MARKER) {
            return;
        }
        for (content, kind) in extraction::extract_memorable_facts(text) {
            let session = match kind {
                MemoryKind::Preferences => None,
                _ => Some(state.session_id.as_str()),
            };
            match engine
                .memory
                .save(kind, &state.actor_id, &content, session)
                .await
            {
                Ok(true) => info!("[specialist] Auto-captured {:?} fact", kind),
                Ok(false) => {}
                Err(e) => warn!("[specialist] Fact capture failed: {}", e),
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
