// ── Opsleuth Engine: Response Aggregator ───────────────────────────────────
//
// Produces the single final user-visible answer from the specialist
// results and metadata — or an approval prompt when the plan is parked.
//
// Two paths:
//   • Approval: deterministic template over the plan. Takes exclusive
//     precedence over any results that happen to be present. No LLM call.
//   • Results: deterministic formatting grouped by persona, with a
//     step-extraction heuristic for runbook-style output. If that path
//     fails, an LLM synthesis over the raw results; if that fails too, a
//     hard-coded fallback summary. The aggregator never errors out to
//     the user.
//
// An isolated executive-summary LLM call may prepend short prose to the
// detailed results; its failure degrades to a fixed generic line.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::extraction::extract_investigation_summary;
use crate::engine::memory::{ConversationEvent, MemoryKind};
use crate::engine::state::EngineState;
use crate::engine::types::*;
use log::{info, warn};
use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;

const SYNTHESIS_SYSTEM_PROMPT: &str = "\
You are an SRE assistant writing the final report of a multi-agent \
investigation. You receive each specialist's raw findings as JSON. \
Synthesize them into a professional, well-structured summary: what was \
observed, what it means, and what to do next. Do not invent findings.";

const EXEC_SUMMARY_SYSTEM_PROMPT: &str = "\
You summarize SRE investigation results for a busy on-call engineer. \
Write 2-4 sentences of plain prose: the headline finding, the impact, and \
the immediate next step. Respect any stated user preferences about tone \
or channel. No headers, no lists.";

const GENERIC_EXEC_SUMMARY: &str =
    "Investigation complete. Detailed findings from each specialist follow below.";

static LIST_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+[.)]|[-*•])\s+(.+)$").unwrap());

// ── Entry point ────────────────────────────────────────────────────────────

/// Produce the final response text. Never fails.
pub async fn aggregate(state: &SessionState, engine: &EngineState) -> String {
    // Approval rendering takes exclusive precedence — even when some
    // results are already present in state.
    if state.metadata.plan_pending_approval {
        let response = render_approval_prompt(state);
        persist_response(state, engine, &response, false).await;
        return response;
    }

    let detailed = match format_results(state) {
        Ok(text) => text,
        Err(e) => {
            warn!("[aggregator] Deterministic formatting failed ({}) — trying LLM synthesis", e);
            match llm_synthesis(state, engine).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("[aggregator] LLM synthesis failed too ({}) — using fallback summary", e);
                    fallback_summary(state)
                }
            }
        }
    };

    let response = if engine.config.executive_summary && !state.agent_results.is_empty() {
        let exec = executive_summary(state, engine).await;
        format!("{}\n\n{}", exec, detailed)
    } else {
        detailed
    };

    persist_response(state, engine, &response, true).await;
    response
}

// ── Approval path ──────────────────────────────────────────────────────────

/// Deterministic approval prompt over the parked plan.
fn render_approval_prompt(state: &SessionState) -> String {
    let Some(plan) = &state.metadata.plan else {
        // Parked with no plan should not happen; fail soft.
        return "The investigation plan is awaiting approval, but no plan was found. \
                Please submit your query again."
            .into();
    };

    let steps = if plan.steps.is_empty() {
        plan.agents_sequence
            .iter()
            .enumerate()
            .map(|(i, k)| format!("{}. {}", i + 1, k.display_name()))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        plan.steps
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let agent = plan
                    .agents_sequence
                    .get(i)
                    .map(|k| format!(" — {}", k.display_name()))
                    .unwrap_or_default();
                format!("{}. {}{}", i + 1, s, agent)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "## Proposed Investigation Plan\n\n\
         **Complexity:** {:?}\n\n\
         **Steps:**\n{}\n\n\
         **Reasoning:** {}\n\n\
         This plan was marked complex, so nothing has been executed yet. \
         Reply to proceed with the plan as-is, describe how to modify it, \
         or ask a question about it.",
        plan.complexity,
        steps,
        if plan.reasoning.is_empty() { "(none given)" } else { &plan.reasoning }
    )
}

// ── Results path ───────────────────────────────────────────────────────────

/// Deterministic formatting of the specialist results, grouped by persona
/// in invocation order.
fn format_results(state: &SessionState) -> EngineResult<String> {
    if state.agent_results.is_empty() {
        return Err(EngineError::Other("no agent results to format".into()));
    }

    let mut out = format!("# Investigation Results\n\n**Query:** {}\n", state.current_query);

    for kind in &state.agents_invoked {
        let Some(result) = state.agent_results.get(kind.display_name()) else {
            continue;
        };
        out.push_str(&format!("\n## {}\n\n", kind.display_name()));
        if *kind == SpecialistKind::Runbooks {
            out.push_str(&format_runbook_result(result));
        } else {
            out.push_str(result);
        }
        out.push('\n');
    }

    Ok(out)
}

/// Runbook output gets a step-extraction pass: numbered/bulleted procedure
/// lines are re-rendered as a clean numbered checklist. Falls back to the
/// raw text when no steps are found.
fn format_runbook_result(text: &str) -> String {
    let steps = extract_procedure_steps(text);
    if steps.is_empty() {
        return text.to_string();
    }
    let numbered: Vec<String> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {}", i + 1, s))
        .collect();
    format!("### Recommended Procedure\n\n{}", numbered.join("\n"))
}

fn extract_procedure_steps(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            LIST_ITEM_RE
                .captures(line)
                .and_then(|c| c.get(2))
                .map(|m| m.as_str().trim().to_string())
        })
        .collect()
}

/// LLM synthesis over the raw results — the middle rung of the ladder.
async fn llm_synthesis(state: &SessionState, engine: &EngineState) -> EngineResult<String> {
    let payload = json!({
        "query": state.current_query,
        "agent_results": state.agent_results,
    });
    let messages = vec![
        Message::text(Role::System, SYNTHESIS_SYSTEM_PROMPT),
        Message::text(Role::User, payload.to_string()),
    ];
    let model = engine.config.model_routing.aggregator_model();
    let chunks = engine.provider.chat_stream(&messages, &[], model, None).await?;
    let text: String = chunks.iter().filter_map(|c| c.delta_text.as_deref()).collect();
    if text.trim().is_empty() {
        return Err(EngineError::Other("synthesis produced no text".into()));
    }
    Ok(text)
}

/// The last rung: a fixed template that always works.
fn fallback_summary(state: &SessionState) -> String {
    let agents = if state.agents_invoked.is_empty() {
        "No specialist agents were able to contribute results.".to_string()
    } else {
        let names: Vec<&str> = state.agents_invoked.iter().map(|k| k.display_name()).collect();
        format!("Specialists consulted: {}.", names.join(", "))
    };
    format!(
        "# Investigation Summary\n\n\
         **Query:** {}\n\n\
         {}\n\n\
         The detailed results could not be formatted automatically. The raw \
         findings have been preserved in this session's memory; ask a \
         follow-up question to dig into any specific area.",
        state.current_query, agents
    )
}

/// Isolated executive-summary call. Always returns a string — failures
/// degrade to the fixed generic line.
async fn executive_summary(state: &SessionState, engine: &EngineState) -> String {
    let preferences: Vec<&str> = state
        .memory_context
        .preferences
        .iter()
        .map(|r| r.content.as_str())
        .collect();
    let payload = json!({
        "query": state.current_query,
        "agent_results": state.agent_results,
        "user_preferences": preferences,
    });
    let messages = vec![
        Message::text(Role::System, EXEC_SUMMARY_SYSTEM_PROMPT),
        Message::text(Role::User, payload.to_string()),
    ];
    let model = engine.config.model_routing.aggregator_model();
    match engine.provider.chat_stream(&messages, &[], model, None).await {
        Ok(chunks) => {
            let text: String = chunks.iter().filter_map(|c| c.delta_text.as_deref()).collect();
            if text.trim().is_empty() {
                GENERIC_EXEC_SUMMARY.to_string()
            } else {
                text.trim().to_string()
            }
        }
        Err(e) => {
            warn!("[aggregator] Executive summary failed ({}) — using generic line", e);
            GENERIC_EXEC_SUMMARY.to_string()
        }
    }
}

// ── Write-back ─────────────────────────────────────────────────────────────

/// Persist the final response as a conversation turn and, when results
/// exist, an investigation summary record. Both best-effort.
async fn persist_response(
    state: &SessionState,
    engine: &EngineState,
    response: &str,
    with_summary: bool,
) {
    let events = [ConversationEvent::new("assistant", response)];
    if !engine
        .memory
        .save_conversation_turn(&state.actor_id, &state.session_id, &events)
        .await
    {
        warn!("[aggregator] Final response not persisted");
    }

    if !with_summary || state.agent_results.is_empty() {
        return;
    }
    let summary = extract_investigation_summary(&state.current_query, response);
    let payload = match serde_json::to_string(&summary) {
        Ok(p) => p,
        Err(e) => {
            warn!("[aggregator] Investigation summary not serializable: {}", e);
            return;
        }
    };
    match engine
        .memory
        .save(
            MemoryKind::Investigations,
            &state.actor_id,
            &payload,
            Some(&state.session_id),
        )
        .await
    {
        Ok(true) => info!("[aggregator] Investigation summary stored"),
        Ok(false) => {}
        Err(e) => warn!("[aggregator] Investigation summary not stored: {}", e),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_results() -> SessionState {
        let mut state = SessionState::new("why are checkout pods crashing", "u1", "s1");
        state.apply(StateUpdate {
            kind: SpecialistKind::Kubernetes,
            result_text: "3 pods in CrashLoopBackOff in namespace checkout.".into(),
            trace: vec![],
            messages: vec![],
        });
        state.apply(StateUpdate {
            kind: SpecialistKind::Runbooks,
            result_text: "Follow these steps:\n1. Check recent deploys\n- Roll back if needed\n2. Verify pod health".into(),
            trace: vec![],
            messages: vec![],
        });
        state
    }

    #[test]
    fn test_approval_takes_precedence_over_results() {
        let mut state = state_with_results();
        state.metadata.plan = Some(InvestigationPlan {
            steps: vec!["drain the node".into()],
            agents_sequence: vec![SpecialistKind::Kubernetes],
            complexity: PlanComplexity::Complex,
            auto_execute: false,
            reasoning: "possible disruption".into(),
            requires_collaboration: false,
        });
        state.metadata.plan_pending_approval = true;

        let prompt = render_approval_prompt(&state);
        assert!(prompt.contains("Proposed Investigation Plan"));
        assert!(prompt.contains("drain the node"));
        // Specialist results never leak into an approval prompt
        assert!(!prompt.contains("CrashLoopBackOff"));
    }

    #[test]
    fn test_format_results_orders_by_invocation() {
        let state = state_with_results();
        let out = format_results(&state).unwrap();
        let k8s_pos = out.find("Kubernetes Infrastructure Agent").unwrap();
        let runbook_pos = out.find("Operational Runbooks Agent").unwrap();
        assert!(k8s_pos < runbook_pos);
        assert!(out.contains("**Query:** why are checkout pods crashing"));
    }

    #[test]
    fn test_format_results_empty_is_error() {
        let state = SessionState::new("q", "u1", "s1");
        assert!(format_results(&state).is_err());
    }

    #[test]
    fn test_runbook_steps_renumbered() {
        let out = format_runbook_result("intro\n1. Check recent deploys\n- Roll back if needed\n2) Verify pod health");
        assert!(out.starts_with("### Recommended Procedure"));
        assert!(out.contains("1. Check recent deploys"));
        assert!(out.contains("2. Roll back if needed"));
        assert!(out.contains("3. Verify pod health"));
    }

    #[test]
    fn test_runbook_without_steps_passes_through() {
        let text = "No formal procedure exists for this scenario.";
        assert_eq!(format_runbook_result(text), text);
    }

    #[test]
    fn test_fallback_summary_mentions_agents() {
        let state = state_with_results();
        let out = fallback_summary(&state);
        assert!(out.contains("Kubernetes Infrastructure Agent"));
        assert!(out.contains("why are checkout pods crashing"));

        let empty = SessionState::new("q", "u1", "s1");
        let out = fallback_summary(&empty);
        assert!(out.contains("No specialist agents"));
    }

    #[test]
    fn test_approval_prompt_numbers_agents_when_steps_missing() {
        let mut state = SessionState::new("q", "u1", "s1");
        state.metadata.plan = Some(InvestigationPlan {
            steps: vec![],
            agents_sequence: vec![SpecialistKind::Metrics, SpecialistKind::Logs],
            complexity: PlanComplexity::Complex,
            auto_execute: false,
            reasoning: String::new(),
            requires_collaboration: false,
        });
        state.metadata.plan_pending_approval = true;
        let prompt = render_approval_prompt(&state);
        assert!(prompt.contains("1. Performance Metrics Agent"));
        assert!(prompt.contains("2. Application Logs Agent"));
        assert!(prompt.contains("(none given)"));
    }
}
