// ── Opsleuth Engine: Investigation Planner ─────────────────────────────────
//
// Produces exactly one InvestigationPlan per investigation:
//   1. Pull memory context (preferences, infrastructure, past
//      investigations) — every retrieval failure degrades to empty.
//   2. Compose the planning prompt from the fixed persona, the query, the
//      formatted context, and the output-shape instructions.
//   3. Call the model: tool-augmented first (the planner may search/store
//      memory itself), then a plain structured-output call on provider
//      error, then the degenerate plan.
//   4. Parse the response. LLM output is unstructured text, so this is the
//      one "structured extraction with typed fallback" boundary: any parse
//      or validation failure returns the documented fallback plan — parse
//      errors never escape this module.

use crate::engine::memory::{ConversationEvent, MemoryKind, MemoryStore};
use crate::engine::state::EngineState;
use crate::engine::tools::shared_tools;
use crate::engine::types::*;
use crate::engine::agent_loop;
use log::{info, warn};
use serde::Deserialize;

/// Rounds the tool-augmented planning call may spend searching memory.
const PLANNER_MAX_ROUNDS: u32 = 4;

const PLANNER_SYSTEM_PROMPT: &str = "\
You are the investigation planner for an SRE assistant. Given a user's \
question and any long-term context, produce a short, ordered plan that \
assigns each step to one specialist agent.\n\
\n\
Available agents:\n\
- kubernetes_agent: cluster, node, deployment, and pod health\n\
- logs_agent: application log search and error-pattern analysis\n\
- metrics_agent: performance, error-rate, and availability metrics\n\
- runbooks_agent: operational procedures and remediation playbooks";

const PLANNING_INSTRUCTIONS: &str = "\
Respond with a JSON object of this exact shape:\n\
{\n\
  \"steps\": [\"...\"],\n\
  \"agentsSequence\": [\"kubernetes_agent\"],\n\
  \"complexity\": \"simple\" or \"complex\",\n\
  \"autoExecute\": true or false,\n\
  \"reasoning\": \"...\",\n\
  \"requiresCollaboration\": false\n\
}\n\
Use 3-5 steps for complex issues, fewer for simple lookups. Mark a plan \
\"complex\" when it spans multiple domains or could justify disruptive \
remediation; complex plans should set autoExecute to false so the user can \
approve them first.";

// ── Memory context ─────────────────────────────────────────────────────────

/// Assemble the planner's memory context for one user. Preferences use a
/// broad (empty) query; infrastructure and past investigations search
/// cross-session against the query text. Failures come back as empty
/// categories, never errors.
pub async fn gather_memory_context(
    memory: &MemoryStore,
    actor_id: &str,
    query: &str,
    recall_limit: usize,
) -> MemoryContext {
    MemoryContext {
        preferences: memory
            .retrieve(MemoryKind::Preferences, actor_id, "", recall_limit, None)
            .await,
        infrastructure: memory
            .retrieve(MemoryKind::Infrastructure, actor_id, query, recall_limit, None)
            .await,
        investigations: memory
            .retrieve(MemoryKind::Investigations, actor_id, query, recall_limit, None)
            .await,
    }
}

/// Render the context for the planning prompt. Empty categories are
/// omitted; an entirely empty context renders to an empty string.
pub fn format_memory_context(ctx: &MemoryContext) -> String {
    let mut sections: Vec<String> = Vec::new();
    for (title, records) in [
        ("User preferences", &ctx.preferences),
        ("Known infrastructure", &ctx.infrastructure),
        ("Past investigations", &ctx.investigations),
    ] {
        if records.is_empty() {
            continue;
        }
        let lines: Vec<String> = records.iter().map(|r| format!("- {}", r.content)).collect();
        sections.push(format!("### {}\n{}", title, lines.join("\n")));
    }
    sections.join("\n\n")
}

// ── Plan parsing ───────────────────────────────────────────────────────────

/// Loose mirror of the model's JSON output, before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlan {
    #[serde(default)]
    steps: Vec<String>,
    #[serde(alias = "agents_sequence")]
    agents_sequence: Vec<String>,
    #[serde(default)]
    complexity: Option<String>,
    #[serde(alias = "auto_execute")]
    #[serde(default)]
    auto_execute: Option<bool>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(alias = "requires_collaboration")]
    #[serde(default)]
    requires_collaboration: bool,
}

/// The documented degenerate plan: investigate, then analyze/recommend.
/// Returned whenever planner output cannot be parsed or validated, so the
/// pipeline never halts on a planning failure.
pub fn fallback_plan() -> InvestigationPlan {
    InvestigationPlan {
        steps: vec![
            "Investigate the reported symptoms and gather telemetry.".into(),
            "Analyze the findings and recommend remediation.".into(),
        ],
        agents_sequence: vec![SpecialistKind::Metrics, SpecialistKind::Logs],
        complexity: PlanComplexity::Simple,
        auto_execute: true,
        reasoning: "Planner output could not be parsed; using the default \
                    investigate-then-analyze plan."
            .into(),
        requires_collaboration: false,
    }
}

/// Scan `text` for a balanced JSON object containing the plan keys.
/// String-aware brace matching: braces inside string literals don't count.
fn extract_json_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut start_indices = text.char_indices().filter(|&(_, c)| c == '{');

    while let Some((start, _)) = start_indices.next() {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (offset, &b) in bytes[start..].iter().enumerate() {
            let c = b as char;
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                '{' if !in_string => depth += 1,
                '}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..=start + offset];
                        if candidate.contains("agentsSequence")
                            || candidate.contains("agents_sequence")
                        {
                            return Some(candidate.to_string());
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Parse the model's textual response into a plan. Any failure — no JSON,
/// malformed JSON, unknown agents, bad complexity — yields the fallback.
pub fn parse_plan_response(text: &str) -> InvestigationPlan {
    let Some(json) = extract_json_object(text) else {
        warn!("[planner] No plan JSON found in response — using fallback plan");
        return fallback_plan();
    };

    let raw: RawPlan = match serde_json::from_str(&json) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("[planner] Plan JSON failed to parse ({}) — using fallback plan", e);
            return fallback_plan();
        }
    };

    // Schema validation: a plan must name at least one known agent, and
    // every named agent must resolve against the closed specialist set.
    let mut agents = Vec::with_capacity(raw.agents_sequence.len());
    for name in &raw.agents_sequence {
        match SpecialistKind::parse(name) {
            Some(kind) => agents.push(kind),
            None => {
                warn!("[planner] Unknown agent '{}' in plan — using fallback plan", name);
                return fallback_plan();
            }
        }
    }
    if agents.is_empty() {
        warn!("[planner] Plan names no agents — using fallback plan");
        return fallback_plan();
    }

    let complexity = match raw.complexity.as_deref().map(str::to_lowercase).as_deref() {
        Some("complex") => PlanComplexity::Complex,
        Some("simple") | None => PlanComplexity::Simple,
        Some(other) => {
            warn!("[planner] Unknown complexity '{}' — using fallback plan", other);
            return fallback_plan();
        }
    };

    InvestigationPlan {
        steps: raw.steps,
        agents_sequence: agents,
        complexity,
        // Unstated autoExecute follows the complexity: simple plans run,
        // complex plans ask.
        auto_execute: raw
            .auto_execute
            .unwrap_or(complexity == PlanComplexity::Simple),
        reasoning: raw.reasoning.unwrap_or_default(),
        requires_collaboration: raw.requires_collaboration,
    }
}

// ── Planner entry point ────────────────────────────────────────────────────

/// Short rendering of a plan for conversation persistence and logs.
pub fn render_plan_summary(plan: &InvestigationPlan) -> String {
    let agents: Vec<&str> = plan.agents_sequence.iter().map(|k| k.agent_id()).collect();
    format!(
        "Plan ({:?}, auto_execute={}): [{}] — {}",
        plan.complexity,
        plan.auto_execute,
        agents.join(" → "),
        plan.reasoning
    )
}

/// Create the investigation plan: gather context, call the model, parse
/// with fallback, and persist the turn. Attaches the retrieved context to
/// the state; never fails.
pub async fn create_investigation_plan(
    state: &mut SessionState,
    engine: &EngineState,
) -> InvestigationPlan {
    state.memory_context = gather_memory_context(
        &engine.memory,
        &state.actor_id,
        &state.current_query,
        engine.config.recall_limit,
    )
    .await;

    let mut prompt = format!("User query: {}", state.current_query);
    let context = format_memory_context(&state.memory_context);
    if !context.is_empty() {
        prompt.push_str("\n\n## Long-term context\n");
        prompt.push_str(&context);
    }
    prompt.push_str("\n\n");
    prompt.push_str(PLANNING_INSTRUCTIONS);

    let model = engine.config.model_routing.planner_model();
    let response = match plan_with_tools(state, engine, model, &prompt).await {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("[planner] Tool-augmented planning failed ({}) — retrying plain", e);
            match plan_plain(engine, model, &prompt).await {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!("[planner] Plain planning call failed too: {}", e);
                    None
                }
            }
        }
    };

    let plan = match response {
        Some(text) => parse_plan_response(&text),
        None => fallback_plan(),
    };

    info!("[planner] {}", render_plan_summary(&plan));

    // Persist the query and the rendered plan as one conversation turn.
    let events = [
        ConversationEvent::new("user", state.current_query.clone()),
        ConversationEvent::new("planner", render_plan_summary(&plan)),
    ];
    if !engine
        .memory
        .save_conversation_turn(&state.actor_id, &state.session_id, &events)
        .await
    {
        warn!("[planner] Plan turn not persisted");
    }

    plan
}

/// Tool-augmented planning: the model may call the shared memory tools
/// before committing to a plan.
async fn plan_with_tools(
    state: &SessionState,
    engine: &EngineState,
    model: &str,
    prompt: &str,
) -> crate::atoms::error::EngineResult<String> {
    let mut messages = vec![
        Message::text(Role::System, PLANNER_SYSTEM_PROMPT),
        Message::text(Role::User, prompt),
    ];
    let tools = shared_tools();
    let outcome = agent_loop::run_tool_loop(
        &engine.provider,
        model,
        &mut messages,
        &tools,
        engine.gateway.as_ref(),
        &engine.memory,
        &state.actor_id,
        &state.session_id,
        PLANNER_MAX_ROUNDS,
        engine.config.tool_timeout_secs,
        "planner",
    )
    .await?;
    Ok(outcome.final_text)
}

/// Plain structured-output call, no tools. The second rung of the ladder.
async fn plan_plain(
    engine: &EngineState,
    model: &str,
    prompt: &str,
) -> crate::atoms::error::EngineResult<String> {
    let messages = vec![
        Message::text(Role::System, PLANNER_SYSTEM_PROMPT),
        Message::text(Role::User, prompt),
    ];
    let chunks = engine.provider.chat_stream(&messages, &[], model, None).await?;
    let text: String = chunks.iter().filter_map(|c| c.delta_text.as_deref()).collect();
    Ok(text)
}

// ── Tests ──────────────────────────────────────────────────────────────────
