// ── Opsleuth Engine: Agentic Tool Loop ─────────────────────────────────────
//
// The model→tools→model cycle shared by the specialists and the
// tool-augmented planner call: send the transcript to the provider,
// assemble streamed tool calls, execute them (memory tools are
// intercepted, everything else goes to the gateway), append results,
// repeat until the model produces a final text or the round budget runs
// out.
//
// Tool failures never abort the loop — the model sees an `Error: …`
// result and decides what to do. A tool that keeps failing gets blocked
// for the rest of the invocation.

use crate::atoms::constants::MAX_CONSECUTIVE_TOOL_FAILS;
use crate::atoms::error::EngineResult;
use crate::atoms::traits::ToolGateway;
use crate::engine::memory::MemoryStore;
use crate::engine::providers::AnyProvider;
use crate::engine::tools::execute_memory_tool;
use crate::engine::types::*;
use log::{info, warn};
use std::collections::HashMap;
use std::time::Duration;

/// Result of one completed loop: the final assistant text plus the
/// ordered tool-call/tool-result trace of the whole invocation.
pub(crate) struct LoopOutcome {
    pub final_text: String,
    pub trace: Vec<TraceEvent>,
}

/// Run a complete agent loop over `messages`, mutating the transcript in
/// place and returning the final text + trace.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_tool_loop(
    provider: &AnyProvider,
    model: &str,
    messages: &mut Vec<Message>,
    tools: &[ToolDefinition],
    gateway: &dyn ToolGateway,
    memory: &MemoryStore,
    actor_id: &str,
    session_id: &str,
    max_rounds: u32,
    tool_timeout_secs: u64,
    label: &str,
) -> EngineResult<LoopOutcome> {
    let mut round = 0u32;
    let mut trace: Vec<TraceEvent> = Vec::new();
    let mut final_text = String::new();
    // Consecutive-failure counter per tool name.
    let mut tool_fail_counter: HashMap<String, u32> = HashMap::new();

    loop {
        round += 1;
        if round > max_rounds {
            warn!("[{}] Max tool rounds ({}) reached, stopping", label, max_rounds);
            if final_text.is_empty() {
                final_text = format!(
                    "I completed {} tool-call rounds but ran out of steps before I \
                     could write a final summary.",
                    max_rounds
                );
            }
            return Ok(LoopOutcome { final_text, trace });
        }

        info!("[{}] Round {}/{}", label, round, max_rounds);

        // ── Stream from the model ──────────────────────────────────────
        let chunks = provider.chat_stream(messages, tools, model, None).await?;

        let mut text_accum = String::new();
        let mut tool_call_map: HashMap<usize, (String, String, String)> = HashMap::new();
        let mut has_tool_calls = false;

        for chunk in &chunks {
            if let Some(dt) = &chunk.delta_text {
                text_accum.push_str(dt);
            }
            for tc_delta in &chunk.tool_calls {
                has_tool_calls = true;
                let entry = tool_call_map
                    .entry(tc_delta.index)
                    .or_insert_with(|| (String::new(), String::new(), String::new()));
                if let Some(id) = &tc_delta.id {
                    entry.0 = id.clone();
                }
                if let Some(name) = &tc_delta.function_name {
                    entry.1 = name.clone();
                }
                if let Some(args_delta) = &tc_delta.arguments_delta {
                    entry.2.push_str(args_delta);
                }
            }
        }

        // ── No tool calls → final response ─────────────────────────────
        if !has_tool_calls || tool_call_map.is_empty() {
            final_text = text_accum.clone();
            messages.push(Message::text(Role::Assistant, text_accum));
            return Ok(LoopOutcome { final_text, trace });
        }

        // ── Assemble tool calls in index order ─────────────────────────
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut sorted_indices: Vec<usize> = tool_call_map.keys().cloned().collect();
        sorted_indices.sort();
        for idx in sorted_indices {
            let (id, name, arguments) = &tool_call_map[&idx];
            let call_id = if id.is_empty() {
                format!("call_{}", uuid::Uuid::new_v4())
            } else {
                id.clone()
            };
            tool_calls.push(ToolCall {
                id: call_id,
                call_type: "function".into(),
                function: FunctionCall { name: name.clone(), arguments: arguments.clone() },
            });
        }

        let mut assistant = Message::text(Role::Assistant, text_accum);
        assistant.tool_calls = Some(tool_calls.clone());
        messages.push(assistant);

        // ── Execute tool calls ─────────────────────────────────────────
        for tc in &tool_calls {
            info!("[{}] Tool call: {} id={}", label, tc.function.name, tc.id);
            trace.push(TraceEvent::ToolCall {
                name: tc.function.name.clone(),
                arguments: tc.function.arguments.clone(),
            });

            let fails = tool_fail_counter.get(&tc.function.name).copied().unwrap_or(0);
            let (output, success) = if fails >= MAX_CONSECUTIVE_TOOL_FAILS {
                (
                    format!(
                        "Error: tool '{}' failed {} times in a row and is blocked \
                         for the rest of this step. Work with what you have.",
                        tc.function.name, fails
                    ),
                    false,
                )
            } else {
                execute_tool_call(tc, gateway, memory, actor_id, session_id, tool_timeout_secs)
                    .await
            };

            if success {
                tool_fail_counter.remove(&tc.function.name);
            } else {
                *tool_fail_counter.entry(tc.function.name.clone()).or_insert(0) += 1;
            }

            trace.push(TraceEvent::ToolResult {
                name: tc.function.name.clone(),
                output: output.clone(),
                success,
            });

            let mut tool_msg = Message::text(Role::Tool, output);
            tool_msg.tool_call_id = Some(tc.id.clone());
            tool_msg.name = Some(tc.function.name.clone());
            messages.push(tool_msg);
        }
    }
}

/// Execute one tool call: memory tools are intercepted, everything else is
/// forwarded to the gateway under a per-call timeout. Returns (output,
/// success) — failures become result text, never errors.
async fn execute_tool_call(
    tc: &ToolCall,
    gateway: &dyn ToolGateway,
    memory: &MemoryStore,
    actor_id: &str,
    session_id: &str,
    tool_timeout_secs: u64,
) -> (String, bool) {
    if let Some(output) = execute_memory_tool(tc, memory, actor_id, session_id).await {
        let success = !output.starts_with("Error:");
        return (output, success);
    }

    let args: serde_json::Value = match serde_json::from_str(&tc.function.arguments) {
        Ok(v) => v,
        Err(_) if tc.function.arguments.trim().is_empty() => serde_json::json!({}),
        Err(e) => {
            return (format!("Error: malformed tool arguments: {}", e), false);
        }
    };

    match tokio::time::timeout(
        Duration::from_secs(tool_timeout_secs),
        gateway.call_tool(&tc.function.name, args),
    )
    .await
    {
        Ok(Ok(output)) => (output, true),
        Ok(Err(e)) => (format!("Error: {}", e), false),
        Err(_) => (
            format!(
                "Error: tool '{}' timed out after {}s",
                tc.function.name, tool_timeout_secs
            ),
            false,
        ),
    }
}
