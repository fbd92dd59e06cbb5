// ── Opsleuth Engine: Tool Surface ──────────────────────────────────────────
//
// The engine-side tool concerns: the shared memory tools every persona
// (and the planner) may use, the persona allow-list filter, and the
// interception that routes memory tool calls to the Memory Store instead
// of the gateway.
//
// Gateway tools pass through untouched — execution happens behind the
// ToolGateway seam; this module only decides visibility.

use crate::engine::gateway::base_tool_name;
use crate::engine::memory::{MemoryKind, MemoryStore};
use crate::engine::types::*;
use serde_json::json;

// ── Shared tools ───────────────────────────────────────────────────────────

/// Tool names visible to every persona regardless of its allow-list.
pub const SHARED_TOOL_NAMES: &[&str] = &["memory_store", "memory_search"];

/// Definitions of the shared memory tools.
pub fn shared_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::function(
            "memory_store",
            "Save a reusable fact for future investigations. Use kind \
             'preferences' for user preferences, 'infrastructure' for facts \
             about the user's systems.",
            json!({
                "type": "object",
                "properties": {
                    "content": {"type": "string", "description": "The fact to remember"},
                    "kind": {
                        "type": "string",
                        "enum": ["preferences", "infrastructure", "investigations"],
                        "default": "infrastructure"
                    }
                },
                "required": ["content"]
            }),
        ),
        ToolDefinition::function(
            "memory_search",
            "Search long-term memory for past context. Set cross_session to \
             true to search across all of this user's sessions.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "kind": {
                        "type": "string",
                        "enum": ["preferences", "infrastructure", "investigations"],
                        "default": "infrastructure"
                    },
                    "cross_session": {"type": "boolean", "default": false}
                },
                "required": ["query"]
            }),
        ),
    ]
}

// ── Persona filtering ──────────────────────────────────────────────────────

/// Restrict a tool list to one persona: keep tools whose identifier, after
/// stripping any gateway transport prefix, appears in the persona
/// allow-list, plus the globally shared tools.
pub fn filter_tools_for(tools: &[ToolDefinition], allowed: &[&str]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .filter(|t| {
            let base = base_tool_name(&t.function.name);
            allowed.contains(&base) || SHARED_TOOL_NAMES.contains(&base)
        })
        .cloned()
        .collect()
}

// ── Memory tool interception ───────────────────────────────────────────────

fn parse_kind(s: Option<&str>) -> MemoryKind {
    match s.unwrap_or("infrastructure") {
        "preferences" => MemoryKind::Preferences,
        "investigations" => MemoryKind::Investigations,
        _ => MemoryKind::Infrastructure,
    }
}

/// Execute a memory tool call against the store. Returns `None` when the
/// call is not a memory tool (the caller forwards it to the gateway).
/// Memory tool failures come back as result text, never as errors — the
/// loop treats them like any other tool output.
pub async fn execute_memory_tool(
    call: &ToolCall,
    memory: &MemoryStore,
    actor_id: &str,
    session_id: &str,
) -> Option<String> {
    let args: serde_json::Value = serde_json::from_str(&call.function.arguments).unwrap_or_default();

    match call.function.name.as_str() {
        "memory_store" => {
            let Some(content) = args["content"].as_str().filter(|c| !c.trim().is_empty()) else {
                return Some("Error: memory_store requires non-empty 'content'".into());
            };
            let kind = parse_kind(args["kind"].as_str());
            let saved = memory
                .save(kind, actor_id, content, Some(session_id))
                .await
                .unwrap_or(false);
            Some(if saved {
                "Memory saved.".into()
            } else {
                "Memory could not be saved; continuing without it.".into()
            })
        }
        "memory_search" => {
            let query = args["query"].as_str().unwrap_or_default();
            let kind = parse_kind(args["kind"].as_str());
            let cross_session = args["cross_session"].as_bool().unwrap_or(false);
            let session = if cross_session { None } else { Some(session_id) };
            let records = memory.retrieve(kind, actor_id, query, 5, session).await;
            if records.is_empty() {
                Some("No matching memories found.".into())
            } else {
                let lines: Vec<String> = records
                    .iter()
                    .map(|r| format!("- [{}] {}", r.created_at, r.content))
                    .collect();
                Some(lines.join("\n"))
            }
        }
        _ => None,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::SqliteMemoryStore;
    use std::sync::Arc;

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition::function(name, "", json!({"type": "object", "properties": {}}))
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            call_type: "function".into(),
            function: FunctionCall { name: name.into(), arguments: args.to_string() },
        }
    }

    #[test]
    fn test_filter_strips_gateway_prefix() {
        let tools = vec![
            tool("gw_sre_get_pod_status"),
            tool("gw_sre_search_logs"),
            tool("memory_search"),
        ];
        let filtered = filter_tools_for(&tools, &["get_pod_status"]);
        let names: Vec<&str> = filtered.iter().map(|t| t.function.name.as_str()).collect();
        assert_eq!(names, vec!["gw_sre_get_pod_status", "memory_search"]);
    }

    #[test]
    fn test_shared_tools_always_pass_filter() {
        let tools = shared_tools();
        let filtered = filter_tools_for(&tools, &[]);
        assert_eq!(filtered.len(), tools.len());
    }

    #[tokio::test]
    async fn test_memory_store_and_search_round_trip() {
        let memory = MemoryStore::new(Arc::new(SqliteMemoryStore::open_in_memory().unwrap()));

        let out = execute_memory_tool(
            &call("memory_store", json!({"content": "api-gateway fronts the payments service"})),
            &memory,
            "u1",
            "s1",
        )
        .await
        .unwrap();
        assert_eq!(out, "Memory saved.");

        let out = execute_memory_tool(
            &call("memory_search", json!({"query": "payments"})),
            &memory,
            "u1",
            "s1",
        )
        .await
        .unwrap();
        assert!(out.contains("api-gateway fronts the payments service"));
    }

    #[tokio::test]
    async fn test_non_memory_tool_passes_through() {
        let memory = MemoryStore::uninitialized();
        let out = execute_memory_tool(
            &call("gw_sre_get_pod_status", json!({})),
            &memory,
            "u1",
            "s1",
        )
        .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_rejects_empty_content() {
        let memory = MemoryStore::uninitialized();
        let out = execute_memory_tool(&call("memory_store", json!({"content": "  "})), &memory, "u1", "s1")
            .await
            .unwrap();
        assert!(out.starts_with("Error:"));
    }
}
