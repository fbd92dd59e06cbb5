// Opsleuth integration tests — full investigations over a scripted fake
// provider, a fake tool gateway, and an in-memory SQLite memory store.
// No network, no real models.

use async_trait::async_trait;
use opsleuth::atoms::traits::{AiProvider, ToolGateway};
use opsleuth::engine::state::{EngineConfig, EngineState};
use opsleuth::engine::tools::shared_tools;
use opsleuth::{
    AnyProvider, EngineError, EngineResult, InvestigationSession, Investigator, MemoryBackend,
    MemoryKind, MemoryStore, Message, SqliteMemoryStore, StreamChunk, ToolDefinition,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;

// ── Scripted provider ──────────────────────────────────────────────────────

/// One scripted model response, consumed per chat_stream call.
enum Script {
    /// Final text with no tool calls.
    Text(String),
    /// One tool call; the loop will call the model again afterwards.
    ToolCall { id: String, name: String, arguments: String },
    /// Provider-level failure.
    Fail(String),
    /// Stall long enough to trip a timeout, then emit text.
    Hang(u64),
}

struct ScriptedProvider {
    script: Mutex<VecDeque<Script>>,
    calls: Mutex<u32>,
}

impl ScriptedProvider {
    fn new(items: Vec<Script>) -> Self {
        ScriptedProvider { script: Mutex::new(items.into()), calls: Mutex::new(0) }
    }

    fn call_count(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl AiProvider for ScriptedProvider {
    async fn chat_stream(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
        _model: &str,
        _temperature: Option<f64>,
    ) -> EngineResult<Vec<StreamChunk>> {
        *self.calls.lock() += 1;
        let item = self
            .script
            .lock()
            .pop_front()
            .ok_or_else(|| EngineError::provider("scripted", "script exhausted"))?;

        match item {
            Script::Text(text) => Ok(vec![StreamChunk {
                delta_text: Some(text),
                ..Default::default()
            }]),
            Script::ToolCall { id, name, arguments } => Ok(vec![StreamChunk {
                tool_calls: vec![opsleuth::atoms::types::ToolCallDelta {
                    index: 0,
                    id: Some(id),
                    function_name: Some(name),
                    arguments_delta: Some(arguments),
                }],
                ..Default::default()
            }]),
            Script::Fail(message) => Err(EngineError::provider("scripted", message)),
            Script::Hang(secs) => {
                tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
                Ok(vec![StreamChunk { delta_text: Some("late".into()), ..Default::default() }])
            }
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

// ── Fake gateway ───────────────────────────────────────────────────────────

struct FakeGateway {
    calls: Mutex<Vec<String>>,
}

impl FakeGateway {
    fn new() -> Self {
        FakeGateway { calls: Mutex::new(vec![]) }
    }

    fn call_log(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition::function(
            format!("gw_sre_{}", name),
            format!("fake {}", name),
            json!({"type": "object", "properties": {}}),
        )
    }
}

#[async_trait]
impl ToolGateway for FakeGateway {
    async fn list_tools(&self) -> EngineResult<Vec<ToolDefinition>> {
        Ok(vec![
            Self::tool("get_pod_status"),
            Self::tool("search_logs"),
            Self::tool("get_error_rates"),
            Self::tool("search_runbooks"),
        ])
    }

    async fn call_tool(&self, name: &str, _arguments: serde_json::Value) -> EngineResult<String> {
        self.calls.lock().push(name.to_string());
        Ok(match opsleuth::engine::gateway::base_tool_name(name) {
            "get_pod_status" => "3/3 pods Running in namespace checkout".into(),
            "search_logs" => "14:02 ERROR connection refused (42 occurrences)".into(),
            "get_error_rates" => "error rate 4.2% over the last hour, baseline 0.1%".into(),
            "search_runbooks" => "Runbook RB-12: restart, then roll back".into(),
            other => format!("no fixture for {}", other),
        })
    }
}

// ── Harness ────────────────────────────────────────────────────────────────

struct Harness {
    investigator: Investigator,
    provider: Arc<ScriptedProvider>,
    gateway: Arc<FakeGateway>,
    backend: Arc<SqliteMemoryStore>,
}

/// Provider handle that lets the harness keep a counting reference while
/// the engine owns the boxed trait object.
struct SharedProvider(Arc<ScriptedProvider>);

#[async_trait]
impl AiProvider for SharedProvider {
    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        temperature: Option<f64>,
    ) -> EngineResult<Vec<StreamChunk>> {
        self.0.chat_stream(messages, tools, model, temperature).await
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

async fn harness(script: Vec<Script>, tune: impl FnOnce(&mut EngineConfig)) -> Harness {
    let provider = Arc::new(ScriptedProvider::new(script));
    let gateway = Arc::new(FakeGateway::new());
    let backend = Arc::new(SqliteMemoryStore::open_in_memory().unwrap());

    let mut config = EngineConfig::new(vec![], "test-model");
    config.executive_summary = false;
    config.investigation_timeout_secs = 30;
    config.specialist_timeout_secs = 10;
    config.tool_timeout_secs = 5;
    tune(&mut config);

    let mut tools = gateway.list_tools().await.unwrap();
    tools.extend(shared_tools());

    let engine = EngineState::with_parts(
        config,
        AnyProvider::from_boxed(Box::new(SharedProvider(provider.clone()))),
        MemoryStore::new(backend.clone()),
        gateway.clone(),
        tools,
    );

    Harness { investigator: Investigator::new(engine), provider, gateway, backend }
}

fn simple_plan_json(agents: &[&str], steps: &[&str]) -> String {
    json!({
        "steps": steps,
        "agentsSequence": agents,
        "complexity": "simple",
        "autoExecute": true,
        "reasoning": "scripted plan"
    })
    .to_string()
}

// ── Scenario A: one simple step, one agent, no approval prompt ─────────────

#[tokio::test]
async fn single_step_simple_plan_runs_one_agent() {
    let h = harness(
        vec![
            Script::Text(simple_plan_json(&["kubernetes_agent"], &["check k8s status"])),
            Script::ToolCall {
                id: "call_1".into(),
                name: "gw_sre_get_pod_status".into(),
                arguments: "{}".into(),
            },
            Script::Text("All pods healthy: 3/3 Running in checkout.".into()),
        ],
        |_| {},
    )
    .await;

    let response = h
        .investigator
        .run_investigation("check pod health", "u1", "s1", false)
        .await;

    assert!(response.contains("Kubernetes Infrastructure Agent"));
    assert!(response.contains("All pods healthy"));
    assert!(!response.contains("Proposed Investigation Plan"));
    // Exactly one gateway tool call, from the one specialist
    assert_eq!(h.gateway.call_log(), vec!["gw_sre_get_pod_status"]);
    // planner + specialist round 1 + specialist round 2
    assert_eq!(h.provider.call_count(), 3);
}

// ── Scenario B: prose planner output → fallback metrics→logs plan ──────────

#[tokio::test]
async fn unparseable_plan_falls_back_to_two_step_default() {
    let h = harness(
        vec![
            Script::Text("Let me think about what to check first...".into()),
            Script::Text("Error rate is elevated at 4.2%.".into()),
            Script::Text("Logs show connection refused spikes.".into()),
        ],
        |_| {},
    )
    .await;

    let response = h
        .investigator
        .run_investigation("checkout is slow", "u1", "s1", false)
        .await;

    let metrics_pos = response.find("Performance Metrics Agent").expect("metrics section");
    let logs_pos = response.find("Application Logs Agent").expect("logs section");
    assert!(metrics_pos < logs_pos, "fallback runs metrics before logs");
}

// ── Scenario C: complex plan parks on approval, zero invocations ───────────

#[tokio::test]
async fn complex_plan_awaits_approval_with_no_agent_runs() {
    let plan = json!({
        "steps": ["inspect cluster", "drain node"],
        "agentsSequence": ["kubernetes_agent", "runbooks_agent"],
        "complexity": "complex",
        "autoExecute": false,
        "reasoning": "potentially disruptive"
    })
    .to_string();

    let h = harness(vec![Script::Text(plan)], |_| {}).await;

    let response = h
        .investigator
        .run_investigation("node keeps flapping", "u1", "s1", false)
        .await;

    assert!(response.contains("Proposed Investigation Plan"));
    assert!(response.contains("potentially disruptive"));
    // No results report, no tool calls, only the planner hit the model
    assert!(!response.contains("Investigation Results"));
    assert!(h.gateway.call_log().is_empty());
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn auto_approve_override_executes_complex_plan() {
    let plan = json!({
        "steps": ["inspect cluster"],
        "agentsSequence": ["kubernetes_agent"],
        "complexity": "complex",
        "autoExecute": false,
        "reasoning": "needs approval normally"
    })
    .to_string();

    let h = harness(
        vec![
            Script::Text(plan),
            Script::Text("Cluster inspected; control plane healthy.".into()),
        ],
        |_| {},
    )
    .await;

    let response = h
        .investigator
        .run_investigation("node keeps flapping", "u1", "s1", true)
        .await;

    assert!(!response.contains("Proposed Investigation Plan"));
    assert!(response.contains("Cluster inspected"));
}

// ── Scenario D: specialist timeout degrades, pipeline completes ────────────

#[tokio::test]
async fn specialist_timeout_becomes_degraded_result() {
    let h = harness(
        vec![
            Script::Text(simple_plan_json(&["logs_agent"], &["search the logs"])),
            Script::Hang(5),
        ],
        |config| {
            config.specialist_timeout_secs = 1;
        },
    )
    .await;

    let response = h
        .investigator
        .run_investigation("errors in checkout", "u1", "s1", false)
        .await;

    assert!(response.contains("Application Logs Agent"));
    assert!(response.contains("timed out after 1 seconds"));
    // The aggregated response is still a complete report
    assert!(response.contains("Investigation Results"));
}

// ── Scenario E: repeated agent short-circuits the plan ─────────────────────

#[tokio::test]
async fn repeated_agent_without_collaboration_runs_once() {
    let plan = json!({
        "steps": ["first pass", "second pass"],
        "agentsSequence": ["metrics_agent", "metrics_agent"],
        "complexity": "simple",
        "autoExecute": true,
        "reasoning": "",
        "requiresCollaboration": false
    })
    .to_string();

    let h = harness(
        vec![
            Script::Text(plan),
            Script::Text("Metrics look elevated.".into()),
        ],
        |_| {},
    )
    .await;

    let response = h
        .investigator
        .run_investigation("latency spike", "u1", "s1", false)
        .await;

    assert!(response.contains("Metrics look elevated"));
    // planner + one specialist call; the second pass was short-circuited
    assert_eq!(h.provider.call_count(), 2);
}

// ── Planner ladder: provider errors land on the degenerate plan ────────────

#[tokio::test]
async fn planner_provider_errors_fall_back_through_ladder() {
    let h = harness(
        vec![
            Script::Fail("rate limited".into()),
            Script::Fail("still rate limited".into()),
            Script::Text("Metrics nominal.".into()),
            Script::Text("Logs quiet.".into()),
        ],
        |_| {},
    )
    .await;

    let response = h
        .investigator
        .run_investigation("anything odd?", "u1", "s1", false)
        .await;

    // Degenerate plan ran both default agents despite the planner being down
    assert!(response.contains("Performance Metrics Agent"));
    assert!(response.contains("Application Logs Agent"));
}

// ── Specialist failure degrades but never aborts ───────────────────────────

#[tokio::test]
async fn specialist_provider_error_becomes_error_result() {
    let h = harness(
        vec![
            Script::Text(simple_plan_json(
                &["kubernetes_agent", "logs_agent"],
                &["check pods", "check logs"],
            )),
            Script::Fail("model unavailable".into()),
            Script::Text("Logs show nothing unusual.".into()),
        ],
        |_| {},
    )
    .await;

    let response = h
        .investigator
        .run_investigation("pods restarting?", "u1", "s1", false)
        .await;

    // First agent degraded, second still ran, report still complete
    assert!(response.contains("could not complete its step"));
    assert!(response.contains("Logs show nothing unusual"));
}

// ── Investigation budget ───────────────────────────────────────────────────

#[tokio::test]
async fn investigation_budget_produces_timeout_message() {
    let h = harness(vec![Script::Hang(10)], |config| {
        config.investigation_timeout_secs = 1;
    })
    .await;

    let response = h
        .investigator
        .run_investigation("slow question", "u1", "s1", false)
        .await;

    assert!(response.contains("time budget"));
}

// ── Memory write-back ──────────────────────────────────────────────────────

#[tokio::test]
async fn investigation_summary_and_conversation_are_persisted() {
    let h = harness(
        vec![
            Script::Text(simple_plan_json(&["kubernetes_agent"], &["check k8s"])),
            Script::Text(
                "The root cause was an OOM-killed pod. The incident is resolved.".into(),
            ),
        ],
        |_| {},
    )
    .await;

    h.investigator
        .run_investigation("why did checkout crash", "u7", "sess-42", false)
        .await;

    // Investigation summary landed in the session-scoped namespace
    let summaries = h
        .backend
        .search("/opsleuth/investigations/u7/sess-42", "", 10)
        .await
        .unwrap();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].content.contains("resolved"));

    // Conversation turns (planner + specialist + final response) persisted
    let turns = h
        .backend
        .search("/opsleuth/conversations/u7/sess-42", "", 10)
        .await
        .unwrap();
    assert!(turns.len() >= 3);
}

#[tokio::test]
async fn retrieved_memory_context_reaches_next_investigation() {
    // Seed a prior infrastructure fact cross-session, then check the next
    // investigation still completes with the memory store active.
    let h = harness(
        vec![
            Script::Text(simple_plan_json(&["metrics_agent"], &["check error rates"])),
            Script::Text("Error rates back to baseline.".into()),
        ],
        |_| {},
    )
    .await;

    let memory = MemoryStore::new(h.backend.clone());
    memory
        .save(
            MemoryKind::Infrastructure,
            "u1",
            "checkout service runs on cluster prod-east",
            Some("old-session"),
        )
        .await
        .unwrap();

    let response = h
        .investigator
        .run_investigation("checkout error rates", "u1", "s-new", false)
        .await;
    assert!(response.contains("Error rates back to baseline"));
}

// ── Executive summary path ─────────────────────────────────────────────────

#[tokio::test]
async fn executive_summary_is_prepended_when_enabled() {
    let h = harness(
        vec![
            Script::Text(simple_plan_json(&["logs_agent"], &["search logs"])),
            Script::Text("42 connection-refused errors found.".into()),
            // exec summary call
            Script::Text("Checkout errors trace to refused connections; restart the pool.".into()),
        ],
        |config| {
            config.executive_summary = true;
        },
    )
    .await;

    let response = h
        .investigator
        .run_investigation("checkout errors", "u1", "s1", false)
        .await;

    let exec_pos = response.find("restart the pool").expect("exec summary present");
    let detail_pos = response.find("Investigation Results").expect("details present");
    assert!(exec_pos < detail_pos, "summary is prepended");
}

#[tokio::test]
async fn executive_summary_failure_degrades_to_generic_line() {
    let h = harness(
        vec![
            Script::Text(simple_plan_json(&["logs_agent"], &["search logs"])),
            Script::Text("Nothing notable in the logs.".into()),
            Script::Fail("summary model down".into()),
        ],
        |config| {
            config.executive_summary = true;
        },
    )
    .await;

    let response = h
        .investigator
        .run_investigation("quiet day?", "u1", "s1", false)
        .await;

    assert!(response.contains("Investigation complete. Detailed findings"));
    assert!(response.contains("Nothing notable in the logs"));
}

// ── Interactive sessions ───────────────────────────────────────────────────

#[tokio::test]
async fn save_report_archives_and_rotates_session() {
    let h = harness(
        vec![
            Script::Text(simple_plan_json(&["kubernetes_agent"], &["check k8s"])),
            Script::Text("Pods recovered after the node came back.".into()),
        ],
        |_| {},
    )
    .await;

    let mut session = InvestigationSession::new(h.investigator.clone(), "u9");
    let first_id = session.session_id().to_string();

    let response = session.ask("check pod health", false).await;
    assert!(response.contains("Pods recovered"));

    let new_id = session.save_report().await;
    assert_ne!(first_id, new_id);
    assert_eq!(session.session_id(), new_id);

    // Old session namespace holds the aggregator summary plus the archived report
    let records = h
        .backend
        .search(&format!("/opsleuth/investigations/u9/{}", first_id), "", 10)
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
}

// ── Memory tool interception ───────────────────────────────────────────────

#[tokio::test]
async fn memory_tools_are_intercepted_not_forwarded() {
    // A specialist stores a memory mid-loop: the call must be served by
    // the memory store, never forwarded to the gateway.
    let h = harness(
        vec![
            Script::Text(simple_plan_json(&["logs_agent"], &["search logs"])),
            Script::ToolCall {
                id: "call_m".into(),
                name: "memory_store".into(),
                arguments: json!({"content": "checkout service depends on redis", "kind": "infrastructure"})
                    .to_string(),
            },
            Script::Text("Logged a durable fact and finished.".into()),
        ],
        |_| {},
    )
    .await;

    h.investigator
        .run_investigation("checkout errors", "u1", "s1", false)
        .await;

    // The memory tool was intercepted — never forwarded to the gateway
    assert!(h.gateway.call_log().is_empty());
    let facts = h
        .backend
        .search("/opsleuth/infra/u1/s1", "redis", 10)
        .await
        .unwrap();
    assert_eq!(facts.len(), 1);
}
