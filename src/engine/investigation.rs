// ── Opsleuth Engine: Investigation Driver ──────────────────────────────────
//
// The single entry point the host calls:
//
//   run_investigation(query, user_id, session_id, auto_approve_plan)
//       -> final response text
//
// One investigation is a sequential pipeline — plan, approval gate,
// specialists one at a time, aggregate — with the overall wall-clock
// budget enforced here as the last line of defense. This function always
// returns a string; worst case the user gets a plain-language timeout or
// apology instead of an error.
//
// Many investigations run concurrently on the async runtime, one per user
// session; their states are fully isolated and only the append-only
// memory store is shared.

use crate::engine::aggregator::aggregate;
use crate::engine::memory::MemoryKind;
use crate::engine::planner::create_investigation_plan;
use crate::engine::router::{route_next, RouteDecision};
use crate::engine::specialists::SpecialistAgent;
use crate::engine::state::EngineState;
use crate::engine::types::*;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

// ── Investigator ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Investigator {
    engine: Arc<EngineState>,
}

impl Investigator {
    pub fn new(engine: EngineState) -> Self {
        Investigator { engine: Arc::new(engine) }
    }

    pub fn engine(&self) -> &EngineState {
        &self.engine
    }

    /// Run one end-to-end investigation. Always returns a response string.
    pub async fn run_investigation(
        &self,
        query: &str,
        user_id: &str,
        session_id: &str,
        auto_approve_plan: bool,
    ) -> String {
        let mut state =
            SessionState::new(query, user_id, session_id).with_auto_approve(auto_approve_plan);

        let budget = Duration::from_secs(self.engine.config.investigation_timeout_secs);
        info!(
            "[investigation] Starting for user={} session={} budget={}s",
            user_id,
            session_id,
            budget.as_secs()
        );

        match tokio::time::timeout(budget, self.run_pipeline(&mut state)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(
                    "[investigation] Budget of {}s exceeded — aborting pending step",
                    budget.as_secs()
                );
                format!(
                    "The investigation exceeded its {} second time budget and was \
                     stopped. Results gathered so far have been saved to this \
                     session's memory; please retry with a narrower question.",
                    budget.as_secs()
                )
            }
        }
    }

    /// Plan → approval gate → specialists one at a time → aggregate.
    async fn run_pipeline(&self, state: &mut SessionState) -> String {
        let plan = create_investigation_plan(state, &self.engine).await;
        state.metadata.plan = Some(plan);

        loop {
            match route_next(state) {
                RouteDecision::Invoke { kind, .. } => {
                    let update = SpecialistAgent::new(kind).invoke(state, &self.engine).await;
                    state.apply(update);
                }
                RouteDecision::AwaitApproval | RouteDecision::Finish => break,
            }
        }

        aggregate(state, &self.engine).await
    }
}

// ── Interactive sessions ───────────────────────────────────────────────────

/// Multi-turn wrapper: carries the identity pair across turns so
/// follow-up questions share session-scoped memory. Each turn is its own
/// single-pass investigation. An explicit `save_report` concludes the
/// session: the last response is archived and the session id rotates.
pub struct InvestigationSession {
    investigator: Investigator,
    user_id: String,
    session_id: String,
    last_response: Option<String>,
}

impl InvestigationSession {
    pub fn new(investigator: Investigator, user_id: impl Into<String>) -> Self {
        InvestigationSession {
            investigator,
            user_id: user_id.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            last_response: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run one turn in this session.
    pub async fn ask(&mut self, query: &str, auto_approve_plan: bool) -> String {
        let response = self
            .investigator
            .run_investigation(query, &self.user_id, &self.session_id, auto_approve_plan)
            .await;
        self.last_response = Some(response.clone());
        response
    }

    /// Archive the last response to the Investigations namespace and
    /// rotate the session id. Returns the new session id.
    pub async fn save_report(&mut self) -> String {
        if let Some(report) = self.last_response.take() {
            match self
                .investigator
                .engine
                .memory
                .save(
                    MemoryKind::Investigations,
                    &self.user_id,
                    &report,
                    Some(&self.session_id),
                )
                .await
            {
                Ok(true) => info!("[investigation] Report saved for session {}", self.session_id),
                Ok(false) => {}
                Err(e) => warn!("[investigation] Report not saved: {}", e),
            }
        }
        self.session_id = uuid::Uuid::new_v4().to_string();
        self.session_id.clone()
    }
}
