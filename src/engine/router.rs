// ── Opsleuth Engine: Routing State Machine ─────────────────────────────────
//
// Drives plan execution step by step. Pure state logic, no I/O:
//
//   Planning → {AwaitingApproval | Executing(step=i)} → … → Finished
//
// The driver creates the plan, stores it in metadata, then calls
// `route_next` in a loop: each call either names the next specialist to
// invoke, parks the turn on the approval gate, or declares the
// investigation finished. Specialist failures never reach this module —
// they arrive as degraded results and the machine advances regardless.

use crate::engine::types::*;
use log::{info, warn};

/// One routing decision.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Invoke this specialist next.
    Invoke { kind: SpecialistKind, reasoning: Option<String> },
    /// Complex plan parked for user approval — terminal for this turn;
    /// the caller must re-invoke with approval to proceed.
    AwaitApproval,
    /// The investigation is complete (or short-circuited).
    Finish,
}

/// Decide the next step. Mutates the step cursor, the routing reasoning,
/// and the pending-approval flag on `state.metadata`.
pub fn route_next(state: &mut SessionState) -> RouteDecision {
    // A turn already parked on approval stays parked.
    if state.metadata.plan_pending_approval {
        return RouteDecision::Finish;
    }

    let Some(plan) = state.metadata.plan.clone() else {
        warn!("[router] route_next called with no plan — finishing");
        return RouteDecision::Finish;
    };

    // Approval gate, consulted before the first invocation only: a Complex
    // plan runs unattended only when the plan itself says auto-execute or
    // the caller set the override.
    if state.agents_invoked.is_empty()
        && plan.complexity == PlanComplexity::Complex
        && !plan.auto_execute
        && !state.auto_approve_plan
    {
        info!("[router] Complex plan awaiting approval — no agents invoked");
        state.metadata.plan_pending_approval = true;
        return RouteDecision::AwaitApproval;
    }

    let step = state.metadata.plan_step;
    if step >= plan.agents_sequence.len() {
        info!("[router] Plan complete after {} steps", step);
        return RouteDecision::Finish;
    }

    let next = plan.agents_sequence[step];

    // Loop-avoidance safety valve: re-invoking an already-run agent risks
    // a cycle, so the machine finishes early unless the plan explicitly
    // requires collaboration. This can truncate a plan that legitimately
    // revisits an agent — documented behavior.
    if state.agents_invoked.contains(&next) && !plan.requires_collaboration {
        warn!(
            "[router] {} already invoked and plan does not require collaboration — finishing early",
            next.agent_id()
        );
        return RouteDecision::Finish;
    }

    let reasoning = plan.steps.get(step).cloned();
    state.metadata.routing_reasoning = reasoning.clone();
    state.metadata.plan_step = step + 1;

    info!(
        "[router] Step {} → {}{}",
        step,
        next.agent_id(),
        reasoning
            .as_deref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default()
    );

    RouteDecision::Invoke { kind: next, reasoning }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_plan(agents: Vec<SpecialistKind>) -> InvestigationPlan {
        InvestigationPlan {
            steps: agents
                .iter()
                .enumerate()
                .map(|(i, k)| format!("step {} for {}", i, k.agent_id()))
                .collect(),
            agents_sequence: agents,
            complexity: PlanComplexity::Simple,
            auto_execute: true,
            reasoning: "test".into(),
            requires_collaboration: false,
        }
    }

    fn state_with_plan(plan: InvestigationPlan) -> SessionState {
        let mut state = SessionState::new("query", "u1", "s1");
        state.metadata.plan = Some(plan);
        state
    }

    fn mark_invoked(state: &mut SessionState, kind: SpecialistKind) {
        state.apply(StateUpdate {
            kind,
            result_text: format!("{} done", kind.agent_id()),
            trace: vec![],
            messages: vec![],
        });
    }

    #[test]
    fn test_terminates_in_exactly_n_steps_without_repeats() {
        let agents = vec![
            SpecialistKind::Kubernetes,
            SpecialistKind::Logs,
            SpecialistKind::Metrics,
        ];
        let mut state = state_with_plan(make_plan(agents.clone()));

        let mut invocations = 0;
        loop {
            match route_next(&mut state) {
                RouteDecision::Invoke { kind, reasoning } => {
                    assert_eq!(kind, agents[invocations]);
                    assert!(reasoning.unwrap().contains(kind.agent_id()));
                    mark_invoked(&mut state, kind);
                    invocations += 1;
                }
                RouteDecision::Finish => break,
                RouteDecision::AwaitApproval => panic!("simple plan must not await approval"),
            }
        }
        assert_eq!(invocations, agents.len());
    }

    #[test]
    fn test_repeated_agent_short_circuits() {
        // Same agent twice consecutively, collaboration not required
        let mut state = state_with_plan(make_plan(vec![
            SpecialistKind::Logs,
            SpecialistKind::Logs,
        ]));

        match route_next(&mut state) {
            RouteDecision::Invoke { kind, .. } => mark_invoked(&mut state, kind),
            other => panic!("expected first invoke, got {:?}", other),
        }
        assert_eq!(route_next(&mut state), RouteDecision::Finish);
        assert_eq!(state.agents_invoked.len(), 1);
    }

    #[test]
    fn test_collaboration_flag_allows_revisit() {
        let mut plan = make_plan(vec![SpecialistKind::Logs, SpecialistKind::Logs]);
        plan.requires_collaboration = true;
        let mut state = state_with_plan(plan);

        let mut invocations = 0;
        while let RouteDecision::Invoke { kind, .. } = route_next(&mut state) {
            mark_invoked(&mut state, kind);
            invocations += 1;
        }
        assert_eq!(invocations, 2);
    }

    #[test]
    fn test_complex_plan_awaits_approval_with_zero_invocations() {
        let mut plan = make_plan(vec![SpecialistKind::Kubernetes]);
        plan.complexity = PlanComplexity::Complex;
        plan.auto_execute = false;
        let mut state = state_with_plan(plan);

        assert_eq!(route_next(&mut state), RouteDecision::AwaitApproval);
        assert!(state.metadata.plan_pending_approval);
        assert!(state.agents_invoked.is_empty());

        // Parked turns stay parked
        assert_eq!(route_next(&mut state), RouteDecision::Finish);
    }

    #[test]
    fn test_caller_override_bypasses_approval_gate() {
        let mut plan = make_plan(vec![SpecialistKind::Kubernetes]);
        plan.complexity = PlanComplexity::Complex;
        plan.auto_execute = false;
        let mut state = state_with_plan(plan).with_auto_approve(true);

        assert!(matches!(route_next(&mut state), RouteDecision::Invoke { .. }));
        assert!(!state.metadata.plan_pending_approval);
    }

    #[test]
    fn test_complex_auto_execute_plan_runs() {
        let mut plan = make_plan(vec![SpecialistKind::Runbooks]);
        plan.complexity = PlanComplexity::Complex;
        plan.auto_execute = true;
        let mut state = state_with_plan(plan);

        assert!(matches!(route_next(&mut state), RouteDecision::Invoke { .. }));
    }

    #[test]
    fn test_no_plan_finishes() {
        let mut state = SessionState::new("q", "u1", "s1");
        assert_eq!(route_next(&mut state), RouteDecision::Finish);
    }

    #[test]
    fn test_missing_step_text_still_routes() {
        // agents_sequence longer than steps — reasoning absent, route fine
        let mut plan = make_plan(vec![SpecialistKind::Logs, SpecialistKind::Metrics]);
        plan.steps.truncate(1);
        let mut state = state_with_plan(plan);

        match route_next(&mut state) {
            RouteDecision::Invoke { kind, reasoning } => {
                assert_eq!(kind, SpecialistKind::Logs);
                assert!(reasoning.is_some());
                mark_invoked(&mut state, kind);
            }
            other => panic!("unexpected {:?}", other),
        }
        match route_next(&mut state) {
            RouteDecision::Invoke { kind, reasoning } => {
                assert_eq!(kind, SpecialistKind::Metrics);
                assert!(reasoning.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
