use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::{info, warn};

use sopflow_core::approval::{ApprovalDecision, ApprovalRequest};
use sopflow_core::error::{Result, SopError};
use sopflow_core::sop::Step;
use sopflow_core::state::ExecutionState;
use sopflow_core::types::RunStatus;

/// Who is recorded as the decider when a pause expires.
pub const TIMEOUT_DECIDER: &str = "timeout";

/// What the gate says about the step under the cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// The step does not need approval.
    NotRequired,
    /// A decision for this step is on record.
    Decided(ApprovalDecision),
    /// The run must pause until someone decides.
    Suspend(ApprovalRequest),
}

/// Human-in-the-loop checkpoint in front of sensitive steps.
///
/// Holds no run state: pending requests and unconsumed decisions live in the
/// [`ExecutionState`] so they survive process restarts.
#[derive(Debug, Clone, Default)]
pub struct ApprovalGate {
    timeout: Option<Duration>,
}

impl ApprovalGate {
    /// A timeout too large for [`Duration`] is treated as no timeout.
    pub fn new(timeout_secs: Option<u64>) -> Self {
        let timeout = timeout_secs.and_then(|s| {
            let timeout = i64::try_from(s).ok().and_then(Duration::try_seconds);
            if timeout.is_none() {
                warn!(timeout_secs = s, "Approval timeout out of range, pauses never expire");
            }
            timeout
        });
        Self { timeout }
    }

    pub fn check(
        &self,
        state: &ExecutionState,
        step: &Step,
        resolved_args: &Map<String, Value>,
    ) -> GateDecision {
        if !step.requires_approval {
            return GateDecision::NotRequired;
        }
        if let Some(decision) = state.decisions.get(&step.id) {
            return GateDecision::Decided(decision.clone());
        }
        GateDecision::Suspend(ApprovalRequest {
            run_id: state.run_id.clone(),
            step_id: step.id.clone(),
            tool: step.tool_ref.to_string(),
            args: resolved_args.clone(),
            description: (!step.description.is_empty()).then(|| step.description.clone()),
            requested_at: Utc::now(),
        })
    }

    /// Record a decision against the paused step and make the run
    /// resumable. Mismatched or unexpected decisions leave `state` untouched.
    pub fn apply_decision(
        &self,
        state: &mut ExecutionState,
        decision: ApprovalDecision,
    ) -> Result<()> {
        let pending = state.pending_approval.as_ref().map(|p| p.step_id.clone());
        let matches = state.status == RunStatus::PausedForApproval
            && pending.as_deref() == Some(decision.step_id.as_str());
        if !matches {
            warn!(
                run_id = %state.run_id,
                status = %state.status,
                pending = ?pending,
                received = %decision.step_id,
                "Ignoring stale approval decision"
            );
            return Err(SopError::StaleApproval {
                pending,
                received: decision.step_id,
            });
        }

        info!(
            run_id = %state.run_id,
            step_id = %decision.step_id,
            verdict = %decision.verdict,
            decided_by = %decision.decided_by,
            "Approval decision recorded"
        );
        state.pending_approval = None;
        state.decisions.insert(decision.step_id.clone(), decision);
        state.status = RunStatus::Running;
        state.touch();
        Ok(())
    }

    /// Whether a pause requested at `request.requested_at` is overdue.
    pub fn is_expired(&self, request: &ApprovalRequest, now: DateTime<Utc>) -> bool {
        self.timeout
            .is_some_and(|t| now.signed_duration_since(request.requested_at) >= t)
    }

    /// Rejection recorded when a pause outlives the configured timeout.
    pub fn timeout_decision(&self, step_id: &str) -> ApprovalDecision {
        ApprovalDecision::rejected(step_id, TIMEOUT_DECIDER, "approval timed out")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sopflow_core::sop::{Sop, ToolRef};

    fn paused_state() -> (ExecutionState, Step) {
        let step = Step::new("save", ToolRef::static_tool("save_file"))
            .with_arg("content", json!("<area>"))
            .requiring_approval();
        let mut state = ExecutionState::new(Sop::new(vec![step.clone()]));
        let gate = ApprovalGate::default();
        let args = json!({"content": 12}).as_object().cloned().unwrap();
        match gate.check(&state, &step, &args) {
            GateDecision::Suspend(req) => {
                assert_eq!(req.args["content"], json!(12));
                state.pending_approval = Some(req);
                state.status = RunStatus::PausedForApproval;
            }
            other => panic!("expected suspend, got {other:?}"),
        }
        (state, step)
    }

    #[test]
    fn steps_without_flag_pass() {
        let step = Step::new("a", ToolRef::static_tool("add"));
        let state = ExecutionState::new(Sop::new(vec![step.clone()]));
        assert_eq!(
            ApprovalGate::default().check(&state, &step, &Map::new()),
            GateDecision::NotRequired
        );
    }

    #[test]
    fn decision_unblocks_step() {
        let (mut state, step) = paused_state();
        let gate = ApprovalGate::default();
        gate.apply_decision(&mut state, ApprovalDecision::approved("save", "alice"))
            .unwrap();
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.pending_approval.is_none());
        match gate.check(&state, &step, &Map::new()) {
            GateDecision::Decided(d) => assert!(d.is_approved()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stale_decision_leaves_state_unchanged() {
        let (mut state, _) = paused_state();
        let before = state.clone();
        let err = ApprovalGate::default()
            .apply_decision(&mut state, ApprovalDecision::approved("other", "bob"))
            .unwrap_err();
        assert!(matches!(err, SopError::StaleApproval { ref received, .. } if received == "other"));
        assert_eq!(state, before);
    }

    #[test]
    fn decision_for_running_run_is_stale() {
        let step = Step::new("a", ToolRef::static_tool("add"));
        let mut state = ExecutionState::new(Sop::new(vec![step]));
        let err = ApprovalGate::default()
            .apply_decision(&mut state, ApprovalDecision::approved("a", "bob"))
            .unwrap_err();
        assert!(matches!(err, SopError::StaleApproval { pending: None, .. }));
    }

    #[test]
    fn expiry_only_with_timeout() {
        let (state, _) = paused_state();
        let req = state.pending_approval.unwrap();
        let later = req.requested_at + Duration::seconds(120);
        assert!(!ApprovalGate::new(None).is_expired(&req, later));
        assert!(ApprovalGate::new(Some(60)).is_expired(&req, later));
        assert!(!ApprovalGate::new(Some(600)).is_expired(&req, later));

        let d = ApprovalGate::new(Some(60)).timeout_decision("save");
        assert!(!d.is_approved());
        assert_eq!(d.decided_by, TIMEOUT_DECIDER);
    }

    #[test]
    fn huge_timeout_never_expires() {
        let (state, _) = paused_state();
        let request = state.pending_approval.unwrap();
        let later = request.requested_at + Duration::days(365 * 100);

        for secs in [u64::MAX, 100_000_000_000_000_000] {
            let gate = ApprovalGate::new(Some(secs));
            assert!(!gate.is_expired(&request, request.requested_at));
            assert!(!gate.is_expired(&request, later));
        }

        let gate = ApprovalGate::new(Some(60));
        assert!(!gate.is_expired(&request, request.requested_at));
        assert!(gate.is_expired(&request, request.requested_at + Duration::seconds(60)));
    }
}
