use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use sopflow_core::approval::{ApprovalDecision, ApprovalRequest};
use sopflow_core::config::AppConfig;
use sopflow_core::error::{FailureKind, Result, SopError};
use sopflow_core::event::EventBus;
use sopflow_core::sop::{RetryPolicy, Sop, Step, END_TARGET};
use sopflow_core::state::{ExecutionState, FailureDetail, RunReport, StepOutcome};
use sopflow_core::traits::SnapshotStore;
use sopflow_core::types::{RunEvent, RunStatus, StepStatus, ToolContext};
use sopflow_tools::ToolAdapter;

use crate::approval::{ApprovalGate, GateDecision};
use crate::condition;
use crate::context;
use crate::retry::{RetryController, RetryOutcome};
use crate::validate::validate;

/// Engine-wide knobs, usually taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_transitions: usize,
    pub default_retry: RetryPolicy,
    /// Directory tools resolve relative paths against.
    pub working_dir: PathBuf,
    pub approval_timeout_secs: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_transitions: 1000,
            default_retry: RetryPolicy::default(),
            working_dir: std::env::temp_dir(),
            approval_timeout_secs: None,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_transitions: config.engine.max_transitions,
            default_retry: config.engine.default_retry.clone(),
            working_dir: config.workspace_dir(),
            approval_timeout_secs: config.approval.timeout_secs,
        }
    }
}

/// What to do after visiting one step.
enum Flow {
    /// Move the cursor (`None` ends the run successfully).
    Goto(Option<String>),
    Pause(ApprovalRequest),
    Fail(FailureDetail),
    /// Cancelled; carries the failure of the step that was interrupted.
    Terminate(Option<FailureDetail>),
}

/// The step-cursor state machine.
///
/// One engine serves many runs; all per-run data lives in the
/// [`ExecutionState`] passed through each call, and a snapshot is persisted
/// after every transition.
pub struct Engine {
    adapter: Arc<ToolAdapter>,
    gate: ApprovalGate,
    store: Arc<dyn SnapshotStore>,
    event_bus: Arc<EventBus>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        adapter: Arc<ToolAdapter>,
        store: Arc<dyn SnapshotStore>,
        event_bus: Arc<EventBus>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            gate: ApprovalGate::new(settings.approval_timeout_secs),
            adapter,
            store,
            event_bus,
            settings,
        }
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Validate `sop` and persist a fresh `Pending` run for it.
    pub fn create(&self, sop: Sop) -> Result<ExecutionState> {
        validate(&sop, self.adapter.registry())?;
        let state = ExecutionState::new(sop);
        self.store.save(&state)?;
        info!(run_id = %state.run_id, steps = state.sop.steps.len(), "Run created");
        Ok(state)
    }

    /// Create a run and drive it until it pauses or finishes.
    pub async fn start(&self, sop: Sop, cancel: CancellationToken) -> Result<RunReport> {
        let state = self.create(sop)?;
        self.execute(state, cancel).await
    }

    /// Apply a decision to a paused run and continue it.
    ///
    /// A decision that does not match the pending step fails with
    /// `StaleApproval` and the stored state is left as it was.
    pub async fn resume(
        &self,
        mut state: ExecutionState,
        decision: ApprovalDecision,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let step_id = decision.step_id.clone();
        let verdict = decision.verdict;
        if let Err(e) = self.gate.apply_decision(&mut state, decision) {
            self.event_bus.publish(RunEvent::StaleApproval {
                run_id: state.run_id.clone(),
                step_id,
            });
            return Err(e);
        }
        self.event_bus.publish(RunEvent::ApprovalResolved {
            run_id: state.run_id.clone(),
            step_id,
            verdict,
        });
        self.store.save(&state)?;
        self.drive(state, cancel).await
    }

    /// Drive a `Pending` run, or continue one whose process died while it
    /// was `Running`.
    pub async fn execute(
        &self,
        state: ExecutionState,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        if !matches!(state.status, RunStatus::Pending | RunStatus::Running) {
            return Err(SopError::NotResumable {
                run_id: state.run_id.to_string(),
                status: state.status.to_string(),
            });
        }
        debug!(run_id = %state.run_id, status = %state.status, cursor = ?state.cursor, "Driving run");
        self.drive(state, cancel).await
    }

    /// Continue a run whose process died while it was `Pending` or `Running`.
    pub async fn recover(
        &self,
        state: ExecutionState,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        info!(run_id = %state.run_id, cursor = ?state.cursor, "Recovering run");
        self.execute(state, cancel).await
    }

    /// Permanently end a run that is not already terminal.
    pub fn terminate(&self, mut state: ExecutionState) -> Result<RunReport> {
        if state.status.is_terminal() {
            return Err(SopError::NotResumable {
                run_id: state.run_id.to_string(),
                status: state.status.to_string(),
            });
        }
        self.finish(&mut state, RunStatus::Terminated)?;
        Ok(state.report())
    }

    /// Reject an overdue approval with a timeout decision, if one is due.
    pub async fn expire(
        &self,
        state: ExecutionState,
        now: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Result<Option<RunReport>> {
        let Some(request) = state.pending_approval.as_ref() else {
            return Ok(None);
        };
        if state.status != RunStatus::PausedForApproval || !self.gate.is_expired(request, now) {
            return Ok(None);
        }
        warn!(run_id = %state.run_id, step_id = %request.step_id, "Approval timed out");
        let decision = self.gate.timeout_decision(&request.step_id);
        self.resume(state, decision, cancel).await.map(Some)
    }

    #[instrument(name = "run", skip_all, fields(run_id = %state.run_id))]
    async fn drive(
        &self,
        mut state: ExecutionState,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        if state.status == RunStatus::Pending {
            state.status = RunStatus::Running;
            state.touch();
            self.store.save(&state)?;
            self.event_bus.publish(RunEvent::RunStarted {
                run_id: state.run_id.clone(),
                steps: state.sop.steps.len(),
            });
            info!(steps = state.sop.steps.len(), "Run started");
        }

        loop {
            if cancel.is_cancelled() {
                self.finish(&mut state, RunStatus::Terminated)?;
                return Ok(state.report());
            }

            let Some(step_id) = state.cursor.clone() else {
                self.finish(&mut state, RunStatus::Succeeded)?;
                return Ok(state.report());
            };

            let flow = match state.sop.step(&step_id).cloned() {
                Some(step) => self.visit(&mut state, &step, &cancel).await,
                None => Flow::Fail(FailureDetail::new(
                    &step_id,
                    &SopError::UnknownJumpTarget {
                        step: step_id.clone(),
                        target: step_id.clone(),
                    },
                )),
            };

            match flow {
                Flow::Goto(next) => {
                    state.transitions += 1;
                    if state.transitions > self.settings.max_transitions {
                        let err = SopError::TransitionLimit(self.settings.max_transitions);
                        self.fail(&mut state, FailureDetail::new(&step_id, &err))?;
                        return Ok(state.report());
                    }
                    debug!(from = %step_id, to = ?next, "Cursor advanced");
                    state.cursor = next;
                    state.touch();
                    self.store.save(&state)?;
                }
                Flow::Pause(request) => {
                    info!(step_id = %request.step_id, "Paused for approval");
                    state.pending_approval = Some(request.clone());
                    state.status = RunStatus::PausedForApproval;
                    state.touch();
                    self.store.save(&state)?;
                    self.event_bus
                        .publish(RunEvent::ApprovalRequested { request });
                    return Ok(state.report());
                }
                Flow::Fail(detail) => {
                    self.fail(&mut state, detail)?;
                    return Ok(state.report());
                }
                Flow::Terminate(detail) => {
                    if let Some(detail) = detail {
                        state.failure = Some(detail);
                    }
                    self.finish(&mut state, RunStatus::Terminated)?;
                    return Ok(state.report());
                }
            }
        }
    }

    /// Visit the step under the cursor: resolve, guard, gate, execute, route.
    async fn visit(
        &self,
        state: &mut ExecutionState,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Flow {
        let started_at = Utc::now();

        if state.has_succeeded(&step.id) {
            debug!(step_id = %step.id, "Step already succeeded, not re-executing");
            return self.route(state, step, step.on_success.as_deref());
        }

        let resolved = {
            let declared = state.sop.result_names();
            context::resolve_args(&step.args, &state.context, &declared)
        };
        let args = match resolved {
            Ok(args) => args,
            Err(e) => return self.structural(state, step, &e, started_at),
        };

        match condition::evaluate(step.condition.as_deref(), &state.context) {
            Ok(true) => {}
            Ok(false) => {
                info!(step_id = %step.id, "Condition false, skipping step");
                state.history.push(StepOutcome {
                    step_id: step.id.clone(),
                    status: StepStatus::Skipped,
                    attempts: 0,
                    result_ref: None,
                    failure: None,
                    approval: None,
                    started_at,
                    finished_at: Utc::now(),
                });
                self.event_bus.publish(RunEvent::StepSkipped {
                    run_id: state.run_id.clone(),
                    step_id: step.id.clone(),
                });
                return self.route(state, step, step.on_success.as_deref());
            }
            Err(e) => return self.structural(state, step, &e, started_at),
        }

        let approval = match self.gate.check(state, step, &args) {
            GateDecision::NotRequired => None,
            GateDecision::Suspend(request) => return Flow::Pause(request),
            GateDecision::Decided(decision) if decision.is_approved() => Some(decision),
            GateDecision::Decided(decision) => {
                state.decisions.remove(&step.id);
                let err = SopError::Rejected {
                    step: step.id.clone(),
                    reason: decision
                        .reason
                        .clone()
                        .unwrap_or_else(|| format!("rejected by {}", decision.decided_by)),
                };
                let detail = FailureDetail::new(&step.id, &err);
                info!(step_id = %step.id, decided_by = %decision.decided_by, "Step rejected");
                self.record_failure(state, step, &detail, Some(decision), started_at);
                return self.on_failure(state, step, detail);
            }
        };

        let policy = step
            .retry_policy
            .as_ref()
            .unwrap_or(&self.settings.default_retry);
        self.event_bus.publish(RunEvent::StepStarted {
            run_id: state.run_id.clone(),
            step_id: step.id.clone(),
            tool: step.tool_ref.to_string(),
        });
        info!(step_id = %step.id, tool = %step.tool_ref, "Executing step");

        let run_id = state.run_id.clone();
        let adapter = &*self.adapter;
        let working_dir = &self.settings.working_dir;
        let (tool_ref, step_id, timeout_secs) = (&step.tool_ref, &step.id, step.timeout_secs);
        let args = &args;
        let attempt_run_id = run_id.clone();
        let outcome = RetryController::new(policy, cancel)
            .run(
                move |_| {
                    let ctx = ToolContext::new(
                        attempt_run_id.clone(),
                        step_id.clone(),
                        working_dir.clone(),
                    );
                    adapter.invoke(tool_ref, args.clone(), ctx, timeout_secs)
                },
                |record| {
                    self.event_bus.publish(RunEvent::AttemptFailed {
                        run_id: run_id.clone(),
                        step_id: step.id.clone(),
                        attempt: record.attempt,
                        kind: record.kind,
                        message: record.message.clone(),
                    })
                },
            )
            .await;

        // A decision covers exactly one execution of the step.
        state.decisions.remove(&step.id);

        match outcome {
            RetryOutcome::Succeeded {
                value, attempts, ..
            } => {
                if let Some(name) = &step.store_result_as {
                    if let Err(e) = state.context.write(name, value) {
                        return self.structural(state, step, &e, started_at);
                    }
                }
                state.history.push(StepOutcome {
                    step_id: step.id.clone(),
                    status: StepStatus::Succeeded,
                    attempts,
                    result_ref: step.store_result_as.clone(),
                    failure: None,
                    approval,
                    started_at,
                    finished_at: Utc::now(),
                });
                self.event_bus.publish(RunEvent::StepSucceeded {
                    run_id: state.run_id.clone(),
                    step_id: step.id.clone(),
                    attempts,
                });
                info!(step_id = %step.id, attempts, "Step succeeded");
                self.route(state, step, step.on_success.as_deref())
            }
            RetryOutcome::Failed {
                kind,
                message,
                attempts,
                history,
            } => {
                let detail = FailureDetail {
                    step_id: step.id.clone(),
                    kind,
                    message,
                    attempts,
                    attempt_history: history,
                };
                self.record_failure(state, step, &detail, approval, started_at);
                if kind == FailureKind::Terminated {
                    return Flow::Terminate(Some(detail));
                }
                self.on_failure(state, step, detail)
            }
        }
    }

    /// Route a failed step: structural kinds end the run, the rest follow
    /// `on_failure` when the step declares it.
    fn on_failure(&self, state: &ExecutionState, step: &Step, detail: FailureDetail) -> Flow {
        if detail.kind.is_structural() {
            return Flow::Fail(detail);
        }
        match step.on_failure.as_deref() {
            Some(target) => {
                info!(step_id = %step.id, kind = %detail.kind, target, "Routing failure");
                self.route(state, step, Some(target))
            }
            None => Flow::Fail(detail),
        }
    }

    /// Next cursor after `step`: an explicit target, `$end`, or the next step
    /// in SOP order. Targets are re-checked here in case validation was skipped.
    fn route(&self, state: &ExecutionState, step: &Step, target: Option<&str>) -> Flow {
        match target {
            Some(END_TARGET) => Flow::Goto(None),
            Some(t) if state.sop.step(t).is_some() => Flow::Goto(Some(t.to_string())),
            Some(t) => Flow::Fail(FailureDetail::new(
                &step.id,
                &SopError::UnknownJumpTarget {
                    step: step.id.clone(),
                    target: t.to_string(),
                },
            )),
            None => Flow::Goto(state.sop.next_id(&step.id).map(String::from)),
        }
    }

    fn structural(
        &self,
        state: &mut ExecutionState,
        step: &Step,
        err: &SopError,
        started_at: DateTime<Utc>,
    ) -> Flow {
        let detail = FailureDetail::new(&step.id, err);
        self.record_failure(state, step, &detail, None, started_at);
        Flow::Fail(detail)
    }

    fn record_failure(
        &self,
        state: &mut ExecutionState,
        step: &Step,
        detail: &FailureDetail,
        approval: Option<ApprovalDecision>,
        started_at: DateTime<Utc>,
    ) {
        let status = if detail.kind == FailureKind::Rejected {
            StepStatus::Rejected
        } else {
            StepStatus::Failed
        };
        warn!(
            step_id = %step.id,
            kind = %detail.kind,
            attempts = detail.attempts,
            error = %detail.message,
            "Step failed"
        );
        state.history.push(StepOutcome {
            step_id: step.id.clone(),
            status,
            attempts: detail.attempts,
            result_ref: None,
            failure: Some(detail.clone()),
            approval,
            started_at,
            finished_at: Utc::now(),
        });
        self.event_bus.publish(RunEvent::StepFailed {
            run_id: state.run_id.clone(),
            step_id: step.id.clone(),
            kind: detail.kind,
            attempts: detail.attempts,
        });
    }

    fn fail(&self, state: &mut ExecutionState, detail: FailureDetail) -> Result<()> {
        warn!(
            step_id = %detail.step_id,
            kind = %detail.kind,
            error = %detail.message,
            "Run failed"
        );
        state.failure = Some(detail);
        self.finish(state, RunStatus::Failed)
    }

    fn finish(&self, state: &mut ExecutionState, status: RunStatus) -> Result<()> {
        state.status = status;
        state.pending_approval = None;
        if status == RunStatus::Succeeded {
            state.cursor = None;
        }
        state.touch();
        self.store.save(state)?;
        self.event_bus.publish(RunEvent::RunFinished {
            run_id: state.run_id.clone(),
            status,
        });
        info!(run_id = %state.run_id, status = %status, "Run finished");
        Ok(())
    }
}
