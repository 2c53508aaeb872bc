use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sopflow_core::approval::{ApprovalDecision, ApprovalRequest};
use sopflow_core::error::{Result, SopError};
use sopflow_core::sop::Sop;
use sopflow_core::state::{ExecutionState, RunReport};
use sopflow_core::types::{RunId, RunStatus};

use crate::engine::Engine;

/// Tracks live runs of one engine so they can be cancelled, and routes
/// decisions and recovery through the snapshot store.
///
/// Runs share nothing but the engine; each one owns its own state.
pub struct RunManager {
    engine: Arc<Engine>,
    live: Mutex<HashMap<RunId, CancellationToken>>,
}

impl RunManager {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Start a run and wait for it to pause or finish.
    pub async fn start(&self, sop: Sop) -> Result<RunReport> {
        let state = self.engine.create(sop)?;
        let run_id = state.run_id.clone();
        let cancel = self.register(&run_id)?;
        let result = self.engine.execute(state, cancel).await;
        self.unregister(&run_id);
        result
    }

    /// Start a run on its own task. The run id is known before the task
    /// makes any progress.
    pub fn spawn(self: &Arc<Self>, sop: Sop) -> Result<(RunId, JoinHandle<Result<RunReport>>)> {
        let state = self.engine.create(sop)?;
        let run_id = state.run_id.clone();
        let cancel = self.register(&run_id)?;
        let this = Arc::clone(self);
        let id = run_id.clone();
        let handle = tokio::spawn(async move {
            let result = this.engine.execute(state, cancel).await;
            this.unregister(&id);
            result
        });
        Ok((run_id, handle))
    }

    /// Deliver a decision to a paused run and continue it.
    pub async fn decide(&self, run_id: &RunId, decision: ApprovalDecision) -> Result<RunReport> {
        let (state, cancel) = self.claim(run_id)?;
        let result = self.engine.resume(state, decision, cancel).await;
        self.unregister(run_id);
        result
    }

    /// Stop a run. A live run is cancelled and ends `Terminated` at its next
    /// checkpoint; a stored run is terminated immediately.
    pub fn terminate(&self, run_id: &RunId) -> Result<Option<RunReport>> {
        {
            let mut live = self.lock_live()?;
            if let Some(token) = live.get(run_id) {
                info!(run_id = %run_id, "Cancelling live run");
                token.cancel();
                return Ok(None);
            }
            live.insert(run_id.clone(), CancellationToken::new());
        }
        let result = self.load(run_id).and_then(|state| self.engine.terminate(state));
        self.unregister(run_id);
        result.map(Some)
    }

    pub fn status(&self, run_id: &RunId) -> Result<RunReport> {
        Ok(self.load(run_id)?.report())
    }

    pub fn runs(&self, status: Option<RunStatus>) -> Result<Vec<ExecutionState>> {
        self.engine.store().list(status)
    }

    /// Every run currently waiting for a human.
    pub fn pending_approvals(&self) -> Result<Vec<ApprovalRequest>> {
        Ok(self
            .engine
            .store()
            .list(Some(RunStatus::PausedForApproval))?
            .into_iter()
            .filter_map(|s| s.pending_approval)
            .collect())
    }

    /// Reject every pause older than the approval timeout.
    pub async fn expire_approvals(&self, now: DateTime<Utc>) -> Result<Vec<RunReport>> {
        let mut reports = Vec::new();
        for listed in self.engine.store().list(Some(RunStatus::PausedForApproval))? {
            let run_id = listed.run_id;
            let Ok((state, cancel)) = self.claim(&run_id) else {
                continue;
            };
            let result = self.engine.expire(state, now, cancel).await;
            self.unregister(&run_id);
            match result {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => warn!(run_id = %run_id, error = %e, "Failed to expire approval"),
            }
        }
        Ok(reports)
    }

    /// Continue a run left `Pending` or `Running` by a dead process.
    pub async fn recover(&self, run_id: &RunId) -> Result<RunReport> {
        let (state, cancel) = self.claim(run_id)?;
        let result = self.engine.recover(state, cancel).await;
        self.unregister(run_id);
        result
    }

    /// Recover every interrupted run in the store, one after another.
    pub async fn recover_all(&self) -> Result<Vec<RunReport>> {
        let mut interrupted = self.engine.store().list(Some(RunStatus::Running))?;
        interrupted.extend(self.engine.store().list(Some(RunStatus::Pending))?);

        let mut reports = Vec::new();
        for state in interrupted {
            match self.recover(&state.run_id).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(run_id = %state.run_id, error = %e, "Recovery failed"),
            }
        }
        Ok(reports)
    }

    pub fn is_live(&self, run_id: &RunId) -> bool {
        self.live_token(run_id).ok().flatten().is_some()
    }

    fn load(&self, run_id: &RunId) -> Result<ExecutionState> {
        self.engine
            .store()
            .load(run_id)?
            .ok_or_else(|| SopError::RunNotFound(run_id.to_string()))
    }

    /// Claim `run_id`, then read its snapshot. Reading only after the claim
    /// means no other driver can save over the state returned here.
    fn claim(&self, run_id: &RunId) -> Result<(ExecutionState, CancellationToken)> {
        let cancel = self.register(run_id)?;
        match self.load(run_id) {
            Ok(state) => Ok((state, cancel)),
            Err(e) => {
                self.unregister(run_id);
                Err(e)
            }
        }
    }

    fn lock_live(&self) -> Result<std::sync::MutexGuard<'_, HashMap<RunId, CancellationToken>>> {
        self.live
            .lock()
            .map_err(|e| SopError::Snapshot(e.to_string()))
    }

    /// Claim a run for this process. Two drivers never touch one run.
    fn register(&self, run_id: &RunId) -> Result<CancellationToken> {
        let mut live = self.lock_live()?;
        if live.contains_key(run_id) {
            return Err(SopError::NotResumable {
                run_id: run_id.to_string(),
                status: "live".into(),
            });
        }
        let token = CancellationToken::new();
        live.insert(run_id.clone(), token.clone());
        Ok(token)
    }

    fn unregister(&self, run_id: &RunId) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(run_id);
        }
    }

    fn live_token(&self, run_id: &RunId) -> Result<Option<CancellationToken>> {
        Ok(self.lock_live()?.get(run_id).cloned())
    }
}
