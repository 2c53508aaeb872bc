use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::{ApprovalDecision, ApprovalRequest};
use crate::error::{FailureKind, Result, SopError};
use crate::sop::Sop;
use crate::types::{RunId, RunStatus, StepStatus};

/// Snapshot format written by this build.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Append-only map of step results for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    values: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a result. Each name may be written once per run.
    pub fn write(&mut self, name: &str, value: Value) -> Result<()> {
        if self.values.contains_key(name) {
            return Err(SopError::DuplicateResult(name.to_string()));
        }
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

/// One failed attempt, as reported by the retry controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub kind: FailureKind,
    pub message: String,
    pub elapsed_ms: u64,
}

/// Why a step (and possibly the run) failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub step_id: String,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempt_history: Vec<AttemptRecord>,
}

impl FailureDetail {
    pub fn new(step_id: impl Into<String>, error: &SopError) -> Self {
        Self {
            step_id: step_id.into(),
            kind: error.kind(),
            message: error.to_string(),
            attempts: 0,
            attempt_history: Vec::new(),
        }
    }
}

/// Record of one visit to a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    /// Context name the result was stored under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalDecision>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Everything needed to continue a run, possibly in another process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub version: u32,
    pub run_id: RunId,
    pub status: RunStatus,
    /// Step to visit next; `None` once the run has no further step.
    pub cursor: Option<String>,
    pub context: ExecutionContext,
    pub history: Vec<StepOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<ApprovalRequest>,
    /// Decisions received but not yet consumed, keyed by step id.
    #[serde(default)]
    pub decisions: BTreeMap<String, ApprovalDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    /// Cursor moves so far, bounded by `max_transitions`.
    #[serde(default)]
    pub transitions: usize,
    pub sop: Sop,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    /// Fresh `Pending` state positioned at the first step.
    pub fn new(sop: Sop) -> Self {
        let now = Utc::now();
        Self {
            version: SNAPSHOT_VERSION,
            run_id: RunId::new(),
            status: RunStatus::Pending,
            cursor: sop.first_id().map(String::from),
            context: ExecutionContext::new(),
            history: Vec::new(),
            pending_approval: None,
            decisions: BTreeMap::new(),
            failure: None,
            transitions: 0,
            sop,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether history holds a successful outcome for `step_id`.
    pub fn has_succeeded(&self, step_id: &str) -> bool {
        self.history
            .iter()
            .any(|o| o.step_id == step_id && o.status == StepStatus::Succeeded)
    }

    /// Serialize as a snapshot document.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Load a snapshot document, refusing unknown format versions.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(json)?;
        let version = raw.get("version").and_then(Value::as_u64);
        if version != Some(SNAPSHOT_VERSION as u64) {
            return Err(SopError::Snapshot(format!(
                "unsupported snapshot version {:?} (expected {})",
                version, SNAPSHOT_VERSION
            )));
        }
        Ok(serde_json::from_value(raw)?)
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            run_id: self.run_id.clone(),
            status: self.status,
            context: self.context.clone(),
            history: self.history.clone(),
            failure: self.failure.clone(),
            pending_approval: self.pending_approval.clone(),
        }
    }
}

/// Outcome handed back to the caller after each drive of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub context: ExecutionContext,
    pub history: Vec<StepOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<ApprovalRequest>,
}

impl RunReport {
    /// Ids of steps in the order they were visited.
    pub fn visited(&self) -> Vec<&str> {
        self.history.iter().map(|o| o.step_id.as_str()).collect()
    }

    pub fn outcome(&self, step_id: &str) -> Option<&StepOutcome> {
        self.history.iter().rev().find(|o| o.step_id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sop::{Step, ToolRef};
    use serde_json::json;

    fn sop() -> Sop {
        Sop::new(vec![
            Step::new("a", ToolRef::static_tool("add")),
            Step::new("b", ToolRef::static_tool("save")),
        ])
    }

    #[test]
    fn context_is_write_once() {
        let mut ctx = ExecutionContext::new();
        ctx.write("area", json!(12)).unwrap();
        let err = ctx.write("area", json!(13)).unwrap_err();
        assert!(matches!(err, SopError::DuplicateResult(ref n) if n == "area"));
        assert_eq!(ctx.get("area"), Some(&json!(12)));
    }

    #[test]
    fn new_state_points_at_first_step() {
        let state = ExecutionState::new(sop());
        assert_eq!(state.status, RunStatus::Pending);
        assert_eq!(state.cursor.as_deref(), Some("a"));
        assert_eq!(state.version, SNAPSHOT_VERSION);
    }

    #[test]
    fn snapshot_roundtrip_preserves_context() {
        let mut state = ExecutionState::new(sop());
        state.context.write("area", json!(12)).unwrap();
        let restored = ExecutionState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn unknown_version_rejected() {
        let state = ExecutionState::new(sop());
        let mut raw: Value = serde_json::to_value(&state).unwrap();
        raw["version"] = json!(99);
        let err = ExecutionState::from_json(&raw.to_string()).unwrap_err();
        assert!(matches!(err, SopError::Snapshot(_)));
    }
}
