use futures::future::BoxFuture;

use crate::error::Result;
use crate::state::ExecutionState;
use crate::types::{ParamSpec, RunId, RunStatus, ToolContext};

/// Static tool: a deterministic callable with a declared signature.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (the `tool_ref` used in SOP steps).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Group shown in the tool catalog (e.g. "math", "file").
    fn category(&self) -> &str {
        "general"
    }

    /// Declared parameters; arguments are validated against this before `execute`.
    fn signature(&self) -> Vec<ParamSpec>;

    /// Execute the tool with validated arguments.
    fn execute(
        &self,
        args: serde_json::Map<String, serde_json::Value>,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Timeout in seconds for this tool (`None` = engine default).
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// Dynamic tool: a reasoning call (usually an LLM) producing text that
/// the adapter parses into a structured result.
pub trait Reasoner: Send + Sync + 'static {
    /// Agent name (the `agent` of a dynamic `tool_ref`).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Answer a directive given the step's resolved arguments.
    fn reason(
        &self,
        directive: String,
        args: serde_json::Map<String, serde_json::Value>,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<String>>;

    /// Timeout in seconds for one reasoning call (`None` = engine default).
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// Durable home of execution state snapshots, one per run.
///
/// Terminal runs stay in the store until explicitly deleted.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Insert or replace the snapshot of `state.run_id`.
    fn save(&self, state: &ExecutionState) -> Result<()>;

    fn load(&self, run_id: &RunId) -> Result<Option<ExecutionState>>;

    /// Snapshots ordered by last update, optionally filtered by status.
    fn list(&self, status: Option<RunStatus>) -> Result<Vec<ExecutionState>>;

    /// Returns whether a snapshot was removed.
    fn delete(&self, run_id: &RunId) -> Result<bool>;
}
