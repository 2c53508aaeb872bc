use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SopError {
    // Context store errors
    #[error("Result '{0}' already exists in the execution context")]
    DuplicateResult(String),

    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),

    // Condition errors
    #[error("Condition could not be resolved: {0}")]
    ConditionResolution(String),

    #[error("Invalid condition '{expr}': {message}")]
    ConditionSyntax { expr: String, message: String },

    // SOP structure errors
    #[error("Step '{step}' routes to unknown step '{target}'")]
    UnknownJumpTarget { step: String, target: String },

    #[error("Step '{step}' references '{name}' before it is produced")]
    ForwardReference { step: String, name: String },

    #[error("Duplicate step id: {0}")]
    DuplicateStepId(String),

    #[error("Step '{step}' has an invalid retry policy: {message}")]
    InvalidRetryPolicy { step: String, message: String },

    #[error("Run exceeded {0} step transitions")]
    TransitionLimit(usize),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid arguments for {tool}: {message}")]
    Argument { tool: String, message: String },

    #[error("Could not parse output of {agent}: {message}")]
    OutputParse { agent: String, message: String },

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    /// Deterministic failure for the given input: retrying cannot help.
    #[error("Tool refused input: {tool}: {message}")]
    ToolRefused { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    // Approval errors
    #[error("Step '{step}' rejected: {reason}")]
    Rejected { step: String, reason: String },

    #[error("Stale approval for step '{received}' (pending: {pending:?})")]
    StaleApproval {
        pending: Option<String>,
        received: String,
    },

    // Run lifecycle errors
    #[error("Run {run_id} cannot be resumed from status {status}")]
    NotResumable { run_id: String, status: String },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run cancelled")]
    Cancelled,

    // Snapshot errors
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SopError {
    /// Classify this error for retry decisions and run reports.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::DuplicateResult(_) => FailureKind::DuplicateResult,
            Self::UnresolvedReference(_) | Self::ForwardReference { .. } => {
                FailureKind::UnresolvedReference
            }
            Self::ConditionResolution(_) => FailureKind::ConditionResolution,
            Self::ConditionSyntax { .. } => FailureKind::ConditionSyntax,
            Self::UnknownJumpTarget { .. } | Self::DuplicateStepId(_) => {
                FailureKind::UnknownJumpTarget
            }
            Self::TransitionLimit(_) => FailureKind::TransitionLimit,
            Self::ToolNotFound(_) => FailureKind::ToolNotFound,
            Self::Argument { .. } | Self::InvalidRetryPolicy { .. } => FailureKind::Argument,
            Self::OutputParse { .. } => FailureKind::OutputParse,
            Self::ToolExecution { .. } | Self::Io(_) => FailureKind::ToolIo,
            Self::ToolRefused { .. } => FailureKind::ToolRefused,
            Self::ToolTimeout { .. } => FailureKind::Timeout,
            Self::Rejected { .. } => FailureKind::Rejected,
            Self::Cancelled => FailureKind::Terminated,
            Self::StaleApproval { .. }
            | Self::NotResumable { .. }
            | Self::RunNotFound(_)
            | Self::Snapshot(_)
            | Self::Config(_)
            | Self::ConfigNotFound(_)
            | Self::Database(_)
            | Self::Json(_) => FailureKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, SopError>;

/// Failure classes recorded in run history and matched by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Tool reported an I/O or execution failure.
    ToolIo,
    /// Tool did not answer within its timeout.
    Timeout,
    /// Tool rejected its input (divide by zero, missing file).
    ToolRefused,
    Argument,
    OutputParse,
    ToolNotFound,
    UnresolvedReference,
    ConditionResolution,
    ConditionSyntax,
    UnknownJumpTarget,
    DuplicateResult,
    TransitionLimit,
    /// A human declined an approval-gated step.
    Rejected,
    Terminated,
    Internal,
}

impl FailureKind {
    /// Structural failures mean the SOP or a tool contract is broken.
    /// They are never retried and never routed through `on_failure`.
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            Self::ToolIo | Self::Timeout | Self::ToolRefused | Self::Rejected | Self::Terminated
        )
    }

    /// Kinds a retry policy is allowed to retry at all.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ToolIo | Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolIo => "tool_io",
            Self::Timeout => "timeout",
            Self::ToolRefused => "tool_refused",
            Self::Argument => "argument",
            Self::OutputParse => "output_parse",
            Self::ToolNotFound => "tool_not_found",
            Self::UnresolvedReference => "unresolved_reference",
            Self::ConditionResolution => "condition_resolution",
            Self::ConditionSyntax => "condition_syntax",
            Self::UnknownJumpTarget => "unknown_jump_target",
            Self::DuplicateResult => "duplicate_result",
            Self::TransitionLimit => "transition_limit",
            Self::Rejected => "rejected",
            Self::Terminated => "terminated",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        let e = SopError::ToolExecution {
            tool: "read_file".into(),
            message: "disk".into(),
        };
        assert_eq!(e.kind(), FailureKind::ToolIo);
        assert!(!e.kind().is_structural());

        let e = SopError::ToolTimeout {
            tool: "slow".into(),
            timeout_secs: 5,
        };
        assert_eq!(e.kind(), FailureKind::Timeout);
        assert!(e.kind().is_transient());
    }

    #[test]
    fn refused_input_is_routable_but_not_transient() {
        let e = SopError::ToolRefused {
            tool: "divide".into(),
            message: "division by zero".into(),
        };
        assert_eq!(e.kind(), FailureKind::ToolRefused);
        assert!(!e.kind().is_structural());
        assert!(!e.kind().is_transient());
    }

    #[test]
    fn classifies_structural_errors() {
        let e = SopError::Argument {
            tool: "add".into(),
            message: "missing b".into(),
        };
        assert!(e.kind().is_structural());
        assert!(SopError::UnresolvedReference("<x>".into())
            .kind()
            .is_structural());
        assert!(!SopError::Rejected {
            step: "s".into(),
            reason: "no".into()
        }
        .kind()
        .is_structural());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::OutputParse).unwrap();
        assert_eq!(json, "\"output_parse\"");
        let parsed: FailureKind = serde_json::from_str("\"tool_io\"").unwrap();
        assert_eq!(parsed, FailureKind::ToolIo);
    }
}
