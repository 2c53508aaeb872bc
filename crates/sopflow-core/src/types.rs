use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::{ApprovalRequest, Verdict};
use crate::error::FailureKind;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    PausedForApproval,
    Succeeded,
    Failed,
    Terminated,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::PausedForApproval => "paused_for_approval",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused_for_approval" | "paused" => Ok(Self::PausedForApproval),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Outcome of one visit to a step, as recorded in run history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Skipped,
    Failed,
    Rejected,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Declared type of a static tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Any,
    String,
    Number,
    Integer,
    Bool,
    Array,
    Object,
}

impl ParamType {
    /// Whether a JSON value satisfies this declared type.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
                }
                _ => false,
            },
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Bool => "bool",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parameter in a static tool's declared signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn default_required() -> bool {
    true
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            default: None,
            description: String::new(),
        }
    }

    /// An optional parameter. `default` is filled in when the caller omits it;
    /// `Null` means the tool receives no value at all.
    pub fn optional(name: impl Into<String>, ty: ParamType, default: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: if default.is_null() { None } else { Some(default) },
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub step_id: String,
    pub working_dir: PathBuf,
}

impl ToolContext {
    pub fn new(run_id: RunId, step_id: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            working_dir,
        }
    }
}

/// Lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Run created and started.
    RunStarted { run_id: RunId, steps: usize },
    /// A step is about to be attempted.
    StepStarted {
        run_id: RunId,
        step_id: String,
        tool: String,
    },
    /// A step's condition evaluated false.
    StepSkipped { run_id: RunId, step_id: String },
    /// A single attempt failed (the step may still be retried).
    AttemptFailed {
        run_id: RunId,
        step_id: String,
        attempt: u32,
        kind: FailureKind,
        message: String,
    },
    StepSucceeded {
        run_id: RunId,
        step_id: String,
        attempts: u32,
    },
    StepFailed {
        run_id: RunId,
        step_id: String,
        kind: FailureKind,
        attempts: u32,
    },
    /// Run paused waiting for a human decision.
    ApprovalRequested { request: ApprovalRequest },
    /// A decision was accepted for the pending step.
    ApprovalResolved {
        run_id: RunId,
        step_id: String,
        verdict: Verdict,
    },
    /// A decision did not match the pending step and was ignored.
    StaleApproval {
        run_id: RunId,
        step_id: String,
    },
    /// Run reached a terminal status.
    RunFinished { run_id: RunId, status: RunStatus },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepSkipped { run_id, .. }
            | Self::AttemptFailed { run_id, .. }
            | Self::StepSucceeded { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::ApprovalResolved { run_id, .. }
            | Self::StaleApproval { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
            Self::ApprovalRequested { request } => &request.run_id,
        }
    }
}
