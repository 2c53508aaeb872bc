use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, Result, SopError};

/// Routing target that ends the run successfully.
pub const END_TARGET: &str = "$end";

/// A validated Standard Operating Procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sop {
    /// Ordered steps; order defines default progression.
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Sop {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            task: None,
            final_target: None,
            created_at: Some(Utc::now()),
        }
    }

    /// Parse an SOP document from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Position of a step in SOP order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Id of the first step, if any.
    pub fn first_id(&self) -> Option<&str> {
        self.steps.first().map(|s| s.id.as_str())
    }

    /// Id of the step following `id` in SOP order.
    pub fn next_id(&self, id: &str) -> Option<&str> {
        let pos = self.position(id)?;
        self.steps.get(pos + 1).map(|s| s.id.as_str())
    }

    /// Every `store_result_as` name declared by some step. Only these names
    /// can appear as `<name>` references in arguments.
    pub fn result_names(&self) -> HashSet<&str> {
        self.steps
            .iter()
            .filter_map(|s| s.store_result_as.as_deref())
            .collect()
    }
}

/// What a step invokes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolRef {
    /// A registered deterministic tool.
    Static { name: String },
    /// A reasoning call handled by a named agent.
    Dynamic { agent: String, directive: String },
}

impl ToolRef {
    pub fn static_tool(name: impl Into<String>) -> Self {
        Self::Static { name: name.into() }
    }

    pub fn dynamic(agent: impl Into<String>, directive: impl Into<String>) -> Self {
        Self::Dynamic {
            agent: agent.into(),
            directive: directive.into(),
        }
    }

    /// Registry key: the tool name or the agent name.
    pub fn target(&self) -> &str {
        match self {
            Self::Static { name } => name,
            Self::Dynamic { agent, .. } => agent,
        }
    }
}

impl fmt::Display for ToolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static { name } => write!(f, "{}", name),
            Self::Dynamic { agent, directive } => write!(f, "{}: {}", agent, directive),
        }
    }
}

/// One step of an SOP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub tool_ref: ToolRef,
    /// Literal values or `<name>` reference expressions.
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_result_as: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
    /// Falls back to the engine's default policy when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub requires_approval: bool,
}

impl Step {
    pub fn new(id: impl Into<String>, tool_ref: ToolRef) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            tool_ref,
            args: serde_json::Map::new(),
            store_result_as: None,
            condition: None,
            on_success: None,
            on_failure: None,
            retry_policy: None,
            timeout_secs: None,
            requires_approval: false,
        }
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.args.insert(name.into(), value);
        self
    }

    pub fn store_as(mut self, name: impl Into<String>) -> Self {
        self.store_result_as = Some(name.into());
        self
    }

    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    pub fn on_success(mut self, target: impl Into<String>) -> Self {
        self.on_success = Some(target.into());
        self
    }

    pub fn on_failure(mut self, target: impl Into<String>) -> Self {
        self.on_failure = Some(target.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

/// Bounded retry policy for a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Failure kinds eligible for retry. Structural kinds are ignored here.
    #[serde(default = "default_retryable")]
    pub retryable: Vec<FailureKind>,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retryable() -> Vec<FailureKind> {
    vec![FailureKind::ToolIo, FailureKind::Timeout]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            retryable: default_retryable(),
        }
    }
}

impl RetryPolicy {
    /// A policy with `max_attempts` attempts and default backoff.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// `max_attempts` clamped to at least one.
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn should_retry(&self, kind: FailureKind) -> bool {
        kind.is_transient() && self.retryable.contains(&kind)
    }
}

/// Delay shape between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        #[serde(default)]
        delay_ms: u64,
    },
    Exponential {
        #[serde(default = "default_initial_backoff")]
        initial_ms: u64,
        #[serde(default = "default_max_backoff")]
        max_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_jitter")]
        jitter: bool,
    },
}

fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: default_initial_backoff(),
            max_ms: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl Backoff {
    pub fn none() -> Self {
        Self::Fixed { delay_ms: 0 }
    }

    pub fn fixed(delay_ms: u64) -> Self {
        Self::Fixed { delay_ms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_minimal_sop() {
        let sop = Sop::from_json(
            r#"{
                "steps": [
                    {"id": "a", "tool_ref": {"kind": "static", "name": "rectangle_area"},
                     "args": {"width": 3, "height": 4}, "store_result_as": "area"},
                    {"id": "b", "tool_ref": {"kind": "static", "name": "create_file"},
                     "args": {"filename": "out", "content": "<area>"},
                     "requires_approval": true}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(sop.steps.len(), 2);
        assert_eq!(sop.first_id(), Some("a"));
        assert_eq!(sop.next_id("a"), Some("b"));
        assert_eq!(sop.next_id("b"), None);
        assert_eq!(sop.steps[0].args["width"], json!(3));
        assert!(sop.steps[1].requires_approval);
        assert!(sop.steps[0].retry_policy.is_none());
    }

    #[test]
    fn parse_dynamic_tool_ref() {
        let r: ToolRef = serde_json::from_value(json!({
            "kind": "dynamic", "agent": "analyst", "directive": "summarize"
        }))
        .unwrap();
        assert_eq!(r.target(), "analyst");
        assert_eq!(r.to_string(), "analyst: summarize");
    }

    #[test]
    fn retry_policy_defaults() {
        let p: RetryPolicy = serde_json::from_value(json!({"max_attempts": 3})).unwrap();
        assert_eq!(p.max_attempts, 3);
        assert!(p.should_retry(FailureKind::ToolIo));
        assert!(p.should_retry(FailureKind::Timeout));
        assert!(!p.should_retry(FailureKind::Argument));
        assert!(matches!(p.backoff, Backoff::Exponential { initial_ms: 500, .. }));
    }

    #[test]
    fn structural_kinds_never_retryable() {
        let p = RetryPolicy {
            max_attempts: 5,
            backoff: Backoff::none(),
            retryable: vec![FailureKind::Argument, FailureKind::OutputParse],
        };
        assert!(!p.should_retry(FailureKind::Argument));
        assert!(!p.should_retry(FailureKind::OutputParse));
    }

    #[test]
    fn zero_attempts_clamped() {
        assert_eq!(RetryPolicy::attempts(0).effective_attempts(), 1);
    }

    #[test]
    fn fixed_backoff_serde() {
        let b: Backoff = serde_json::from_value(json!({"type": "fixed", "delay_ms": 250})).unwrap();
        assert_eq!(b, Backoff::fixed(250));
    }
}
