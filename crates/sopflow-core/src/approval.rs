use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::RunId;

/// Human verdict on an approval-gated step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approved,
    Rejected,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Decision event delivered by the HITL subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub step_id: String,
    pub verdict: Verdict,
    pub decided_by: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn approved(step_id: impl Into<String>, decided_by: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            verdict: Verdict::Approved,
            decided_by: decided_by.into(),
            timestamp: Utc::now(),
            reason: None,
        }
    }

    pub fn rejected(
        step_id: impl Into<String>,
        decided_by: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            verdict: Verdict::Rejected,
            decided_by: decided_by.into(),
            timestamp: Utc::now(),
            reason: Some(reason.into()),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.verdict == Verdict::Approved
    }
}

/// A step waiting for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: RunId,
    pub step_id: String,
    /// Display form of the tool reference (`name` or `agent: directive`).
    pub tool: String,
    /// Arguments as they will be passed to the tool.
    pub args: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub requested_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// One-line summary for approval prompts.
    pub fn summary(&self) -> String {
        let args = serde_json::to_string(&self.args).unwrap_or_default();
        let args = if args.len() > 120 {
            format!("{}...", truncate_at_char_boundary(&args, 120))
        } else {
            args
        };
        format!("[{}] {} {}", self.step_id, self.tool, args)
    }
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_constructors() {
        let d = ApprovalDecision::approved("save", "alice");
        assert!(d.is_approved());
        assert!(d.reason.is_none());

        let d = ApprovalDecision::rejected("save", "bob", "wrong file");
        assert!(!d.is_approved());
        assert_eq!(d.reason.as_deref(), Some("wrong file"));
    }

    #[test]
    fn summary_truncates_long_args() {
        let mut args = serde_json::Map::new();
        args.insert("content".into(), serde_json::json!("x".repeat(500)));
        let req = ApprovalRequest {
            run_id: RunId::from_str("r1"),
            step_id: "save".into(),
            tool: "save_file".into(),
            args,
            description: None,
            requested_at: Utc::now(),
        };
        let s = req.summary();
        assert!(s.starts_with("[save] save_file "));
        assert!(s.ends_with("..."));
        assert!(s.len() < 200);
    }

    #[test]
    fn verdict_serde() {
        assert_eq!(
            serde_json::to_string(&Verdict::Rejected).unwrap(),
            "\"rejected\""
        );
    }
}
