//! Mock tools, scripted reasoners and SOP fixtures shared by tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use sopflow_core::error::{Result, SopError};
use sopflow_core::sop::{Sop, Step, ToolRef};
use sopflow_core::traits::{Reasoner, Tool};
use sopflow_core::types::{ParamSpec, ParamType, ToolContext};

pub type Args = Map<String, Value>;

/// Build an argument map from a `json!` object literal.
pub fn args(value: Value) -> Args {
    value.as_object().cloned().unwrap_or_default()
}

// ── Counting ────────────────────────────────────────────────────

/// Succeeds every time and counts calls. Accepts one optional `value`
/// argument, echoed back when present.
pub struct CountingTool {
    name: String,
    calls: Arc<AtomicU32>,
}

impl CountingTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

impl Tool for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Counts invocations"
    }

    fn signature(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::optional("value", ParamType::Any, Value::Null)]
    }

    fn execute(&self, args: Args, _ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(args.get("value").cloned().unwrap_or_else(|| json!(n)))
        })
    }
}

// ── Flaky ───────────────────────────────────────────────────────

/// Fails with a transient I/O error for the first `failures` calls, then
/// returns `"ok"`.
pub struct FlakyTool {
    name: String,
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl FlakyTool {
    pub fn new(name: impl Into<String>, failures: u32) -> Self {
        Self {
            name: name.into(),
            failures,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// A tool that never succeeds.
    pub fn always(name: impl Into<String>) -> Self {
        Self::new(name, u32::MAX)
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

impl Tool for FlakyTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Fails a fixed number of times"
    }

    fn signature(&self) -> Vec<ParamSpec> {
        vec![]
    }

    fn execute(&self, _args: Args, _ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(SopError::ToolExecution {
                    tool: self.name.clone(),
                    message: format!("simulated failure {}", n),
                });
            }
            Ok(json!("ok"))
        })
    }
}

// ── Slow ────────────────────────────────────────────────────────

/// Sleeps before answering. Pair with a short timeout to provoke `Timeout`.
pub struct SlowTool {
    name: String,
    delay: Duration,
}

impl SlowTool {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
        }
    }
}

impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Answers after a delay"
    }

    fn signature(&self) -> Vec<ParamSpec> {
        vec![]
    }

    fn execute(&self, _args: Args, _ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(json!("late"))
        })
    }
}

// ── Recording ───────────────────────────────────────────────────

/// Records the arguments of every call and returns them as an object.
/// Every declared parameter is optional and untyped.
pub struct RecordingTool {
    name: String,
    params: Vec<String>,
    calls: Arc<Mutex<Vec<Args>>>,
}

impl RecordingTool {
    pub fn new(name: impl Into<String>, params: &[&str]) -> Self {
        Self {
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<Args>>> {
        Arc::clone(&self.calls)
    }
}

impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Records its arguments"
    }

    fn signature(&self) -> Vec<ParamSpec> {
        self.params
            .iter()
            .map(|p| ParamSpec::optional(p.as_str(), ParamType::Any, Value::Null))
            .collect()
    }

    fn execute(&self, args: Args, _ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(args.clone());
            }
            Ok(Value::Object(args))
        })
    }
}

// ── Area ────────────────────────────────────────────────────────

/// `compute_area(w, h) -> w * h`, counting calls.
pub struct AreaTool {
    calls: Arc<AtomicU32>,
}

impl AreaTool {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

impl Default for AreaTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for AreaTool {
    fn name(&self) -> &str {
        "compute_area"
    }

    fn description(&self) -> &str {
        "Area of a w by h rectangle"
    }

    fn category(&self) -> &str {
        "math"
    }

    fn signature(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("w", ParamType::Number),
            ParamSpec::required("h", ParamType::Number),
        ]
    }

    fn execute(&self, args: Args, _ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let w = args.get("w").and_then(Value::as_f64).unwrap_or(0.0);
            let h = args.get("h").and_then(Value::as_f64).unwrap_or(0.0);
            let area = w * h;
            if area.fract() == 0.0 {
                Ok(json!(area as i64))
            } else {
                Ok(json!(area))
            }
        })
    }
}

// ── Reasoner ────────────────────────────────────────────────────

/// Replays canned answers in order and records each directive.
/// Fails with a tool error once the script runs out.
pub struct ScriptedReasoner {
    name: String,
    responses: Mutex<VecDeque<String>>,
    directives: Arc<Mutex<Vec<String>>>,
}

impl ScriptedReasoner {
    pub fn new(name: impl Into<String>, responses: Vec<String>) -> Self {
        Self {
            name: name.into(),
            responses: Mutex::new(responses.into()),
            directives: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn directives(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.directives)
    }
}

impl Reasoner for ScriptedReasoner {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted reasoner for tests"
    }

    fn reason(&self, directive: String, _args: Args, _ctx: ToolContext) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            if let Ok(mut seen) = self.directives.lock() {
                seen.push(directive);
            }
            let next = self
                .responses
                .lock()
                .ok()
                .and_then(|mut r| r.pop_front());
            next.ok_or_else(|| SopError::ToolExecution {
                tool: format!("agent:{}", self.name),
                message: "script exhausted".into(),
            })
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// `compute_area(w=3, h=4) -> area`, then an approval-gated
/// `save_file(content=<area>)`.
pub fn area_sop() -> Sop {
    Sop::new(vec![
        Step::new("compute", ToolRef::static_tool("compute_area"))
            .with_arg("w", json!(3))
            .with_arg("h", json!(4))
            .store_as("area"),
        Step::new("save", ToolRef::static_tool("save_file"))
            .with_arg("content", json!("<area>"))
            .requiring_approval(),
    ])
}

/// `n` independent steps on one tool, each storing `r{i}`.
pub fn linear_sop(tool: &str, n: usize) -> Sop {
    Sop::new(
        (1..=n)
            .map(|i| {
                Step::new(format!("s{}", i), ToolRef::static_tool(tool))
                    .store_as(format!("r{}", i))
            })
            .collect(),
    )
}
