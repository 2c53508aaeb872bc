use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use sopflow_core::error::{Result, SopError};
use sopflow_core::sop::ToolRef;
use sopflow_core::types::ToolContext;

use crate::registry::{ToolDescriptor, ToolRegistry};

/// Uniform call contract over static tools and reasoners.
///
/// Shared by every run; holds no per-run state.
pub struct ToolAdapter {
    registry: Arc<ToolRegistry>,
    default_timeout_secs: u64,
}

impl ToolAdapter {
    pub fn new(registry: Arc<ToolRegistry>, default_timeout_secs: u64) -> Self {
        Self {
            registry,
            default_timeout_secs,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn lookup(&self, tool_ref: &ToolRef) -> Result<ToolDescriptor> {
        self.registry.lookup(tool_ref)
    }

    /// Effective timeout: step override, else the tool's own, else the default.
    pub fn timeout_for(&self, descriptor: &ToolDescriptor, step_override: Option<u64>) -> u64 {
        step_override
            .or(descriptor.timeout_secs)
            .unwrap_or(self.default_timeout_secs)
    }

    /// Invoke `tool_ref` once with already-resolved arguments.
    pub async fn invoke(
        &self,
        tool_ref: &ToolRef,
        args: Map<String, Value>,
        ctx: ToolContext,
        step_timeout: Option<u64>,
    ) -> Result<Value> {
        let descriptor = self.lookup(tool_ref)?;
        let timeout_secs = self.timeout_for(&descriptor, step_timeout);
        let start = Instant::now();

        debug!(
            tool = %tool_ref,
            step_id = %ctx.step_id,
            timeout_secs,
            "Invoking tool"
        );

        let result = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            descriptor.invoke(args, ctx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SopError::ToolTimeout {
                tool: descriptor.name.clone(),
                timeout_secs,
            }),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(tool = %tool_ref, elapsed_ms, "Tool returned"),
            Err(e) => warn!(tool = %tool_ref, elapsed_ms, kind = %e.kind(), error = %e, "Tool failed"),
        }
        result
    }
}
