use std::collections::HashSet;

use sopflow_core::error::{Result, SopError};
use sopflow_core::sop::{Sop, END_TARGET};
use sopflow_tools::ToolRegistry;

use crate::condition;
use crate::context;

/// Structural checks run before a run is created.
///
/// Step ids and result names must be unique and routing targets must exist.
/// Conditions must parse, retry policies allow at least one attempt, and every
/// tool must be registered. Arguments and conditions may only read results of
/// steps that come earlier in SOP order.
pub fn validate(sop: &Sop, registry: &ToolRegistry) -> Result<()> {
    let mut ids = HashSet::new();
    for step in &sop.steps {
        if step.id == END_TARGET || !ids.insert(step.id.as_str()) {
            return Err(SopError::DuplicateStepId(step.id.clone()));
        }
    }

    let declared = sop.result_names();
    let mut produced: HashSet<&str> = HashSet::new();
    for step in &sop.steps {
        for target in [&step.on_success, &step.on_failure].into_iter().flatten() {
            if target != END_TARGET && !ids.contains(target.as_str()) {
                return Err(SopError::UnknownJumpTarget {
                    step: step.id.clone(),
                    target: target.clone(),
                });
            }
        }

        if step.retry_policy.as_ref().is_some_and(|p| p.max_attempts == 0) {
            return Err(SopError::InvalidRetryPolicy {
                step: step.id.clone(),
                message: "max_attempts must be at least 1".into(),
            });
        }

        if !registry.contains(&step.tool_ref) {
            return Err(SopError::ToolNotFound(step.tool_ref.target().to_string()));
        }

        let mut reads =
            context::references(&serde_json::Value::Object(step.args.clone()), &declared);
        if let Some(expr) = step.condition.as_deref().filter(|c| !c.trim().is_empty()) {
            reads.extend(condition::parse(expr)?.references());
        }
        if let Some(name) = reads.iter().find(|n| !produced.contains(n.as_str())) {
            return Err(SopError::ForwardReference {
                step: step.id.clone(),
                name: name.clone(),
            });
        }

        if let Some(name) = &step.store_result_as {
            if !produced.insert(name.as_str()) {
                return Err(SopError::DuplicateResult(name.clone()));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sopflow_core::sop::{RetryPolicy, Step, ToolRef};

    fn registry() -> ToolRegistry {
        ToolRegistry::with_builtins()
    }

    fn area() -> Step {
        Step::new("area", ToolRef::static_tool("rectangle_area"))
            .with_arg("width", json!(3))
            .with_arg("height", json!(4))
            .store_as("area")
    }

    #[test]
    fn accepts_valid_sop() {
        let sop = Sop::new(vec![
            area(),
            Step::new("save", ToolRef::static_tool("create_file"))
                .with_arg("filename", json!("area"))
                .with_arg("content", json!("Area: <area>"))
                .with_condition("area > 0")
                .on_success(END_TARGET),
        ]);
        validate(&sop, &registry()).unwrap();
    }

    #[test]
    fn rejects_duplicate_ids() {
        let sop = Sop::new(vec![area(), Step::new("area", ToolRef::static_tool("add"))]);
        assert!(matches!(
            validate(&sop, &registry()),
            Err(SopError::DuplicateStepId(_))
        ));
    }

    #[test]
    fn rejects_unknown_jump_target() {
        let sop = Sop::new(vec![area().on_failure("nowhere")]);
        let err = validate(&sop, &registry()).unwrap_err();
        assert!(matches!(err, SopError::UnknownJumpTarget { ref target, .. } if target == "nowhere"));
    }

    #[test]
    fn rejects_forward_reference() {
        let sop = Sop::new(vec![
            Step::new("first", ToolRef::static_tool("square")).with_arg("x", json!("<area>")),
            area(),
        ]);
        let err = validate(&sop, &registry()).unwrap_err();
        assert!(matches!(err, SopError::ForwardReference { ref name, .. } if name == "area"));
    }

    #[test]
    fn rejects_forward_reference_in_condition() {
        let sop = Sop::new(vec![
            Step::new("first", ToolRef::static_tool("square"))
                .with_arg("x", json!(2))
                .with_condition("area > 1"),
            area(),
        ]);
        assert!(matches!(
            validate(&sop, &registry()),
            Err(SopError::ForwardReference { .. })
        ));
    }

    #[test]
    fn rejects_self_reference() {
        let sop = Sop::new(vec![area().with_arg("height", json!("<area>"))]);
        assert!(matches!(
            validate(&sop, &registry()),
            Err(SopError::ForwardReference { .. })
        ));
    }

    #[test]
    fn rejects_bad_condition_syntax() {
        let sop = Sop::new(vec![area(), area_consumer().with_condition("area >")]);
        assert!(matches!(
            validate(&sop, &registry()),
            Err(SopError::ConditionSyntax { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_result_name() {
        let sop = Sop::new(vec![area(), area_consumer().store_as("area")]);
        assert!(matches!(
            validate(&sop, &registry()),
            Err(SopError::DuplicateResult(_))
        ));
    }

    #[test]
    fn rejects_unknown_tool() {
        let sop = Sop::new(vec![Step::new("x", ToolRef::static_tool("teleport"))]);
        assert!(matches!(
            validate(&sop, &registry()),
            Err(SopError::ToolNotFound(_))
        ));
    }

    #[test]
    fn html_content_is_not_a_reference() {
        let sop = Sop::new(vec![
            area(),
            Step::new("write", ToolRef::static_tool("create_file"))
                .with_arg("filename", json!("page.html"))
                .with_arg("content", json!("<p>hello</p><p>Area: <area></p>")),
        ]);
        validate(&sop, &registry()).unwrap();
    }

    #[test]
    fn rejects_zero_attempts() {
        let sop = Sop::new(vec![area().with_retry(RetryPolicy::attempts(0))]);
        let err = validate(&sop, &registry()).unwrap_err();
        assert!(matches!(err, SopError::InvalidRetryPolicy { ref step, .. } if step == "area"));
    }

    fn area_consumer() -> Step {
        Step::new("double", ToolRef::static_tool("multiply"))
            .with_arg("a", json!("<area>"))
            .with_arg("b", json!(2))
    }
}
