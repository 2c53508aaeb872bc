use serde_json::{Map, Value};

use sopflow_core::error::{Result, SopError};
use sopflow_core::types::ParamSpec;

/// Check resolved arguments against a static tool's declared signature.
///
/// Rejects unknown names, missing required parameters and values of the wrong
/// type. Omitted optional parameters receive their declared default. The
/// returned map is what the tool is invoked with.
pub fn validate_args(
    tool: &str,
    signature: &[ParamSpec],
    mut args: Map<String, Value>,
) -> Result<Map<String, Value>> {
    if let Some(unknown) = args
        .keys()
        .find(|k| !signature.iter().any(|p| &p.name == *k))
    {
        return Err(SopError::Argument {
            tool: tool.to_string(),
            message: format!("unexpected argument '{}'", unknown),
        });
    }

    for param in signature {
        match args.get(&param.name) {
            Some(value) => {
                if !param.ty.accepts(value) {
                    return Err(SopError::Argument {
                        tool: tool.to_string(),
                        message: format!(
                            "argument '{}' must be {}, got {}",
                            param.name,
                            param.ty,
                            json_type_name(value)
                        ),
                    });
                }
            }
            None if param.required => {
                return Err(SopError::Argument {
                    tool: tool.to_string(),
                    message: format!("missing required argument '{}'", param.name),
                });
            }
            None => {
                if let Some(default) = &param.default {
                    args.insert(param.name.clone(), default.clone());
                }
            }
        }
    }

    Ok(args)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sopflow_core::types::ParamType;

    fn sig() -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("width", ParamType::Number),
            ParamSpec::required("height", ParamType::Number),
            ParamSpec::optional("unit", ParamType::String, json!("m")),
        ]
    }

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn fills_defaults() {
        let out = validate_args("area", &sig(), map(json!({"width": 3, "height": 4}))).unwrap();
        assert_eq!(out["unit"], json!("m"));
        assert_eq!(out["width"], json!(3));
    }

    #[test]
    fn rejects_missing() {
        let err = validate_args("area", &sig(), map(json!({"width": 3}))).unwrap_err();
        assert!(err.to_string().contains("height"));
        assert!(err.kind().is_structural());
    }

    #[test]
    fn rejects_unknown() {
        let err = validate_args(
            "area",
            &sig(),
            map(json!({"width": 3, "height": 4, "depth": 1})),
        )
        .unwrap_err();
        assert!(err.to_string().contains("depth"));
    }

    #[test]
    fn rejects_wrong_type() {
        let err = validate_args("area", &sig(), map(json!({"width": "3", "height": 4})))
            .unwrap_err();
        assert!(matches!(err, SopError::Argument { .. }));
        assert!(err.to_string().contains("must be number"));
    }
}
