use futures::future::BoxFuture;
use serde_json::{Map, Value};

use sopflow_core::error::{Result, SopError};
use sopflow_core::traits::Tool;
use sopflow_core::types::{ParamSpec, ParamType, ToolContext};

const CATEGORY: &str = "math";

type BinaryOp = fn(f64, f64) -> std::result::Result<f64, String>;
type UnaryOp = fn(f64) -> std::result::Result<f64, String>;

/// Whole results come back as JSON integers so `<area> == 12` holds.
pub fn number(value: f64) -> Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0; // 2^53
    if value.fract() == 0.0 && value.abs() < MAX_EXACT {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn arg(tool: &str, args: &Map<String, Value>, name: &str) -> Result<f64> {
    args.get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| SopError::Argument {
            tool: tool.to_string(),
            message: format!("'{}' must be a number", name),
        })
}

fn finish(tool: &str, result: std::result::Result<f64, String>) -> Result<Value> {
    match result {
        Ok(v) if v.is_finite() => Ok(number(v)),
        Ok(_) => Err(SopError::ToolRefused {
            tool: tool.to_string(),
            message: "result is not a finite number".to_string(),
        }),
        Err(message) => Err(SopError::ToolRefused {
            tool: tool.to_string(),
            message,
        }),
    }
}

// ── BinaryMathTool ──────────────────────────────────────────────

/// A math tool of two numeric parameters.
pub struct BinaryMathTool {
    name: &'static str,
    description: &'static str,
    params: [&'static str; 2],
    op: BinaryOp,
}

impl Tool for BinaryMathTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        self.description
    }
    fn category(&self) -> &str {
        CATEGORY
    }
    fn signature(&self) -> Vec<ParamSpec> {
        self.params
            .iter()
            .map(|p| ParamSpec::required(*p, ParamType::Number))
            .collect()
    }
    fn execute(&self, args: Map<String, Value>, _ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let lhs = arg(self.name, &args, self.params[0])?;
            let rhs = arg(self.name, &args, self.params[1])?;
            finish(self.name, (self.op)(lhs, rhs))
        })
    }
}

pub fn binary_tools() -> Vec<BinaryMathTool> {
    vec![
        BinaryMathTool {
            name: "add",
            description: "Add two numbers.",
            params: ["a", "b"],
            op: |a, b| Ok(a + b),
        },
        BinaryMathTool {
            name: "subtract",
            description: "Subtract b from a.",
            params: ["a", "b"],
            op: |a, b| Ok(a - b),
        },
        BinaryMathTool {
            name: "multiply",
            description: "Multiply two numbers.",
            params: ["a", "b"],
            op: |a, b| Ok(a * b),
        },
        BinaryMathTool {
            name: "divide",
            description: "Divide a by b.",
            params: ["a", "b"],
            op: |a, b| {
                if b == 0.0 {
                    Err("division by zero".to_string())
                } else {
                    Ok(a / b)
                }
            },
        },
        BinaryMathTool {
            name: "rectangle_area",
            description: "Area of a rectangle.",
            params: ["width", "height"],
            op: |w, h| {
                if w < 0.0 || h < 0.0 {
                    Err("dimensions must be non-negative".to_string())
                } else {
                    Ok(w * h)
                }
            },
        },
    ]
}

// ── UnaryMathTool ───────────────────────────────────────────────

/// A math tool of one numeric parameter.
pub struct UnaryMathTool {
    name: &'static str,
    description: &'static str,
    param: &'static str,
    op: UnaryOp,
}

impl Tool for UnaryMathTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        self.description
    }
    fn category(&self) -> &str {
        CATEGORY
    }
    fn signature(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::required(self.param, ParamType::Number)]
    }
    fn execute(&self, args: Map<String, Value>, _ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let x = arg(self.name, &args, self.param)?;
            finish(self.name, (self.op)(x))
        })
    }
}

pub fn unary_tools() -> Vec<UnaryMathTool> {
    vec![
        UnaryMathTool {
            name: "square",
            description: "Square a number.",
            param: "x",
            op: |x| Ok(x * x),
        },
        UnaryMathTool {
            name: "square_root",
            description: "Square root of a non-negative number.",
            param: "x",
            op: |x| {
                if x < 0.0 {
                    Err(format!("cannot take square root of {}", x))
                } else {
                    Ok(x.sqrt())
                }
            },
        },
        UnaryMathTool {
            name: "circle_area",
            description: "Area of a circle.",
            param: "radius",
            op: |r| {
                if r < 0.0 {
                    Err("radius must be non-negative".to_string())
                } else {
                    Ok(std::f64::consts::PI * r * r)
                }
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sopflow_core::types::RunId;

    fn find_binary(name: &str) -> BinaryMathTool {
        binary_tools().into_iter().find(|t| t.name == name).unwrap()
    }

    fn find_unary(name: &str) -> UnaryMathTool {
        unary_tools().into_iter().find(|t| t.name == name).unwrap()
    }

    fn ctx() -> ToolContext {
        ToolContext::new(RunId::new(), "m", std::env::temp_dir())
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn whole_numbers_become_integers() {
        assert_eq!(number(12.0), json!(12));
        assert!(number(12.0).is_i64());
        assert_eq!(number(2.5), json!(2.5));
    }

    #[tokio::test]
    async fn rectangle_area() {
        let out = find_binary("rectangle_area")
            .execute(args(json!({"width": 3, "height": 4})), ctx())
            .await
            .unwrap();
        assert_eq!(out, json!(12));
    }

    #[tokio::test]
    async fn divide_by_zero_is_tool_error() {
        let err = find_binary("divide")
            .execute(args(json!({"a": 1, "b": 0})), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, SopError::ToolRefused { .. }));
        assert!(!err.kind().is_transient());
        assert!(err.to_string().contains("division by zero"));
    }

    #[tokio::test]
    async fn square_root_of_negative_fails() {
        let tool = find_unary("square_root");
        assert_eq!(
            tool.execute(args(json!({"x": 16})), ctx()).await.unwrap(),
            json!(4)
        );
        assert!(tool.execute(args(json!({"x": -1})), ctx()).await.is_err());
    }

    #[tokio::test]
    async fn circle_area_is_fractional() {
        let out = find_unary("circle_area")
            .execute(args(json!({"radius": 1})), ctx())
            .await
            .unwrap();
        let v = out.as_f64().unwrap();
        assert!((v - std::f64::consts::PI).abs() < 1e-12);
    }
}
