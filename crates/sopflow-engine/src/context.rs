//! Reference resolution against the execution context.
//!
//! A reference token is `<name>` optionally followed by a dot path:
//! `<area>`, `<file>.meta.path`, `<rows>.0.id`. A string that is exactly one
//! token resolves to the referenced value with its JSON type intact; tokens
//! inside longer strings are substituted as text.
//!
//! Only names some step declares with `store_result_as` are references.
//! Anything else in angle brackets (`<p>hello</p>`) is literal text.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use sopflow_core::error::{Result, SopError};
use sopflow_core::state::ExecutionContext;

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<([A-Za-z_][A-Za-z0-9_]*)>((?:\.[A-Za-z0-9_]+)*)").expect("valid regex")
    })
}

/// Walk a dot path into a JSON value. Numeric segments index arrays.
pub fn drill<'a, S: AsRef<str>>(value: &'a Value, path: &[S]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, seg| {
        let seg = seg.as_ref();
        match current {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    })
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

/// Value of one token. A dot path only drills into objects and arrays; after
/// a scalar it is literal text (`<name>.txt`), returned as the suffix.
fn lookup<'c>(ctx: &ExecutionContext, caps: &Captures<'c>) -> Result<(Value, &'c str)> {
    let name = &caps[1];
    let path = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let root = ctx
        .get(name)
        .ok_or_else(|| SopError::UnresolvedReference(caps[0].to_string()))?;
    if !(root.is_object() || root.is_array()) {
        return Ok((root.clone(), path));
    }
    drill(root, &split_path(path))
        .cloned()
        .map(|v| (v, ""))
        .ok_or_else(|| SopError::UnresolvedReference(caps[0].to_string()))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reference tokens in `s`, skipping angle-bracketed words that are not
/// declared result names.
fn tokens<'s>(s: &'s str, declared: &HashSet<&str>) -> Vec<Captures<'s>> {
    token_re()
        .captures_iter(s)
        .filter(|caps| declared.contains(&caps[1]))
        .collect()
}

fn resolve_str(s: &str, ctx: &ExecutionContext, declared: &HashSet<&str>) -> Result<Value> {
    let tokens = tokens(s, declared);
    let Some(first) = tokens.first() else {
        return Ok(Value::String(s.to_string()));
    };

    if tokens.len() == 1 && first.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len()) {
        let (value, suffix) = lookup(ctx, first)?;
        return Ok(if suffix.is_empty() {
            value
        } else {
            Value::String(format!("{}{}", render(&value), suffix))
        });
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in &tokens {
        let Some(m) = caps.get(0) else { continue };
        let (value, suffix) = lookup(ctx, caps)?;
        out.push_str(&s[last..m.start()]);
        out.push_str(&render(&value));
        out.push_str(suffix);
        last = m.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// Substitute every reference token in `value`, recursing into arrays and
/// objects. Non-string literals pass through. `declared` is the set of
/// result names the SOP declares.
pub fn resolve(value: &Value, ctx: &ExecutionContext, declared: &HashSet<&str>) -> Result<Value> {
    match value {
        Value::String(s) => resolve_str(s, ctx, declared),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve(v, ctx, declared))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => resolve_args(map, ctx, declared).map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Resolve a step's argument map.
pub fn resolve_args(
    args: &Map<String, Value>,
    ctx: &ExecutionContext,
    declared: &HashSet<&str>,
) -> Result<Map<String, Value>> {
    args.iter()
        .map(|(k, v)| Ok((k.clone(), resolve(v, ctx, declared)?)))
        .collect()
}

/// Declared result names referenced anywhere inside `value`, in order of
/// appearance.
pub fn references(value: &Value, declared: &HashSet<&str>) -> Vec<String> {
    let mut names = Vec::new();
    collect_references(value, declared, &mut names);
    names
}

fn collect_references(value: &Value, declared: &HashSet<&str>, names: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for caps in tokens(s, declared) {
                let name = caps[1].to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        Value::Array(items) => items
            .iter()
            .for_each(|v| collect_references(v, declared, names)),
        Value::Object(map) => map
            .values()
            .for_each(|v| collect_references(v, declared, names)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Result names the SOP under test declares. `missing` is declared but
    /// never written, as for a skipped step.
    fn declared() -> HashSet<&'static str> {
        ["area", "name", "file", "missing"].into_iter().collect()
    }

    fn res(value: Value) -> Result<Value> {
        resolve(&value, &ctx(), &declared())
    }

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.write("area", json!(12)).unwrap();
        ctx.write("name", json!("report")).unwrap();
        ctx.write(
            "file",
            json!({"meta": {"path": "/tmp/a.txt"}, "rows": [{"id": 7}]}),
        )
        .unwrap();
        ctx
    }

    #[test]
    fn whole_token_keeps_type() {
        assert_eq!(res(json!("<area>")).unwrap(), json!(12));
        assert_eq!(
            res(json!("<file>.meta")).unwrap(),
            json!({"path": "/tmp/a.txt"})
        );
    }

    #[test]
    fn dot_path_with_index() {
        assert_eq!(res(json!("<file>.rows.0.id")).unwrap(), json!(7));
    }

    #[test]
    fn embedded_tokens_are_textual() {
        assert_eq!(
            res(json!("Area of <name> is <area> m2")).unwrap(),
            json!("Area of report is 12 m2")
        );
    }

    #[test]
    fn recurses_into_containers() {
        let args = json!({"list": ["<area>", 3, {"p": "<file>.meta.path"}], "flag": true});
        assert_eq!(
            res(args).unwrap(),
            json!({"list": [12, 3, {"p": "/tmp/a.txt"}], "flag": true})
        );
    }

    #[test]
    fn unresolved_name_and_path() {
        let err = res(json!("<missing>")).unwrap_err();
        assert!(matches!(err, SopError::UnresolvedReference(ref t) if t == "<missing>"));

        let err = res(json!("<file>.meta.size")).unwrap_err();
        assert!(matches!(err, SopError::UnresolvedReference(_)));

        let err = res(json!("x <missing> y")).unwrap_err();
        assert!(matches!(err, SopError::UnresolvedReference(_)));
    }

    #[test]
    fn dot_after_scalar_is_text() {
        assert_eq!(res(json!("<name>.txt")).unwrap(), json!("report.txt"));
        assert_eq!(
            res(json!("saved <name>.txt now")).unwrap(),
            json!("saved report.txt now")
        );
    }

    #[test]
    fn plain_strings_untouched() {
        assert_eq!(res(json!("a < b > c")).unwrap(), json!("a < b > c"));
    }

    #[test]
    fn collects_reference_names() {
        let args = json!({"a": "<area>", "b": ["<file>.x", "<area> and <name>"]});
        let mut names = references(&args, &declared());
        names.sort();
        assert_eq!(names, vec!["area", "file", "name"]);
    }

    #[test]
    fn undeclared_angle_words_are_literal() {
        assert_eq!(res(json!("<p>hello</p>")).unwrap(), json!("<p>hello</p>"));
        assert_eq!(res(json!("<br>")).unwrap(), json!("<br>"));
        assert_eq!(
            res(json!("<p>Area: <area> m2</p>")).unwrap(),
            json!("<p>Area: 12 m2</p>")
        );
        assert!(references(&json!({"html": "<div><span>x</span></div>"}), &declared()).is_empty());
    }
}
