//! Step guard expressions.
//!
//! A small closed grammar: boolean connectives (`&&`/`and`, `||`/`or`,
//! `!`/`not`), comparisons (`== != < <= > >= in`, `not in`, `contains`),
//! JSON literals and dot paths into the execution context. Nothing is ever
//! evaluated as code.

use std::cmp::Ordering;

use serde_json::Value;

use sopflow_core::error::{Result, SopError};
use sopflow_core::state::ExecutionContext;

use crate::context::drill;

pub const MAX_CONDITION_LEN: usize = 4096;
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        lhs: Operand,
        op: CmpOp,
        rhs: Operand,
    },
    /// Bare operand, evaluated by JSON truthiness.
    Truthy(Operand),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    /// Root context name followed by drill segments.
    Path(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Contains,
}

impl CmpOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Contains => "contains",
        }
    }
}

/// Evaluate an optional guard. No condition (or a blank one) means "run".
pub fn evaluate(condition: Option<&str>, ctx: &ExecutionContext) -> Result<bool> {
    match condition.map(str::trim) {
        None | Some("") => Ok(true),
        Some(expr) => parse(expr)?.eval(ctx),
    }
}

/// Parse an expression, reporting problems as `ConditionSyntax`.
pub fn parse(expr: &str) -> Result<Expr> {
    let syntax = |message: String| SopError::ConditionSyntax {
        expr: expr.to_string(),
        message,
    };

    if expr.len() > MAX_CONDITION_LEN {
        return Err(syntax(format!(
            "expression is {} bytes, limit is {}",
            expr.len(),
            MAX_CONDITION_LEN
        )));
    }

    let tokens = lex(expr).map_err(syntax)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let ast = parser.expr().map_err(syntax)?;
    if let Some(tok) = parser.peek() {
        return Err(syntax(format!("unexpected {} after expression", tok.describe())));
    }
    Ok(ast)
}

impl Expr {
    pub fn eval(&self, ctx: &ExecutionContext) -> Result<bool> {
        match self {
            Self::Or(a, b) => Ok(a.eval(ctx)? || b.eval(ctx)?),
            Self::And(a, b) => Ok(a.eval(ctx)? && b.eval(ctx)?),
            Self::Not(e) => Ok(!e.eval(ctx)?),
            Self::Truthy(op) => Ok(truthy(&op.value(ctx)?)),
            Self::Compare { lhs, op, rhs } => compare(&lhs.value(ctx)?, *op, &rhs.value(ctx)?),
        }
    }

    /// Root context names this expression reads.
    pub fn references(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect(&self, out: &mut Vec<String>) {
        fn push(op: &Operand, out: &mut Vec<String>) {
            if let Operand::Path(segs) = op {
                if let Some(root) = segs.first() {
                    if !out.contains(root) {
                        out.push(root.clone());
                    }
                }
            }
        }
        match self {
            Self::Or(a, b) | Self::And(a, b) => {
                a.collect(out);
                b.collect(out);
            }
            Self::Not(e) => e.collect(out),
            Self::Truthy(op) => push(op, out),
            Self::Compare { lhs, rhs, .. } => {
                push(lhs, out);
                push(rhs, out);
            }
        }
    }
}

impl Operand {
    fn value(&self, ctx: &ExecutionContext) -> Result<Value> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Path(segs) => {
                let (root, rest) = segs
                    .split_first()
                    .ok_or_else(|| SopError::ConditionResolution("empty path".into()))?;
                let value = ctx.get(root).ok_or_else(|| {
                    SopError::ConditionResolution(format!("'{}' is not in the context", root))
                })?;
                // A missing field inside a present result reads as null.
                Ok(drill(value, rest).cloned().unwrap_or(Value::Null))
            }
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// JSON equality with `3 == 3.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, l)| y.get(k).is_some_and(|r| values_equal(l, r)))
        }
        _ => a == b,
    }
}

fn ordering(a: &Value, b: &Value, op: CmpOp) -> Result<Ordering> {
    let ord = match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    };
    ord.ok_or_else(|| {
        SopError::ConditionResolution(format!("cannot apply '{}' to {} and {}", op.as_str(), a, b))
    })
}

fn membership(needle: &Value, haystack: &Value) -> Result<bool> {
    match (needle, haystack) {
        (_, Value::Array(items)) => Ok(items.iter().any(|i| values_equal(needle, i))),
        (Value::String(key), Value::Object(map)) => Ok(map.contains_key(key)),
        (Value::String(sub), Value::String(s)) => Ok(s.contains(sub.as_str())),
        _ => Err(SopError::ConditionResolution(format!(
            "cannot test membership of {} in {}",
            needle, haystack
        ))),
    }
}

fn compare(lhs: &Value, op: CmpOp, rhs: &Value) -> Result<bool> {
    Ok(match op {
        CmpOp::Eq => values_equal(lhs, rhs),
        CmpOp::Ne => !values_equal(lhs, rhs),
        CmpOp::Lt => ordering(lhs, rhs, op)? == Ordering::Less,
        CmpOp::Le => ordering(lhs, rhs, op)? != Ordering::Greater,
        CmpOp::Gt => ordering(lhs, rhs, op)? == Ordering::Greater,
        CmpOp::Ge => ordering(lhs, rhs, op)? != Ordering::Less,
        CmpOp::In => membership(lhs, rhs)?,
        CmpOp::NotIn => !membership(lhs, rhs)?,
        CmpOp::Contains => membership(rhs, lhs)?,
    })
}

// ── Lexer ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Cmp(CmpOp),
    AndAnd,
    OrOr,
    Bang,
    Num(Value),
    Str(String),
    Word(String),
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Self::LParen => "'('".into(),
            Self::RParen => "')'".into(),
            Self::LBracket => "'['".into(),
            Self::RBracket => "']'".into(),
            Self::Comma => "','".into(),
            Self::Cmp(op) => format!("'{}'", op.as_str()),
            Self::AndAnd => "'&&'".into(),
            Self::OrOr => "'||'".into(),
            Self::Bang => "'!'".into(),
            Self::Num(n) => format!("number {}", n),
            Self::Str(s) => format!("string {:?}", s),
            Self::Word(w) => format!("'{}'", w),
        }
    }
}

fn lex(input: &str) -> std::result::Result<Vec<Tok>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Tok::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Tok::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Tok::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Tok::Comma);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Tok::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Tok::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Tok::Bang);
                i += 1;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    (_, true) => CmpOp::Ge,
                    (_, false) => CmpOp::Gt,
                };
                tokens.push(Tok::Cmp(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '&' if next == Some('&') => {
                tokens.push(Tok::AndAnd);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Tok::OrOr);
                i += 2;
            }
            '"' | '\'' => {
                let (s, end) = lex_string(&chars, i)?;
                tokens.push(Tok::Str(s));
                i = end;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || matches!(chars[i], '.' | 'e' | 'E')
                        || (matches!(chars[i], '+' | '-') && matches!(chars[i - 1], 'e' | 'E')))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Tok::Num(parse_number(&text)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Tok::Word(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}' at offset {}", other, i)),
        }
    }
    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize) -> std::result::Result<(String, usize), String> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                out.push(match chars[i + 1] {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(format!("unterminated string starting at offset {}", start))
}

fn parse_number(text: &str) -> std::result::Result<Value, String> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| format!("invalid number '{}'", text))
}

// ── Parser ──────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
    depth: usize,
}

type PResult<T> = std::result::Result<T, String>;

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn peek_word(&self, offset: usize) -> Option<&str> {
        match self.tokens.get(self.pos + offset) {
            Some(Tok::Word(w)) => Some(w.as_str()),
            _ => None,
        }
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, want: Tok) -> PResult<()> {
        match self.next() {
            Some(ref t) if *t == want => Ok(()),
            Some(t) => Err(format!("expected {}, found {}", want.describe(), t.describe())),
            None => Err(format!("expected {}, found end of input", want.describe())),
        }
    }

    fn enter(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(format!("nesting deeper than {}", MAX_DEPTH));
        }
        Ok(())
    }

    fn expr(&mut self) -> PResult<Expr> {
        self.enter()?;
        let mut lhs = self.and()?;
        while matches!(self.peek(), Some(Tok::OrOr)) || self.peek_word(0) == Some("or") {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        self.depth -= 1;
        Ok(lhs)
    }

    fn and(&mut self) -> PResult<Expr> {
        let mut lhs = self.unary()?;
        while matches!(self.peek(), Some(Tok::AndAnd)) || self.peek_word(0) == Some("and") {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> PResult<Expr> {
        if matches!(self.peek(), Some(Tok::Bang)) || self.peek_word(0) == Some("not") {
            self.pos += 1;
            self.enter()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> PResult<Expr> {
        if matches!(self.peek(), Some(Tok::LParen)) {
            self.pos += 1;
            let inner = self.expr()?;
            self.expect(Tok::RParen)?;
            return Ok(inner);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let lhs = self.operand()?;
        let op = match self.peek() {
            Some(Tok::Cmp(op)) => Some(*op),
            _ => match (self.peek_word(0), self.peek_word(1)) {
                (Some("in"), _) => Some(CmpOp::In),
                (Some("contains"), _) => Some(CmpOp::Contains),
                (Some("not"), Some("in")) => Some(CmpOp::NotIn),
                _ => None,
            },
        };
        let Some(op) = op else {
            return Ok(Expr::Truthy(lhs));
        };
        self.pos += if op == CmpOp::NotIn { 2 } else { 1 };
        let rhs = self.operand()?;
        Ok(Expr::Compare { lhs, op, rhs })
    }

    fn operand(&mut self) -> PResult<Operand> {
        match self.next() {
            Some(Tok::Num(n)) => Ok(Operand::Literal(n)),
            Some(Tok::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Tok::LBracket) => self.list().map(Operand::Literal),
            Some(Tok::Word(w)) => word_operand(&w),
            Some(t) => Err(format!("expected a value, found {}", t.describe())),
            None => Err("expected a value, found end of input".into()),
        }
    }

    fn list(&mut self) -> PResult<Value> {
        let mut items = Vec::new();
        if matches!(self.peek(), Some(Tok::RBracket)) {
            self.pos += 1;
            return Ok(Value::Array(items));
        }
        loop {
            match self.operand()? {
                Operand::Literal(v) => items.push(v),
                Operand::Path(p) => {
                    return Err(format!("list items must be literals, found '{}'", p.join(".")))
                }
            }
            match self.next() {
                Some(Tok::Comma) => continue,
                Some(Tok::RBracket) => return Ok(Value::Array(items)),
                Some(t) => return Err(format!("expected ',' or ']', found {}", t.describe())),
                None => return Err("unterminated list".into()),
            }
        }
    }
}

fn word_operand(word: &str) -> PResult<Operand> {
    match word {
        "true" => return Ok(Operand::Literal(Value::Bool(true))),
        "false" => return Ok(Operand::Literal(Value::Bool(false))),
        "null" => return Ok(Operand::Literal(Value::Null)),
        "and" | "or" | "not" | "in" | "contains" => {
            return Err(format!("unexpected keyword '{}'", word))
        }
        _ => {}
    }
    let segs: Vec<String> = word.split('.').map(String::from).collect();
    if segs.iter().any(|s| s.is_empty()) {
        return Err(format!("malformed path '{}'", word));
    }
    Ok(Operand::Path(segs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.write("area", json!(12)).unwrap();
        ctx.write("status", json!("ok")).unwrap();
        ctx.write("tags", json!(["draft", "urgent"])).unwrap();
        ctx.write("file", json!({"exists": true, "meta": {"size": 0}}))
            .unwrap();
        ctx.write("empty", json!("")).unwrap();
        ctx
    }

    fn eval(expr: &str) -> bool {
        evaluate(Some(expr), &ctx()).unwrap()
    }

    #[test]
    fn absent_condition_is_true() {
        assert!(evaluate(None, &ctx()).unwrap());
        assert!(evaluate(Some("   "), &ctx()).unwrap());
    }

    #[test]
    fn comparisons() {
        assert!(eval("area == 12"));
        assert!(eval("area == 12.0"));
        assert!(eval("area > 10 && area <= 12"));
        assert!(!eval("area < 12"));
        assert!(eval("status == 'ok'"));
        assert!(eval("status != \"failed\""));
        assert!(eval("status >= 'a'"));
    }

    #[test]
    fn boolean_connectives() {
        assert!(eval("area > 100 or status == 'ok'"));
        assert!(!eval("area > 100 || !file.exists"));
        assert!(eval("not (area > 100) and file.exists"));
        assert!(eval("!!file.exists"));
    }

    #[test]
    fn membership() {
        assert!(eval("'urgent' in tags"));
        assert!(eval("'draft' not in ['final']"));
        assert!(eval("tags contains 'draft'"));
        assert!(eval("'meta' in file"));
        assert!(eval("status in 'looks ok'"));
        assert!(eval("area in [1, 12.0]"));
    }

    #[test]
    fn truthiness() {
        assert!(eval("file.exists"));
        assert!(!eval("empty"));
        assert!(!eval("file.meta.size"));
        assert!(!eval("file.missing"));
        assert!(eval("tags"));
    }

    #[test]
    fn missing_root_is_resolution_error() {
        let err = evaluate(Some("nothing == 1"), &ctx()).unwrap_err();
        assert!(matches!(err, SopError::ConditionResolution(_)));
        assert!(err.kind().is_structural());
    }

    #[test]
    fn incomparable_ordering_is_resolution_error() {
        let err = evaluate(Some("status > 3"), &ctx()).unwrap_err();
        assert!(matches!(err, SopError::ConditionResolution(_)));
    }

    #[test]
    fn syntax_errors() {
        for bad in [
            "area ==",
            "(area == 1",
            "area == 1 )",
            "'unterminated",
            "area = 1",
            "a..b",
            "[area] == 1",
            "area ~ 1",
        ] {
            let err = parse(bad).unwrap_err();
            assert!(
                matches!(err, SopError::ConditionSyntax { .. }),
                "expected syntax error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn limits_enforced() {
        let long = format!("area == {}", "1".repeat(MAX_CONDITION_LEN));
        assert!(matches!(parse(&long), Err(SopError::ConditionSyntax { .. })));

        let deep = format!("{}area{}", "(".repeat(MAX_DEPTH + 1), ")".repeat(MAX_DEPTH + 1));
        assert!(matches!(parse(&deep), Err(SopError::ConditionSyntax { .. })));

        let nots = format!("{}area", "!".repeat(MAX_DEPTH + 1));
        assert!(matches!(parse(&nots), Err(SopError::ConditionSyntax { .. })));

        let ok = format!("{}area{}", "(".repeat(10), ")".repeat(10));
        assert!(parse(&ok).is_ok());
    }

    #[test]
    fn collects_references() {
        let expr = parse("area > 1 and (file.exists or 'x' in tags)").unwrap();
        assert_eq!(expr.references(), vec!["area", "file", "tags"]);
    }
}
