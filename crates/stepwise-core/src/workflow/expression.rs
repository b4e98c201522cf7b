//! Condition DSL for edge guards and `condition` nodes.
//!
//! Grammar (recursive descent, whitespace-insensitive between tokens):
//!
//! ```text
//! expr     := call | bare
//! call     := "not" "(" arg ")" | "eq" "(" arg "," arg ")" | "contains" "(" arg "," arg ")"
//! arg      := call | quoted | raw
//! quoted   := '"' ... '"' | "'" ... "'"      (backslash escapes)
//! raw      := text up to a top-level ',' or ')' (templates allowed)
//! bare     := any text, resolved as a template and tested for truthiness
//! ```
//!
//! Quoted strings are literals. Raw arguments and bare expressions go through
//! template resolution, so `eq({{ nodes.check.result }}, true)` compares the
//! node output against the text `true`.
//!
//! Falsy values are `""`, `"false"`, `"0"` and `"{}"` (after rendering and
//! trimming); everything else is truthy.

use serde_json::Value;

use super::template::{resolve_template_string, value_to_string};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while parsing a condition expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression is empty")]
    Empty,

    #[error("parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("unknown function '{0}' (expected not, eq or contains)")]
    UnknownFunction(String),

    #[error("{function}() takes {expected} argument(s), got {got}")]
    Arity {
        function: &'static str,
        expected: usize,
        got: usize,
    },
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// A parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Not(Box<Expr>),
    Eq(Operand, Operand),
    Contains(Operand, Operand),
    Truthy(Operand),
}

/// A call argument or bare value.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Quoted string, never template-resolved.
    Literal(String),
    /// Raw text resolved against the context.
    Template(String),
    /// A nested call evaluating to a boolean.
    Call(Box<Expr>),
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub result: bool,
    pub missing_paths: Vec<String>,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

const FUNCTIONS: [&str; 3] = ["not", "eq", "contains"];

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Parse {
            position: self.pos,
            message: message.into(),
        }
    }

    fn expect(&mut self, wanted: char) -> Result<(), ExpressionError> {
        self.skip_ws();
        match self.peek() {
            Some(c) if c == wanted => {
                self.bump();
                Ok(())
            }
            Some(c) => Err(self.error(format!("expected '{wanted}', found '{c}'"))),
            None => Err(self.error(format!("expected '{wanted}', found end of input"))),
        }
    }

    /// If the input at the cursor is `ident(`, return the identifier without consuming it.
    fn peek_call(&self) -> Option<&'a str> {
        let rest = self.rest();
        let end = rest
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if end == 0 || rest.as_bytes()[0].is_ascii_digit() {
            return None;
        }
        let after = rest[end..].trim_start();
        after.starts_with('(').then_some(&rest[..end])
    }

    fn parse_call(&mut self) -> Result<Expr, ExpressionError> {
        self.skip_ws();
        let name = self
            .peek_call()
            .ok_or_else(|| self.error("expected function call"))?;
        if !FUNCTIONS.contains(&name) {
            return Err(ExpressionError::UnknownFunction(name.to_string()));
        }
        self.pos += name.len();
        self.expect('(')?;

        let mut args = Vec::new();
        self.skip_ws();
        if self.peek() == Some(')') {
            self.bump();
        } else {
            loop {
                args.push(self.parse_arg()?);
                self.skip_ws();
                match self.bump() {
                    Some(',') => continue,
                    Some(')') => break,
                    Some(c) => return Err(self.error(format!("expected ',' or ')', found '{c}'"))),
                    None => return Err(self.error("unclosed '('")),
                }
            }
        }

        let got = args.len();
        let mut args = args.into_iter();
        match name {
            "not" => match (args.next(), args.next()) {
                (Some(a), None) => Ok(Expr::Not(Box::new(operand_into_expr(a)))),
                _ => Err(ExpressionError::Arity {
                    function: "not",
                    expected: 1,
                    got,
                }),
            },
            "eq" | "contains" => match (args.next(), args.next(), args.next()) {
                (Some(a), Some(b), None) if name == "eq" => Ok(Expr::Eq(a, b)),
                (Some(a), Some(b), None) => Ok(Expr::Contains(a, b)),
                _ => Err(ExpressionError::Arity {
                    function: if name == "eq" { "eq" } else { "contains" },
                    expected: 2,
                    got,
                }),
            },
            other => Err(ExpressionError::UnknownFunction(other.to_string())),
        }
    }

    fn parse_arg(&mut self) -> Result<Operand, ExpressionError> {
        self.skip_ws();
        match self.peek() {
            Some(q @ ('"' | '\'')) => self.parse_quoted(q),
            Some(_) if self.peek_call().is_some() => Ok(Operand::Call(Box::new(self.parse_call()?))),
            Some(_) => self.parse_raw(),
            None => Err(self.error("expected argument, found end of input")),
        }
    }

    fn parse_quoted(&mut self, quote: char) -> Result<Operand, ExpressionError> {
        let start = self.pos;
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => break,
                },
                Some(c) if c == quote => return Ok(Operand::Literal(out)),
                Some(c) => out.push(c),
                None => break,
            }
        }
        Err(ExpressionError::Parse {
            position: start,
            message: "unterminated string literal".to_string(),
        })
    }

    /// Raw text up to a top-level `,` or `)`. Commas and parens inside `{{ }}` are kept.
    fn parse_raw(&mut self) -> Result<Operand, ExpressionError> {
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(c) = self.peek() {
            if self.rest().starts_with("{{") {
                depth += 1;
                self.pos += 2;
                continue;
            }
            if depth > 0 && self.rest().starts_with("}}") {
                depth -= 1;
                self.pos += 2;
                continue;
            }
            if depth == 0 && (c == ',' || c == ')') {
                break;
            }
            self.bump();
        }
        let text = self.src[start..self.pos].trim();
        if text.is_empty() {
            return Err(ExpressionError::Parse {
                position: start,
                message: "empty argument".to_string(),
            });
        }
        Ok(Operand::Template(text.to_string()))
    }
}

fn operand_into_expr(operand: Operand) -> Expr {
    match operand {
        Operand::Call(expr) => *expr,
        other => Expr::Truthy(other),
    }
}

/// Parse a condition expression.
pub fn parse_expression(source: &str) -> Result<Expr, ExpressionError> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(ExpressionError::Empty);
    }

    let mut parser = Parser::new(trimmed);
    if parser.peek_call().is_none() {
        return Ok(Expr::Truthy(Operand::Template(trimmed.to_string())));
    }

    let expr = parser.parse_call()?;
    parser.skip_ws();
    if parser.pos < trimmed.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

/// Parse and evaluate in one step.
pub fn evaluate_expression(source: &str, context: &Value) -> Result<Evaluation, ExpressionError> {
    Ok(parse_expression(source)?.evaluate(context))
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// DSL truthiness: `""`, `"false"`, `"0"`, `"{}"` (and null) are falsy.
pub fn is_truthy(value: &Value) -> bool {
    let rendered = value_to_string(value);
    !matches!(rendered.trim(), "" | "false" | "0" | "{}")
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    a == b || value_to_string(a).trim() == value_to_string(b).trim()
}

impl Expr {
    pub fn evaluate(&self, context: &Value) -> Evaluation {
        let mut missing = Vec::new();
        let result = self.eval(context, &mut missing);
        Evaluation {
            result,
            missing_paths: missing,
        }
    }

    fn eval(&self, context: &Value, missing: &mut Vec<String>) -> bool {
        match self {
            Expr::Not(inner) => !inner.eval(context, missing),
            Expr::Truthy(operand) => is_truthy(&operand.value(context, missing)),
            Expr::Eq(a, b) => {
                let a = a.value(context, missing);
                let b = b.value(context, missing);
                loosely_equal(&a, &b)
            }
            Expr::Contains(haystack, needle) => {
                let haystack = haystack.value(context, missing);
                let needle = needle.value(context, missing);
                match &haystack {
                    Value::Array(items) => items.iter().any(|item| loosely_equal(item, &needle)),
                    Value::Object(map) => map.contains_key(value_to_string(&needle).as_str()),
                    Value::Null => false,
                    other => value_to_string(other).contains(&value_to_string(&needle)),
                }
            }
        }
    }
}

impl Operand {
    fn value(&self, context: &Value, missing: &mut Vec<String>) -> Value {
        match self {
            Operand::Literal(s) => Value::String(s.clone()),
            Operand::Template(text) => {
                let resolved = resolve_template_string(text, context);
                for path in resolved.missing_paths {
                    if !missing.contains(&path) {
                        missing.push(path);
                    }
                }
                resolved.value
            }
            Operand::Call(expr) => Value::Bool(expr.eval(context, missing)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
