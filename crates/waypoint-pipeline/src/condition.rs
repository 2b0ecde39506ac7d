//! Edge condition expressions: parser and evaluator.
//!
//! Grammar:
//! ```text
//! ConditionExpr  ::= Clause ( '&&' Clause )*
//! Clause         ::= Key Operator Literal
//! Key            ::= identifier ( '.' identifier )*
//! Operator       ::= '=' | '!='
//! ```
//!
//! Key resolution at evaluation time:
//! - `outcome` — the current outcome's status string
//! - `preferred_label` — the current outcome's preferred label
//! - `context.<path>` — context value under `context.<path>`, falling
//!   back to `<path>` when absent
//! - any other identifier — context value under that identifier
//!
//! Comparisons are string equality after trimming; an empty expression is
//! always true; unparseable clauses evaluate false at selection time.

use std::collections::HashMap;

use waypoint_types::{Outcome, WaypointError};

/// A parsed condition: one or more clauses joined by `&&`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionExpr {
    pub clauses: Vec<Clause>,
}

/// A single comparison clause: `key op value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub key: String,
    pub operator: Operator,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
}

/// Parse a condition string into a [`ConditionExpr`].
///
/// Whitespace-only input yields zero clauses, which evaluates to true.
pub fn parse_condition(input: &str) -> Result<ConditionExpr, WaypointError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(ConditionExpr { clauses: Vec::new() });
    }

    let mut clauses = Vec::new();
    for part in trimmed.split("&&") {
        clauses.push(parse_clause(part.trim())?);
    }
    Ok(ConditionExpr { clauses })
}

fn parse_clause(input: &str) -> Result<Clause, WaypointError> {
    if input.is_empty() {
        return Err(make_error("empty clause"));
    }

    let (key_end, operator, op_len) = find_operator(input)?;

    let key = input[..key_end].trim().to_string();
    if key.is_empty() {
        return Err(make_error("missing key before operator"));
    }
    for seg in key.split('.') {
        if seg.is_empty() || !seg.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(make_error(&format!("invalid key segment: '{seg}'")));
        }
    }

    let raw_value = input[key_end + op_len..].trim();
    if raw_value.is_empty() {
        return Err(make_error(&format!("missing value after operator in '{input}'")));
    }

    Ok(Clause {
        key,
        operator,
        value: strip_quotes(raw_value),
    })
}

fn find_operator(input: &str) -> Result<(usize, Operator, usize), WaypointError> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'!' if i + 1 < bytes.len() && bytes[i + 1] == b'=' => {
                return Ok((i, Operator::NotEq, 2));
            }
            b'=' => return Ok((i, Operator::Eq, 1)),
            _ => i += 1,
        }
    }
    Err(make_error(&format!("no operator found in '{input}'")))
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if s.len() >= 2
        && ((bytes[0] == b'"' && bytes[s.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[s.len() - 1] == b'\''))
    {
        return s[1..s.len() - 1].to_string();
    }
    s.to_string()
}

fn make_error(msg: &str) -> WaypointError {
    WaypointError::ValidationError(format!("condition parse error: {msg}"))
}

/// Evaluate an expression against a key resolver. Missing keys should
/// resolve to an empty string.
pub fn evaluate_condition(expr: &ConditionExpr, resolve: &dyn Fn(&str) -> String) -> bool {
    expr.clauses.iter().all(|clause| {
        let actual = resolve(&clause.key).trim().to_string();
        let expected = clause.value.trim();
        match clause.operator {
            Operator::Eq => actual == expected,
            Operator::NotEq => actual != expected,
        }
    })
}

/// Build the standard key resolver over the current outcome and a
/// context snapshot.
pub fn resolver_for<'a>(
    outcome: &'a Outcome,
    snapshot: &'a HashMap<String, serde_json::Value>,
) -> impl Fn(&str) -> String + 'a {
    move |key: &str| match key {
        "outcome" => outcome.status.as_str().to_string(),
        "preferred_label" => outcome.preferred_label.clone().unwrap_or_default(),
        _ => {
            let direct = snapshot.get(key);
            let value = if key.starts_with("context.") {
                direct.or_else(|| snapshot.get(key.trim_start_matches("context.")))
            } else {
                direct
            };
            value.map(waypoint_types::coerce_to_string).unwrap_or_default()
        }
    }
}
