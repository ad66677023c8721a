//! Condition gates on processes.
//!
//! The language is deliberately closed:
//!
//! ```text
//! true | false | name | !name | name == literal | name != literal
//! ```
//!
//! Literals may be bare words or quoted with `'` or `"`. A bare `name` is
//! truthy when its value exists and is not one of `""`, `false`, `0`, `no`
//! (case-insensitive).

use std::collections::BTreeMap;

use crate::errors::GraphError;

/// A parsed condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Constant.
    Const(bool),
    /// `name`
    Truthy(String),
    /// `!name`
    Falsy(String),
    /// `name == literal`
    Equals(String, String),
    /// `name != literal`
    NotEquals(String, String),
}

impl Condition {
    /// Parses a condition expression.
    pub fn parse(input: &str) -> Result<Self, GraphError> {
        let text = input.trim();
        let invalid = |reason: &str| GraphError::Schema(format!("invalid condition '{input}': {reason}"));

        if text.is_empty() {
            return Err(invalid("empty expression"));
        }
        if text.eq_ignore_ascii_case("true") {
            return Ok(Self::Const(true));
        }
        if text.eq_ignore_ascii_case("false") {
            return Ok(Self::Const(false));
        }

        for (op, negate) in [("!=", true), ("==", false)] {
            if let Some((lhs, rhs)) = text.split_once(op) {
                let name = parse_name(lhs).ok_or_else(|| invalid("left side must be a variable name"))?;
                let literal = parse_literal(rhs).ok_or_else(|| invalid("right side must be a literal"))?;
                return Ok(if negate {
                    Self::NotEquals(name, literal)
                } else {
                    Self::Equals(name, literal)
                });
            }
        }

        if let Some(rest) = text.strip_prefix('!') {
            return parse_name(rest)
                .map(Self::Falsy)
                .ok_or_else(|| invalid("expected a variable name after '!'"));
        }

        parse_name(text)
            .map(Self::Truthy)
            .ok_or_else(|| invalid("expected a variable name"))
    }

    /// Evaluates the condition against named string values.
    #[must_use]
    pub fn evaluate(&self, values: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Const(v) => *v,
            Self::Truthy(name) => values.get(name).is_some_and(|v| is_truthy(v)),
            Self::Falsy(name) => !values.get(name).is_some_and(|v| is_truthy(v)),
            Self::Equals(name, literal) => values.get(name).is_some_and(|v| v == literal),
            Self::NotEquals(name, literal) => values.get(name).map_or(true, |v| v != literal),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    let v = value.trim();
    !(v.is_empty()
        || v.eq_ignore_ascii_case("false")
        || v == "0"
        || v.eq_ignore_ascii_case("no"))
}

fn parse_name(text: &str) -> Option<String> {
    let name = text.trim();
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    valid.then(|| name.to_string())
}

fn parse_literal(text: &str) -> Option<String> {
    let lit = text.trim();
    if lit.is_empty() {
        return None;
    }
    for quote in ['\'', '"'] {
        if let Some(inner) = lit.strip_prefix(quote).and_then(|s| s.strip_suffix(quote)) {
            return Some(inner.to_string());
        }
    }
    Some(lit.to_string())
}
