use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::models::Product;

static PROPERTY_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]*$").expect("invalid regex"));
static COMPARISON_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9.\-]*$").expect("invalid regex"));

/// Properties whose mention in an expression must agree with their presence on the resource.
const PRESENCE_CHECKED: [&str; 2] = ["clusterType", "instanceGroupSize"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatchError {
    #[error("empty clause in match expression `{0}`")]
    EmptyClause(String),
    #[error("invalid property name `{0}`")]
    InvalidProperty(String),
    #[error("invalid comparison value `{0}`")]
    InvalidValue(String),
    #[error("clause `{0}` mixes `==` and `!=`")]
    MixedOperators(String),
    #[error("unbalanced parentheses in `{0}`")]
    UnbalancedParens(String),
    #[error("`&&` is not supported inside parentheses: `{0}`")]
    NestedConjunction(String),
    #[error("`||` is only supported inside parentheses: `{0}`")]
    BareDisjunction(String),
    #[error("property `{property}` value `{value}` is not a boolean")]
    NotBoolean { property: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
}

/// key: usage-matcher -> parsed product eligibility rule
///
/// Top-level clauses are conjoined. Every parenthesised group contributes its alternatives to a
/// single shared `Or`, so `(a || b) && (c || d)` evaluates as `a || b || c || d`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(String),
    Flag(String),
    Compare {
        property: String,
        op: CompareOp,
        value: String,
    },
}

impl Expr {
    pub fn parse(expr: &str) -> Result<Expr, MatchError> {
        let mut all = Vec::new();
        let mut any = Vec::new();

        for segment in split_conjunction(expr)? {
            let segment = segment.trim();
            if segment.is_empty() {
                return Err(MatchError::EmptyClause(expr.to_string()));
            }
            if let Some(rest) = segment.strip_prefix('(') {
                let inner = rest
                    .strip_suffix(')')
                    .ok_or_else(|| MatchError::UnbalancedParens(segment.to_string()))?;
                if inner.contains("&&") {
                    return Err(MatchError::NestedConjunction(segment.to_string()));
                }
                for alternative in inner.split("||") {
                    let alternative = alternative.trim();
                    if alternative.is_empty() {
                        return Err(MatchError::EmptyClause(expr.to_string()));
                    }
                    any.push(parse_clause(alternative)?);
                }
            } else if segment.contains("||") {
                return Err(MatchError::BareDisjunction(segment.to_string()));
            } else {
                all.push(parse_clause(segment)?);
            }
        }

        if !any.is_empty() {
            all.push(Expr::Or(any));
        }
        Ok(Expr::And(all))
    }

    pub fn evaluate(&self, properties: &HashMap<String, String>) -> Result<bool, MatchError> {
        match self {
            Expr::And(clauses) => {
                for clause in clauses {
                    if !clause.evaluate(properties)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Or(alternatives) => {
                for alternative in alternatives {
                    if alternative.evaluate(properties)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expr::Flag(property) => match properties.get(property) {
                Some(value) => parse_bool(property, value),
                None => Ok(false),
            },
            Expr::Not(property) => match properties.get(property) {
                Some(value) => parse_bool(property, value).map(|flag| !flag),
                None => Ok(false),
            },
            Expr::Compare {
                property,
                op,
                value,
            } => Ok(match (properties.get(property), op) {
                (Some(actual), CompareOp::Eq) => equals_present(actual, value),
                (Some(actual), CompareOp::Ne) => !equals_present(actual, value),
                (None, CompareOp::Eq) => value.is_empty() || value == "0",
                (None, CompareOp::Ne) => false,
            }),
        }
    }
}

/// Evaluates a raw match expression against resource properties.
pub fn matches(match_expr: &str, properties: &HashMap<String, String>) -> Result<bool, MatchError> {
    let consistent = PRESENCE_CHECKED
        .iter()
        .all(|key| match_expr.contains(key) == properties.contains_key(*key));
    if !consistent {
        return Ok(false);
    }
    Expr::parse(match_expr)?.evaluate(properties)
}

pub fn product_matches(
    product: &Product,
    properties: &HashMap<String, String>,
) -> Result<bool, MatchError> {
    matches(&product.match_expr, properties)
}

fn split_conjunction(expr: &str) -> Result<Vec<&str>, MatchError> {
    let bytes = expr.as_bytes();
    let mut segments = Vec::new();
    let mut depth: i32 = 0;
    let mut start = 0;
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(MatchError::UnbalancedParens(expr.to_string()));
                }
            }
            b'&' if depth == 0 && bytes.get(index + 1) == Some(&b'&') => {
                segments.push(&expr[start..index]);
                index += 2;
                start = index;
                continue;
            }
            _ => {}
        }
        index += 1;
    }

    if depth != 0 {
        return Err(MatchError::UnbalancedParens(expr.to_string()));
    }
    segments.push(&expr[start..]);
    Ok(segments)
}

fn parse_clause(text: &str) -> Result<Expr, MatchError> {
    let has_eq = text.contains("==");
    let has_ne = text.contains("!=");
    if has_eq && has_ne {
        return Err(MatchError::MixedOperators(text.to_string()));
    }

    if has_eq || has_ne {
        let (op, token) = if has_eq {
            (CompareOp::Eq, "==")
        } else {
            (CompareOp::Ne, "!=")
        };
        let (lhs, rhs) = text
            .split_once(token)
            .ok_or_else(|| MatchError::InvalidProperty(text.to_string()))?;
        let property = property_name(lhs)?;
        let value = unquote(rhs.trim());
        if !COMPARISON_VALUE.is_match(value) {
            return Err(MatchError::InvalidValue(value.to_string()));
        }
        return Ok(Expr::Compare {
            property,
            op,
            value: value.to_string(),
        });
    }

    if let Some(negated) = text.strip_prefix('!') {
        return Ok(Expr::Not(property_name(negated)?));
    }

    Ok(Expr::Flag(property_name(text)?))
}

fn property_name(raw: &str) -> Result<String, MatchError> {
    let name = raw.trim();
    if name.is_empty() || !PROPERTY_NAME.is_match(name) {
        return Err(MatchError::InvalidProperty(name.to_string()));
    }
    Ok(name.to_string())
}

fn unquote(raw: &str) -> &str {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        &raw[1..raw.len() - 1]
    } else {
        raw
    }
}

// An empty expected value matches an empty or zero-valued property.
fn equals_present(actual: &str, expected: &str) -> bool {
    if expected.is_empty() {
        actual.is_empty() || actual.trim().parse::<i64>().map(|n| n == 0).unwrap_or(false)
    } else {
        actual == expected
    }
}

fn parse_bool(property: &str, value: &str) -> Result<bool, MatchError> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(MatchError::NotBoolean {
            property: property.to_string(),
            value: value.to_string(),
        }),
    }
}
