//! Condition trees and matcher evaluation.

use serde::Deserialize;
use serde_json::Value;

use crate::token::TokenFinder;
use pulse_types::data::to_display_string;

/// A node in a rule's condition tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "definition", rename_all = "lowercase")]
pub enum Condition {
    /// A logical combination of child conditions.
    Group(GroupDefinition),
    /// A leaf comparing one token path against candidate values.
    Matcher(MatcherDefinition),
}

/// The definition of a group node.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupDefinition {
    /// How the children combine.
    pub logic: Logic,
    /// The child conditions.
    pub conditions: Vec<Condition>,
}

/// Group combinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    /// Every child must hold.
    And,
    /// At least one child must hold.
    Or,
    /// No child may hold.
    Not,
}

/// The definition of a matcher leaf.
#[derive(Debug, Clone, Deserialize)]
pub struct MatcherDefinition {
    /// The token path of the left-hand side.
    pub key: String,
    /// The operator string (`eq`, `ne`, `gt`, ...). Unknown operators
    /// evaluate false with a warning.
    pub matcher: String,
    /// Right-hand candidates; the matcher holds if any candidate matches.
    #[serde(default)]
    pub values: Vec<Value>,
}

impl Condition {
    /// Evaluates this node against `finder`'s universe.
    pub fn evaluate(&self, finder: &TokenFinder<'_>) -> bool {
        match self {
            Self::Group(group) => match group.logic {
                Logic::And => group.conditions.iter().all(|c| c.evaluate(finder)),
                Logic::Or => group.conditions.iter().any(|c| c.evaluate(finder)),
                Logic::Not => !group.conditions.iter().any(|c| c.evaluate(finder)),
            },
            Self::Matcher(matcher) => evaluate_matcher(matcher, finder),
        }
    }
}

/// Evaluates one matcher leaf.
///
/// A missing path satisfies only `nx` and `ne`; every other operator is
/// false on absence. String comparison is case-insensitive; ordering
/// operators coerce numeric-looking strings.
fn evaluate_matcher(matcher: &MatcherDefinition, finder: &TokenFinder<'_>) -> bool {
    let actual = finder.find(&matcher.key);

    match matcher.matcher.as_str() {
        "ex" => actual.is_some(),
        "nx" => actual.is_none(),
        "eq" => match &actual {
            Some(actual) => matcher.values.iter().any(|v| loosely_equal(actual, v)),
            None => false,
        },
        "ne" => match &actual {
            Some(actual) => !matcher.values.iter().any(|v| loosely_equal(actual, v)),
            None => true,
        },
        op @ ("gt" | "ge" | "lt" | "le") => match actual.as_ref().and_then(as_number) {
            Some(lhs) => matcher.values.iter().filter_map(as_number).any(|rhs| match op {
                "gt" => lhs > rhs,
                "ge" => lhs >= rhs,
                "lt" => lhs < rhs,
                _ => lhs <= rhs,
            }),
            None => false,
        },
        op @ ("co" | "nc" | "sw" | "ew") => match &actual {
            Some(actual) => {
                let lhs = to_display_string(actual).to_lowercase();
                let hit = matcher.values.iter().any(|v| {
                    let rhs = to_display_string(v).to_lowercase();
                    match op {
                        "co" | "nc" => lhs.contains(&rhs),
                        "sw" => lhs.starts_with(&rhs),
                        _ => lhs.ends_with(&rhs),
                    }
                });
                if op == "nc" {
                    !hit
                } else {
                    hit
                }
            }
            None => false,
        },
        unknown => {
            tracing::warn!(matcher = unknown, key = %matcher.key, "unknown matcher operator");
            false
        }
    }
}

/// Equality with numeric coercion and case-insensitive strings.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(a), as_number(b)) {
        return a == b;
    }
    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => to_display_string(a).eq_ignore_ascii_case(&to_display_string(b)),
    }
}

/// Numeric view of a value: numbers directly, strings that parse as f64.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
