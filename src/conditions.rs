//! Condition evaluation for branch, filter and list-status decisions.
//!
//! A condition is a tree: groups combine children with `and`/`or`, leaves
//! compare one field of the run context against a literal. Evaluation is
//! total and pure. Unknown operators and missing fields evaluate to `false`
//! (except `not_exists`, which is how absence is tested explicitly).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A boolean condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Group {
        operator: String,
        children: Vec<Condition>,
    },
    Leaf {
        operator: String,
        field: String,
        #[serde(default)]
        value: Value,
    },
}

impl Condition {
    pub fn leaf(operator: &str, field: &str, value: Value) -> Self {
        Condition::Leaf {
            operator: operator.to_string(),
            field: field.to_string(),
            value,
        }
    }

    pub fn all(children: Vec<Condition>) -> Self {
        Condition::Group {
            operator: "and".to_string(),
            children,
        }
    }

    pub fn any(children: Vec<Condition>) -> Self {
        Condition::Group {
            operator: "or".to_string(),
            children,
        }
    }
}

/// How leaf values are compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMode {
    /// Exact JSON equality; numbers compare numerically, strings by case.
    #[default]
    Strict,
    /// Like strict, but strings compare without regard to ASCII case.
    CaseInsensitive,
    /// Case-insensitive, and numeric/boolean strings coerce to their type.
    Coerce,
}

impl fmt::Display for ComparisonMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonMode::Strict => write!(f, "strict"),
            ComparisonMode::CaseInsensitive => write!(f, "case_insensitive"),
            ComparisonMode::Coerce => write!(f, "coerce"),
        }
    }
}

impl FromStr for ComparisonMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(ComparisonMode::Strict),
            "case_insensitive" => Ok(ComparisonMode::CaseInsensitive),
            "coerce" => Ok(ComparisonMode::Coerce),
            _ => Err(format!("Unknown comparison mode: {}", s)),
        }
    }
}

/// Evaluates condition trees with a fixed comparison mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator {
    mode: ComparisonMode,
}

impl ConditionEvaluator {
    pub fn new(mode: ComparisonMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ComparisonMode {
        self.mode
    }

    /// Evaluate `condition` against a context record.
    pub fn evaluate(&self, condition: &Condition, context: &Value) -> bool {
        match condition {
            Condition::Group { operator, children } => match operator.as_str() {
                "and" => children.iter().all(|c| self.evaluate(c, context)),
                "or" => children.iter().any(|c| self.evaluate(c, context)),
                _ => false,
            },
            Condition::Leaf {
                operator,
                field,
                value,
            } => {
                let actual = resolve_field(context, field);
                match operator.as_str() {
                    "exists" => actual.is_some(),
                    "not_exists" => actual.is_none(),
                    _ => match actual {
                        Some(actual) => self.compare(operator, actual, value),
                        None => false,
                    },
                }
            }
        }
    }

    fn compare(&self, operator: &str, left: &Value, right: &Value) -> bool {
        match operator {
            "equals" => self.values_equal(left, right),
            "not_equals" => !self.values_equal(left, right),
            "contains" => match left {
                Value::String(haystack) => right
                    .as_str()
                    .map(|needle| {
                        if self.mode == ComparisonMode::Strict {
                            haystack.contains(needle)
                        } else {
                            haystack.to_lowercase().contains(&needle.to_lowercase())
                        }
                    })
                    .unwrap_or(false),
                Value::Array(items) => items.iter().any(|item| self.values_equal(item, right)),
                _ => false,
            },
            "gt" | "lt" => match (self.as_number(left), self.as_number(right)) {
                (Some(l), Some(r)) if operator == "gt" => l > r,
                (Some(l), Some(r)) => l < r,
                _ => false,
            },
            _ => false,
        }
    }

    fn values_equal(&self, left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
            (Value::String(l), Value::String(r)) => match self.mode {
                ComparisonMode::Strict => l == r,
                _ => l.eq_ignore_ascii_case(r),
            },
            (Value::String(s), other) | (other, Value::String(s))
                if self.mode == ComparisonMode::Coerce =>
            {
                match other {
                    Value::Number(n) => s.trim().parse::<f64>().ok() == n.as_f64(),
                    Value::Bool(b) => s.trim().eq_ignore_ascii_case(if *b { "true" } else { "false" }),
                    _ => false,
                }
            }
            _ => left == right,
        }
    }

    fn as_number(&self, value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) if self.mode == ComparisonMode::Coerce => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Evaluate with strict comparison.
pub fn evaluate(condition: &Condition, context: &Value) -> bool {
    ConditionEvaluator::default().evaluate(condition, context)
}

/// Resolve a dotted field path against the context.
///
/// Paths are looked up from the root first, then under `changes`, where the
/// triggering event's contact attributes live. JSON `null` counts as absent.
pub fn resolve_field<'a>(context: &'a Value, field: &str) -> Option<&'a Value> {
    get_path_value(context, field)
        .or_else(|| context.get("changes").and_then(|c| get_path_value(c, field)))
        .filter(|v| !v.is_null())
}

fn get_path_value<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                let index = segment.parse::<usize>().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}
