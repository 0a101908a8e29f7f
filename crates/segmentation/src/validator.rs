//! Raw rule tree validation.
//!
//! Walks the user-authored JSON and collects every problem, each tagged with
//! its path (`rules.conditions[1]`), before returning. Nothing here touches
//! the customer repository.

use crm_core::types::{parse_timestamp, Comparator, Field};
use crm_core::ValidationError;
use serde_json::{Map, Value};

use crate::rules::{RuleNode, ValidatedRuleTree, ValidationErrors};

const ROOT_PATH: &str = "rules";

/// Validates a raw rule tree into its canonical typed form.
pub fn validate(raw: &Value) -> Result<ValidatedRuleTree, ValidationErrors> {
    let mut errors = Vec::new();
    let node = parse_node(raw, ROOT_PATH, &mut errors);
    match node {
        Some(root) if errors.is_empty() => Ok(ValidatedRuleTree::new_unchecked(root)),
        _ => {
            if errors.is_empty() {
                errors.push(ValidationError::new(ROOT_PATH, "Condition could not be parsed"));
            }
            Err(ValidationErrors(errors))
        }
    }
}

fn parse_node(raw: &Value, path: &str, errors: &mut Vec<ValidationError>) -> Option<RuleNode> {
    let obj = match raw {
        Value::Object(obj) => obj,
        Value::Null => {
            errors.push(ValidationError::new(path, "Condition is undefined"));
            return None;
        }
        other => {
            errors.push(ValidationError::new(
                path,
                format!("Condition must be an object, got {}", json_kind(other)),
            ));
            return None;
        }
    };

    let kind = match obj.get("type") {
        Some(Value::String(s)) => s.to_ascii_lowercase(),
        Some(other) => {
            errors.push(ValidationError::new(
                path,
                format!("Condition type must be a string, got {}", json_kind(other)),
            ));
            return None;
        }
        None => {
            errors.push(ValidationError::new(path, "Condition is missing a type"));
            return None;
        }
    };

    match kind.as_str() {
        "simple" => parse_simple(obj, path, errors),
        "and" | "or" | "complex" => parse_group(&kind, obj, path, errors),
        _ => {
            errors.push(ValidationError::new(
                path,
                format!("Unknown condition type: {kind}"),
            ));
            None
        }
    }
}

fn parse_simple(
    obj: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<RuleNode> {
    let field = match obj.get("field") {
        None | Some(Value::Null) => {
            errors.push(ValidationError::new(path, "Simple condition must have a field"));
            None
        }
        Some(Value::String(name)) => {
            let parsed = Field::parse(name);
            if parsed.is_none() {
                errors.push(ValidationError::new(path, format!("Invalid field '{name}'")));
            }
            parsed
        }
        Some(other) => {
            errors.push(ValidationError::new(path, format!("Invalid field '{other}'")));
            None
        }
    };

    let comparator = match obj.get("comparator") {
        Some(Value::String(name)) => {
            let parsed = Comparator::parse(name);
            if parsed.is_none() {
                errors.push(ValidationError::new(
                    path,
                    format!("Invalid comparator '{name}'"),
                ));
            }
            parsed
        }
        None | Some(Value::Null) => {
            errors.push(ValidationError::new(path, "Invalid comparator 'undefined'"));
            None
        }
        Some(other) => {
            errors.push(ValidationError::new(
                path,
                format!("Invalid comparator '{other}'"),
            ));
            None
        }
    };

    let value = match obj.get("value") {
        None | Some(Value::Null) => {
            errors.push(ValidationError::new(path, "Simple condition must have a value"));
            None
        }
        Some(raw) => {
            let is_date = field.map(|f| f.is_date()).unwrap_or(false);
            let coerced = if is_date {
                coerce_date(raw)
            } else {
                coerce_number(raw)
            };
            if coerced.is_none() {
                let expected = if is_date { "date" } else { "numeric" };
                errors.push(ValidationError::new(
                    path,
                    format!("Invalid {expected} value: {}", display_value(raw)),
                ));
            }
            coerced
        }
    };

    Some(RuleNode::Simple {
        field: field?,
        comparator: comparator?,
        value: value?,
    })
}

fn parse_group(
    kind: &str,
    obj: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<RuleNode> {
    let label = kind.to_ascii_uppercase();
    let raw_children = match obj.get("conditions").or_else(|| obj.get("children")) {
        Some(Value::Array(items)) => items,
        _ => {
            errors.push(ValidationError::new(
                path,
                format!("{label} condition must have conditions"),
            ));
            return None;
        }
    };

    let mut children = Vec::with_capacity(raw_children.len());
    let mut complete = true;
    for (i, child) in raw_children.iter().enumerate() {
        match parse_node(child, &child_path(path, i), errors) {
            Some(node) => children.push(node),
            None => complete = false,
        }
    }

    if !check_arity(kind, raw_children.len(), path, errors) || !complete {
        return None;
    }

    Some(match kind {
        "and" => RuleNode::And {
            conditions: children,
        },
        "or" => RuleNode::Or {
            conditions: children,
        },
        _ => RuleNode::Complex {
            conditions: children,
        },
    })
}

/// AND/OR need two or more children; COMPLEX needs at least one. A
/// single-child combinator is rejected rather than unwrapped.
fn check_arity(kind: &str, len: usize, path: &str, errors: &mut Vec<ValidationError>) -> bool {
    match kind {
        "and" | "or" if len < 2 => {
            errors.push(ValidationError::new(
                path,
                format!("{} must have at least two conditions", kind.to_ascii_uppercase()),
            ));
            false
        }
        "complex" if len == 0 => {
            errors.push(ValidationError::new(
                path,
                "COMPLEX must have at least one condition",
            ));
            false
        }
        _ => true,
    }
}

/// Structural checks for typed trees built in code or loaded from storage.
pub(crate) fn check_structure(node: &RuleNode, path: &str, errors: &mut Vec<ValidationError>) {
    match node {
        RuleNode::Simple { value, .. } => {
            if !value.is_finite() {
                errors.push(ValidationError::new(
                    path,
                    format!("Invalid numeric value: {value}"),
                ));
            }
        }
        RuleNode::And { conditions }
        | RuleNode::Or { conditions }
        | RuleNode::Complex { conditions } => {
            check_arity(node.kind(), conditions.len(), path, errors);
            for (i, child) in conditions.iter().enumerate() {
                check_structure(child, &child_path(path, i), errors);
            }
        }
    }
}

fn child_path(path: &str, index: usize) -> String {
    format!("{path}.conditions[{index}]")
}

fn coerce_number(raw: &Value) -> Option<f64> {
    let n = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<f64>().ok()?
        }
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Dates become epoch milliseconds: RFC 3339, `YYYY-MM-DD`, or a number
/// already in epoch milliseconds.
fn coerce_date(raw: &Value) -> Option<f64> {
    if let Value::String(s) = raw {
        if let Some(ts) = parse_timestamp(s.trim()) {
            return Some(ts.timestamp_millis() as f64);
        }
    }
    coerce_number(raw)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
