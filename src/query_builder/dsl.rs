//! Filter DSL: normalizes the client-facing JSON mapping into a [`Condition`] tree.
//!
//! Accepted shapes for a field entry:
//!
//! | Surface | Meaning |
//! |---|---|
//! | `{"f": "v"}` | equality (`null` becomes `IS NULL`) |
//! | `{"f": [">=", 18]}` | comparison, `IN`/`NOT IN` with an array operand |
//! | `{"f": ["BETWEEN", 1, 9]}` | `BETWEEN`/`NOT BETWEEN` |
//! | `{"f": {">": 1, "<": 9}}` | operator map on one field, AND-combined, may hold an `"OR"` entry |
//! | `{"f": {"column": "g"}}` | column reference, no parameter |
//!
//! `"OR"` and `"AND"` keys take either an object (each entry is one sub-filter) or an
//! array of filter objects. Anything else is a [`KeelError::MalformedFilter`].

use super::conditions::{CompareOp, Condition, SqlFragment};
use crate::database::value::{coerce, is_scalar};
use crate::error::{KeelError, Result};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    And,
    Or,
}

impl GroupKind {
    fn from_key(key: &str) -> Option<Self> {
        if key.eq_ignore_ascii_case("OR") {
            Some(GroupKind::Or)
        } else if key.eq_ignore_ascii_case("AND") {
            Some(GroupKind::And)
        } else {
            None
        }
    }

    fn name(&self) -> &'static str {
        match self {
            GroupKind::And => "AND",
            GroupKind::Or => "OR",
        }
    }
}

/// Operators that take something other than a single operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetOp {
    In,
    NotIn,
    Between,
    NotBetween,
}

impl SetOp {
    fn parse(token: &str) -> Option<Self> {
        let normalized = token
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();

        match normalized.as_str() {
            "IN" => Some(SetOp::In),
            "NOT IN" => Some(SetOp::NotIn),
            "BETWEEN" => Some(SetOp::Between),
            "NOT BETWEEN" => Some(SetOp::NotBetween),
            _ => None,
        }
    }
}

/// Parse a filter mapping. An empty mapping yields `None` (no WHERE clause).
pub fn parse_filter(filter: &Value) -> Result<Option<Condition>> {
    let Value::Object(entries) = filter else {
        return Err(KeelError::malformed(format!(
            "filter must be an object, got {filter}"
        )));
    };
    parse_entries(entries)
}

/// Parse and compile in one step; `{}` compiles to an empty fragment
pub fn compile_filter(filter: &Value) -> Result<SqlFragment> {
    Ok(parse_filter(filter)?
        .map(|condition| condition.compile())
        .unwrap_or_default())
}

fn parse_entries(entries: &Map<String, Value>) -> Result<Option<Condition>> {
    let mut members = entries
        .iter()
        .map(|(key, value)| parse_entry(key, value))
        .collect::<Result<Vec<_>>>()?;

    Ok(match members.len() {
        0 => None,
        1 => members.pop(),
        _ => Some(Condition::And(members)),
    })
}

fn parse_entry(key: &str, value: &Value) -> Result<Condition> {
    match GroupKind::from_key(key) {
        Some(kind) => parse_group(kind, value),
        None => parse_field(key, value),
    }
}

fn parse_group(kind: GroupKind, value: &Value) -> Result<Condition> {
    let members = match value {
        Value::Object(entries) => entries
            .iter()
            .map(|(key, value)| parse_entry(key, value))
            .collect::<Result<Vec<_>>>()?,
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(entries) => parse_entries(entries)?.ok_or_else(|| {
                    KeelError::malformed(format!("empty filter inside {} group", kind.name()))
                }),
                other => Err(KeelError::malformed(format!(
                    "{} group members must be objects, got {other}",
                    kind.name()
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        other => {
            return Err(KeelError::malformed(format!(
                "{} group must be an object or array, got {other}",
                kind.name()
            )))
        }
    };

    group(kind, members)
}

fn group(kind: GroupKind, mut members: Vec<Condition>) -> Result<Condition> {
    match (kind, members.len()) {
        (GroupKind::And, 0) => Err(KeelError::malformed("empty AND group")),
        (GroupKind::Or, 0) => Ok(Condition::Or(members)),
        (_, 1) => members
            .pop()
            .ok_or_else(|| KeelError::malformed("empty group")),
        (GroupKind::And, _) => Ok(Condition::And(members)),
        (GroupKind::Or, _) => Ok(Condition::Or(members)),
    }
}

fn parse_field(field: &str, value: &Value) -> Result<Condition> {
    if field.trim().is_empty() {
        return Err(KeelError::malformed("empty field name"));
    }

    match value {
        Value::Null => Ok(Condition::is_null(field)),
        Value::Array(items) => parse_operator_array(field, items),
        Value::Object(entries) => match column_reference(entries)? {
            Some(other) => Ok(Condition::column_ref(field, CompareOp::Eq, &other)),
            None => parse_operator_map(field, entries),
        },
        scalar => Ok(Condition::Equals {
            field: field.to_string(),
            value: coerce(scalar.clone()),
        }),
    }
}

/// `{"column": "name"}` operand
fn column_reference(entries: &Map<String, Value>) -> Result<Option<String>> {
    if entries.len() != 1 {
        return Ok(None);
    }
    match entries.get("column") {
        Some(Value::String(name)) if !name.trim().is_empty() => Ok(Some(name.clone())),
        Some(other) => Err(KeelError::malformed(format!(
            "column reference must name a column, got {other}"
        ))),
        None => Ok(None),
    }
}

fn parse_operator_array(field: &str, items: &[Value]) -> Result<Condition> {
    let Some(Value::String(op)) = items.first() else {
        return Err(KeelError::malformed(format!(
            "`{field}`: operator array must start with an operator string"
        )));
    };

    match &items[1..] {
        [operand] => parse_operator(field, op, operand),
        [low, high] => match SetOp::parse(op) {
            Some(SetOp::Between) => between(field, low, high, false),
            Some(SetOp::NotBetween) => between(field, low, high, true),
            _ => Err(KeelError::malformed(format!(
                "`{field}`: operator {op} takes one operand"
            ))),
        },
        _ => Err(KeelError::malformed(format!(
            "`{field}`: operator array must have two or three elements"
        ))),
    }
}

fn parse_operator_map(field: &str, entries: &Map<String, Value>) -> Result<Condition> {
    let members = entries
        .iter()
        .map(|(op, operand)| match GroupKind::from_key(op) {
            Some(kind) => parse_operator_group(field, kind, operand),
            None => parse_operator(field, op, operand),
        })
        .collect::<Result<Vec<_>>>()?;

    if members.is_empty() {
        return Err(KeelError::malformed(format!(
            "`{field}`: empty operator map"
        )));
    }
    group(GroupKind::And, members)
}

/// `"OR"`/`"AND"` inside an operator map: entries are operators on the same field
fn parse_operator_group(field: &str, kind: GroupKind, operand: &Value) -> Result<Condition> {
    let members = match operand {
        Value::Object(entries) => entries
            .iter()
            .map(|(op, operand)| parse_operator(field, op, operand))
            .collect::<Result<Vec<_>>>()?,
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(entries) => parse_operator_map(field, entries),
                Value::Array(items) => parse_operator_array(field, items),
                other => Err(KeelError::malformed(format!(
                    "`{field}`: invalid {} member {other}",
                    kind.name()
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        other => {
            return Err(KeelError::malformed(format!(
                "`{field}`: {} must be an object or array, got {other}",
                kind.name()
            )))
        }
    };

    group(kind, members)
}

fn parse_operator(field: &str, op: &str, operand: &Value) -> Result<Condition> {
    if let Some(set_op) = SetOp::parse(op) {
        return match (set_op, operand) {
            (SetOp::In | SetOp::NotIn, Value::Array(values)) => {
                let values = values
                    .iter()
                    .map(|v| bindable(field, v))
                    .collect::<Result<Vec<_>>>()?;
                Ok(if set_op == SetOp::In {
                    Condition::In {
                        field: field.to_string(),
                        values,
                    }
                } else {
                    Condition::NotIn {
                        field: field.to_string(),
                        values,
                    }
                })
            }
            (SetOp::Between, Value::Array(bounds)) if bounds.len() == 2 => {
                between(field, &bounds[0], &bounds[1], false)
            }
            (SetOp::NotBetween, Value::Array(bounds)) if bounds.len() == 2 => {
                between(field, &bounds[0], &bounds[1], true)
            }
            (SetOp::In | SetOp::NotIn, other) => Err(KeelError::malformed(format!(
                "`{field}`: {op} requires an array, got {other}"
            ))),
            (_, other) => Err(KeelError::malformed(format!(
                "`{field}`: {op} requires two bounds, got {other}"
            ))),
        };
    }

    let compare = CompareOp::parse(op)
        .ok_or_else(|| KeelError::malformed(format!("`{field}`: unknown operator {op}")))?;

    match operand {
        Value::Null => match compare {
            CompareOp::Eq => Ok(Condition::is_null(field)),
            c if c.is_inequality() => Ok(Condition::IsNotNull {
                field: field.to_string(),
            }),
            _ => Err(KeelError::malformed(format!(
                "`{field}`: null cannot be compared with {op}"
            ))),
        },
        Value::Object(entries) => match column_reference(entries)? {
            Some(other) => Ok(Condition::column_ref(field, compare, &other)),
            None => Err(KeelError::malformed(format!(
                "`{field}`: {op} operand must be a scalar or a column reference"
            ))),
        },
        Value::Array(_) => Err(KeelError::malformed(format!(
            "`{field}`: {op} operand must be a scalar"
        ))),
        scalar => Ok(Condition::Compare {
            field: field.to_string(),
            op: compare,
            value: coerce(scalar.clone()),
        }),
    }
}

fn between(field: &str, low: &Value, high: &Value, negated: bool) -> Result<Condition> {
    let low = bindable(field, low)?;
    let high = bindable(field, high)?;
    Ok(if negated {
        Condition::NotBetween {
            field: field.to_string(),
            low,
            high,
        }
    } else {
        Condition::Between {
            field: field.to_string(),
            low,
            high,
        }
    })
}

/// Non-null scalar
fn bindable(field: &str, value: &Value) -> Result<Value> {
    if value.is_null() || !is_scalar(value) {
        return Err(KeelError::malformed(format!(
            "`{field}`: expected a non-null scalar, got {value}"
        )));
    }
    Ok(coerce(value.clone()))
}
