//! Filter expression tree and its compiler to a parameterized MySQL fragment.
//!
//! Compilation is a pure function of the tree: literals always become `?` placeholders
//! with the value appended to the parameter list left to right, and identifiers are
//! backtick-quoted.

use crate::database::value::coerce;
use serde_json::Value;
use std::fmt;

/// A compiled WHERE fragment and its bound parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlFragment {
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    /// Number of `?` placeholders in the fragment
    pub fn placeholder_count(&self) -> usize {
        self.sql.matches('?').count()
    }
}

/// Comparison operators accepted by the filter DSL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Diamond,
    Lt,
    Gt,
    Lte,
    Gte,
    Like,
    NotLike,
}

impl CompareOp {
    /// Parse an operator token; case and inner whitespace are normalized
    pub fn parse(token: &str) -> Option<Self> {
        let normalized = token
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();

        match normalized.as_str() {
            "=" => Some(CompareOp::Eq),
            "!=" => Some(CompareOp::NotEq),
            "<>" => Some(CompareOp::Diamond),
            "<" => Some(CompareOp::Lt),
            ">" => Some(CompareOp::Gt),
            "<=" => Some(CompareOp::Lte),
            ">=" => Some(CompareOp::Gte),
            "LIKE" => Some(CompareOp::Like),
            "NOT LIKE" => Some(CompareOp::NotLike),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Diamond => "<>",
            CompareOp::Lt => "<",
            CompareOp::Gt => ">",
            CompareOp::Lte => "<=",
            CompareOp::Gte => ">=",
            CompareOp::Like => "LIKE",
            CompareOp::NotLike => "NOT LIKE",
        }
    }

    /// `!=` and `<>`
    pub fn is_inequality(&self) -> bool {
        matches!(self, CompareOp::NotEq | CompareOp::Diamond)
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Normalized filter expression
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Equals {
        field: String,
        value: Value,
    },
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    NotIn {
        field: String,
        values: Vec<Value>,
    },
    Between {
        field: String,
        low: Value,
        high: Value,
    },
    NotBetween {
        field: String,
        low: Value,
        high: Value,
    },
    IsNull {
        field: String,
    },
    IsNotNull {
        field: String,
    },
    ColumnRef {
        field: String,
        op: CompareOp,
        other: String,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    pub fn equals(field: &str, value: impl Into<Value>) -> Self {
        Condition::Equals {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn compare(field: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        Condition::Compare {
            field: field.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn is_null(field: &str) -> Self {
        Condition::IsNull {
            field: field.to_string(),
        }
    }

    pub fn column_ref(field: &str, op: CompareOp, other: &str) -> Self {
        Condition::ColumnRef {
            field: field.to_string(),
            op,
            other: other.to_string(),
        }
    }

    /// Compile to a fragment. Top-level AND members are joined without parentheses.
    pub fn compile(&self) -> SqlFragment {
        let mut fragment = SqlFragment::default();
        self.write(&mut fragment);
        fragment
    }

    fn write(&self, out: &mut SqlFragment) {
        match self {
            Condition::Equals { field, value } => {
                if value.is_null() {
                    out.sql.push_str(&format!("{} IS NULL", quote_identifier(field)));
                } else {
                    out.sql.push_str(&format!("{} = ?", quote_identifier(field)));
                    out.params.push(coerce(value.clone()));
                }
            }
            Condition::Compare { field, op, value } => {
                if value.is_null() && (*op == CompareOp::Eq || op.is_inequality()) {
                    let test = if *op == CompareOp::Eq {
                        "IS NULL"
                    } else {
                        "IS NOT NULL"
                    };
                    out.sql
                        .push_str(&format!("{} {test}", quote_identifier(field)));
                } else {
                    out.sql
                        .push_str(&format!("{} {} ?", quote_identifier(field), op));
                    out.params.push(coerce(value.clone()));
                }
            }
            Condition::In { field, values } => write_in(out, field, values, false),
            Condition::NotIn { field, values } => write_in(out, field, values, true),
            Condition::Between { field, low, high } => {
                write_between(out, field, low, high, false)
            }
            Condition::NotBetween { field, low, high } => {
                write_between(out, field, low, high, true)
            }
            Condition::IsNull { field } => {
                out.sql.push_str(&format!("{} IS NULL", quote_identifier(field)));
            }
            Condition::IsNotNull { field } => {
                out.sql
                    .push_str(&format!("{} IS NOT NULL", quote_identifier(field)));
            }
            Condition::ColumnRef { field, op, other } => {
                out.sql.push_str(&format!(
                    "{} {} {}",
                    quote_identifier(field),
                    op,
                    quote_identifier(other)
                ));
            }
            Condition::And(members) => match members.as_slice() {
                [] => out.sql.push('1'),
                [only] => only.write(out),
                _ => {
                    for (i, member) in members.iter().enumerate() {
                        if i > 0 {
                            out.sql.push_str(" AND ");
                        }
                        member.write(out);
                    }
                }
            },
            Condition::Or(members) => match members.as_slice() {
                [] => out.sql.push('0'),
                [only] => only.write(out),
                _ => {
                    out.sql.push('(');
                    for (i, member) in members.iter().enumerate() {
                        if i > 0 {
                            out.sql.push_str(" OR ");
                        }
                        member.write_as_or_member(out);
                    }
                    out.sql.push(')');
                }
            },
        }
    }

    fn write_as_or_member(&self, out: &mut SqlFragment) {
        match self {
            Condition::And(members) if members.len() > 1 => {
                out.sql.push('(');
                self.write(out);
                out.sql.push(')');
            }
            _ => self.write(out),
        }
    }
}

fn write_in(out: &mut SqlFragment, field: &str, values: &[Value], negated: bool) {
    if values.is_empty() {
        // Nothing is IN an empty set; everything is NOT IN it
        out.sql.push(if negated { '1' } else { '0' });
        return;
    }

    let placeholders = vec!["?"; values.len()].join(", ");
    let keyword = if negated { "NOT IN" } else { "IN" };
    out.sql.push_str(&format!(
        "{} {keyword} ({placeholders})",
        quote_identifier(field)
    ));
    out.params.extend(values.iter().cloned().map(coerce));
}

fn write_between(out: &mut SqlFragment, field: &str, low: &Value, high: &Value, negated: bool) {
    let keyword = if negated { "NOT BETWEEN" } else { "BETWEEN" };
    out.sql.push_str(&format!(
        "{} {keyword} ? AND ?",
        quote_identifier(field)
    ));
    out.params.push(coerce(low.clone()));
    out.params.push(coerce(high.clone()));
}

/// Quote an identifier for MySQL. `a.b` becomes `` `a`.`b` `` and embedded backticks are doubled.
pub fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(".")
}
