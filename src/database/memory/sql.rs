//! Lowering and evaluation for the SQL subset emitted by the query builder.
//!
//! Statements are parsed with `sqlparser` under the MySQL dialect and lowered into a small
//! plan the engine can run. Placeholders are bound left to right during lowering, so a
//! placeholder/parameter mismatch is caught before anything executes.

use crate::database::value::{as_f64, coerce_ref};
use crate::error::{KeelError, Result};
use serde_json::Value;
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, FromTable, FunctionArg, FunctionArgExpr,
    FunctionArguments, LimitClause, LockType, NonBlock, ObjectName, ObjectNamePart,
    OrderByExpr, OrderByKind, SelectItem, SetExpr, TableFactor, TableObject, TableWithJoins,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AggregateFunc {
    Count,
    Min,
    Max,
    Sum,
    Avg,
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Projection {
    All,
    Columns(Vec<String>),
    Aggregate {
        func: AggregateFunc,
        column: Option<String>,
        alias: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct OrderTerm {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Statement {
    Select {
        projection: Projection,
        table: String,
        filter: Option<Expr>,
        order: Vec<OrderTerm>,
        offset: u64,
        limit: Option<u64>,
        lock: Option<bool>,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Value)>,
        filter: Option<Expr>,
        order: Vec<OrderTerm>,
        limit: Option<u64>,
    },
    Delete {
        table: String,
        filter: Option<Expr>,
        order: Vec<OrderTerm>,
        limit: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CmpOp {
    Eq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Operand {
    Value(Value),
    Column(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Expr {
    Literal(bool),
    Compare {
        column: String,
        op: CmpOp,
        rhs: Operand,
    },
    Like {
        column: String,
        pattern: Value,
        negated: bool,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    In {
        column: String,
        values: Vec<Value>,
        negated: bool,
    },
    Between {
        column: String,
        low: Value,
        high: Value,
        negated: bool,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Every column the expression reads
    pub fn columns(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Compare { column, rhs, .. } => {
                out.push(column.clone());
                if let Operand::Column(other) = rhs {
                    out.push(other.clone());
                }
            }
            Expr::Like { column, .. }
            | Expr::IsNull { column, .. }
            | Expr::In { column, .. }
            | Expr::Between { column, .. } => out.push(column.clone()),
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.columns(out);
                r.columns(out);
            }
        }
    }

    /// Evaluate against a row; comparisons involving NULL are false
    pub fn matches(&self, lookup: &dyn Fn(&str) -> Value) -> bool {
        match self {
            Expr::Literal(b) => *b,
            Expr::Compare { column, op, rhs } => {
                let left = lookup(column);
                let right = match rhs {
                    Operand::Value(v) => v.clone(),
                    Operand::Column(other) => lookup(other),
                };
                match compare(&left, &right) {
                    None => false,
                    Some(ord) => match op {
                        CmpOp::Eq => ord == Ordering::Equal,
                        CmpOp::NotEq => ord != Ordering::Equal,
                        CmpOp::Lt => ord == Ordering::Less,
                        CmpOp::Gt => ord == Ordering::Greater,
                        CmpOp::Le => ord != Ordering::Greater,
                        CmpOp::Ge => ord != Ordering::Less,
                    },
                }
            }
            Expr::Like {
                column,
                pattern,
                negated,
            } => match (lookup(column), pattern) {
                (Value::Null, _) | (_, Value::Null) => false,
                (value, pattern) => {
                    like(&render(&value), &render(pattern)) != *negated
                }
            },
            Expr::IsNull { column, negated } => lookup(column).is_null() != *negated,
            Expr::In {
                column,
                values,
                negated,
            } => {
                let value = lookup(column);
                if value.is_null() {
                    return false;
                }
                let found = values
                    .iter()
                    .any(|v| compare(&value, v) == Some(Ordering::Equal));
                found != *negated
            }
            Expr::Between {
                column,
                low,
                high,
                negated,
            } => {
                let value = lookup(column);
                match (compare(&value, low), compare(&value, high)) {
                    (Some(lo), Some(hi)) => {
                        let inside = lo != Ordering::Less && hi != Ordering::Greater;
                        inside != *negated
                    }
                    _ => false,
                }
            }
            Expr::And(l, r) => l.matches(lookup) && r.matches(lookup),
            Expr::Or(l, r) => l.matches(lookup) || r.matches(lookup),
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// SQL comparison; `None` when either side is NULL
pub(super) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::String(x), Value::String(y)) => Some(x.to_lowercase().cmp(&y.to_lowercase())),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => Some(render(a).cmp(&render(b))),
        },
    }
}

/// Ordering for ORDER BY: NULL sorts first
pub(super) fn sort_key_cmp(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => compare(a, b).unwrap_or(Ordering::Equal),
    }
}

/// Case-insensitive LIKE with `%`, `_` and backslash escapes
fn like(value: &str, pattern: &str) -> bool {
    let value: Vec<char> = value.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    like_at(&value, &pattern)
}

fn like_at(value: &[char], pattern: &[char]) -> bool {
    match pattern.split_first() {
        None => value.is_empty(),
        Some(('%', rest)) => (0..=value.len()).any(|skip| like_at(&value[skip..], rest)),
        Some(('_', rest)) => !value.is_empty() && like_at(&value[1..], rest),
        Some(('\\', rest)) if !rest.is_empty() => {
            value.first() == Some(&rest[0]) && like_at(&value[1..], &rest[1..])
        }
        Some((c, rest)) => value.first() == Some(c) && like_at(&value[1..], rest),
    }
}

fn syntax(detail: &str) -> KeelError {
    KeelError::DatabaseError(format!("You have an error in your SQL syntax: {detail}"))
}

/// Parse one statement, binding `params` to its placeholders in order
pub(super) fn parse(sql: &str, params: &[Value]) -> Result<Statement> {
    let mut statements =
        Parser::parse_sql(&MySqlDialect {}, sql).map_err(|e| syntax(&e.to_string()))?;
    if statements.len() != 1 {
        return Err(syntax(&format!(
            "expected one statement, found {}",
            statements.len()
        )));
    }

    let mut binder = Binder { params, next: 0 };
    let statement = match statements.remove(0) {
        ast::Statement::Query(query) => binder.select(&query)?,
        ast::Statement::Insert(insert) => binder.insert(&insert)?,
        ast::Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => binder.update(&table, &assignments, selection.as_ref())?,
        ast::Statement::Delete(delete) => binder.delete(&delete)?,
        other => return Err(syntax(&format!("unsupported statement: {other}"))),
    };

    if binder.next != params.len() {
        return Err(KeelError::DatabaseError(format!(
            "Incorrect arguments to mysqld_stmt_execute: {} placeholders, {} parameters",
            binder.next,
            params.len()
        )));
    }
    Ok(statement)
}

/// Last segment of a possibly qualified name
fn object_name(name: &ObjectName) -> Result<String> {
    match name.0.last() {
        Some(ObjectNamePart::Identifier(ident)) => Ok(ident.value.clone()),
        _ => Err(syntax(&format!("unsupported name {name}"))),
    }
}

fn single_table(from: &[TableWithJoins]) -> Result<String> {
    match from {
        [source] if source.joins.is_empty() => match &source.relation {
            TableFactor::Table { name, .. } => object_name(name),
            other => Err(syntax(&format!("unsupported table reference {other}"))),
        },
        _ => Err(syntax("expected exactly one table")),
    }
}

/// `col` or `table`.`col`; the qualifier is dropped
fn column_name(expr: &ast::Expr) -> Result<String> {
    match expr {
        ast::Expr::Identifier(ident) => Ok(ident.value.clone()),
        ast::Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|ident| ident.value.clone())
            .ok_or_else(|| syntax("empty identifier")),
        other => Err(syntax(&format!("expected a column, found {other}"))),
    }
}

fn row_count(expr: &ast::Expr) -> Result<u64> {
    if let ast::Expr::Value(v) = expr {
        if let ast::Value::Number(n, _) = &v.value {
            if let Ok(n) = n.parse::<u64>() {
                return Ok(n);
            }
        }
    }
    Err(syntax(&format!("expected a row count, found {expr}")))
}

fn number(text: &str) -> Result<Value> {
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Value::from(n));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| syntax(&format!("invalid number {text}")))
}

fn order_terms(terms: &[OrderByExpr]) -> Result<Vec<OrderTerm>> {
    terms
        .iter()
        .map(|term| {
            Ok(OrderTerm {
                column: column_name(&term.expr)?,
                descending: term.options.asc == Some(false),
            })
        })
        .collect()
}

fn projection(items: &[SelectItem]) -> Result<Projection> {
    match items {
        [SelectItem::Wildcard(_)] => return Ok(Projection::All),
        [SelectItem::ExprWithAlias {
            expr: ast::Expr::Function(function),
            alias,
        }] => return aggregate(function, alias.value.clone()),
        [SelectItem::UnnamedExpr(ast::Expr::Function(function))] => {
            return aggregate(function, "aggregate".to_string())
        }
        _ => {}
    }

    items
        .iter()
        .map(|item| match item {
            SelectItem::UnnamedExpr(expr) => column_name(expr),
            other => Err(syntax(&format!("unsupported select item {other}"))),
        })
        .collect::<Result<Vec<_>>>()
        .map(Projection::Columns)
}

fn aggregate(function: &ast::Function, alias: String) -> Result<Projection> {
    let name = object_name(&function.name)?;
    let func = match name.to_ascii_uppercase().as_str() {
        "COUNT" => AggregateFunc::Count,
        "MIN" => AggregateFunc::Min,
        "MAX" => AggregateFunc::Max,
        "SUM" => AggregateFunc::Sum,
        "AVG" => AggregateFunc::Avg,
        _ => return Err(syntax(&format!("unsupported function {name}"))),
    };

    let FunctionArguments::List(list) = &function.args else {
        return Err(syntax(&format!("{name} expects one argument")));
    };
    let column = match list.args.as_slice() {
        [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] => None,
        [FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))] => Some(column_name(expr)?),
        _ => return Err(syntax(&format!("{name} expects one argument"))),
    };

    Ok(Projection::Aggregate {
        func,
        column,
        alias,
    })
}

/// Walks the AST in source order, consuming one parameter per placeholder
struct Binder<'a> {
    params: &'a [Value],
    next: usize,
}

impl Binder<'_> {
    fn scalar(&mut self, expr: &ast::Expr) -> Result<Value> {
        let ast::Expr::Value(v) = expr else {
            return Err(syntax(&format!("expected a value, found {expr}")));
        };
        match &v.value {
            ast::Value::Placeholder(_) => {
                let value = self.params.get(self.next).ok_or_else(|| {
                    KeelError::DatabaseError(
                        "Incorrect arguments to mysqld_stmt_execute".to_string(),
                    )
                })?;
                self.next += 1;
                Ok(coerce_ref(value))
            }
            ast::Value::Number(n, _) => number(n),
            ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
                Ok(Value::from(s.as_str()))
            }
            ast::Value::Boolean(b) => Ok(Value::from(i64::from(*b))),
            ast::Value::Null => Ok(Value::Null),
            other => Err(syntax(&format!("unsupported literal {other}"))),
        }
    }

    fn filter(&mut self, selection: Option<&ast::Expr>) -> Result<Option<Expr>> {
        selection.map(|expr| self.predicate(expr)).transpose()
    }

    fn predicate(&mut self, expr: &ast::Expr) -> Result<Expr> {
        match expr {
            ast::Expr::Nested(inner) => self.predicate(inner),
            ast::Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                let left = self.predicate(left)?;
                let right = self.predicate(right)?;
                Ok(Expr::And(Box::new(left), Box::new(right)))
            }
            ast::Expr::BinaryOp {
                left,
                op: BinaryOperator::Or,
                right,
            } => {
                let left = self.predicate(left)?;
                let right = self.predicate(right)?;
                Ok(Expr::Or(Box::new(left), Box::new(right)))
            }
            ast::Expr::BinaryOp { left, op, right } => {
                let op = match op {
                    BinaryOperator::Eq => CmpOp::Eq,
                    BinaryOperator::NotEq => CmpOp::NotEq,
                    BinaryOperator::Lt => CmpOp::Lt,
                    BinaryOperator::Gt => CmpOp::Gt,
                    BinaryOperator::LtEq => CmpOp::Le,
                    BinaryOperator::GtEq => CmpOp::Ge,
                    other => return Err(syntax(&format!("unsupported operator {other}"))),
                };
                let column = column_name(left)?;
                let rhs = match right.as_ref() {
                    ast::Expr::Identifier(_) | ast::Expr::CompoundIdentifier(_) => {
                        Operand::Column(column_name(right)?)
                    }
                    value => Operand::Value(self.scalar(value)?),
                };
                Ok(Expr::Compare { column, op, rhs })
            }
            ast::Expr::IsNull(inner) => Ok(Expr::IsNull {
                column: column_name(inner)?,
                negated: false,
            }),
            ast::Expr::IsNotNull(inner) => Ok(Expr::IsNull {
                column: column_name(inner)?,
                negated: true,
            }),
            ast::Expr::InList {
                expr,
                list,
                negated,
            } => {
                let column = column_name(expr)?;
                let values = list
                    .iter()
                    .map(|item| self.scalar(item))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::In {
                    column,
                    values,
                    negated: *negated,
                })
            }
            ast::Expr::Between {
                expr,
                negated,
                low,
                high,
            } => {
                let column = column_name(expr)?;
                let low = self.scalar(low)?;
                let high = self.scalar(high)?;
                Ok(Expr::Between {
                    column,
                    low,
                    high,
                    negated: *negated,
                })
            }
            ast::Expr::Like {
                negated,
                expr,
                pattern,
                ..
            } => {
                let column = column_name(expr)?;
                let pattern = self.scalar(pattern)?;
                Ok(Expr::Like {
                    column,
                    pattern,
                    negated: *negated,
                })
            }
            ast::Expr::Value(v) => match &v.value {
                ast::Value::Number(n, _) => Ok(Expr::Literal(n.as_str() != "0")),
                ast::Value::Boolean(b) => Ok(Expr::Literal(*b)),
                other => Err(syntax(&format!("unsupported condition {other}"))),
            },
            other => Err(syntax(&format!("unsupported condition {other}"))),
        }
    }

    fn select(&mut self, query: &ast::Query) -> Result<Statement> {
        let select = query
            .body
            .as_select()
            .ok_or_else(|| syntax("expected a plain SELECT"))?;
        let table = single_table(&select.from)?;
        let projection = projection(&select.projection)?;
        let filter = self.filter(select.selection.as_ref())?;

        let order = match &query.order_by {
            None => Vec::new(),
            Some(order_by) => match &order_by.kind {
                OrderByKind::Expressions(terms) => order_terms(terms)?,
                OrderByKind::All(_) => return Err(syntax("ORDER BY ALL is not supported")),
            },
        };

        let (offset, limit) = match &query.limit_clause {
            None => (0, None),
            Some(LimitClause::OffsetCommaLimit { offset, limit }) => {
                (row_count(offset)?, Some(row_count(limit)?))
            }
            Some(LimitClause::LimitOffset { limit, offset, .. }) => (
                offset
                    .as_ref()
                    .map(|o| row_count(&o.value))
                    .transpose()?
                    .unwrap_or(0),
                limit.as_ref().map(row_count).transpose()?,
            ),
        };

        let lock = match query.locks.as_slice() {
            [] => None,
            [clause] if matches!(clause.lock_type, LockType::Update) => {
                Some(matches!(clause.nonblock, Some(NonBlock::SkipLocked)))
            }
            _ => return Err(syntax("unsupported locking clause")),
        };

        Ok(Statement::Select {
            projection,
            table,
            filter,
            order,
            offset,
            limit,
            lock,
        })
    }

    fn insert(&mut self, insert: &ast::Insert) -> Result<Statement> {
        let TableObject::TableName(name) = &insert.table else {
            return Err(syntax("unsupported INSERT target"));
        };
        let table = object_name(name)?;
        let columns: Vec<String> = insert.columns.iter().map(|c| c.value.clone()).collect();

        let rows = match insert.source.as_deref().map(|source| source.body.as_ref()) {
            Some(SetExpr::Values(values)) => &values.rows,
            _ => return Err(syntax("expected INSERT ... VALUES")),
        };
        let [row] = rows.as_slice() else {
            return Err(syntax("expected a single VALUES row"));
        };
        let values = row
            .iter()
            .map(|expr| self.scalar(expr))
            .collect::<Result<Vec<_>>>()?;

        if columns.len() != values.len() {
            return Err(KeelError::DatabaseError(
                "Column count doesn't match value count".to_string(),
            ));
        }

        Ok(Statement::Insert {
            table,
            columns,
            values,
        })
    }

    fn update(
        &mut self,
        table: &TableWithJoins,
        assignments: &[ast::Assignment],
        selection: Option<&ast::Expr>,
    ) -> Result<Statement> {
        let table = single_table(std::slice::from_ref(table))?;

        let mut set = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let AssignmentTarget::ColumnName(name) = &assignment.target else {
                return Err(syntax("tuple assignments are not supported"));
            };
            set.push((object_name(name)?, self.scalar(&assignment.value)?));
        }
        let filter = self.filter(selection)?;

        Ok(Statement::Update {
            table,
            assignments: set,
            filter,
            order: Vec::new(),
            limit: None,
        })
    }

    fn delete(&mut self, delete: &ast::Delete) -> Result<Statement> {
        let (FromTable::WithFromKeyword(from) | FromTable::WithoutKeyword(from)) = &delete.from;
        let table = single_table(from)?;
        let filter = self.filter(delete.selection.as_ref())?;

        Ok(Statement::Delete {
            table,
            filter,
            order: order_terms(&delete.order_by)?,
            limit: delete.limit.as_ref().map(row_count).transpose()?,
        })
    }
}
