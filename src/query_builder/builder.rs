use super::conditions::{quote_identifier, Condition, SqlFragment};
use super::dsl::parse_filter;
use super::pagination::Pagination;
use crate::database::value::coerce;
use crate::error::{KeelError, Result};
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// A complete statement ready for a [`Connection`](crate::database::Connection)
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn parse(direction: &str) -> Result<Self> {
        match direction.trim().to_ascii_uppercase().as_str() {
            "ASC" => Ok(Direction::Asc),
            "DESC" => Ok(Direction::Desc),
            other => Err(KeelError::InvalidInput(format!(
                "order direction must be ASC or DESC, got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Asc => f.write_str("ASC"),
            Direction::Desc => f.write_str("DESC"),
        }
    }
}

/// Aggregate functions available through [`QueryBuilder::build_aggregate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Min,
    Max,
    Sum,
    Avg,
}

impl Aggregate {
    fn as_sql(&self) -> &'static str {
        match self {
            Aggregate::Count => "COUNT",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
            Aggregate::Sum => "SUM",
            Aggregate::Avg => "AVG",
        }
    }
}

/// Alias under which aggregate results are returned
pub const AGGREGATE_ALIAS: &str = "aggregate";

/// Main query builder: holds the query state and compiles it to MySQL.
///
/// Building is pure; executing lives in [`crate::repository::Query`]. Order directions
/// are kept as given and validated when a statement is compiled.
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    table: String,
    select_fields: Vec<String>,
    filter: Option<Condition>,
    order_by: Vec<(String, String)>,
    limit: Option<u64>,
    offset: Option<u64>,
    lock: Option<bool>,
}

impl QueryBuilder {
    /// Create a new query builder for the given table
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Default::default()
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Set specific fields to select; empty selects `*`
    pub fn select(mut self, fields: &[&str]) -> Self {
        self.select_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// AND a condition onto the current filter
    pub fn where_condition(mut self, condition: Condition) -> Self {
        self.filter = Some(match self.filter.take() {
            None => condition,
            Some(Condition::And(mut members)) => {
                members.push(condition);
                Condition::And(members)
            }
            Some(existing) => Condition::And(vec![existing, condition]),
        });
        self
    }

    /// AND a DSL filter onto the current filter
    pub fn where_filter(self, filter: &Value) -> Result<Self> {
        Ok(match parse_filter(filter)? {
            Some(condition) => self.where_condition(condition),
            None => self,
        })
    }

    pub fn filter(&self) -> Option<&Condition> {
        self.filter.as_ref()
    }

    /// Add ORDER BY clause
    pub fn order_by(mut self, field: &str, direction: &str) -> Self {
        self.order_by.push((field.to_string(), direction.to_string()));
        self
    }

    pub fn order_asc(self, field: &str) -> Self {
        self.order_by(field, "ASC")
    }

    pub fn order_desc(self, field: &str) -> Self {
        self.order_by(field, "DESC")
    }

    pub fn has_order(&self) -> bool {
        !self.order_by.is_empty()
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn get_limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn get_offset(&self) -> Option<u64> {
        self.offset
    }

    /// Apply page-based pagination
    pub fn paginate(self, page: u64, per_page: u64) -> Self {
        let pagination = Pagination::new(page, per_page);
        self.limit(pagination.limit).offset(pagination.offset)
    }

    /// Add `FOR UPDATE`, optionally `SKIP LOCKED`
    pub fn lock_for_update(mut self, skip_locked: bool) -> Self {
        self.lock = Some(skip_locked);
        self
    }

    pub fn is_locking(&self) -> bool {
        self.lock.is_some()
    }

    fn where_sql(&self, sql: &mut String, params: &mut Vec<Value>) {
        if let Some(filter) = &self.filter {
            let SqlFragment {
                sql: fragment,
                params: fragment_params,
            } = filter.compile();
            sql.push_str(" WHERE ");
            sql.push_str(&fragment);
            params.extend(fragment_params);
        }
    }

    fn order_sql(&self, sql: &mut String) -> Result<()> {
        if self.order_by.is_empty() {
            return Ok(());
        }

        let terms = self
            .order_by
            .iter()
            .map(|(field, direction)| {
                Direction::parse(direction)
                    .map(|d| format!("{} {d}", quote_identifier(field)))
            })
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(" ORDER BY ");
        sql.push_str(&terms.join(", "));
        Ok(())
    }

    fn reject_offset(&self, statement: &str) -> Result<()> {
        match self.offset {
            Some(offset) if offset > 0 => Err(KeelError::UnsupportedOperation(format!(
                "OFFSET is not supported on {statement}"
            ))),
            _ => Ok(()),
        }
    }

    /// Compile the SELECT statement
    pub fn build_select(&self) -> Result<Statement> {
        let mut sql = String::from("SELECT ");
        let mut params = Vec::new();

        if self.select_fields.is_empty() {
            sql.push('*');
        } else {
            let fields: Vec<String> = self
                .select_fields
                .iter()
                .map(|f| quote_identifier(f))
                .collect();
            sql.push_str(&fields.join(", "));
        }

        sql.push_str(&format!(" FROM {}", quote_identifier(&self.table)));
        self.where_sql(&mut sql, &mut params);
        self.order_sql(&mut sql)?;

        match (self.limit, self.offset) {
            (Some(limit), offset) => {
                sql.push_str(&Pagination::limit_offset(limit, offset.unwrap_or(0)).to_sql())
            }
            (None, Some(offset)) if offset > 0 => {
                return Err(KeelError::UnsupportedOperation(
                    "OFFSET requires a LIMIT".to_string(),
                ))
            }
            (None, _) => {}
        }

        if let Some(skip_locked) = self.lock {
            sql.push_str(" FOR UPDATE");
            if skip_locked {
                sql.push_str(" SKIP LOCKED");
            }
        }

        debug!(sql = %sql, params = params.len(), "Compiled SELECT");
        Ok(Statement { sql, params })
    }

    /// Compile an aggregate over the filter; ordering, limits and locks are dropped.
    /// `column` may only be omitted for `COUNT`.
    pub fn build_aggregate(&self, aggregate: Aggregate, column: Option<&str>) -> Result<Statement> {
        let target = match (aggregate, column) {
            (_, Some(column)) => quote_identifier(column),
            (Aggregate::Count, None) => "*".to_string(),
            (other, None) => {
                return Err(KeelError::InvalidInput(format!(
                    "{} requires a column",
                    other.as_sql()
                )))
            }
        };

        let mut sql = format!(
            "SELECT {}({target}) AS {} FROM {}",
            aggregate.as_sql(),
            quote_identifier(AGGREGATE_ALIAS),
            quote_identifier(&self.table)
        );
        let mut params = Vec::new();
        self.where_sql(&mut sql, &mut params);

        debug!(sql = %sql, params = params.len(), "Compiled aggregate");
        Ok(Statement { sql, params })
    }

    /// Compile a bulk UPDATE of the matching rows
    pub fn build_update(&self, values: &IndexMap<String, Value>) -> Result<Statement> {
        self.reject_offset("UPDATE")?;
        if values.is_empty() {
            return Err(KeelError::InvalidInput(
                "UPDATE requires at least one column".to_string(),
            ));
        }

        let assignments: Vec<String> = values
            .keys()
            .map(|column| format!("{} = ?", quote_identifier(column)))
            .collect();
        let mut params: Vec<Value> = values.values().cloned().map(coerce).collect();

        let mut sql = format!(
            "UPDATE {} SET {}",
            quote_identifier(&self.table),
            assignments.join(", ")
        );
        self.where_sql(&mut sql, &mut params);
        self.order_sql(&mut sql)?;
        if let Some(limit) = self.limit {
            sql.push_str(&Pagination::limit_only(limit).to_sql());
        }

        debug!(sql = %sql, params = params.len(), "Compiled UPDATE");
        Ok(Statement { sql, params })
    }

    /// Compile a bulk DELETE of the matching rows
    pub fn build_delete(&self) -> Result<Statement> {
        self.reject_offset("DELETE")?;

        let mut sql = format!("DELETE FROM {}", quote_identifier(&self.table));
        let mut params = Vec::new();
        self.where_sql(&mut sql, &mut params);
        self.order_sql(&mut sql)?;
        if let Some(limit) = self.limit {
            sql.push_str(&Pagination::limit_only(limit).to_sql());
        }

        debug!(sql = %sql, params = params.len(), "Compiled DELETE");
        Ok(Statement { sql, params })
    }

    /// Compile a single-row INSERT; an empty map inserts all defaults
    pub fn build_insert(table: &str, values: &IndexMap<String, Value>) -> Statement {
        let columns: Vec<String> = values.keys().map(|c| quote_identifier(c)).collect();
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote_identifier(table),
            columns.join(", ")
        );
        let params = values.values().cloned().map(coerce).collect();

        debug!(sql = %sql, "Compiled INSERT");
        Statement { sql, params }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_query_building() {
        let statement = QueryBuilder::new("queue_jobs")
            .select(&["id", "queue_name"])
            .where_filter(&json!({"queue_name": "mail"}))
            .unwrap()
            .order_desc("available_at")
            .limit(10)
            .build_select()
            .unwrap();

        assert_eq!(
            statement.sql,
            "SELECT `id`, `queue_name` FROM `queue_jobs` WHERE `queue_name` = ? ORDER BY `available_at` DESC LIMIT 10"
        );
        assert_eq!(statement.params, vec![json!("mail")]);
    }

    #[test]
    fn test_offset_uses_mysql_limit_form() {
        let statement = QueryBuilder::new("t").limit(5).offset(20).build_select().unwrap();
        assert_eq!(statement.sql, "SELECT * FROM `t` LIMIT 20, 5");
    }

    #[test]
    fn test_offset_without_limit_is_rejected() {
        let err = QueryBuilder::new("t").offset(3).build_select().unwrap_err();
        assert!(matches!(err, KeelError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_lock_clauses() {
        let statement = QueryBuilder::new("t")
            .order_asc("id")
            .limit(1)
            .lock_for_update(true)
            .build_select()
            .unwrap();
        assert!(statement.sql.ends_with("LIMIT 1 FOR UPDATE SKIP LOCKED"));

        let statement = QueryBuilder::new("t")
            .lock_for_update(false)
            .build_select()
            .unwrap();
        assert!(statement.sql.ends_with("FOR UPDATE"));
    }

    #[test]
    fn test_invalid_direction_fails_at_compile() {
        let builder = QueryBuilder::new("t").order_by("id", "sideways");
        assert!(builder.build_select().is_err());
        assert!(builder.build_delete().is_err());
    }

    #[test]
    fn test_aggregate_ignores_order_limit_and_lock() {
        let statement = QueryBuilder::new("t")
            .where_filter(&json!({"a": 1}))
            .unwrap()
            .order_asc("id")
            .limit(3)
            .lock_for_update(true)
            .build_aggregate(Aggregate::Count, None)
            .unwrap();
        assert_eq!(
            statement.sql,
            "SELECT COUNT(*) AS `aggregate` FROM `t` WHERE `a` = ?"
        );
        assert!(QueryBuilder::new("t")
            .build_aggregate(Aggregate::Sum, None)
            .is_err());
    }

    #[test]
    fn test_update_params_precede_where_params() {
        let mut values = IndexMap::new();
        values.insert("name".to_string(), json!("x"));
        values.insert("active".to_string(), json!(true));

        let statement = QueryBuilder::new("t")
            .where_filter(&json!({"id": 4}))
            .unwrap()
            .order_asc("id")
            .limit(2)
            .build_update(&values)
            .unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE `t` SET `name` = ?, `active` = ? WHERE `id` = ? ORDER BY `id` ASC LIMIT 2"
        );
        assert_eq!(statement.params, vec![json!("x"), json!(1), json!(4)]);
    }

    #[test]
    fn test_offset_rejected_on_update_and_delete() {
        let builder = QueryBuilder::new("t").limit(1).offset(1);
        let mut values = IndexMap::new();
        values.insert("a".to_string(), json!(1));

        assert!(matches!(
            builder.build_update(&values),
            Err(KeelError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            builder.build_delete(),
            Err(KeelError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_insert_of_defaults() {
        let statement = QueryBuilder::build_insert("t", &IndexMap::new());
        assert_eq!(statement.sql, "INSERT INTO `t` () VALUES ()");
        assert!(statement.params.is_empty());
    }

    #[test]
    fn test_where_conditions_accumulate() {
        let statement = QueryBuilder::new("t")
            .where_filter(&json!({"a": 1}))
            .unwrap()
            .where_filter(&json!({"b": 2}))
            .unwrap()
            .where_filter(&json!({}))
            .unwrap()
            .build_select()
            .unwrap();
        assert_eq!(statement.sql, "SELECT * FROM `t` WHERE `a` = ? AND `b` = ?");
    }
}
