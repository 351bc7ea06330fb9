use indexmap::IndexMap;
use keel_core::error::KeelError;
use keel_core::query_builder::{Aggregate, CompareOp, Condition, QueryBuilder, UNBOUNDED_LIMIT};
use serde_json::json;

#[test]
fn test_select_with_filter_order_and_page() {
    let statement = QueryBuilder::new("widgets")
        .where_filter(&json!({"active": true, "score": [">", 3]}))
        .unwrap()
        .order_desc("score")
        .order_asc("id")
        .paginate(2, 10)
        .build_select()
        .unwrap();

    assert_eq!(
        statement.sql,
        "SELECT * FROM `widgets` WHERE `active` = ? AND `score` > ? \
         ORDER BY `score` DESC, `id` ASC LIMIT 10, 10"
    );
    assert_eq!(statement.params, vec![json!(1), json!(3)]);
}

#[test]
fn test_unbounded_limit_with_offset() {
    let statement = QueryBuilder::new("widgets")
        .limit(UNBOUNDED_LIMIT)
        .offset(4)
        .build_select()
        .unwrap();
    assert_eq!(
        statement.sql,
        "SELECT * FROM `widgets` LIMIT 4, 18446744073709551615"
    );
}

#[test]
fn test_skip_locked_reservation_query() {
    let statement = QueryBuilder::new("queue_jobs")
        .where_condition(Condition::equals("queue_name", "mail"))
        .where_condition(Condition::column_ref("attempts", CompareOp::Lt, "max_attempts"))
        .order_asc("available_at")
        .order_asc("id")
        .limit(1)
        .lock_for_update(true)
        .build_select()
        .unwrap();

    assert_eq!(
        statement.sql,
        "SELECT * FROM `queue_jobs` WHERE `queue_name` = ? AND `attempts` < `max_attempts` \
         ORDER BY `available_at` ASC, `id` ASC LIMIT 1 FOR UPDATE SKIP LOCKED"
    );
    assert_eq!(statement.params, vec![json!("mail")]);
}

#[test]
fn test_aggregate_functions() {
    let builder = QueryBuilder::new("widgets")
        .where_filter(&json!({"category": "tools"}))
        .unwrap();

    let statement = builder.build_aggregate(Aggregate::Avg, Some("score")).unwrap();
    assert_eq!(
        statement.sql,
        "SELECT AVG(`score`) AS `aggregate` FROM `widgets` WHERE `category` = ?"
    );

    let statement = builder.build_aggregate(Aggregate::Count, Some("name")).unwrap();
    assert!(statement.sql.starts_with("SELECT COUNT(`name`)"));

    assert!(matches!(
        builder.build_aggregate(Aggregate::Max, None),
        Err(KeelError::InvalidInput(_))
    ));
}

#[test]
fn test_update_and_delete_without_filter() {
    let mut values = IndexMap::new();
    values.insert("active".to_string(), json!(false));

    let statement = QueryBuilder::new("widgets").build_update(&values).unwrap();
    assert_eq!(statement.sql, "UPDATE `widgets` SET `active` = ?");
    assert_eq!(statement.params, vec![json!(0)]);

    let statement = QueryBuilder::new("widgets").build_delete().unwrap();
    assert_eq!(statement.sql, "DELETE FROM `widgets`");

    assert!(QueryBuilder::new("widgets")
        .build_update(&IndexMap::new())
        .is_err());
}

#[test]
fn test_insert_preserves_column_order() {
    let mut values = IndexMap::new();
    values.insert("name".to_string(), json!("gear"));
    values.insert("score".to_string(), json!(4));
    values.insert("active".to_string(), json!(true));

    let statement = QueryBuilder::build_insert("widgets", &values);
    assert_eq!(
        statement.sql,
        "INSERT INTO `widgets` (`name`, `score`, `active`) VALUES (?, ?, ?)"
    );
    assert_eq!(statement.params, vec![json!("gear"), json!(4), json!(1)]);
}

#[test]
fn test_malformed_filter_propagates() {
    let result = QueryBuilder::new("widgets").where_filter(&json!({"score": ["~", 1]}));
    assert!(matches!(result, Err(KeelError::MalformedFilter(_))));
}

#[test]
fn test_or_filter_merged_with_condition() {
    let statement = QueryBuilder::new("widgets")
        .where_filter(&json!({"OR": [{"name": "a"}, {"name": "b"}]}))
        .unwrap()
        .where_condition(Condition::is_null("category"))
        .build_select()
        .unwrap();
    assert_eq!(
        statement.sql,
        "SELECT * FROM `widgets` WHERE (`name` = ? OR `name` = ?) AND `category` IS NULL"
    );
}
