use keel_core::error::KeelError;
use keel_core::query_builder::{compile_filter, parse_filter, CompareOp, Condition};
use serde_json::json;

fn compile(filter: serde_json::Value) -> (String, Vec<serde_json::Value>) {
    let fragment = compile_filter(&filter).unwrap();
    (fragment.sql, fragment.params)
}

#[test]
fn test_scalar_equality() {
    assert_eq!(
        compile(json!({"status": "active"})),
        ("`status` = ?".to_string(), vec![json!("active")])
    );
}

#[test]
fn test_boolean_false_is_bound_not_dropped() {
    let (sql, params) = compile(json!({"key1": false, "key2": true}));
    assert_eq!(sql, "`key1` = ? AND `key2` = ?");
    assert_eq!(params, vec![json!(0), json!(1)]);
}

#[test]
fn test_dotted_fields_are_quoted_per_segment() {
    let (sql, _) = compile(json!({"jobs.queue_name": "mail"}));
    assert_eq!(sql, "`jobs`.`queue_name` = ?");
}

#[test]
fn test_reservation_filter_shape() {
    let (sql, params) = compile(json!({
        "queue_name": "mail",
        "available_at": ["<=", 100],
        "completed_at": null,
        "OR": [
            {"reserved_at": null, "attempts": ["<", {"column": "max_attempts"}]},
            {"reserved_at": ["<", 40]}
        ]
    }));

    assert_eq!(
        sql,
        "`queue_name` = ? AND `available_at` <= ? AND `completed_at` IS NULL AND \
         ((`reserved_at` IS NULL AND `attempts` < `max_attempts`) OR `reserved_at` < ?)"
    );
    assert_eq!(params, vec![json!("mail"), json!(100), json!(40)]);
}

#[test]
fn test_not_between_and_not_in() {
    let (sql, params) = compile(json!({
        "score": ["NOT BETWEEN", 1, 5],
        "id": ["NOT IN", [7, 8]]
    }));
    assert_eq!(sql, "`score` NOT BETWEEN ? AND ? AND `id` NOT IN (?, ?)");
    assert_eq!(params, vec![json!(1), json!(5), json!(7), json!(8)]);
}

#[test]
fn test_empty_in_matches_nothing() {
    assert_eq!(compile(json!({"id": ["IN", []]})), ("0".to_string(), vec![]));
}

#[test]
fn test_and_object_and_or_object_groups() {
    let (sql, params) = compile(json!({
        "AND": {"a": 1, "b": ["!=", 2]},
        "OR": {"c": 3, "d": null}
    }));
    assert_eq!(sql, "`a` = ? AND `b` != ? AND (`c` = ? OR `d` IS NULL)");
    assert_eq!(params, vec![json!(1), json!(2), json!(3)]);
}

#[test]
fn test_group_keys_are_case_insensitive() {
    let (sql, _) = compile(json!({"or": [{"a": 1}, {"b": 2}]}));
    assert_eq!(sql, "(`a` = ? OR `b` = ?)");
}

#[test]
fn test_parse_filter_yields_condition_tree() {
    let condition = parse_filter(&json!({"age": [">", 18]})).unwrap();
    assert_eq!(condition, Some(Condition::compare("age", CompareOp::Gt, 18)));
    assert_eq!(parse_filter(&json!({})).unwrap(), None);
}

#[test]
fn test_non_object_filters_are_malformed() {
    for filter in [json!(null), json!(false), json!("a = 1"), json!([{"a": 1}])] {
        assert!(
            matches!(compile_filter(&filter), Err(KeelError::MalformedFilter(_))),
            "{filter} should be rejected"
        );
    }
}

#[test]
fn test_compilation_is_pure() {
    let filter = json!({"a": ["IN", [1, 2]], "OR": [{"b": null}, {"c": ["LIKE", "x%"]}]});
    let first = compile_filter(&filter).unwrap();
    let second = compile_filter(&filter).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.placeholder_count(), first.params.len());
}

#[test]
fn test_empty_filter_and_empty_or_group() {
    assert_eq!(compile(json!({})), (String::new(), vec![]));
    assert_eq!(compile(json!({"OR": {}})), ("0".to_string(), vec![]));
}
