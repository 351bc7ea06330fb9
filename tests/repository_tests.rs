//! Repository behavior against the in-memory engine: identity, dirty tracking,
//! reads, bulk operations and failures.

mod common;

use common::{seed_widgets, widget_db, widget_repo, Widget, WIDGET_CREATED_AT};
use indexmap::IndexMap;
use keel_core::database::Connection;
use keel_core::error::KeelError;
use keel_core::models::Record;
use serde_json::{json, Value};
use std::ops::ControlFlow;

#[tokio::test]
async fn test_save_new_record_assigns_identity() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);

    let mut widget = repo.create_record(Widget::named("gear", 5));
    assert!(widget.is_new());
    assert_eq!(widget.id(), None);

    assert!(repo.save(&mut widget).await.unwrap());

    assert!(!widget.is_new());
    assert_eq!(widget.id(), Some(1));
    assert_eq!(widget.category.as_deref(), Some("general"));
    assert_eq!(widget.created_at.as_deref(), Some(WIDGET_CREATED_AT));
    assert_eq!(widget.original_values(), &widget.current_values());
    assert!(!widget.is_dirty());
}

#[tokio::test]
async fn test_save_with_explicit_id() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);

    let mut widget = repo.create_record(Widget::named("sprocket", 1));
    widget.set_id(40).unwrap();
    repo.save(&mut widget).await.unwrap();

    assert_eq!(widget.id(), Some(40));
    assert!(repo.exists(40).await.unwrap());
    assert!(matches!(widget.set_id(41), Err(KeelError::InvalidState(_))));
}

#[tokio::test]
async fn test_update_writes_only_dirty_fields() {
    let db = widget_db();
    let (repo, connection) = widget_repo(&db);
    let mut widget = seed_widgets(&repo, 1).await.remove(0);
    connection.clear_statements();

    widget.score = 42;
    assert_eq!(
        widget.dirty_fields().keys().collect::<Vec<_>>(),
        vec!["score"]
    );

    assert!(repo.save(&mut widget).await.unwrap());
    let statements = connection.statements();
    assert_eq!(statements.len(), 1);
    assert_eq!(
        statements[0].sql,
        "UPDATE `widgets` SET `score` = ? WHERE `id` = ?"
    );
    assert_eq!(statements[0].params, vec![json!(42), json!(1)]);

    // Nothing changed since the last save: no statement at all
    assert!(!repo.save(&mut widget).await.unwrap());
    assert_eq!(connection.statement_count(), 1);

    let reloaded = repo.find_by_id(1).await.unwrap().unwrap();
    assert_eq!(reloaded.score, 42);
    assert_eq!(reloaded.name.as_deref(), Some("widget-1"));
}

#[tokio::test]
async fn test_reverting_a_change_is_not_dirty() {
    let db = widget_db();
    let (repo, connection) = widget_repo(&db);
    let mut widget = seed_widgets(&repo, 1).await.remove(0);
    connection.clear_statements();

    widget.name = Some("renamed".to_string());
    widget.name = Some("widget-1".to_string());
    assert!(!repo.save(&mut widget).await.unwrap());
    assert_eq!(connection.statement_count(), 0);
}

#[tokio::test]
async fn test_narrow_projection_save_keeps_unselected_columns() {
    let db = widget_db();
    let (repo, connection) = widget_repo(&db);
    seed_widgets(&repo, 1).await;

    let mut partial = repo
        .query(&json!({"id": 1}))
        .unwrap()
        .select(&["id", "score"])
        .first()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(partial.name, None);

    partial.score = 9;
    connection.clear_statements();
    repo.save(&mut partial).await.unwrap();

    assert_eq!(
        connection.statements()[0].sql,
        "UPDATE `widgets` SET `score` = ? WHERE `id` = ?"
    );
    let stored = repo.find_by_id(1).await.unwrap().unwrap();
    assert_eq!(stored.name.as_deref(), Some("widget-1"));
    assert!(stored.active);
    assert_eq!(stored.score, 9);
}

#[tokio::test]
async fn test_narrow_projection_set_writes_default_values() {
    let db = widget_db();
    let (repo, connection) = widget_repo(&db);
    seed_widgets(&repo, 1).await;

    let mut partial = repo
        .query(&json!({"id": 1}))
        .unwrap()
        .select(&["id", "name"])
        .first()
        .await
        .unwrap()
        .unwrap();

    partial.set("score", json!(0)).unwrap();
    partial.set("active", json!(false)).unwrap();
    connection.clear_statements();
    assert!(repo.save(&mut partial).await.unwrap());

    assert_eq!(
        connection.statements()[0].sql,
        "UPDATE `widgets` SET `score` = ?, `active` = ? WHERE `id` = ?"
    );
    let stored = repo.find_by_id(1).await.unwrap().unwrap();
    assert_eq!(stored.score, 0);
    assert!(!stored.active);
    assert_eq!(stored.name.as_deref(), Some("widget-1"));
    assert!(!repo.save(&mut partial).await.unwrap());
}

#[tokio::test]
async fn test_find_one() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);
    seed_widgets(&repo, 3).await;

    let found = repo.find_one(&json!({"name": "widget-2"})).await.unwrap();
    assert_eq!(found.and_then(|w| w.id()), Some(2));

    assert!(repo
        .find_one(&json!({"name": "missing"}))
        .await
        .unwrap()
        .is_none());

    match repo.find_one(&json!({"active": true})).await {
        Err(KeelError::NonUniqueResult { entity, count }) => {
            assert_eq!(entity, "Widget");
            assert_eq!(count, 2);
        }
        other => panic!("expected NonUniqueResult, got {other:?}"),
    }
}

#[tokio::test]
async fn test_find_many_limits_and_ordering() {
    let db = widget_db();
    let (repo, connection) = widget_repo(&db);
    seed_widgets(&repo, 5).await;

    let top = repo
        .find_many(0, 2, &json!({}), &[("score", "desc")])
        .await
        .unwrap();
    assert_eq!(top.iter().map(|w| w.score).collect::<Vec<_>>(), vec![5, 4]);

    connection.clear_statements();
    let tail = repo
        .find_many(3, -1, &json!({}), &[("id", "ASC")])
        .await
        .unwrap();
    assert_eq!(
        tail.iter().filter_map(Record::id).collect::<Vec<_>>(),
        vec![4, 5]
    );
    assert!(connection.statements()[0]
        .sql
        .ends_with("LIMIT 3, 18446744073709551615"));

    let all = repo.find_many(0, -1, &json!({}), &[]).await.unwrap();
    assert_eq!(all.len(), 5);

    assert!(matches!(
        repo.find_many(0, -2, &json!({}), &[]).await,
        Err(KeelError::InvalidInput(_))
    ));
    assert!(matches!(
        repo.find_many(0, 1, &json!({}), &[("id", "up")]).await,
        Err(KeelError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_exists_and_count() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);
    seed_widgets(&repo, 4).await;

    assert!(repo.exists(3).await.unwrap());
    assert!(!repo.exists(30).await.unwrap());
    assert_eq!(repo.count(&json!({})).await.unwrap(), 4);
    assert_eq!(repo.count(&json!({"score": ["BETWEEN", 2, 3]})).await.unwrap(), 2);
    assert_eq!(repo.count(&json!({"id": ["IN", []]})).await.unwrap(), 0);
    assert_eq!(repo.count(&json!({"OR": []})).await.unwrap(), 0);
}

#[tokio::test]
async fn test_create_reads_back_database_defaults() {
    let db = widget_db();
    let (repo, connection) = widget_repo(&db);

    let created = repo.create(IndexMap::new()).await.unwrap();
    assert_eq!(
        connection.statements()[0].sql,
        "INSERT INTO `widgets` () VALUES ()"
    );
    assert_eq!(created.id(), Some(1));
    assert_eq!(created.name, None);
    assert_eq!(created.score, 0);
    assert!(created.active);
    assert_eq!(created.category.as_deref(), Some("general"));

    let mut fields = IndexMap::new();
    fields.insert("name".to_string(), json!("bolt"));
    fields.insert("active".to_string(), json!(false));
    let created = repo.create(fields).await.unwrap();
    assert_eq!(created.name.as_deref(), Some("bolt"));
    assert!(!created.active);
    assert!(!created.is_new());
}

#[tokio::test]
async fn test_create_failures_become_persist_failed() {
    let db = widget_db();
    let (repo, connection) = widget_repo(&db);

    connection.fail_when("INSERT", "Deadlock found when trying to get lock");
    assert!(matches!(
        repo.create(IndexMap::new()).await,
        Err(KeelError::PersistFailed { .. })
    ));
    assert!(db.rows("widgets").is_empty());

    connection.fail_when("SELECT", "MySQL server has gone away");
    let err = repo.create(IndexMap::new()).await.unwrap_err();
    assert!(matches!(err, KeelError::PersistFailed { ref entity, .. } if entity == "Widget"));
    assert!(err.to_string().contains("gone away"));
    assert_eq!(connection.last_error().as_deref(), Some("MySQL server has gone away"));
}

#[tokio::test]
async fn test_unknown_column_surfaces_as_database_error() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);

    let err = repo.count(&json!({"colour": "red"})).await.unwrap_err();
    assert!(matches!(err, KeelError::DatabaseError(ref m) if m.contains("colour")));
}

#[tokio::test]
async fn test_delete() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);
    let widgets = seed_widgets(&repo, 2).await;

    repo.delete(&widgets[0]).await.unwrap();
    assert!(!repo.exists(1).await.unwrap());
    assert!(repo.exists(2).await.unwrap());

    // Deleting again is not an error, it just matches nothing
    repo.delete(&widgets[0]).await.unwrap();

    let unsaved = repo.create_record(Widget::named("draft", 0));
    assert!(matches!(
        repo.delete(&unsaved).await,
        Err(KeelError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_hydrate_with_prefix() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);

    let row = serde_json::from_value(json!({
        "w_id": 7,
        "w_name": "joined",
        "w_score": "12",
        "other_id": 99
    }))
    .unwrap();
    let widget = repo.hydrate(&row, Some("w_")).unwrap();
    assert_eq!(widget.id(), Some(7));
    assert_eq!(widget.name.as_deref(), Some("joined"));
    assert_eq!(widget.score, 12);
    assert!(!widget.is_new());

    let row = serde_json::from_value(json!({"name": "no id"})).unwrap();
    assert!(matches!(
        repo.hydrate(&row, None),
        Err(KeelError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_get_filter_array_exposes_compiler() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);

    let fragment = repo
        .get_filter_array(&json!({"score": [">", 1], "name": null}))
        .unwrap();
    assert_eq!(fragment.sql, "`score` > ? AND `name` IS NULL");
    assert_eq!(fragment.params, vec![json!(1)]);
}

#[tokio::test]
async fn test_chunk_visits_every_row_once_in_id_order() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);
    seed_widgets(&repo, 7).await;

    let mut seen = Vec::new();
    let mut batches = Vec::new();
    let completed = repo
        .query(&json!({}))
        .unwrap()
        .chunk(3, |records| {
            batches.push(records.len());
            seen.extend(records.iter().filter_map(Record::id));
            ControlFlow::Continue(())
        })
        .await
        .unwrap();

    assert!(completed);
    assert_eq!(batches, vec![3, 3, 1]);
    assert_eq!(seen, (1..=7).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_chunk_uses_keyset_pages() {
    let db = widget_db();
    let (repo, connection) = widget_repo(&db);
    seed_widgets(&repo, 4).await;
    connection.clear_statements();

    repo.query(&json!({"active": true}))
        .unwrap()
        .chunk(1, |_| ControlFlow::Continue(()))
        .await
        .unwrap();

    let statements = connection.statements();
    assert_eq!(
        statements[1].sql,
        "SELECT * FROM `widgets` WHERE `active` = ? AND `id` > ? ORDER BY `id` ASC LIMIT 1"
    );
    assert_eq!(statements[1].params, vec![json!(1), json!(1)]);
}

#[tokio::test]
async fn test_chunk_stops_when_callback_breaks() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);
    seed_widgets(&repo, 6).await;

    let mut calls = 0;
    let completed = repo
        .query(&json!({}))
        .unwrap()
        .chunk(2, |_| {
            calls += 1;
            ControlFlow::Break(())
        })
        .await
        .unwrap();

    assert!(!completed);
    assert_eq!(calls, 1);
}

#[tokio::test]
async fn test_chunk_with_explicit_order() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);
    seed_widgets(&repo, 5).await;

    let mut scores = Vec::new();
    repo.query(&json!({}))
        .unwrap()
        .order_desc("score")
        .chunk(2, |records| {
            scores.extend(records.iter().map(|w| w.score));
            ControlFlow::Continue(())
        })
        .await
        .unwrap();

    assert_eq!(scores, vec![5, 4, 3, 2, 1]);
}

#[tokio::test]
async fn test_chunk_respects_query_limit_and_offset() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);
    seed_widgets(&repo, 7).await;

    let limited = repo.query(&json!({})).unwrap().limit(3);
    assert_eq!(limited.execute().await.unwrap().len(), 3);

    let mut batches = Vec::new();
    let mut seen = Vec::new();
    let completed = limited
        .chunk(2, |records| {
            batches.push(records.len());
            seen.extend(records.iter().filter_map(Record::id));
            ControlFlow::Continue(())
        })
        .await
        .unwrap();
    assert!(completed);
    assert_eq!(batches, vec![2, 1]);
    assert_eq!(seen, vec![1, 2, 3]);

    let mut seen = Vec::new();
    repo.query(&json!({}))
        .unwrap()
        .limit(3)
        .offset(2)
        .chunk(2, |records| {
            seen.extend(records.iter().filter_map(Record::id));
            ControlFlow::Continue(())
        })
        .await
        .unwrap();
    assert_eq!(seen, vec![3, 4, 5]);

    let mut scores = Vec::new();
    repo.query(&json!({}))
        .unwrap()
        .order_desc("score")
        .limit(4)
        .offset(1)
        .chunk(3, |records| {
            scores.extend(records.iter().map(|w| w.score));
            ControlFlow::Continue(())
        })
        .await
        .unwrap();
    assert_eq!(scores, vec![6, 5, 4, 3]);
}

#[tokio::test]
async fn test_paginate_clamps_to_last_page() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);
    seed_widgets(&repo, 25).await;

    let page = repo
        .query(&json!({}))
        .unwrap()
        .order_asc("id")
        .paginate(10, 99)
        .await
        .unwrap();

    assert_eq!(page.total, 25);
    assert_eq!(page.current_page, 3);
    assert_eq!(page.last_page, 3);
    assert_eq!(page.items.len(), 5);
    assert_eq!(page.items[0].id(), Some(21));
    assert!(!page.has_more_pages());

    let empty = repo
        .query(&json!({"score": [">", 100]}))
        .unwrap()
        .paginate(10, 4)
        .await
        .unwrap();
    assert_eq!(empty.current_page, 1);
    assert!(empty.items.is_empty());
}

#[tokio::test]
async fn test_pluck() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);
    seed_widgets(&repo, 3).await;

    let query = repo.query(&json!({"score": [">=", 2]})).unwrap().order_asc("id");
    assert_eq!(
        query.pluck("name").await.unwrap(),
        vec![json!("widget-2"), json!("widget-3")]
    );

    let keyed = query.pluck_keyed("score", "name").await.unwrap();
    assert_eq!(keyed.get("widget-3"), Some(&json!(3)));
    assert_eq!(keyed.len(), 2);
}

#[tokio::test]
async fn test_aggregates() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);
    seed_widgets(&repo, 4).await;

    let query = repo.query(&json!({})).unwrap();
    assert_eq!(query.count().await.unwrap(), 4);
    assert_eq!(query.min("score").await.unwrap(), json!(1));
    assert_eq!(query.max("score").await.unwrap(), json!(4));
    assert_eq!(keel_core::database::value::as_i64(&query.sum("score").await.unwrap()), Some(10));
    assert_eq!(query.avg("score").await.unwrap(), Some(2.5));

    let none = repo.query(&json!({"score": [">", 10]})).unwrap();
    assert_eq!(none.count().await.unwrap(), 0);
    assert_eq!(none.max("score").await.unwrap(), Value::Null);
    assert_eq!(none.avg("score").await.unwrap(), None);
}

#[tokio::test]
async fn test_bulk_update_and_delete() {
    let db = widget_db();
    let (repo, _) = widget_repo(&db);
    seed_widgets(&repo, 5).await;

    let mut values = IndexMap::new();
    values.insert("category".to_string(), json!("archived"));
    let updated = repo
        .query(&json!({"active": false}))
        .unwrap()
        .update(&values)
        .await
        .unwrap();
    assert_eq!(updated, 2);
    assert_eq!(repo.count(&json!({"category": "archived"})).await.unwrap(), 2);

    // Rows already holding the value do not count as changed
    let updated = repo
        .query(&json!({"active": false}))
        .unwrap()
        .update(&values)
        .await
        .unwrap();
    assert_eq!(updated, 0);

    let removed = repo
        .query(&json!({"category": "archived"}))
        .unwrap()
        .order_desc("id")
        .limit(1)
        .delete()
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(!repo.exists(4).await.unwrap());

    assert!(matches!(
        repo.query(&json!({})).unwrap().limit(1).offset(1).delete().await,
        Err(KeelError::UnsupportedOperation(_))
    ));
}

#[tokio::test]
async fn test_nested_transactions_only_outermost_rolls_back() {
    let db = widget_db();
    let (repo, connection) = widget_repo(&db);

    connection.begin().await.unwrap();
    seed_widgets(&repo, 1).await;
    connection.begin().await.unwrap();
    seed_widgets(&repo, 1).await;
    connection.rollback().await.unwrap();
    assert_eq!(connection.transaction_depth(), 1);
    assert_eq!(db.rows("widgets").len(), 2);

    connection.rollback().await.unwrap();
    assert_eq!(connection.transaction_depth(), 0);
    assert!(db.rows("widgets").is_empty());
    assert!(matches!(
        connection.rollback().await,
        Err(KeelError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_malformed_filter_is_rejected_before_any_statement() {
    let db = widget_db();
    let (repo, connection) = widget_repo(&db);

    assert!(matches!(
        repo.count(&json!({"score": ["BETWEEN", 1]})).await,
        Err(KeelError::MalformedFilter(_))
    ));
    assert_eq!(connection.statement_count(), 0);
}
