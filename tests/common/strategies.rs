//! Proptest strategies producing well-formed filter mappings over the `widgets` columns.

use proptest::prelude::*;
use serde_json::{json, Map, Value};

pub fn text_field_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("name"), Just("category")]
}

pub fn numeric_field_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("score"), Just("active"), Just("id")]
}

pub fn text_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        "widget-[0-9]{1,2}".prop_map(Value::from),
        Just(json!("general")),
        "[a-z%_]{0,6}".prop_map(Value::from),
    ]
}

pub fn comparison_operator_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("="),
        Just("!="),
        Just("<>"),
        Just("<"),
        Just(">"),
        Just("<="),
        Just(">="),
    ]
}

fn text_entry_strategy() -> impl Strategy<Value = (String, Value)> {
    let shape = prop_oneof![
        text_value_strategy(),
        Just(Value::Null),
        text_value_strategy().prop_map(|v| json!(["LIKE", v])),
        text_value_strategy().prop_map(|v| json!(["not like", v])),
        prop_oneof![Just("="), Just("!=")].prop_map(|op| json!([op, null])),
        prop::collection::vec(text_value_strategy(), 0..4).prop_map(|vs| json!(["IN", vs])),
    ];
    (text_field_strategy(), shape).prop_map(|(field, value)| (field.to_string(), value))
}

fn numeric_entry_strategy() -> impl Strategy<Value = (String, Value)> {
    let shape = prop_oneof![
        (-5i64..30).prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        (comparison_operator_strategy(), -5i64..30).prop_map(|(op, v)| json!([op, v])),
        (0i64..15, 0i64..15).prop_map(|(lo, hi)| json!(["BETWEEN", lo, hi])),
        (0i64..15, 0i64..15).prop_map(|(lo, hi)| json!(["NOT BETWEEN", lo, hi])),
        prop::collection::vec(0i64..20, 0..5).prop_map(|vs| json!(["NOT IN", vs])),
        ((-5i64..30), (-5i64..30)).prop_map(|(a, b)| json!({">=": a, "<": b})),
        Just(json!(["<=", {"column": "score"}])),
    ];
    (numeric_field_strategy(), shape).prop_map(|(field, value)| (field.to_string(), value))
}

pub fn filter_entry_strategy() -> impl Strategy<Value = (String, Value)> {
    prop_oneof![text_entry_strategy(), numeric_entry_strategy()]
}

fn into_object(entries: Vec<(String, Value)>) -> Map<String, Value> {
    entries.into_iter().collect()
}

/// Arbitrary valid filters, including nested `OR` arrays and `AND` objects
pub fn filter_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop::collection::vec(filter_entry_strategy(), 0..4)
        .prop_map(|entries| Value::Object(into_object(entries)));

    leaf.prop_recursive(3, 24, 4, |inner| {
        (
            prop::collection::vec(filter_entry_strategy(), 0..3),
            prop::collection::vec(inner.clone(), 0..3),
            prop::option::of(inner),
        )
            .prop_map(|(entries, alternatives, conjunct)| {
                let mut object = into_object(entries);
                let alternatives: Vec<Value> = alternatives
                    .into_iter()
                    .filter(|f| f.as_object().is_some_and(|m| !m.is_empty()))
                    .collect();
                if !alternatives.is_empty() {
                    object.insert("OR".to_string(), Value::Array(alternatives));
                }
                if let Some(Value::Object(conjunct)) = conjunct {
                    if !conjunct.is_empty() {
                        object.insert("AND".to_string(), Value::Object(conjunct));
                    }
                }
                Value::Object(object)
            })
    })
}
