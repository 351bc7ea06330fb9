use keel_core::query_builder::{clamp_page, last_page, Paginated, Pagination};

#[test]
fn test_page_to_limit_offset() {
    let pagination = Pagination::new(3, 25);
    assert_eq!(pagination.limit, 25);
    assert_eq!(pagination.offset, 50);
    assert_eq!(pagination.to_sql(), " LIMIT 50, 25");
    assert_eq!(pagination.current_page(), 3);
}

#[test]
fn test_page_zero_is_treated_as_first() {
    let pagination = Pagination::new(0, 10);
    assert_eq!(pagination.offset, 0);
    assert_eq!(pagination.to_sql(), " LIMIT 10");
}

#[test]
fn test_last_page_is_at_least_one() {
    assert_eq!(last_page(0, 10), 1);
    assert_eq!(last_page(10, 10), 1);
    assert_eq!(last_page(11, 10), 2);
    assert_eq!(last_page(25, 10), 3);
}

#[test]
fn test_out_of_range_pages_clamp() {
    assert_eq!(clamp_page(99, 25, 10), 3);
    assert_eq!(clamp_page(0, 25, 10), 1);
    assert_eq!(clamp_page(2, 25, 10), 2);
    assert_eq!(clamp_page(5, 0, 10), 1);
}

#[test]
fn test_paginated_serializes_with_page_metadata() {
    let page = Paginated {
        items: vec!["a", "b"],
        total: 12,
        per_page: 2,
        current_page: 6,
        last_page: 6,
    };
    assert!(!page.has_more_pages());

    let json = serde_json::to_value(&page).unwrap();
    assert_eq!(json["total"], 12);
    assert_eq!(json["current_page"], 6);
    assert_eq!(json["items"][1], "b");
}
