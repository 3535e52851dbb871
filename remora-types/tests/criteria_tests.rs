use pretty_assertions::assert_eq;
use proptest::prelude::*;
use remora_types::{Criteria, Object, ObjectId};
use serde_json::json;

// ── Normalization ─────────────────────────────────────────────────

#[test]
fn key_order_does_not_matter() {
    let a = Criteria::from_value(json!({"user_id": 4, "deleted": false})).unwrap();
    let b = Criteria::new().with("deleted", false).with("user_id", 4);
    assert_eq!(a, b);
}

#[test]
fn array_order_does_not_matter() {
    let a = Criteria::from_value(json!({"id": [5, 1, 3]})).unwrap();
    let b = Criteria::from_value(json!({"id": [1, 3, 5, 5]})).unwrap();
    assert_eq!(a, b);
}

#[test]
fn nested_objects_are_normalized() {
    let a = Criteria::from_value(json!({"range": {"to": 2, "from": [3, 1]}})).unwrap();
    let b = Criteria::from_value(json!({"range": {"from": [1, 3], "to": 2}})).unwrap();
    assert_eq!(a, b);
}

#[test]
fn null_is_empty_criteria() {
    let c = Criteria::from_value(json!(null)).unwrap();
    assert!(c.is_empty());
}

#[test]
fn non_object_criteria_rejected() {
    assert!(Criteria::from_value(json!([1, 2])).is_err());
    assert!(Criteria::from_value(json!("id=5")).is_err());
}

#[test]
fn deserialization_normalizes() {
    let c: Criteria = serde_json::from_value(json!({"id": [9, 2]})).unwrap();
    assert_eq!(c.get("id"), Some(&json!([2, 9])));
}

#[test]
fn shape_lists_sorted_keys() {
    let c = Criteria::new().with("b", 1).with("a", 2);
    assert_eq!(c.shape(), vec!["a", "b"]);
}

// ── Explicit ids ──────────────────────────────────────────────────

#[test]
fn explicit_ids_from_scalar_and_array() {
    let single = Criteria::new().with("id", 5);
    assert_eq!(single.explicit_ids(), Some(vec![ObjectId::new(5)]));

    let many = Criteria::ids([ObjectId::new(7), ObjectId::new(2)]);
    assert_eq!(many.explicit_ids(), Some(vec![ObjectId::new(2), ObjectId::new(7)]));

    assert_eq!(Criteria::new().with("user_id", 5).explicit_ids(), None);
}

// ── Matching ──────────────────────────────────────────────────────

#[test]
fn scalar_term_matches_equal_field() {
    let c = Criteria::new().with("user_id", 4);
    assert_eq!(c.matches(&Object::new(1).with("user_id", 4)), Some(true));
    assert_eq!(c.matches(&Object::new(1).with("user_id", 5)), Some(false));
}

#[test]
fn array_term_is_membership() {
    let c = Criteria::new().with("id", json!([1, 2]));
    assert_eq!(c.matches(&Object::new(2)), Some(true));
    assert_eq!(c.matches(&Object::new(3)), Some(false));
}

#[test]
fn scalar_term_against_array_field() {
    let c = Criteria::new().with("user_ids", 9);
    assert_eq!(c.matches(&Object::new(1).with("user_ids", json!([3, 9]))), Some(true));
    assert_eq!(c.matches(&Object::new(1).with("user_ids", json!([3]))), Some(false));
}

#[test]
fn missing_field_is_undecidable() {
    let c = Criteria::new().with("user_id", 4);
    assert_eq!(c.matches(&Object::new(1)), None);
    assert!(c.admits(&Object::new(1)));
}

#[test]
fn ranking_terms_are_undecidable() {
    let c = Criteria::new().with("limit", 10);
    assert_eq!(c.matches(&Object::new(1)), None);
}

#[test]
fn definite_mismatch_wins_over_undecidable() {
    let c = Criteria::new().with("limit", 10).with("user_id", 1);
    assert_eq!(c.matches(&Object::new(1).with("user_id", 2)), Some(false));
    assert!(!c.admits(&Object::new(1).with("user_id", 2)));
}

#[test]
fn empty_criteria_matches_everything() {
    assert_eq!(Criteria::new().matches(&Object::new(8)), Some(true));
}

proptest! {
    #[test]
    fn permuted_id_lists_normalize_identically(mut ids in proptest::collection::vec(-50i64..50, 0..20)) {
        let a = Criteria::new().with("id", ids.clone());
        ids.reverse();
        let b = Criteria::new().with("id", ids);
        prop_assert_eq!(a, b);
    }
}
