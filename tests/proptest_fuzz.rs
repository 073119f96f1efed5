//! Property-based tests for the operation queue and the JSON helpers.
//!
//! The collapse property drives a real [`OperationsQueue`] with random
//! sequences of local mutations against one item and compares it with a
//! small reference model of the collapse rules. The fuzz properties feed
//! arbitrary JSON to the item and filter helpers and check they never panic.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{json, Value};

use offline_sync::queue::{OperationKind, OperationState, OperationsQueue, TableOperation};
use offline_sync::system::{self, JsonObject};
use offline_sync::{query_id, Filter, InMemoryStore, Query, SyncError};

// =============================================================================
// Strategies for generating test data
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Step {
    Enqueue(OperationKind),
    /// A push attempted the queued operation and it failed.
    MarkFailed,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Enqueue(OperationKind::Insert)),
        3 => Just(Step::Enqueue(OperationKind::Update)),
        3 => Just(Step::Enqueue(OperationKind::Delete)),
        1 => Just(Step::MarkFailed),
    ]
}

/// Generate arbitrary JSON values (including odd structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
        Just(json!("2026-03-01T10:00:00.000Z")),
    ];

    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::hash_map("[a-z]{1,6}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn arbitrary_item_strategy() -> impl Strategy<Value = JsonObject> {
    prop::collection::hash_map(
        prop_oneof![
            Just("id".to_string()),
            Just("version".to_string()),
            Just("updatedAt".to_string()),
            Just("deleted".to_string()),
            "[a-z]{1,6}",
        ],
        arbitrary_json_strategy(),
        0..8,
    )
    .prop_map(|m| m.into_iter().collect())
}

fn filter_strategy() -> impl Strategy<Value = Filter> {
    let field = prop_oneof![Just("n"), Just("s"), Just("updatedAt"), Just("missing")];
    let leaf = (field, arbitrary_json_strategy(), 0..6u8).prop_map(|(f, v, op)| match op {
        0 => Filter::eq(f, v),
        1 => Filter::ne(f, v),
        2 => Filter::gt(f, v),
        3 => Filter::ge(f, v),
        4 => Filter::lt(f, v),
        _ => Filter::le(f, v),
    });
    leaf.prop_recursive(3, 16, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a.and(b)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a.or(b)),
            inner.prop_map(Filter::negate),
        ]
    })
}

// =============================================================================
// Reference model of the collapse rules
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    DuplicateInsert,
    InsertAfterUpdate,
    DeleteQueued,
    StoreInconsistent,
}

fn classify(error: &SyncError) -> Option<Rejection> {
    match error {
        SyncError::DuplicateInsert { .. } => Some(Rejection::DuplicateInsert),
        SyncError::InsertAfterUpdate { .. } => Some(Rejection::InsertAfterUpdate),
        SyncError::DeleteQueued { .. } => Some(Rejection::DeleteQueued),
        SyncError::StoreInconsistent { .. } => Some(Rejection::StoreInconsistent),
        _ => None,
    }
}

/// What the queue should hold for the item after one more enqueue.
fn model(
    queued: Option<(OperationKind, OperationState)>,
    new: OperationKind,
) -> Result<Option<(OperationKind, OperationState)>, Rejection> {
    use OperationKind::*;
    let Some((kind, state)) = queued else {
        return Ok(Some((new, OperationState::Pending)));
    };
    let pending = state == OperationState::Pending;
    match (kind, new) {
        (Insert, Insert) => Err(Rejection::DuplicateInsert),
        (Insert, Update) | (Update, Update) => Ok(Some((kind, state))),
        (Insert, Delete) if pending => Ok(None),
        (Insert, Delete) => Err(Rejection::StoreInconsistent),
        (Update, Insert) => Err(Rejection::InsertAfterUpdate),
        (Update, Delete) => Ok(Some((Delete, OperationState::Pending))),
        (Delete, _) if pending => Err(Rejection::DeleteQueued),
        (Delete, _) => Err(Rejection::StoreInconsistent),
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("test runtime")
}

async fn noop() -> Result<(), SyncError> {
    Ok(())
}

async fn run_steps(steps: Vec<Step>) -> Result<(), TestCaseError> {
    let queue = OperationsQueue::new(Arc::new(InMemoryStore::new()), "__operations");
    queue.initialize().await.map_err(|e| TestCaseError::fail(e.to_string()))?;
    let mut expected: Option<(OperationKind, OperationState)> = None;

    for step in steps {
        match step {
            Step::MarkFailed => {
                if let Some(mut op) = queue.get_by_item_id("todo", "a").await.unwrap() {
                    queue.set_state(&mut op, OperationState::Failed).await.unwrap();
                    expected = Some((op.kind, OperationState::Failed));
                }
            }
            Step::Enqueue(kind) => {
                let snapshot = json!({"id": "a"}).as_object().cloned().unwrap();
                let op = TableOperation::new(kind, "todo", "a").with_item(snapshot);
                let actual = queue.enqueue(op, noop).await;
                match model(expected, kind) {
                    Ok(next) => {
                        prop_assert!(actual.is_ok(), "{kind} after {expected:?} failed: {actual:?}");
                        expected = next;
                    }
                    Err(rejection) => {
                        let err = actual.expect_err("model rejected the operation");
                        prop_assert_eq!(classify(&err), Some(rejection));
                    }
                }
            }
        }

        let queued = queue.operations(Some("todo")).await.unwrap();
        prop_assert!(queued.len() <= 1);
        prop_assert_eq!(queue.pending(), queued.len() as i64);
        let actual = queued.first().map(|op| (op.kind, op.state));
        prop_assert_eq!(actual, expected);
    }
    Ok(())
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn collapse_matches_model(steps in prop::collection::vec(step_strategy(), 1..12)) {
        runtime().block_on(run_steps(steps))?;
    }

    #[test]
    fn strip_keeps_id_and_returns_version(item in arbitrary_item_strategy()) {
        let (stripped, version) = system::strip_system_properties(&item);
        prop_assert_eq!(stripped.get("id"), item.get("id"));
        prop_assert!(!stripped.contains_key("version"));
        prop_assert!(!stripped.contains_key("updatedAt"));
        prop_assert!(!stripped.contains_key("deleted"));
        prop_assert_eq!(version, system::item_version(&item));
    }

    #[test]
    fn item_helpers_never_panic(item in arbitrary_item_strategy()) {
        let _ = system::item_id(&item);
        let _ = system::updated_at(&item);
        let _ = system::is_deleted(&item);
        if let Some(id) = system::item_id(&item) {
            let _ = system::validate_id(id);
        }
    }

    #[test]
    fn filters_evaluate_and_render(filter in filter_strategy(), item in arbitrary_item_strategy()) {
        let negated = filter.clone().negate();
        prop_assert_ne!(filter.matches(&item), negated.matches(&item));
        let odata = filter.to_odata();
        prop_assert!(odata.starts_with('(') || odata.starts_with("not("));
    }

    #[test]
    fn query_ids_are_stable(filter in filter_strategy()) {
        let query = Query::new("todo").with_filter(filter);
        let id = query_id(&query);
        prop_assert_eq!(&id, &query_id(&query.clone()));
        prop_assert!(id.starts_with("q_"));
        prop_assert_eq!(id.len(), 18);
        prop_assert!(system::validate_id(&id).is_ok());
    }
}
