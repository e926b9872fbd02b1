//! Property-based tests for loop invariants
//!
//! These tests use proptest to generate inputs and failure patterns and verify that:
//! 1. Results are index-aligned with the input for every policy
//! 2. `success_count + errors.len() == total_count` always holds
//! 3. `raise` reports the lowest failing index when a single worker runs

use std::sync::Arc;

use proptest::prelude::*;
use undertow::{EngineConfig, Error, ErrorPolicy, Loop, Slot, WorkerPool};

// =============================================================================
// STRATEGY GENERATORS
// =============================================================================

fn policy() -> impl Strategy<Value = ErrorPolicy> {
    prop_oneof![
        Just(ErrorPolicy::Continue),
        Just(ErrorPolicy::Collect),
        Just(ErrorPolicy::Raise),
    ]
}

/// Items paired with whether they should fail
fn items() -> impl Strategy<Value = Vec<(i64, bool)>> {
    prop::collection::vec((-1000i64..1000, prop::bool::weighted(0.25)), 0..64)
}

lazy_static::lazy_static! {
    static ref POOL: Arc<WorkerPool> =
        Arc::new(WorkerPool::new(EngineConfig::default().with_max_threads(4)).unwrap());
}

fn apply(item: &(i64, bool)) -> undertow::Result<i64> {
    let (value, fails) = *item;
    if fails {
        Err(Error::user(format!("rejected {}", value)))
    } else {
        Ok(value * 3)
    }
}

// =============================================================================
// PROPERTIES
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_results_align_with_input(items in items(), workers in 1usize..8, policy in policy()) {
        let expected_failures = items.iter().filter(|(_, fails)| *fails).count();
        let outcome = Loop::over(items.clone())
            .pool(Arc::clone(&POOL))
            .workers(workers)
            .on_error(policy)
            .run(|item, _| apply(item));

        match outcome {
            Ok(results) => {
                prop_assert!(policy != ErrorPolicy::Raise || expected_failures == 0);
                prop_assert_eq!(results.total_count(), items.len());
                prop_assert_eq!(
                    results.success_count() + results.errors().len(),
                    results.total_count()
                );
                prop_assert_eq!(results.errors().len(), expected_failures);
                for (i, item) in items.iter().enumerate() {
                    match &results[i] {
                        Slot::Value(v) => {
                            prop_assert!(!item.1);
                            prop_assert_eq!(*v, item.0 * 3);
                        }
                        Slot::Failed(_) => {
                            prop_assert!(item.1);
                            prop_assert_eq!(policy, ErrorPolicy::Collect);
                        }
                        Slot::Empty => {
                            prop_assert!(item.1);
                            prop_assert_eq!(policy, ErrorPolicy::Continue);
                        }
                    }
                }
            }
            Err(Error::ItemFailed { index, .. }) => {
                prop_assert_eq!(policy, ErrorPolicy::Raise);
                prop_assert!(items[index].1);
            }
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }

    #[test]
    fn prop_single_worker_raise_reports_first_failure(items in items()) {
        let first = items.iter().position(|(_, fails)| *fails);
        let outcome = Loop::over(items)
            .pool(Arc::clone(&POOL))
            .workers(1)
            .on_error(ErrorPolicy::Raise)
            .run(|item, _| apply(item));

        match (first, outcome) {
            (None, Ok(_)) => {}
            (Some(expected), Err(Error::ItemFailed { index, .. })) => {
                prop_assert_eq!(index, expected);
            }
            (first, outcome) => prop_assert!(
                false,
                "first failure {:?}, outcome ok = {}",
                first,
                outcome.is_ok()
            ),
        }
    }
}
