//! Integration tests for the parallel loop executor
//!
//! Covers ordering, the three error policies, scope propagation into nested
//! loops and flows, and the misuse checks performed before dispatch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use undertow::{
    capture, run_flow, EngineConfig, Error, ErrorPolicy, FlowOptions, Iteration, Loop, Result,
    Slot, WorkerPool,
};

fn pool(threads: usize) -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(EngineConfig::default().with_max_threads(threads)).unwrap())
}

fn hundred_over(n: &i64, _: &Iteration<'_>) -> Result<i64> {
    if *n == 0 {
        return Err(Error::DivisionByZero);
    }
    Ok(100 / n)
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_results_follow_input_order() {
    let delays: Vec<u64> = vec![120, 100, 80, 60, 40, 20, 0];
    let results = Loop::over(delays.clone())
        .pool(pool(7))
        .workers(7)
        .run(|ms, it| {
            std::thread::sleep(Duration::from_millis(*ms));
            Ok((it.index(), *ms))
        })
        .unwrap();

    assert_eq!(results.len(), delays.len());
    for (i, ms) in delays.iter().enumerate() {
        assert_eq!(results.get(i), Some(&(i, *ms)));
    }
}

#[test]
fn test_iteration_reports_total() {
    let results = Loop::over(vec!['x', 'y'])
        .pool(pool(2))
        .run(|_, it| Ok(it.total()))
        .unwrap();
    assert_eq!(results.into_values(), vec![2, 2]);
}

// =============================================================================
// Error policies
// =============================================================================

#[test]
fn test_collect_example() {
    let results = Loop::over(vec![10i64, 20, 0, 30, 0, 40])
        .pool(pool(4))
        .on_error_str("collect")
        .run(hundred_over)
        .unwrap();

    assert_eq!(results.success_count(), 4);
    assert_eq!(results.total_count(), 6);
    assert!(results.errors().contains_key(&2));
    assert!(results.errors().contains_key(&4));
    assert!(matches!(results[2], Slot::Failed(Error::DivisionByZero)));
    assert_eq!(results.get(5), Some(&2));
}

#[test]
fn test_continue_is_default() {
    let results = Loop::over(vec![10i64, 0])
        .pool(pool(2))
        .run(hundred_over)
        .unwrap();
    assert_eq!(results.policy(), ErrorPolicy::Continue);
    assert!(matches!(results[1], Slot::Empty));
    assert_eq!(results.clone().into_options(), vec![Some(10), None]);
}

#[test]
fn test_every_item_failing_still_returns() {
    for policy in [ErrorPolicy::Continue, ErrorPolicy::Collect] {
        let results = Loop::over(vec![0i64; 5])
            .pool(pool(3))
            .on_error(policy)
            .run(hundred_over)
            .unwrap();
        assert_eq!(results.success_count(), 0);
        assert_eq!(results.errors().len(), 5);
        assert!(!results.all_successful());
    }
}

#[test]
fn test_raise_example() {
    let result = Loop::over(vec![1i64, 2, 0, 4])
        .pool(pool(2))
        .on_error(ErrorPolicy::Raise)
        .run(|n, _| {
            if *n == 0 {
                Err(Error::DivisionByZero)
            } else {
                Ok(10 / n)
            }
        });

    let err = result.unwrap_err();
    assert!(matches!(err, Error::ItemFailed { index: 2, .. }));
    assert!(matches!(err.root_cause(), Error::DivisionByZero));
    assert_eq!(err.to_string(), "Item 2 failed: Division by zero");
}

#[test]
fn test_summary_counts() {
    let results = Loop::over(vec![10i64, 0, 5])
        .pool(pool(2))
        .label("divide")
        .on_error(ErrorPolicy::Collect)
        .run(hundred_over)
        .unwrap();
    let summary = results.summary();
    assert_eq!(summary.label, "divide");
    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors.get(&1).map(String::as_str), Some("Division by zero"));
}

// =============================================================================
// Captured scope
// =============================================================================

#[test]
fn test_nested_loops_observe_query() {
    let query = "hello world";
    let seen = AtomicUsize::new(0);

    let outer = Loop::over(vec!["electronics", "books", "clothing"])
        .pool(pool(4))
        .workers(3)
        .capture(capture!(query))
        .bind_as("category")
        .run(|_, it| {
            it.for_each(vec![1i64, 2, 3])
                .workers(2)
                .run(|id, inner| {
                    assert_eq!(inner.get("query")?.as_str()?, "hello world");
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("{}/{}", inner.get("category")?, id))
                })
        })
        .unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 9);
    assert_eq!(outer.get(0).unwrap().get(2).unwrap(), "electronics/3");
    assert_eq!(outer.get(2).unwrap().get(0).unwrap(), "clothing/1");
}

#[test]
fn test_loop_inside_flow_inside_loop() {
    let query = "q";
    let results = Loop::over(vec![1i64, 2])
        .pool(pool(2))
        .capture(capture!(query))
        .run(|n, it| {
            it.flow(FlowOptions::new(), |fx| {
                let doubled = fx.spawn("double", {
                    let n = *n;
                    move || Ok(n * 2)
                });
                let inner = fx
                    .for_each(vec![doubled.resolve()?])
                    .run(|d, inner| Ok(format!("{}:{}", inner.get("query")?, d)))?;
                Ok(inner.into_values().join(","))
            })
        })
        .unwrap();
    assert_eq!(results.into_values(), vec!["q:2", "q:4"]);
}

#[test]
fn test_deep_nesting_on_small_pool_completes() {
    let results = Loop::over(0..4i64)
        .pool(pool(2))
        .workers(4)
        .run(|a, it| {
            let inner = it.for_each(0..4i64).workers(4).run(|b, inner| {
                let leaf = inner.for_each(0..4i64).workers(4).run(|c, _| Ok(a + b + c))?;
                Ok(leaf.values().sum::<i64>())
            })?;
            Ok(inner.values().sum::<i64>())
        })
        .unwrap();
    // sum over b, c of (a + b + c) is 16a + 48
    assert_eq!(results.into_values(), vec![48, 64, 80, 96]);
}

// =============================================================================
// Misuse
// =============================================================================

#[test]
fn test_empty_input() {
    let results = Loop::over(Vec::<i64>::new())
        .run(hundred_over)
        .unwrap();
    assert_eq!(results.total_count(), 0);
    assert_eq!(results.success_count(), 0);
    assert!(results.all_successful());
    assert!(results.errors().is_empty());
}

#[test]
fn test_zero_workers_rejected() {
    let err = Loop::over(vec![1i64]).workers(0).run(hundred_over).unwrap_err();
    assert!(err.is_misuse());
    assert!(matches!(err, Error::InvalidWorkers { workers: 0 }));
}

#[test]
fn test_unknown_policy_rejected() {
    let err = Loop::over(vec![1i64])
        .on_error_str("bogus")
        .run(hundred_over)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPolicy { ref value } if value == "bogus"));
}

#[test]
fn test_infinite_input_rejected() {
    let err = Loop::over(1i64..).run(hundred_over).unwrap_err();
    assert!(matches!(err, Error::UnboundedInput { .. }));
}

#[test]
fn test_pool_item_limit() {
    let small = Arc::new(
        WorkerPool::new(EngineConfig::default().with_max_threads(2).with_max_items(3)).unwrap(),
    );
    let err = Loop::over(vec![1i64, 2, 3, 4])
        .pool(small)
        .run(hundred_over)
        .unwrap_err();
    assert!(matches!(err, Error::UnboundedInput { limit: 3 }));
}

#[test]
fn test_more_workers_than_items() {
    let results = Loop::over(vec![4i64, 5])
        .pool(pool(2))
        .workers(1000)
        .run(hundred_over)
        .unwrap();
    assert_eq!(results.into_values(), vec![25, 20]);
}

#[test]
fn test_flow_scoped_loop_with_run_flow() {
    let base = 7i64;
    let values = run_flow(FlowOptions::new().pool(pool(2)).scope(capture!(base)), |fx| {
        let collection = fx
            .for_each(vec![1i64, 2, 3])
            .run(|n, it| Ok(it.get("base")?.as_int()? * n))?;
        Ok(collection.into_values())
    })
    .unwrap();
    assert_eq!(values, vec![7, 14, 21]);
}
