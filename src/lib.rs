//! # Undertow - Implicit Parallelism for Plain Functions
//!
//! Undertow runs ordinary closures concurrently without the caller juggling
//! threads, channels or futures. Two building blocks cover most workloads:
//!
//! - **Flows** - a scoped session in which every scheduled call returns a
//!   [`TaskProxy`] immediately. Calls whose inputs come from other calls start
//!   once those inputs resolve, and leaving the flow joins everything.
//! - **Loops** - a parallel for-each over a finite input with a bounded
//!   worker count and a per-invocation [`ErrorPolicy`]. Results come back in
//!   input order as a [`ResultCollection`].
//!
//! All work runs on one bounded [`WorkerPool`], so nesting loops in loops or
//! flows in loops never multiplies the thread count.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! undertow = "1.0.0"
//! ```
//!
//! ### Flows
//!
//! ```rust
//! use std::time::Duration;
//! use undertow::{run_flow, FlowOptions, Result};
//!
//! fn fetch(ms: u64, value: f64) -> impl FnOnce() -> Result<f64> + Send + 'static {
//!     move || {
//!         std::thread::sleep(Duration::from_millis(ms));
//!         Ok(value)
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let total = run_flow(FlowOptions::new(), |fx| {
//!     // Both calls start right away and overlap
//!     let a = fx.spawn("fetch a", fetch(20, 0.2));
//!     let b = fx.spawn("fetch b", fetch(50, 1.0));
//!     let sum = fx.spawn_after("sum", (a, b), |(a, b)| Ok(a + b));
//!     sum.resolve()
//! })?;
//! assert!((total - 1.2).abs() < 1e-9);
//! # Ok(())
//! # }
//! ```
//!
//! ### Loops
//!
//! ```rust
//! use undertow::{capture, Error, ErrorPolicy, Loop, Result};
//!
//! # fn main() -> Result<()> {
//! let numerator = 100;
//! let results = Loop::over(vec![10i64, 20, 0, 30, 0, 40])
//!     .workers(3)
//!     .on_error(ErrorPolicy::Collect)
//!     .capture(capture!(numerator))
//!     .run(|n, it| {
//!         if *n == 0 {
//!             return Err(Error::DivisionByZero);
//!         }
//!         Ok(it.get("numerator")?.as_int()? / n)
//!     })?;
//!
//! assert_eq!(results.success_count(), 4);
//! assert_eq!(results.total_count(), 6);
//! assert_eq!(results.errors().keys().copied().collect::<Vec<_>>(), vec![2, 4]);
//! # Ok(())
//! # }
//! ```
//!
//! ### Parallel Map
//!
//! ```rust
//! let lengths = undertow::pmap(|s: &&str| Ok(s.len()), vec!["a", "bb", "ccc"]).unwrap();
//! assert_eq!(lengths, vec![1, 2, 3]);
//! ```
//!
//! ## Error Policies
//!
//! | Policy     | Failed slot       | Loop result                 |
//! |------------|-------------------|-----------------------------|
//! | `continue` | empty             | `Ok`, error listed by index |
//! | `collect`  | holds the error   | `Ok`, error listed by index |
//! | `raise`    | -                 | `Err(ItemFailed)`           |
//!
//! ## Configuration
//!
//! The global pool reads `UNDERTOW_MAX_THREADS`, `UNDERTOW_WORKERS`,
//! `UNDERTOW_MAX_ITEMS` and `UNDERTOW_DEBUG` once, on first use. See
//! [`EngineConfig`].
//!
//! ## Debugging
//!
//! With `debug` on, a flow or loop reports every task start and finish to a
//! [`Reporter`]. The default emits `tracing` events; [`ProgressReporter`]
//! prints progress lines instead.
//!
//! ## License
//!
//! Licensed under the [MIT License](https://opensource.org/licenses/MIT).

/// Version of the Undertow engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod config;
pub mod error;
pub mod parallel;
pub mod report;
pub mod runtime;

// Re-export main types
pub use config::EngineConfig;
pub use error::{Error, ErrorSeverity, Result};
pub use parallel::{
    pmap, pmap_with, ErrorPolicy, Iteration, Loop, LoopSummary, ResultCollection, Slot,
};
pub use report::{ProgressReporter, Reporter, SilentReporter, TaskOutcome, TracingReporter};
pub use runtime::{
    run_flow, Dependencies, Flow, FlowHandle, FlowId, FlowOptions, Ready, Scope, TaskId,
    TaskProxy, TaskState, Value, WorkerPool,
};
