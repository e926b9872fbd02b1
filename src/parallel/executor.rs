//! Parallel loop executor for Undertow
//!
//! Runs one function over every input item on the shared worker pool with a
//! bounded number of concurrent workers. Each worker repeatedly claims the next
//! unclaimed index, so results are written straight into their input slot and
//! the returned [`ResultCollection`] keeps input order.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::{EngineConfig, DEFAULT_MAX_ITEMS};
use crate::error::{Error, Result};
use crate::parallel::{ErrorPolicy, ResultCollection};
use crate::report::{self, default_reporter, Reporter, TaskOutcome};
use crate::runtime::task::{self, panic_message};
use crate::runtime::{run_flow, Flow, FlowOptions, Scope, TaskId, Value, WorkerPool};

const DEFAULT_LABEL: &str = "loop";

struct Binding<T> {
    name: String,
    to_value: fn(&T) -> Value,
}

/// A parallel for-each over a finite input
///
/// # Example
/// ```
/// use undertow::{capture, ErrorPolicy, Loop};
///
/// let multiplier = 10;
/// let results = Loop::over(vec![1i64, 2, 0, 4])
///     .workers(2)
///     .on_error(ErrorPolicy::Collect)
///     .capture(capture!(multiplier))
///     .run(|n, it| {
///         let m = it.get("multiplier")?.as_int()?;
///         if *n == 0 {
///             return Err(undertow::Error::DivisionByZero);
///         }
///         Ok(m * 100 / n)
///     })
///     .unwrap();
///
/// assert_eq!(results.get(0), Some(&1000));
/// assert_eq!(results.success_count(), 3);
/// assert!(results.errors().contains_key(&2));
/// ```
pub struct Loop<T> {
    items: Vec<T>,
    overflow: Option<usize>,
    workers: Option<usize>,
    policy: Result<ErrorPolicy>,
    scope: Scope,
    binding: Option<Binding<T>>,
    debug: Option<bool>,
    label: String,
    pool: Option<Arc<WorkerPool>>,
    reporter: Option<Arc<dyn Reporter>>,
}

impl<T: Send + Sync> Loop<T> {
    /// Materializes `items` for a loop on the global pool
    pub fn over<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let limit = WorkerPool::global()
            .map(|pool| pool.config().max_items)
            .unwrap_or(DEFAULT_MAX_ITEMS);
        Self::over_limited(items, limit)
    }

    /// Materializes at most `max_items` items; more is reported as unbounded input on run
    pub fn over_limited<I>(items: I, max_items: usize) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let (items, overflow) = materialize(items, max_items);
        Loop {
            items,
            overflow,
            workers: None,
            policy: Ok(ErrorPolicy::default()),
            scope: Scope::new(),
            binding: None,
            debug: None,
            label: DEFAULT_LABEL.to_string(),
            pool: None,
            reporter: None,
        }
    }

    pub(crate) fn inherit<I>(
        pool: Arc<WorkerPool>,
        items: I,
        scope: Scope,
        debug: bool,
        reporter: Option<Arc<dyn Reporter>>,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let mut looped = Self::over_limited(items, pool.config().max_items);
        looped.pool = Some(pool);
        looped.scope = scope;
        looped.debug = Some(debug);
        looped.reporter = reporter;
        looped
    }

    /// Maximum items in flight at once
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Error policy for the whole invocation
    pub fn on_error(mut self, policy: ErrorPolicy) -> Self {
        self.policy = Ok(policy);
        self
    }

    /// Error policy by name; an unknown name fails the invocation before dispatch
    pub fn on_error_str(mut self, policy: &str) -> Self {
        self.policy = policy.parse();
        self
    }

    /// Adds variables visible to every item; names already captured are replaced
    pub fn capture(mut self, scope: Scope) -> Self {
        self.scope = self.scope.merge(&scope);
        self
    }

    /// Enable or disable per-item debug events
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    /// Name used in logs and reporter labels
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Run on a specific pool instead of the global one
    pub fn pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Reporter used when debug is on
    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Number of materialized items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True for an empty input
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Applies `f` to every item and waits for all of them
    ///
    /// `f` receives the item and an [`Iteration`] carrying its index and scope.
    /// Misuse (zero workers, unknown policy, unbounded input) is reported
    /// before any item runs. Under [`ErrorPolicy::Raise`] the first failure is
    /// returned as [`Error::ItemFailed`]; other policies never fail here.
    pub fn run<R, F>(self, f: F) -> Result<ResultCollection<R>>
    where
        R: Send,
        F: Fn(&T, &Iteration<'_>) -> Result<R> + Send + Sync,
    {
        let Loop {
            items,
            overflow,
            workers,
            policy,
            scope,
            binding,
            debug,
            label,
            pool,
            reporter,
        } = self;

        let policy = policy?;
        let pool = match pool {
            Some(pool) => pool,
            None => WorkerPool::global()?,
        };
        let workers = workers.unwrap_or(pool.config().default_workers);
        if workers == 0 {
            return Err(Error::InvalidWorkers { workers });
        }
        if let Some(limit) = overflow {
            return Err(Error::UnboundedInput { limit });
        }
        let limit = pool.config().max_items;
        if items.len() > limit {
            return Err(Error::UnboundedInput { limit });
        }

        let total = items.len();
        if total == 0 {
            return Ok(ResultCollection::empty(label, policy));
        }

        let debug = debug.unwrap_or(pool.config().debug);
        let reporter = if debug {
            Some(reporter.unwrap_or_else(default_reporter))
        } else {
            None
        };
        let lanes = workers.min(total);
        // A task on this thread must not sit below a work-stealing wait
        let inline = task::inside_task();
        let started = Instant::now();
        tracing::debug!(
            loop_label = %label,
            total,
            lanes,
            inline,
            policy = %policy,
            "loop dispatched"
        );

        let slots: Vec<Mutex<Option<Result<R>>>> = (0..total).map(|_| Mutex::new(None)).collect();
        let cursor = AtomicUsize::new(0);
        let halted = AtomicBool::new(false);
        let first_failure: Mutex<Option<(usize, Error)>> = Mutex::new(None);

        let run_item = |index: usize| -> Result<R> {
            let item = &items[index];
            let scope = match &binding {
                Some(binding) => scope.with(binding.name.clone(), (binding.to_value)(item)),
                None => scope.clone(),
            };
            let iteration = Iteration {
                index,
                total,
                scope,
                pool: &pool,
                debug,
                reporter: reporter.as_ref(),
            };

            let id = TaskId::next();
            let item_label = reporter.as_ref().map(|_| format!("{}[{}]", label, index));
            if let Some(item_label) = &item_label {
                report::notify_start(reporter.as_ref(), id, item_label);
            }
            let item_started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| f(item, &iteration))).unwrap_or_else(
                |payload| {
                    Err(Error::TaskPanicked {
                        task: format!("item-{}", index),
                        message: panic_message(payload.as_ref()),
                    })
                },
            );
            if let Some(item_label) = &item_label {
                let rendered = match &outcome {
                    Ok(_) => TaskOutcome::Succeeded,
                    Err(e) => TaskOutcome::Failed(e.to_string()),
                };
                report::notify_finish(
                    reporter.as_ref(),
                    id,
                    item_label,
                    item_started.elapsed(),
                    &rendered,
                );
            }
            outcome
        };

        let lane = || loop {
            if policy == ErrorPolicy::Raise && halted.load(Ordering::Acquire) {
                break;
            }
            let index = cursor.fetch_add(1, Ordering::AcqRel);
            if index >= total {
                break;
            }
            // Another lane may have failed between the check above and the claim
            if policy == ErrorPolicy::Raise && halted.load(Ordering::Acquire) {
                break;
            }
            let outcome = run_item(index);
            if let Err(e) = &outcome {
                tracing::debug!(loop_label = %label, index, error = %e, "loop item failed");
                if policy == ErrorPolicy::Raise {
                    first_failure.lock().get_or_insert_with(|| (index, e.clone()));
                    halted.store(true, Ordering::Release);
                }
            }
            *slots[index].lock() = Some(outcome);
        };

        if inline {
            lane();
        } else {
            pool.install(|| {
                rayon::scope(|s| {
                    for _ in 0..lanes {
                        s.spawn(|_| lane());
                    }
                })
            });
        }

        if let Some((index, error)) = first_failure.into_inner() {
            tracing::debug!(
                loop_label = %label,
                index,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "loop raised"
            );
            return Err(Error::ItemFailed {
                index,
                source: Box::new(error),
            });
        }

        let outcomes = slots.into_iter().map(Mutex::into_inner).collect();
        let collection = ResultCollection::from_outcomes(label, policy, outcomes);
        tracing::debug!(
            loop_label = %collection.label(),
            succeeded = collection.success_count(),
            failed = collection.errors().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "loop finished"
        );
        Ok(collection)
    }
}

impl<T: Send + Sync + Clone + Into<Value>> Loop<T> {
    /// Exposes each item in its iteration scope under `name`
    ///
    /// The binding is layered over captured variables, so it wins on a name
    /// clash. Loops declared from that iteration see it too.
    pub fn bind_as(mut self, name: impl Into<String>) -> Self {
        self.binding = Some(Binding {
            name: name.into(),
            to_value: |item: &T| item.clone().into(),
        });
        self
    }
}

impl<T> fmt::Debug for Loop<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("label", &self.label)
            .field("items", &self.items.len())
            .field("workers", &self.workers)
            .field("policy", &self.policy)
            .field("scope", &self.scope)
            .field("binding", &self.binding.as_ref().map(|b| &b.name))
            .field("debug", &self.debug)
            .finish()
    }
}

/// Per-item context handed to a loop body
pub struct Iteration<'a> {
    index: usize,
    total: usize,
    scope: Scope,
    pool: &'a Arc<WorkerPool>,
    debug: bool,
    reporter: Option<&'a Arc<dyn Reporter>>,
}

impl<'a> Iteration<'a> {
    /// Input index of this item
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of items in the loop
    pub fn total(&self) -> usize {
        self.total
    }

    /// Captured variables plus this item's binding
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Looks up a captured variable
    pub fn get(&self, name: &str) -> Result<Value> {
        self.scope.get(name)
    }

    /// Pool the loop runs on
    pub fn pool(&self) -> &Arc<WorkerPool> {
        self.pool
    }

    /// True when the loop reports debug events
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// A loop nested in this item, seeing this item's scope
    pub fn for_each<U, I>(&self, items: I) -> Loop<U>
    where
        U: Send + Sync,
        I: IntoIterator<Item = U>,
    {
        Loop::inherit(
            Arc::clone(self.pool),
            items,
            self.scope.clone(),
            self.debug,
            self.reporter.cloned(),
        )
    }

    /// Runs `body` in a flow whose calls execute on this worker as they are made
    pub fn flow<R, F>(&self, options: FlowOptions, body: F) -> Result<R>
    where
        F: FnOnce(&Flow) -> Result<R>,
    {
        let options = options.inherit(
            Arc::clone(self.pool),
            self.scope.clone(),
            self.debug,
            self.reporter.cloned(),
        );
        run_flow(options, body)
    }
}

impl fmt::Debug for Iteration<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iteration")
            .field("index", &self.index)
            .field("total", &self.total)
            .field("scope", &self.scope)
            .finish()
    }
}

fn materialize<T, I>(items: I, limit: usize) -> (Vec<T>, Option<usize>)
where
    I: IntoIterator<Item = T>,
{
    let mut iter = items.into_iter();
    // Endless iterators such as `0..` advertise a huge lower bound
    if iter.size_hint().0 > limit {
        return (Vec::new(), Some(limit));
    }
    let items: Vec<T> = iter.by_ref().take(limit).collect();
    let overflow = iter.next().is_some().then_some(limit);
    (items, overflow)
}

/// Parallel map: first error wins, no error bookkeeping
///
/// Runs on the global pool with the default worker count and returns plain
/// values in input order.
///
/// # Example
/// ```
/// let squared = undertow::pmap(|x: &i64| Ok(x * x), vec![1, 2, 3, 4]).unwrap();
/// assert_eq!(squared, vec![1, 4, 9, 16]);
/// ```
pub fn pmap<T, R, F, I>(f: F, items: I) -> Result<Vec<R>>
where
    T: Send + Sync,
    R: Send,
    F: Fn(&T) -> Result<R> + Send + Sync,
    I: IntoIterator<Item = T>,
{
    let results = Loop::over(items)
        .on_error(ErrorPolicy::Raise)
        .label("pmap")
        .run(|item, _| f(item))?;
    Ok(results.into_values())
}

/// [`pmap`] with an explicit engine configuration
///
/// Every field is honoured: `max_threads` caps the pool the map runs on,
/// `default_workers` sets the lane count, `max_items` bounds the input and
/// `debug` turns on reporting. The global pool is reused when its
/// configuration matches, otherwise a pool is built for this call.
pub fn pmap_with<T, R, F, I>(config: &EngineConfig, f: F, items: I) -> Result<Vec<R>>
where
    T: Send + Sync,
    R: Send,
    F: Fn(&T) -> Result<R> + Send + Sync,
    I: IntoIterator<Item = T>,
{
    let pool = pool_for(config)?;
    let results = Loop::over_limited(items, config.max_items)
        .pool(pool)
        .workers(config.default_workers)
        .debug(config.debug)
        .on_error(ErrorPolicy::Raise)
        .label("pmap")
        .run(|item, _| f(item))?;
    Ok(results.into_values())
}

fn pool_for(config: &EngineConfig) -> Result<Arc<WorkerPool>> {
    config.validate()?;
    let global = WorkerPool::global()?;
    if global.config() == config {
        return Ok(global);
    }
    Ok(Arc::new(WorkerPool::new(config.clone())?))
}
