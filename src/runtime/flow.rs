//! Flow execution contexts
//!
//! A flow is a scoped scheduling session. Calls handed to [`FlowHandle::spawn`]
//! are queued on the worker pool and the caller gets a [`TaskProxy`] back at
//! once; calls with inputs from other calls go through
//! [`FlowHandle::spawn_after`] and start only when those inputs have resolved.
//! Leaving the flow joins every task it scheduled, so nothing outlives it.
//!
//! ```
//! use std::time::Duration;
//! use undertow::{run_flow, FlowOptions, Ready};
//!
//! let total = run_flow(FlowOptions::new(), |fx| {
//!     let a = fx.spawn("a", || {
//!         std::thread::sleep(Duration::from_millis(20));
//!         Ok(2)
//!     });
//!     let b = fx.spawn("b", || Ok(3));
//!     let sum = fx.spawn_after("sum", (a, b, Ready(10)), |(a, b, c)| Ok(a + b + c));
//!     sum.resolve()
//! })
//! .unwrap();
//! assert_eq!(total, 15);
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::parallel::Loop;
use crate::report::{default_reporter, Reporter};
use crate::runtime::task::{Dependencies, Joinable, Task};
use crate::runtime::{Scope, TaskId, TaskProxy, WorkerPool};

/// Unique flow identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowId(Uuid);

impl FlowId {
    fn new() -> Self {
        FlowId(Uuid::new_v4())
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow-{}", self.0.simple())
    }
}

/// Where spawned calls execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    /// Queue on the worker pool
    Pool,
    /// Run on the calling thread at spawn time (flows entered from loop workers)
    Inline,
}

/// Settings for entering a flow
#[derive(Clone, Default)]
pub struct FlowOptions {
    debug: Option<bool>,
    label: Option<String>,
    pool: Option<Arc<WorkerPool>>,
    reporter: Option<Arc<dyn Reporter>>,
    scope: Scope,
    inline: bool,
    depth: usize,
}

impl FlowOptions {
    /// Defaults: global pool, debug from the pool's config, empty scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the debug reporter for this flow and what it schedules
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    /// Name used in logs
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Schedule on a specific pool instead of the global one
    pub fn pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Reporter used when debug is on
    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Variables made visible to loops declared inside the flow
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = self.scope.merge(&scope);
        self
    }

    pub(crate) fn inline(mut self) -> Self {
        self.inline = true;
        self
    }

    /// Fills unset options from a loop iteration; such flows always run inline
    pub(crate) fn inherit(
        self,
        pool: Arc<WorkerPool>,
        scope: Scope,
        debug: bool,
        reporter: Option<Arc<dyn Reporter>>,
    ) -> Self {
        FlowOptions {
            debug: self.debug.or(Some(debug)),
            label: self.label,
            pool: self.pool.or(Some(pool)),
            reporter: self.reporter.or(reporter),
            scope: scope.merge(&self.scope),
            inline: true,
            depth: self.depth + 1,
        }
    }
}

impl fmt::Debug for FlowOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowOptions")
            .field("debug", &self.debug)
            .field("label", &self.label)
            .field("has_pool", &self.pool.is_some())
            .field("has_reporter", &self.reporter.is_some())
            .field("scope", &self.scope)
            .field("inline", &self.inline)
            .finish()
    }
}

struct FlowShared {
    id: FlowId,
    label: String,
    depth: usize,
    pool: Arc<WorkerPool>,
    dispatch: Dispatch,
    debug: bool,
    reporter: Option<Arc<dyn Reporter>>,
    scope: Scope,
    outstanding: DashMap<TaskId, Arc<dyn Joinable>>,
    closed: AtomicBool,
}

/// Cloneable, thread-safe scheduling handle of a flow
///
/// Hand a clone to a spawned task so that it can schedule more work in the
/// same flow; such work is joined when the owning [`Flow`] exits.
#[derive(Clone)]
pub struct FlowHandle {
    shared: Arc<FlowShared>,
}

impl FlowHandle {
    /// Flow identifier
    pub fn id(&self) -> FlowId {
        self.shared.id
    }

    /// Flow label
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Nesting depth; 0 for a top-level flow
    pub fn depth(&self) -> usize {
        self.shared.depth
    }

    /// True when the debug reporter is active
    pub fn is_debug(&self) -> bool {
        self.shared.debug
    }

    /// Scope visible to loops declared in this flow
    pub fn scope(&self) -> &Scope {
        &self.shared.scope
    }

    /// Pool this flow schedules on
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.shared.pool
    }

    /// Tasks scheduled so far that have not been joined by exit
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.len()
    }

    /// Schedules `f` and returns its proxy immediately
    pub fn spawn<T, F>(&self, label: impl Into<String>, f: F) -> TaskProxy<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let task = Task::new(label, Box::new(f), self.shared.reporter.clone());
        self.track(&task);
        dispatch(&self.shared.pool, self.shared.dispatch, task.clone());
        TaskProxy::new(task)
    }

    /// Schedules `f` to run once every input in `deps` has resolved
    ///
    /// No worker blocks while waiting: the task is queued by whichever input
    /// finishes last. If an input failed, the task fails with
    /// [`Error::DependencyFailed`] without calling `f`.
    pub fn spawn_after<D, T, F>(&self, label: impl Into<String>, deps: D, f: F) -> TaskProxy<T>
    where
        D: Dependencies,
        T: Send + 'static,
        F: FnOnce(D::Output) -> Result<T> + Send + 'static,
    {
        let handles = deps.handles();
        let task = Task::new(
            label,
            Box::new(move || f(deps.collect()?)),
            self.shared.reporter.clone(),
        );
        self.track(&task);

        if handles.is_empty() {
            dispatch(&self.shared.pool, self.shared.dispatch, task.clone());
            return TaskProxy::new(task);
        }

        let remaining = Arc::new(AtomicUsize::new(handles.len()));
        for handle in handles {
            let remaining = Arc::clone(&remaining);
            let pool = Arc::clone(&self.shared.pool);
            let mode = self.shared.dispatch;
            let task = Arc::clone(&task);
            handle.subscribe(Box::new(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    dispatch(&pool, mode, task);
                }
            }));
        }
        TaskProxy::new(task)
    }

    /// Parallel loop that inherits this flow's pool, debug setting and scope
    pub fn for_each<T, I>(&self, items: I) -> Loop<T>
    where
        T: Send + Sync,
        I: IntoIterator<Item = T>,
    {
        Loop::inherit(
            Arc::clone(&self.shared.pool),
            items,
            self.shared.scope.clone(),
            self.shared.debug,
            self.shared.reporter.clone(),
        )
    }

    /// Enters an independent child flow sharing this flow's pool
    ///
    /// Unset options are inherited from this flow.
    pub fn nested(&self, options: FlowOptions) -> Result<Flow> {
        let scope = self.shared.scope.merge(&options.scope);
        let options = FlowOptions {
            debug: options.debug.or(Some(self.shared.debug)),
            pool: options.pool.or_else(|| Some(Arc::clone(&self.shared.pool))),
            reporter: options.reporter.or_else(|| self.shared.reporter.clone()),
            scope,
            inline: options.inline || self.shared.dispatch == Dispatch::Inline,
            depth: self.shared.depth + 1,
            label: options.label,
        };
        Flow::enter(options)
    }

    /// Runs `body` in a child flow and joins it
    pub fn run_nested<R, F>(&self, options: FlowOptions, body: F) -> Result<R>
    where
        F: FnOnce(&Flow) -> Result<R>,
    {
        finish(self.nested(options)?, body)
    }

    fn track<T: Send + 'static>(&self, task: &Arc<Task<T>>) {
        if self.shared.closed.load(Ordering::Acquire) {
            tracing::warn!(
                flow = %self.shared.id,
                task = %task.id(),
                "task scheduled after flow exit will not be joined"
            );
        }
        let joinable: Arc<dyn Joinable> = Arc::clone(task) as Arc<dyn Joinable>;
        self.shared.outstanding.insert(task.id(), joinable);
    }
}

impl fmt::Debug for FlowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowHandle")
            .field("id", &self.shared.id)
            .field("label", &self.shared.label)
            .field("depth", &self.shared.depth)
            .field("debug", &self.shared.debug)
            .field("outstanding", &self.shared.outstanding.len())
            .finish()
    }
}

fn dispatch<T: Send + 'static>(pool: &Arc<WorkerPool>, mode: Dispatch, task: Arc<Task<T>>) {
    match mode {
        Dispatch::Pool => pool.spawn(move || {
            task.run();
        }),
        Dispatch::Inline => {
            task.run();
        }
    }
}

/// An active flow; joins its tasks on [`exit`](Flow::exit) or drop
///
/// Dereferences to [`FlowHandle`] for scheduling.
pub struct Flow {
    handle: FlowHandle,
    started: Instant,
    exited: bool,
}

impl Flow {
    /// Enters a flow
    pub fn enter(options: FlowOptions) -> Result<Flow> {
        let pool = match options.pool {
            Some(pool) => pool,
            None => WorkerPool::global()?,
        };
        let is_debug = options.debug.unwrap_or(pool.config().debug);
        let reporter = if is_debug {
            Some(options.reporter.unwrap_or_else(default_reporter))
        } else {
            None
        };
        let id = FlowId::new();
        let label = options.label.unwrap_or_else(|| id.to_string());
        let dispatch = if options.inline {
            Dispatch::Inline
        } else {
            Dispatch::Pool
        };

        tracing::debug!(
            flow = %id,
            label = %label,
            depth = options.depth,
            debug = is_debug,
            "flow entered"
        );

        Ok(Flow {
            handle: FlowHandle {
                shared: Arc::new(FlowShared {
                    id,
                    label,
                    depth: options.depth,
                    pool,
                    dispatch,
                    debug: is_debug,
                    reporter,
                    scope: options.scope,
                    outstanding: DashMap::new(),
                    closed: AtomicBool::new(false),
                }),
            },
            started: Instant::now(),
            exited: false,
        })
    }

    /// A cloneable handle for scheduling from other threads
    pub fn handle(&self) -> FlowHandle {
        self.handle.clone()
    }

    /// Joins every task scheduled in this flow and leaves it
    ///
    /// Returns the first failure, in scheduling order, that no caller has
    /// already read through a proxy.
    pub fn exit(mut self) -> Result<()> {
        self.exited = true;
        let joined = self.join_all();
        match &joined {
            Ok(()) => tracing::debug!(
                flow = %self.handle.id(),
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "flow exited"
            ),
            Err(e) => tracing::warn!(
                flow = %self.handle.id(),
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                error = %e,
                "flow failed"
            ),
        }
        joined
    }

    fn join_all(&self) -> Result<()> {
        let shared = &self.handle.shared;
        let mut first_error: Option<Error> = None;
        let mut cursor: Option<TaskId> = None;

        // Tasks may schedule more tasks while we join; ids only grow, so keep
        // sweeping past the last id joined until nothing new appears.
        loop {
            let mut batch: Vec<(TaskId, Arc<dyn Joinable>)> = shared
                .outstanding
                .iter()
                .filter(|entry| cursor.map_or(true, |last| *entry.key() > last))
                .map(|entry| (*entry.key(), Arc::clone(entry.value())))
                .collect();
            if batch.is_empty() {
                break;
            }
            batch.sort_by_key(|(id, _)| *id);
            for (id, task) in batch {
                if let Some(err) = task.join() {
                    first_error.get_or_insert(err);
                }
                cursor = Some(id);
            }
        }

        shared.closed.store(true, Ordering::Release);
        shared.outstanding.clear();
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Deref for Flow {
    type Target = FlowHandle;

    fn deref(&self) -> &FlowHandle {
        &self.handle
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        if let Err(e) = self.join_all() {
            tracing::warn!(flow = %self.handle.id(), error = %e, "flow dropped with a failed task");
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("handle", &self.handle)
            .field("exited", &self.exited)
            .finish()
    }
}

/// Runs `body` inside a new flow and returns its value once every task joined
///
/// An error returned by `body` takes precedence over task failures found while
/// joining.
pub fn run_flow<R, F>(options: FlowOptions, body: F) -> Result<R>
where
    F: FnOnce(&Flow) -> Result<R>,
{
    finish(Flow::enter(options)?, body)
}

fn finish<R, F>(flow: Flow, body: F) -> Result<R>
where
    F: FnOnce(&Flow) -> Result<R>,
{
    let value = body(&flow);
    let joined = flow.exit();
    let value = value?;
    joined?;
    Ok(value)
}
