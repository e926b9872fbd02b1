//! Tasks and task proxies
//!
//! A [`Task`] owns a callable until some thread claims it. Two parties race for
//! the claim: the pool job that dispatched it and any caller resolving its
//! [`TaskProxy`] first. Whoever flips `Pending → Running` runs the callable;
//! the other side just waits for the outcome. This gives exactly-once
//! execution and means a resolver on a saturated pool never waits on work that
//! nobody is running.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::report::{self, Reporter, TaskOutcome};

static TASK_COUNTER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Tasks executing on this thread, innermost last
    static RUNNING: RefCell<Vec<TaskId>> = RefCell::new(Vec::new());
}

/// Marks a task as executing on the current thread until dropped
struct RunningGuard;

impl RunningGuard {
    fn enter(id: TaskId) -> Self {
        RUNNING.with(|running| running.borrow_mut().push(id));
        RunningGuard
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        RUNNING.with(|running| {
            running.borrow_mut().pop();
        });
    }
}

/// True while the current thread is executing a task's callable
///
/// Work started from inside a task must not wait in a way that lets this
/// thread pick up unrelated jobs: a stolen job that resolves the task below it
/// on the stack can never be woken.
pub(crate) fn inside_task() -> bool {
    RUNNING.with(|running| !running.borrow().is_empty())
}

fn running_here(id: TaskId) -> bool {
    RUNNING.with(|running| running.borrow().contains(&id))
}

/// Unique, monotonically increasing task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocates the next identifier
    pub fn next() -> Self {
        TaskId(TASK_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw number (for tests and custom reporters)
    pub fn from_raw(raw: u64) -> Self {
        TaskId(raw)
    }

    /// The raw number
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Queued or waiting for its inputs
    Pending,
    /// Claimed by a thread
    Running,
    /// Finished with a value
    Completed,
    /// Finished with an error
    Failed,
}

impl TaskState {
    /// True for `Completed` and `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

pub(crate) type Job<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;
pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Cell<T> {
    state: TaskState,
    job: Option<Job<T>>,
    outcome: Option<Result<T>>,
    listeners: Vec<Callback>,
    finished_at: Option<DateTime<Utc>>,
}

/// One unit of scheduled work
pub(crate) struct Task<T> {
    id: TaskId,
    label: String,
    created_at: DateTime<Utc>,
    cell: Mutex<Cell<T>>,
    done: Condvar,
    /// Set once a reader has seen the error, so flow exit does not report it again
    observed: AtomicBool,
    reporter: Option<Arc<dyn Reporter>>,
}

impl<T: Send + 'static> Task<T> {
    pub(crate) fn new(
        label: impl Into<String>,
        job: Job<T>,
        reporter: Option<Arc<dyn Reporter>>,
    ) -> Arc<Self> {
        Arc::new(Task {
            id: TaskId::next(),
            label: label.into(),
            created_at: Utc::now(),
            cell: Mutex::new(Cell {
                state: TaskState::Pending,
                job: Some(job),
                outcome: None,
                listeners: Vec::new(),
                finished_at: None,
            }),
            done: Condvar::new(),
            observed: AtomicBool::new(false),
            reporter,
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn state(&self) -> TaskState {
        self.cell.lock().state
    }

    /// Claims and executes the callable; false if another thread already claimed it
    pub(crate) fn run(&self) -> bool {
        let job = {
            let mut cell = self.cell.lock();
            if cell.state != TaskState::Pending {
                return false;
            }
            cell.state = TaskState::Running;
            cell.job.take()
        };
        let Some(job) = job else {
            return false;
        };

        tracing::trace!(task = %self.id, label = %self.label, "task claimed");
        report::notify_start(self.reporter.as_ref(), self.id, &self.label);
        let started = Instant::now();
        let outcome = {
            let _running = RunningGuard::enter(self.id);
            catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
                Err(Error::TaskPanicked {
                    task: self.id.to_string(),
                    message: panic_message(payload.as_ref()),
                })
            })
        };
        let rendered = match &outcome {
            Ok(_) => TaskOutcome::Succeeded,
            Err(e) => TaskOutcome::Failed(e.to_string()),
        };
        // Reported before publishing so a joined flow has seen every event
        report::notify_finish(
            self.reporter.as_ref(),
            self.id,
            &self.label,
            started.elapsed(),
            &rendered,
        );
        self.complete(outcome);
        true
    }

    fn complete(&self, outcome: Result<T>) {
        let listeners = {
            let mut cell = self.cell.lock();
            cell.state = if outcome.is_ok() {
                TaskState::Completed
            } else {
                TaskState::Failed
            };
            cell.outcome = Some(outcome);
            cell.finished_at = Some(Utc::now());
            std::mem::take(&mut cell.listeners)
        };
        self.done.notify_all();
        for listener in listeners {
            listener();
        }
    }

    /// Runs `callback` once the task is terminal (immediately if it already is)
    pub(crate) fn on_complete(&self, callback: Callback) {
        {
            let mut cell = self.cell.lock();
            if !cell.state.is_terminal() {
                cell.listeners.push(callback);
                return;
            }
        }
        callback();
    }

    /// Blocks until terminal, running the callable here if nobody claimed it yet
    pub(crate) fn wait(&self) {
        self.run();
        let mut cell = self.cell.lock();
        while !cell.state.is_terminal() {
            self.done.wait(&mut cell);
        }
    }

    /// Blocks until terminal or until `timeout` elapses; never runs the callable
    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cell = self.cell.lock();
        while !cell.state.is_terminal() {
            if self.done.wait_until(&mut cell, deadline).timed_out() {
                return cell.state.is_terminal();
            }
        }
        true
    }

    /// Error of a failed task that nobody has read yet
    pub(crate) fn unobserved_error(&self) -> Option<Error> {
        if self.observed.load(Ordering::Acquire) {
            return None;
        }
        match &self.cell.lock().outcome {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    pub(crate) fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.cell.lock().finished_at
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    /// Cached outcome, if terminal
    pub(crate) fn outcome(&self) -> Option<Result<T>> {
        let outcome = self.cell.lock().outcome.clone();
        if let Some(Err(_)) = &outcome {
            self.observed.store(true, Ordering::Release);
        }
        outcome
    }
}

/// Type-erased view of a task used by flow bookkeeping and dependency tracking
pub(crate) trait Joinable: Send + Sync {
    fn task_id(&self) -> TaskId;
    fn join(&self) -> Option<Error>;
    fn subscribe(&self, callback: Callback);
}

impl<T: Send + 'static> Joinable for Task<T> {
    fn task_id(&self) -> TaskId {
        self.id
    }

    fn join(&self) -> Option<Error> {
        self.wait();
        self.unobserved_error()
    }

    fn subscribe(&self, callback: Callback) {
        self.on_complete(callback)
    }
}

/// Placeholder for a value that is still being computed
///
/// Cloning a proxy is cheap; every clone refers to the same task and cache.
pub struct TaskProxy<T> {
    task: Arc<Task<T>>,
}

impl<T> Clone for TaskProxy<T> {
    fn clone(&self) -> Self {
        TaskProxy {
            task: Arc::clone(&self.task),
        }
    }
}

impl<T: Send + 'static> TaskProxy<T> {
    pub(crate) fn new(task: Arc<Task<T>>) -> Self {
        TaskProxy { task }
    }

    pub(crate) fn joinable(&self) -> Arc<dyn Joinable> {
        Arc::clone(&self.task) as Arc<dyn Joinable>
    }

    /// Identifier of the underlying task
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// Label given at scheduling time
    pub fn label(&self) -> &str {
        self.task.label()
    }

    /// Current task state
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// True once the value or error is available without blocking
    pub fn is_resolved(&self) -> bool {
        self.state().is_terminal()
    }

    /// When the task was scheduled
    pub fn created_at(&self) -> DateTime<Utc> {
        self.task.created_at
    }

    /// When the task finished, if it has
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.task.finished_at()
    }
}

impl<T: Clone + Send + 'static> TaskProxy<T> {
    /// Returns the task's value, blocking until it is available
    ///
    /// The callable runs at most once; later calls return the cached value or
    /// the cached error.
    pub fn resolve(&self) -> Result<T> {
        if running_here(self.id()) {
            return Err(Error::runtime(format!(
                "{} was resolved from inside its own callable",
                self.id()
            )));
        }
        self.task.wait();
        self.task
            .outcome()
            .unwrap_or_else(|| Err(Error::runtime("task finished without an outcome")))
    }

    /// Like [`resolve`](Self::resolve) but gives up after `timeout`
    ///
    /// Expiry fails this demand only; the task keeps running and a later
    /// resolution can still succeed.
    pub fn resolve_timeout(&self, timeout: Duration) -> Result<T> {
        if !self.task.wait_for(timeout) {
            return Err(Error::Timeout(timeout));
        }
        self.resolve()
    }

    /// The cached outcome, or `None` while the task is still pending or running
    pub fn try_get(&self) -> Option<Result<T>> {
        self.task.outcome()
    }
}

impl<U: Clone + Send + 'static> TaskProxy<TaskProxy<U>> {
    /// Resolves through a proxy whose task produced another proxy
    pub fn flatten(&self) -> Result<U> {
        self.resolve()?.resolve()
    }
}

impl<T: Send + 'static> fmt::Debug for TaskProxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskProxy")
            .field("id", &self.id())
            .field("label", &self.label())
            .field("state", &self.state())
            .finish()
    }
}

/// Opaque handle on a value a dependent task waits for
pub struct DependencyHandle {
    inner: Arc<dyn Joinable>,
}

impl DependencyHandle {
    pub(crate) fn subscribe(self, callback: Callback) {
        self.inner.subscribe(callback)
    }

    /// Task this handle waits on
    pub fn task_id(&self) -> TaskId {
        self.inner.task_id()
    }
}

/// Inputs of a dependent task
///
/// The scheduler waits for every handle in [`handles`](Self::handles) before
/// queueing the task, then calls [`collect`](Self::collect) to turn the inputs
/// into concrete values. Callees never see a proxy.
pub trait Dependencies: Send + 'static {
    /// Concrete values handed to the dependent callable
    type Output: Send + 'static;

    /// Handles on the tasks these inputs wait for
    fn handles(&self) -> Vec<DependencyHandle>;

    /// Concrete values; an input's error becomes [`Error::DependencyFailed`]
    fn collect(self) -> Result<Self::Output>;
}

/// A plain value passed where a dependency is expected
#[derive(Debug, Clone, PartialEq)]
pub struct Ready<T>(pub T);

impl<T: Send + 'static> Dependencies for Ready<T> {
    type Output = T;

    fn handles(&self) -> Vec<DependencyHandle> {
        Vec::new()
    }

    fn collect(self) -> Result<T> {
        Ok(self.0)
    }
}

impl<T: Clone + Send + 'static> Dependencies for TaskProxy<T> {
    type Output = T;

    fn handles(&self) -> Vec<DependencyHandle> {
        vec![DependencyHandle {
            inner: self.joinable(),
        }]
    }

    fn collect(self) -> Result<T> {
        self.resolve().map_err(|e| Error::DependencyFailed {
            task: self.id(),
            source: Box::new(e),
        })
    }
}

impl<T: Clone + Send + 'static> Dependencies for Vec<TaskProxy<T>> {
    type Output = Vec<T>;

    fn handles(&self) -> Vec<DependencyHandle> {
        self.iter().flat_map(|proxy| proxy.handles()).collect()
    }

    fn collect(self) -> Result<Vec<T>> {
        self.into_iter().map(|proxy| proxy.collect()).collect()
    }
}

macro_rules! tuple_dependencies {
    ($($name:ident),+) => {
        impl<$($name: Dependencies),+> Dependencies for ($($name,)+) {
            type Output = ($(<$name as Dependencies>::Output,)+);

            #[allow(non_snake_case)]
            fn handles(&self) -> Vec<DependencyHandle> {
                let ($($name,)+) = self;
                let mut handles = Vec::new();
                $(handles.extend($name.handles());)+
                handles
            }

            #[allow(non_snake_case)]
            fn collect(self) -> Result<Self::Output> {
                let ($($name,)+) = self;
                Ok(($($name.collect()?,)+))
            }
        }
    };
}

tuple_dependencies!(A);
tuple_dependencies!(A, B);
tuple_dependencies!(A, B, C);
tuple_dependencies!(A, B, C, D);

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn proxy<T, F>(f: F) -> TaskProxy<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        TaskProxy::new(Task::new("test", Box::new(f), None))
    }

    #[test]
    fn test_task_ids_increase() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert!(b > a);
        assert_eq!(TaskId::from_raw(5).to_string(), "task-5");
    }

    #[test]
    fn test_resolve_runs_pending_task_inline() {
        let p = proxy(|| Ok(21 * 2));
        assert_eq!(p.state(), TaskState::Pending);
        assert_eq!(p.resolve().unwrap(), 42);
        assert_eq!(p.state(), TaskState::Completed);
        assert!(p.finished_at().is_some());
    }

    #[test]
    fn test_resolution_is_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let p = proxy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("value".to_string())
        });
        let q = p.clone();
        assert_eq!(p.resolve().unwrap(), "value");
        assert_eq!(q.resolve().unwrap(), "value");
        assert_eq!(p.try_get().unwrap().unwrap(), "value");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_errors_are_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let p: TaskProxy<i64> = proxy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::DivisionByZero)
        });
        assert!(matches!(p.resolve(), Err(Error::DivisionByZero)));
        assert!(matches!(p.resolve(), Err(Error::DivisionByZero)));
        assert_eq!(p.state(), TaskState::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panics_become_errors() {
        let p: TaskProxy<i64> = proxy(|| panic!("kaboom"));
        match p.resolve() {
            Err(Error::TaskPanicked { message, .. }) => assert_eq!(message, "kaboom"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_run_claims_once() {
        let p = proxy(|| Ok(1));
        assert!(p.task.run());
        assert!(!p.task.run());
    }

    #[test]
    fn test_try_get_before_run() {
        let p = proxy(|| Ok(1));
        assert!(p.try_get().is_none());
        assert!(!p.is_resolved());
    }

    #[test]
    fn test_listener_fires_after_completion() {
        let p = proxy(|| Ok(3));
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        p.task.on_complete(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(!fired.load(Ordering::SeqCst));
        p.resolve().unwrap();
        assert!(fired.load(Ordering::SeqCst));

        // Subscribing after completion fires immediately
        let late = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&late);
        p.task.on_complete(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(late.load(Ordering::SeqCst));
    }

    #[test]
    fn test_resolve_timeout_does_not_run_task() {
        let p = proxy(|| Ok(1));
        assert!(matches!(
            p.resolve_timeout(Duration::from_millis(10)),
            Err(Error::Timeout(_))
        ));
        assert_eq!(p.state(), TaskState::Pending);
        assert_eq!(p.resolve().unwrap(), 1);
    }

    #[test]
    fn test_flatten_nested_proxy() {
        let inner = proxy(|| Ok(7));
        let outer = proxy(move || Ok(inner));
        assert_eq!(outer.flatten().unwrap(), 7);
    }

    #[test]
    fn test_observed_errors_not_reported_again() {
        let p: TaskProxy<i64> = proxy(|| Err(Error::user("bad")));
        assert!(p.joinable().join().is_some());
        let _ = p.resolve();
        assert!(p.joinable().join().is_none());
    }

    #[test]
    fn test_dependency_collect() {
        let a = proxy(|| Ok(2));
        let b = proxy(|| Ok("x".to_string()));
        let deps = (a, Ready(5), b);
        assert_eq!(deps.handles().len(), 2);
        assert_eq!(deps.collect().unwrap(), (2, 5, "x".to_string()));
    }

    #[test]
    fn test_failed_dependency_is_wrapped() {
        let a: TaskProxy<i64> = proxy(|| Err(Error::DivisionByZero));
        let id = a.id();
        match a.collect() {
            Err(Error::DependencyFailed { task, source }) => {
                assert_eq!(task, id);
                assert!(matches!(*source, Error::DivisionByZero));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
