//! Debug and progress reporting
//!
//! Reporters observe task and loop-item lifecycles. They never influence
//! scheduling: every call goes through [`notify_start`] / [`notify_finish`],
//! which swallow panics raised by the reporter.

use std::fmt;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::runtime::TaskId;

/// How an observed unit of work ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Returned a value
    Succeeded,
    /// Returned or panicked with an error, rendered as text
    Failed(String),
}

impl TaskOutcome {
    /// True for [`TaskOutcome::Succeeded`]
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Succeeded => write!(f, "ok"),
            TaskOutcome::Failed(message) => write!(f, "failed: {}", message),
        }
    }
}

/// Observer of task start/finish events
pub trait Reporter: Send + Sync {
    /// A task or loop item began executing
    fn on_task_start(&self, id: TaskId, label: &str);

    /// A task or loop item finished
    fn on_task_finish(&self, id: TaskId, label: &str, duration: Duration, outcome: &TaskOutcome);
}

/// Emits `tracing` events; the default reporter for `debug = true`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn on_task_start(&self, id: TaskId, label: &str) {
        tracing::debug!(task = %id, label, "task started");
    }

    fn on_task_finish(&self, id: TaskId, label: &str, duration: Duration, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Succeeded => tracing::debug!(
                task = %id,
                label,
                elapsed_ms = duration.as_millis() as u64,
                "task finished"
            ),
            TaskOutcome::Failed(message) => tracing::warn!(
                task = %id,
                label,
                elapsed_ms = duration.as_millis() as u64,
                error = %message,
                "task failed"
            ),
        }
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl Reporter for SilentReporter {
    fn on_task_start(&self, _id: TaskId, _label: &str) {}

    fn on_task_finish(&self, _id: TaskId, _label: &str, _duration: Duration, _outcome: &TaskOutcome) {}
}

/// Renders one text line per event to a writer
///
/// Lines look like `[3/5] fetch[2] (task-17) ok in 104ms`, where the counter is
/// finished/started so far. Write errors are ignored.
pub struct ProgressReporter {
    sink: Mutex<Box<dyn Write + Send>>,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl ProgressReporter {
    /// Reports to any writer
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        ProgressReporter {
            sink: Mutex::new(Box::new(sink)),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    /// Reports to standard error
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }

    /// Events started so far
    pub fn started(&self) -> usize {
        self.started.load(Ordering::Acquire)
    }

    /// Events finished so far
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::Acquire)
    }

    fn write_line(&self, line: fmt::Arguments<'_>) {
        let mut sink = self.sink.lock();
        let _ = sink.write_fmt(line);
        let _ = sink.write_all(b"\n");
        let _ = sink.flush();
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("started", &self.started())
            .field("finished", &self.finished())
            .finish()
    }
}

impl Reporter for ProgressReporter {
    fn on_task_start(&self, id: TaskId, label: &str) {
        let started = self.started.fetch_add(1, Ordering::AcqRel) + 1;
        let finished = self.finished();
        self.write_line(format_args!(
            "[{}/{}] {} ({}) started",
            finished, started, label, id
        ));
    }

    fn on_task_finish(&self, id: TaskId, label: &str, duration: Duration, outcome: &TaskOutcome) {
        let finished = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        let started = self.started();
        self.write_line(format_args!(
            "[{}/{}] {} ({}) {} in {}ms",
            finished,
            started,
            label,
            id,
            outcome,
            duration.as_millis()
        ));
    }
}

/// Reporter used when debug is on and none was supplied
pub fn default_reporter() -> Arc<dyn Reporter> {
    Arc::new(TracingReporter)
}

pub(crate) fn notify_start(reporter: Option<&Arc<dyn Reporter>>, id: TaskId, label: &str) {
    if let Some(reporter) = reporter {
        let delivered = catch_unwind(AssertUnwindSafe(|| reporter.on_task_start(id, label)));
        if delivered.is_err() {
            tracing::warn!(task = %id, "reporter panicked on start event");
        }
    }
}

pub(crate) fn notify_finish(
    reporter: Option<&Arc<dyn Reporter>>,
    id: TaskId,
    label: &str,
    duration: Duration,
    outcome: &TaskOutcome,
) {
    if let Some(reporter) = reporter {
        let delivered = catch_unwind(AssertUnwindSafe(|| {
            reporter.on_task_finish(id, label, duration, outcome)
        }));
        if delivered.is_err() {
            tracing::warn!(task = %id, "reporter panicked on finish event");
        }
    }
}
