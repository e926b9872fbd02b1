//! Error types for Undertow flows and loops

use std::time::Duration;

use thiserror::Error;

use crate::runtime::TaskId;

/// Undertow scheduling errors
///
/// Errors are `Clone` because a resolved task caches its outcome and hands the
/// same error to every reader of its proxy.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Per-item failures
    /// A scheduled callable returned an error
    ///
    /// **Triggered by:** `Err(..)` returned from a flow task or loop body
    #[error("Task failed: {message}")]
    TaskFailed {
        /// Failure description
        message: String,
    },

    /// A loop item failed under the `raise` policy
    ///
    /// **Triggered by:** the first failing item of a `raise`-policy loop or `pmap`
    /// **Example:** `pmap(|n| 10 / n, [1, 2, 0, 4])` fails with index 2
    #[error("Item {index} failed: {source}")]
    ItemFailed {
        /// Input index of the failing item
        index: usize,
        /// Error raised by the item
        source: Box<Error>,
    },

    /// A task could not start because one of its inputs failed
    #[error("Dependency {task} failed: {source}")]
    DependencyFailed {
        /// Task whose outcome was consumed
        task: TaskId,
        /// Error carried by the dependency
        source: Box<Error>,
    },

    /// A scheduled callable panicked
    ///
    /// **Recovery:** Fatal for the task, still isolated by loop policies
    #[error("Task {task} panicked: {message}")]
    TaskPanicked {
        /// Panicking task (or `item-N` for loop items)
        task: String,
        /// Panic payload rendered as text
        message: String,
    },

    // Misuse
    /// Worker count outside the accepted range
    ///
    /// **Triggered by:** `Loop::over(items).workers(0)`
    #[error("Invalid worker count: {workers} (must be at least 1)")]
    InvalidWorkers {
        /// Requested worker count
        workers: usize,
    },

    /// Unknown error policy name
    #[error("Invalid error policy: {value} (expected continue, collect or raise)")]
    InvalidPolicy {
        /// Rejected policy text
        value: String,
    },

    /// Input exceeded the materialization limit
    ///
    /// **Triggered by:** an unbounded iterator such as `(0..)` handed to a loop
    #[error("Input exceeds {limit} items; loops require finite input")]
    UnboundedInput {
        /// Configured item limit
        limit: usize,
    },

    // Resource errors
    /// Resolution deadline elapsed
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The worker pool could not be created
    #[error("Failed to build worker pool: {0}")]
    PoolBuild(String),

    // Value access
    /// Type mismatch when reading a captured value
    #[error("Type error: expected {expected}, got {got}")]
    TypeError {
        /// Expected type
        expected: String,
        /// Actual type
        got: String,
    },

    /// Captured scope lookup failed
    #[error("Undefined variable: {name}")]
    UndefinedVariable {
        /// Variable name
        name: String,
    },

    /// Division by zero
    #[error("Division by zero")]
    DivisionByZero,

    // User-defined
    /// User-defined error
    #[error("User error: {0}")]
    UserError(String),

    /// General runtime error
    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

/// Error severity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Programmer error reported at invocation time
    Misuse,
    /// Per-item or per-task failure, isolated by loop policies
    Recoverable,
    /// Panic inside scheduled code
    Fatal,
}

impl Error {
    /// Create a runtime error with a message
    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::RuntimeError(msg.into())
    }

    /// Create a user error with a message
    pub fn user(msg: impl Into<String>) -> Self {
        Error::UserError(msg.into())
    }

    /// Create a task failure from anything printable
    pub fn task_failed(msg: impl std::fmt::Display) -> Self {
        Error::TaskFailed {
            message: msg.to_string(),
        }
    }

    /// Classify error severity
    pub fn classify(&self) -> ErrorSeverity {
        match self {
            Error::InvalidWorkers { .. }
            | Error::InvalidPolicy { .. }
            | Error::UnboundedInput { .. }
            | Error::PoolBuild(_) => ErrorSeverity::Misuse,

            Error::TaskPanicked { .. } => ErrorSeverity::Fatal,

            Error::ItemFailed { source, .. } | Error::DependencyFailed { source, .. } => {
                source.classify()
            }

            _ => ErrorSeverity::Recoverable,
        }
    }

    /// True for errors raised at invocation time rather than from scheduled code
    pub fn is_misuse(&self) -> bool {
        self.classify() == ErrorSeverity::Misuse
    }

    /// Innermost error, skipping item and dependency wrappers
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::ItemFailed { source, .. } | Error::DependencyFailed { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

/// Result type for Undertow operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_misuse_classification() {
        assert!(Error::InvalidWorkers { workers: 0 }.is_misuse());
        assert!(Error::InvalidPolicy {
            value: "retry".to_string()
        }
        .is_misuse());
        assert!(!Error::DivisionByZero.is_misuse());
    }

    #[test]
    fn test_item_failure_classifies_as_source() {
        let err = Error::ItemFailed {
            index: 2,
            source: Box::new(Error::TaskPanicked {
                task: "item-2".to_string(),
                message: "boom".to_string(),
            }),
        };
        assert_eq!(err.classify(), ErrorSeverity::Fatal);
    }

    #[test]
    fn test_root_cause_unwraps_nesting() {
        let err = Error::DependencyFailed {
            task: TaskId::from_raw(7),
            source: Box::new(Error::ItemFailed {
                index: 1,
                source: Box::new(Error::DivisionByZero),
            }),
        };
        assert!(matches!(err.root_cause(), Error::DivisionByZero));
        assert_eq!(
            err.to_string(),
            "Dependency task-7 failed: Item 1 failed: Division by zero"
        );
    }
}
