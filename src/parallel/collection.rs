//! Ordered loop results

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Index;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::parallel::ErrorPolicy;

/// Outcome stored for one input index
#[derive(Debug, Clone)]
pub enum Slot<R> {
    /// The item's value
    Value(R),
    /// The item failed under [`ErrorPolicy::Continue`]
    Empty,
    /// The item failed under [`ErrorPolicy::Collect`]; the error doubles as a sentinel
    Failed(Error),
}

impl<R> Slot<R> {
    /// True when the item produced a value
    pub fn is_value(&self) -> bool {
        matches!(self, Slot::Value(_))
    }

    /// The value, if any
    pub fn value(&self) -> Option<&R> {
        match self {
            Slot::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The error sentinel, if any
    pub fn error(&self) -> Option<&Error> {
        match self {
            Slot::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Consumes the slot, keeping only a value
    pub fn into_value(self) -> Option<R> {
        match self {
            Slot::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Index-aligned results of one loop invocation
///
/// `collection[i]` always comes from `input[i]`, whatever order the workers
/// finished in. Failed items are listed in [`errors`](Self::errors), and
/// `success_count() + errors().len() == total_count()` for every policy.
#[derive(Debug, Clone)]
pub struct ResultCollection<R> {
    label: String,
    policy: ErrorPolicy,
    slots: Vec<Slot<R>>,
    errors: BTreeMap<usize, Error>,
    success_count: usize,
}

impl<R> ResultCollection<R> {
    pub(crate) fn from_outcomes(
        label: String,
        policy: ErrorPolicy,
        outcomes: Vec<Option<Result<R>>>,
    ) -> Self {
        let mut errors = BTreeMap::new();
        let mut success_count = 0;
        let slots = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| match outcome {
                Some(Ok(value)) => {
                    success_count += 1;
                    Slot::Value(value)
                }
                Some(Err(error)) => {
                    let slot = match policy {
                        ErrorPolicy::Collect => Slot::Failed(error.clone()),
                        _ => Slot::Empty,
                    };
                    errors.insert(index, error);
                    slot
                }
                None => {
                    errors.insert(
                        index,
                        Error::runtime(format!("item {} was never dispatched", index)),
                    );
                    Slot::Empty
                }
            })
            .collect();

        ResultCollection {
            label,
            policy,
            slots,
            errors,
            success_count,
        }
    }

    pub(crate) fn empty(label: String, policy: ErrorPolicy) -> Self {
        ResultCollection {
            label,
            policy,
            slots: Vec::new(),
            errors: BTreeMap::new(),
            success_count: 0,
        }
    }

    /// Number of input items
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True for an empty input
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Value for input index `i`, if that item succeeded
    pub fn get(&self, index: usize) -> Option<&R> {
        self.slots.get(index).and_then(Slot::value)
    }

    /// Slot for input index `i`
    pub fn slot(&self, index: usize) -> Option<&Slot<R>> {
        self.slots.get(index)
    }

    /// Slots in input order
    pub fn iter(&self) -> std::slice::Iter<'_, Slot<R>> {
        self.slots.iter()
    }

    /// Successful values in input order
    pub fn values(&self) -> impl Iterator<Item = &R> + '_ {
        self.slots.iter().filter_map(Slot::value)
    }

    /// Errors keyed by input index
    pub fn errors(&self) -> &BTreeMap<usize, Error> {
        &self.errors
    }

    /// Items that produced a value
    pub fn success_count(&self) -> usize {
        self.success_count
    }

    /// Items in the input
    pub fn total_count(&self) -> usize {
        self.slots.len()
    }

    /// True when no item failed
    pub fn all_successful(&self) -> bool {
        self.success_count == self.total_count()
    }

    /// Policy the loop ran with
    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    /// Loop label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Successful values in input order, dropping failed slots
    pub fn into_values(self) -> Vec<R> {
        self.slots.into_iter().filter_map(Slot::into_value).collect()
    }

    /// One `Option` per input index
    pub fn into_options(self) -> Vec<Option<R>> {
        self.slots.into_iter().map(Slot::into_value).collect()
    }

    /// One `Result` per input index
    pub fn into_results(self) -> Vec<Result<R>> {
        let mut errors = self.errors;
        self.slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| match slot {
                Slot::Value(v) => Ok(v),
                Slot::Failed(e) => Err(e),
                Slot::Empty => Err(errors
                    .remove(&index)
                    .unwrap_or_else(|| Error::runtime("missing result"))),
            })
            .collect()
    }

    /// Counts and errors, ready for serialization
    pub fn summary(&self) -> LoopSummary {
        LoopSummary {
            label: self.label.clone(),
            policy: self.policy,
            total: self.total_count(),
            succeeded: self.success_count,
            failed: self.errors.len(),
            errors: self
                .errors
                .iter()
                .map(|(index, error)| (*index, error.to_string()))
                .collect(),
        }
    }
}

impl<R> Index<usize> for ResultCollection<R> {
    type Output = Slot<R>;

    fn index(&self, index: usize) -> &Slot<R> {
        &self.slots[index]
    }
}

impl<'a, R> IntoIterator for &'a ResultCollection<R> {
    type Item = &'a Slot<R>;
    type IntoIter = std::slice::Iter<'a, Slot<R>>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.iter()
    }
}

impl<R> IntoIterator for ResultCollection<R> {
    type Item = Slot<R>;
    type IntoIter = std::vec::IntoIter<Slot<R>>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.into_iter()
    }
}

/// Renders like a list, with `None` for failed items
impl<R: fmt::Display> fmt::Display for ResultCollection<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, slot) in self.slots.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match slot {
                Slot::Value(v) => write!(f, "{}", v)?,
                _ => write!(f, "None")?,
            }
        }
        write!(f, "]")
    }
}

/// Serializable digest of a [`ResultCollection`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopSummary {
    /// Loop label
    pub label: String,
    /// Policy the loop ran with
    pub policy: ErrorPolicy,
    /// Items in the input
    pub total: usize,
    /// Items that produced a value
    pub succeeded: usize,
    /// Items that failed
    pub failed: usize,
    /// Rendered errors keyed by input index
    pub errors: BTreeMap<usize, String>,
}
