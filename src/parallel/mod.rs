//! Parallel loop execution
//!
//! [`Loop`] runs a function over a finite input with bounded concurrency and a
//! per-invocation [`ErrorPolicy`]; [`pmap`] is the fail-fast shorthand.

mod collection;
mod executor;
mod policy;

pub use collection::{LoopSummary, ResultCollection, Slot};
pub use executor::{pmap, pmap_with, Iteration, Loop};
pub use policy::ErrorPolicy;
