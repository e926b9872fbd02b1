//! Runtime pieces shared by flows and loops: values, scopes, the worker pool and tasks

mod flow;
mod pool;
mod scope;
pub(crate) mod task;
mod value;

pub use flow::{run_flow, Flow, FlowHandle, FlowId, FlowOptions};
pub use pool::WorkerPool;
pub use scope::Scope;
pub use task::{Dependencies, DependencyHandle, Ready, TaskId, TaskProxy, TaskState};
pub use value::Value;
