//! Task scheduling: the task model, the ready queue, retry policy and the
//! orchestrator that ties them to the bridge and the sandbox pool.

pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod task;

pub use orchestrator::{Orchestrator, TaskEvent};
pub use queue::TaskQueue;
pub use retry::{RetryDecision, RetryPolicy};
pub use task::{Task, TaskFilter, TaskSnapshot, TaskSpec, TaskStatus};
