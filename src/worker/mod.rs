//! Worker agent: the process that runs inside a sandbox.
//!
//! - `connection` — connection state machine and offline queue
//! - `handlers` — named actions answered through `execute-action`
//! - `shell` — the built-in `run-task` action
//! - `client` — bridge session: register, heartbeat, reconnect, dispatch

pub mod client;
pub mod connection;
pub mod handlers;
pub mod shell;

pub use client::WorkerClient;
pub use connection::{Connection, ConnectionState, Delivery};
pub use handlers::{ActionError, ActionHandler, HandlerRegistry};
pub use shell::ShellAction;
