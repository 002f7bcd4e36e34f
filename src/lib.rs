//! Autocoder — orchestration core for sandboxed coding workers.

pub mod api;
pub mod bridge;
pub mod config;
pub mod correlation;
pub mod error;
pub mod git;
pub mod pool;
pub mod protocol;
pub mod scheduler;
pub mod summary;
pub mod worker;
