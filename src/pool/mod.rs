//! Sandbox pool manager and the providers that start sandboxes.

pub mod manager;
pub mod provider;

pub use manager::{CategoryStatus, EntryStatus, EnvironmentConfig, Lease, PoolEntry, PoolManager, PoolStatus};
pub use provider::{ProcessProvider, ProvisionRequest, SandboxProvider};
