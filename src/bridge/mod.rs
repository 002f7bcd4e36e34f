//! Communication bridge: agent directory plus the WebSocket server that
//! registers workers and routes traffic between them.

pub mod directory;
pub mod server;

pub use directory::{AgentDirectory, AgentInfo, WorkerStatus};
pub use server::{Bridge, BridgeEvent};
