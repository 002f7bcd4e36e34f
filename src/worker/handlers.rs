//! Action handlers a worker exposes through `execute-action`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::ErrorKind;
use crate::protocol::error_content;

/// Failure reported by an action handler.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Execution failed: {0}")]
    Failed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// A named operation the worker can run on request.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn execute(&self, params: Value) -> Result<Value, ActionError>;
}

/// Extract a required string parameter.
pub fn require_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, ActionError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ActionError::InvalidParameters(format!("missing '{name}'")))
}

/// Aborts the handler task if the caller stops waiting for it.
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Registry of action handlers by name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler (sync version for startup).
    pub fn register_sync(&self, handler: Arc<dyn ActionHandler>) {
        let name = handler.name().to_string();
        if let Ok(mut handlers) = self.handlers.try_write() {
            handlers.insert(name.clone(), handler);
            tracing::debug!("Registered action: {}", name);
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.read().await.get(name).cloned()
    }

    /// Content of a `get-capabilities` response.
    pub async fn capabilities(&self) -> Value {
        let handlers = self.handlers.read().await;
        let mut actions: Vec<Value> = handlers
            .values()
            .map(|h| {
                serde_json::json!({
                    "name": h.name(),
                    "description": h.description(),
                })
            })
            .collect();
        actions.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        serde_json::json!({
            "requests": ["get-status", "get-capabilities", "execute-action", "cancel"],
            "actions": actions,
        })
    }

    /// Run an action and turn every outcome into response content.
    ///
    /// The handler runs on its own task so a panic surfaces as an error
    /// payload rather than tearing down the connection.
    pub async fn execute(&self, name: &str, params: Value) -> Value {
        let Some(handler) = self.get(name).await else {
            return error_content(
                ErrorKind::RemoteExecution,
                format!("no handler registered for action '{name}'"),
            );
        };

        let task = tokio::spawn(async move { handler.execute(params).await });
        let _abort = AbortOnDrop(task.abort_handle());
        let joined = task.await;
        match joined {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => error_content(ErrorKind::RemoteExecution, e.to_string()),
            Err(e) if e.is_panic() => {
                tracing::error!(action = %name, "Action handler panicked");
                error_content(ErrorKind::RemoteExecution, format!("action '{name}' panicked"))
            }
            Err(e) => error_content(ErrorKind::RemoteExecution, format!("action '{name}' aborted: {e}")),
        }
    }
}
