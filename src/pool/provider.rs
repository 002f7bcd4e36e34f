//! Sandbox providers: how an execution environment is actually started.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{ENV_AGENT_ID, ENV_BRIDGE_URL, ENV_CATEGORY, ENV_ROLE, ENV_ROOM_ID};
use crate::error::ProvisioningError;

/// Grace period for a child to exit after being killed.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Everything a provider needs to start one worker sandbox.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub environment_id: Uuid,
    pub category: String,
    pub agent_id: String,
    pub room_id: String,
    pub role: String,
    pub bridge_url: String,
    /// Extra environment passed through to the worker.
    pub env: HashMap<String, String>,
}

impl ProvisionRequest {
    /// Environment variables carrying the worker's injected identity.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.extend([
            (ENV_AGENT_ID.to_string(), self.agent_id.clone()),
            (ENV_ROOM_ID.to_string(), self.room_id.clone()),
            (ENV_ROLE.to_string(), self.role.clone()),
            (ENV_BRIDGE_URL.to_string(), self.bridge_url.clone()),
            (ENV_CATEGORY.to_string(), self.category.clone()),
        ]);
        vars
    }
}

/// Starts and stops isolated execution environments.
///
/// `provision` returns once the environment has been launched; the worker
/// inside it registers with the bridge on its own afterwards.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Launch a sandbox. Returns a provider-specific handle; using the
    /// environment id lets a sandbox be torn down before its handle is known.
    async fn provision(&self, request: &ProvisionRequest) -> Result<String, ProvisioningError>;

    /// Tear a sandbox down. Unknown handles are not an error.
    async fn destroy(&self, handle: &str) -> Result<(), ProvisioningError>;
}

/// Runs each sandbox as a local child process of the worker binary.
pub struct ProcessProvider {
    program: PathBuf,
    args: Vec<String>,
    /// Parent of per-environment working directories.
    workdir_root: Option<PathBuf>,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessProvider {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            workdir_root: None,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Launch `<current executable> worker` for every sandbox.
    pub fn current_exe() -> Result<Self, ProvisioningError> {
        let program = std::env::current_exe().map_err(|e| ProvisioningError::Failed {
            category: "*".to_string(),
            reason: format!("cannot locate worker binary: {e}"),
        })?;
        Ok(Self::new(program, vec!["worker".to_string()]))
    }

    /// Give every sandbox its own directory under `root`.
    pub fn with_workdir_root(mut self, root: PathBuf) -> Self {
        self.workdir_root = Some(root);
        self
    }

    pub async fn running(&self) -> usize {
        self.children.lock().await.len()
    }
}

#[async_trait]
impl SandboxProvider for ProcessProvider {
    fn name(&self) -> &str {
        "process"
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<String, ProvisioningError> {
        let failed = |reason: String| ProvisioningError::Failed {
            category: request.category.clone(),
            reason,
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(request.env_vars())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(root) = &self.workdir_root {
            let dir = root.join(request.environment_id.to_string());
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| failed(format!("cannot create {}: {e}", dir.display())))?;
            command.current_dir(&dir).env("AUTOCODER_WORKDIR", &dir);
        }

        let child = command
            .spawn()
            .map_err(|e| failed(format!("spawn {}: {e}", self.program.display())))?;
        let handle = request.environment_id.to_string();

        tracing::info!(
            environment_id = %request.environment_id,
            agent_id = %request.agent_id,
            pid = child.id().unwrap_or_default(),
            "Started sandbox process"
        );
        self.children.lock().await.insert(handle.clone(), child);
        Ok(handle)
    }

    async fn destroy(&self, handle: &str) -> Result<(), ProvisioningError> {
        let Some(mut child) = self.children.lock().await.remove(handle) else {
            return Ok(());
        };

        if let Err(e) = child.start_kill() {
            tracing::warn!(handle = %handle, error = %e, "Failed to kill sandbox process (may already be gone)");
        }
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(handle = %handle, status = %status, "Stopped sandbox process");
            }
            Ok(Err(e)) => {
                tracing::warn!(handle = %handle, error = %e, "Failed to reap sandbox process");
            }
            Err(_) => {
                tracing::warn!(handle = %handle, "Sandbox process did not exit within grace period");
            }
        }

        if let Some(root) = &self.workdir_root {
            let dir = root.join(handle);
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove sandbox directory");
            }
        }
        Ok(())
    }
}
