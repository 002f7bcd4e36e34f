//! Git collaboration boundary.
//!
//! Once a task completes, the orchestrator hands its snapshot to a
//! [`GitCollaborator`]. The built-in [`BranchTracker`] only records the
//! branch and pull-request state; pushing and opening PRs are left to
//! whatever sits behind this trait in a real deployment.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::GitError;
use crate::scheduler::task::{TaskSnapshot, TaskStatus};

const BRANCH_PREFIX: &str = "autocoder/task-";

/// Workflow state of a task's branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    BranchPushed,
    PrOpen,
    Merged,
    Closed,
}

impl PrState {
    pub fn can_transition_to(&self, target: PrState) -> bool {
        use PrState::*;

        matches!(
            (self, target),
            (BranchPushed, PrOpen) | (BranchPushed, Closed) | (PrOpen, Merged) | (PrOpen, Closed)
        )
    }
}

impl std::fmt::Display for PrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BranchPushed => "branch_pushed",
            Self::PrOpen => "pr_open",
            Self::Merged => "merged",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRecord {
    pub task_id: Uuid,
    pub branch: String,
    pub state: PrState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Receives completed tasks from the orchestrator.
#[async_trait]
pub trait GitCollaborator: Send + Sync {
    async fn on_task_completed(&self, task: &TaskSnapshot) -> Result<BranchRecord, GitError>;
}

/// Branch name for a task: the payload's `branch` if it is usable,
/// otherwise `autocoder/task-<first 8 hex of the id>`.
pub fn branch_name(task: &TaskSnapshot) -> String {
    task.payload
        .get("branch")
        .and_then(|b| b.as_str())
        .map(str::trim)
        .filter(|b| is_valid_branch(b))
        .map(str::to_string)
        .unwrap_or_else(|| {
            let id = task.id.simple().to_string();
            format!("{BRANCH_PREFIX}{}", &id[..8])
        })
}

fn is_valid_branch(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.ends_with(".lock")
        && !name.contains("..")
        && !name.contains("//")
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
}

/// In-memory branch/PR bookkeeping.
#[derive(Debug, Default)]
pub struct BranchTracker {
    records: RwLock<HashMap<Uuid, BranchRecord>>,
}

impl BranchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, task_id: Uuid) -> Option<BranchRecord> {
        self.records.read().await.get(&task_id).cloned()
    }

    pub async fn list(&self) -> Vec<BranchRecord> {
        let mut records: Vec<BranchRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.updated_at);
        records
    }

    pub async fn open_pr(&self, task_id: Uuid, url: impl Into<String>) -> Result<BranchRecord, GitError> {
        let url = url.into();
        self.advance(task_id, PrState::PrOpen, Some(url)).await
    }

    pub async fn mark_merged(&self, task_id: Uuid) -> Result<BranchRecord, GitError> {
        self.advance(task_id, PrState::Merged, None).await
    }

    pub async fn close(&self, task_id: Uuid) -> Result<BranchRecord, GitError> {
        self.advance(task_id, PrState::Closed, None).await
    }

    async fn advance(
        &self,
        task_id: Uuid,
        state: PrState,
        pr_url: Option<String>,
    ) -> Result<BranchRecord, GitError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&task_id)
            .ok_or(GitError::UnknownTask { id: task_id })?;
        if !record.state.can_transition_to(state) {
            return Err(GitError::InvalidTransition {
                id: task_id,
                from: record.state.to_string(),
                to: state.to_string(),
            });
        }
        record.state = state;
        if pr_url.is_some() {
            record.pr_url = pr_url;
        }
        record.updated_at = Utc::now();
        info!(task_id = %task_id, branch = %record.branch, state = %state, "Branch state changed");
        Ok(record.clone())
    }
}

#[async_trait]
impl GitCollaborator for BranchTracker {
    async fn on_task_completed(&self, task: &TaskSnapshot) -> Result<BranchRecord, GitError> {
        if task.status != TaskStatus::Completed {
            return Err(GitError::NotCompleted {
                id: task.id,
                status: task.status.to_string(),
            });
        }

        let record = BranchRecord {
            task_id: task.id,
            branch: branch_name(task),
            state: PrState::BranchPushed,
            pr_url: None,
            updated_at: Utc::now(),
        };
        info!(task_id = %task.id, branch = %record.branch, "Recorded task branch");
        self.records.write().await.insert(task.id, record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{Task, TaskSpec};
    use serde_json::json;

    fn completed(payload: serde_json::Value) -> TaskSnapshot {
        let mut task = Task::new(TaskSpec::new("rust", 0, payload), 1);
        task.transition_to(TaskStatus::Assigned).unwrap();
        task.transition_to(TaskStatus::Running).unwrap();
        task.transition_to(TaskStatus::Completed).unwrap();
        task.snapshot()
    }

    #[test]
    fn branch_name_prefers_valid_payload_branch() {
        let snap = completed(json!({"branch": "feature/login"}));
        assert_eq!(branch_name(&snap), "feature/login");

        let bad = completed(json!({"branch": "has space"}));
        assert!(branch_name(&bad).starts_with(BRANCH_PREFIX));

        let none = completed(json!({}));
        let name = branch_name(&none);
        assert_eq!(name.len(), BRANCH_PREFIX.len() + 8);
    }

    #[tokio::test]
    async fn pr_workflow() {
        let tracker = BranchTracker::new();
        let snap = completed(json!({}));
        let record = tracker.on_task_completed(&snap).await.unwrap();
        assert_eq!(record.state, PrState::BranchPushed);

        let open = tracker.open_pr(snap.id, "https://example.test/pr/1").await.unwrap();
        assert_eq!(open.state, PrState::PrOpen);
        assert_eq!(open.pr_url.as_deref(), Some("https://example.test/pr/1"));

        let merged = tracker.mark_merged(snap.id).await.unwrap();
        assert_eq!(merged.state, PrState::Merged);

        let err = tracker.close(snap.id).await.unwrap_err();
        assert!(matches!(err, GitError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn only_completed_tasks_get_branches() {
        let tracker = BranchTracker::new();
        let queued = Task::new(TaskSpec::new("rust", 0, json!({})), 1).snapshot();
        assert!(tracker.on_task_completed(&queued).await.is_err());
        assert!(matches!(
            tracker.mark_merged(queued.id).await,
            Err(GitError::UnknownTask { .. })
        ));
    }
}
