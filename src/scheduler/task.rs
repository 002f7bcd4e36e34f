//! Task model and lifecycle.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrorKind, TaskError};

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for capacity (or for its retry backoff).
    Queued,
    /// A sandbox is being leased and its worker awaited.
    Assigned,
    /// The work instruction is with the worker.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Queued, Assigned)
                | (Queued, Cancelled)
                | (Assigned, Running)
                | (Assigned, Queued)
                | (Assigned, Failed)
                | (Assigned, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Queued)
                | (Running, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// What the caller asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Sandbox category the task needs.
    pub category: String,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Handed to the worker's task action as its parameters.
    #[serde(default)]
    pub payload: Value,
}

impl TaskSpec {
    pub fn new(category: impl Into<String>, priority: i32, payload: Value) -> Self {
        Self {
            category: category.into(),
            priority,
            payload,
        }
    }
}

/// A unit of orchestrated work. Owned and mutated by the orchestrator only.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub assigned_worker_id: Option<String>,
    pub environment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub retry_count: u32,
    /// Enqueue order; kept across retries.
    pub seq: u64,
    /// Not eligible for scheduling before this instant (retry backoff).
    pub not_before: Option<Instant>,
}

impl Task {
    pub fn new(spec: TaskSpec, seq: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec,
            status: TaskStatus::Queued,
            assigned_worker_id: None,
            environment_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            error_kind: None,
            retry_count: 0,
            seq,
            not_before: None,
        }
    }

    /// Apply a status change, keeping timestamps and assignment consistent.
    pub fn transition_to(&mut self, status: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(status) {
            return Err(TaskError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.status = status;

        match status {
            TaskStatus::Running => {
                self.started_at = Some(Utc::now());
            }
            TaskStatus::Queued => {
                self.assigned_worker_id = None;
                self.environment_id = None;
                self.started_at = None;
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            TaskStatus::Assigned => {}
        }
        Ok(())
    }

    /// Record a failure message and its machine tag.
    pub fn record_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.error_kind = Some(kind);
        self.error = Some(message.into());
    }

    /// Whether the task may be picked up now.
    pub fn is_ready(&self, now: Instant) -> bool {
        self.status == TaskStatus::Queued && self.not_before.is_none_or(|t| t <= now)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            category: self.spec.category.clone(),
            priority: self.spec.priority,
            payload: self.spec.payload.clone(),
            status: self.status,
            assigned_worker_id: self.assigned_worker_id.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            result: self.result.clone(),
            error: self.error.clone(),
            error_kind: self.error_kind,
            retry_count: self.retry_count,
        }
    }
}

/// Read-only view of a task handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub category: String,
    pub priority: i32,
    pub payload: Value,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub retry_count: u32,
}

/// Selection for `list_tasks`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub category: Option<String>,
}

impl TaskFilter {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            category: None,
        }
    }

    pub fn matches(&self, task: &TaskSnapshot) -> bool {
        self.status.is_none_or(|s| s == task.status)
            && self
                .category
                .as_deref()
                .is_none_or(|c| c == task.category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Task {
        Task::new(TaskSpec::new("rust", 0, json!({"command": "true"})), 1)
    }

    #[test]
    fn lifecycle_transitions() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Queued.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Queued));
        assert!(Failed.is_terminal());
        assert!(!Assigned.is_terminal());
    }

    #[test]
    fn transition_sets_timestamps() {
        let mut t = task();
        t.transition_to(TaskStatus::Assigned).unwrap();
        t.assigned_worker_id = Some("w1".into());
        t.transition_to(TaskStatus::Running).unwrap();
        assert!(t.started_at.is_some());

        t.transition_to(TaskStatus::Queued).unwrap();
        assert!(t.assigned_worker_id.is_none());
        assert!(t.started_at.is_none());

        t.transition_to(TaskStatus::Cancelled).unwrap();
        assert!(t.completed_at.is_some());
        let err = t.transition_to(TaskStatus::Running).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
    }

    #[test]
    fn readiness_respects_backoff() {
        let mut t = task();
        let now = Instant::now();
        assert!(t.is_ready(now));
        t.not_before = Some(now + std::time::Duration::from_secs(1));
        assert!(!t.is_ready(now));
        assert!(t.is_ready(now + std::time::Duration::from_secs(2)));
    }

    #[test]
    fn snapshot_serializes_error_kind() {
        let mut t = task();
        t.record_error(ErrorKind::RemoteExecution, "exit 1");
        let value = serde_json::to_value(t.snapshot()).unwrap();
        assert_eq!(value["status"], "queued");
        assert_eq!(value["errorKind"], "remote_execution");
        assert_eq!(value["error"], "exit 1");
        assert!(value.get("startedAt").is_none());
    }

    #[test]
    fn filter_matches_status_and_category() {
        let snap = task().snapshot();
        assert!(TaskFilter::default().matches(&snap));
        assert!(TaskFilter::with_status(TaskStatus::Queued).matches(&snap));
        assert!(!TaskFilter::with_status(TaskStatus::Running).matches(&snap));
        let other = TaskFilter {
            status: None,
            category: Some("python".into()),
        };
        assert!(!other.matches(&snap));
    }

    #[test]
    fn status_parses_from_query_strings() {
        assert_eq!("running".parse::<TaskStatus>().unwrap(), TaskStatus::Running);
        assert!("paused".parse::<TaskStatus>().is_err());
    }
}
