//! Batch summary artifact: aggregate counts plus per-task results.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::scheduler::task::{TaskSnapshot, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub queued: usize,
    /// Assigned or running.
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Completed share of finished tasks, 0.0 when none have finished.
    pub success_rate: f64,
    pub tasks: Vec<TaskSnapshot>,
}

impl BatchSummary {
    pub fn from_tasks(mut tasks: Vec<TaskSnapshot>) -> Self {
        tasks.sort_by_key(|t| t.created_at);

        let count = |pred: fn(TaskStatus) -> bool| tasks.iter().filter(|t| pred(t.status)).count();
        let queued = count(|s| s == TaskStatus::Queued);
        let running = count(|s| matches!(s, TaskStatus::Assigned | TaskStatus::Running));
        let completed = count(|s| s == TaskStatus::Completed);
        let failed = count(|s| s == TaskStatus::Failed);
        let cancelled = count(|s| s == TaskStatus::Cancelled);

        let finished = completed + failed + cancelled;
        let success_rate = if finished == 0 {
            0.0
        } else {
            completed as f64 / finished as f64
        };

        Self {
            generated_at: Utc::now(),
            total: tasks.len(),
            queued,
            running,
            completed,
            failed,
            cancelled,
            success_rate,
            tasks,
        }
    }

    /// Write the summary as pretty JSON, replacing `path` atomically.
    pub async fn write_to(&self, path: &Path) -> Result<(), Error> {
        let json = serde_json::to_vec_pretty(self)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::info!(path = %path.display(), total = self.total, "Wrote batch summary");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{Task, TaskSpec};
    use serde_json::json;

    fn snapshot(path: &[TaskStatus]) -> TaskSnapshot {
        let mut task = Task::new(TaskSpec::new("rust", 0, json!({})), 0);
        for status in path {
            task.transition_to(*status).unwrap();
        }
        task.snapshot()
    }

    fn batch() -> Vec<TaskSnapshot> {
        use TaskStatus::*;
        vec![
            snapshot(&[Assigned, Running, Completed]),
            snapshot(&[Assigned, Running, Completed]),
            snapshot(&[Assigned, Running, Completed]),
            snapshot(&[Assigned, Running, Failed]),
            snapshot(&[Cancelled]),
            snapshot(&[Assigned, Running]),
            snapshot(&[]),
        ]
    }

    #[test]
    fn counts_and_success_rate() {
        let summary = BatchSummary::from_tasks(batch());
        assert_eq!(summary.total, 7);
        assert_eq!(summary.completed, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.running, 1);
        assert_eq!(summary.queued, 1);
        assert!((summary.success_rate - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_batch_has_zero_rate() {
        let summary = BatchSummary::from_tasks(Vec::new());
        assert_eq!(summary.total, 0);
        assert_eq!(summary.success_rate, 0.0);
    }

    #[tokio::test]
    async fn writes_json_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("summary.json");
        let summary = BatchSummary::from_tasks(batch());
        summary.write_to(&path).await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["completed"], 3);
        assert_eq!(value["tasks"].as_array().unwrap().len(), 7);
        assert!(value.get("successRate").is_some());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
