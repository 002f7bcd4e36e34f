//! Task scheduler and orchestrator.
//!
//! The orchestrator owns every task. Callers submit, query and cancel
//! through its methods; a background loop runs scheduling passes on
//! submission, when a worker frees up, and on a timer. Each assignment
//! spawns one attempt driver that provisions (or reuses) a sandbox, waits
//! for its worker to register, sends the work instruction over the bridge
//! and reports the outcome back here.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::queue::TaskQueue;
use super::retry::{RetryDecision, RetryPolicy};
use super::task::{Task, TaskFilter, TaskSnapshot, TaskSpec, TaskStatus};
use crate::bridge::{Bridge, BridgeEvent};
use crate::config::SchedulerConfig;
use crate::error::{Error, ErrorKind, ProvisioningError, TaskError};
use crate::git::GitCollaborator;
use crate::pool::{EnvironmentConfig, Lease, PoolManager};
use crate::protocol::WorkerRequest;
use crate::summary::BatchSummary;

const EVENT_CAPACITY: usize = 1024;

/// Role given to workers started for tasks.
const TASK_ROLE: &str = "coder";

/// A task changed status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub at: DateTime<Utc>,
    pub task: TaskSnapshot,
}

#[derive(Default)]
struct SchedulerState {
    /// Non-terminal tasks.
    tasks: HashMap<Uuid, Task>,
    queue: TaskQueue,
    /// Terminal tasks, oldest first.
    history: VecDeque<TaskSnapshot>,
    drivers: HashMap<Uuid, JoinHandle<()>>,
    next_seq: u64,
}

impl SchedulerState {
    fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// What to do with an environment once an attempt is over.
enum Teardown {
    Release,
    Destroy,
}

pub struct Orchestrator {
    config: SchedulerConfig,
    retry: RetryPolicy,
    bridge: Arc<Bridge>,
    pool: Arc<PoolManager>,
    git: Arc<dyn GitCollaborator>,
    state: Mutex<SchedulerState>,
    wake: Notify,
    events: broadcast::Sender<TaskEvent>,
}

impl Orchestrator {
    pub fn new(
        config: SchedulerConfig,
        bridge: Arc<Bridge>,
        pool: Arc<PoolManager>,
        git: Arc<dyn GitCollaborator>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            retry: RetryPolicy::new(config.max_retries, config.retry_backoff),
            config,
            bridge,
            pool,
            git,
            state: Mutex::new(SchedulerState::default()),
            wake: Notify::new(),
            events,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn emit(&self, task: &Task) {
        let _ = self.events.send(TaskEvent {
            at: Utc::now(),
            task: task.snapshot(),
        });
    }

    // ── Task API ─────────────────────────────────────────────────────────

    /// Queue a task and return its id immediately.
    pub async fn submit_task(&self, spec: TaskSpec) -> Result<Uuid, Error> {
        if !self.pool.categories().any(|c| c == spec.category) {
            return Err(ProvisioningError::UnknownCategory {
                category: spec.category,
            }
            .into());
        }

        let id = {
            let mut state = self.state.lock().await;
            if self.config.max_queued > 0 && state.queued() >= self.config.max_queued {
                return Err(Error::CapacityExceeded {
                    what: "task queue".to_string(),
                    limit: self.config.max_queued,
                });
            }
            state.next_seq += 1;
            let task = Task::new(spec, state.next_seq);
            let id = task.id;
            info!(
                task_id = %id,
                category = %task.spec.category,
                priority = task.spec.priority,
                "Task submitted"
            );
            state.queue.push(&task);
            self.emit(&task);
            state.tasks.insert(id, task);
            id
        };

        self.wake.notify_one();
        Ok(id)
    }

    pub async fn get_task_status(&self, id: Uuid) -> Result<TaskSnapshot, Error> {
        let state = self.state.lock().await;
        if let Some(task) = state.tasks.get(&id) {
            return Ok(task.snapshot());
        }
        state
            .history
            .iter()
            .rev()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound { id }.into())
    }

    /// Active and retained terminal tasks matching `filter`, oldest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Vec<TaskSnapshot> {
        let state = self.state.lock().await;
        let mut tasks: Vec<TaskSnapshot> = state
            .tasks
            .values()
            .map(Task::snapshot)
            .chain(state.history.iter().cloned())
            .filter(|t| filter.matches(t))
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Cancel a task. Queued tasks are cancelled with certainty; for a task
    /// already handed to a worker the worker gets a best-effort cancel and
    /// the task is marked cancelled regardless. Returns false if the task
    /// had already finished.
    pub async fn cancel_task(&self, id: Uuid) -> Result<bool, Error> {
        let (previous, lease) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            let Some(task) = state.tasks.get_mut(&id) else {
                return if state.history.iter().any(|t| t.id == id) {
                    Ok(false)
                } else {
                    Err(TaskError::NotFound { id }.into())
                };
            };
            let previous = task.status;

            if previous == TaskStatus::Queued {
                state.queue.remove(task);
            }
            if let Some(driver) = state.drivers.remove(&id) {
                driver.abort();
            }

            let lease = task.assigned_worker_id.clone().zip(task.environment_id);
            task.transition_to(TaskStatus::Cancelled)?;
            task.record_error(ErrorKind::Cancelled, "cancelled by caller");
            info!(task_id = %id, from = %previous, "Task cancelled");

            self.finalize(state, id);
            (previous, lease)
        };

        if let Some((agent_id, environment_id)) = lease {
            if previous == TaskStatus::Running {
                let content = WorkerRequest::Cancel {
                    task_id: Some(id.to_string()),
                }
                .to_content();
                if let Err(e) = self.bridge.notify(&agent_id, content).await {
                    debug!(task_id = %id, agent_id = %agent_id, error = %e, "Cancel signal not delivered");
                }
            }
            self.teardown(&agent_id, environment_id, Teardown::Destroy, "task cancelled")
                .await;
        }

        self.wake.notify_one();
        Ok(true)
    }

    /// Wait until task `id` is terminal or `timeout` elapses, returning the
    /// latest snapshot either way.
    pub async fn wait_for_task(&self, id: Uuid, timeout: Duration) -> Result<TaskSnapshot, Error> {
        let mut rx = self.subscribe();
        let current = self.get_task_status(id).await?;
        if current.status.is_terminal() {
            return Ok(current);
        }

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(event) if event.task.id == id && event.task.status.is_terminal() => {
                        return Some(event.task);
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(snapshot)) => Ok(snapshot),
            _ => self.get_task_status(id).await,
        }
    }

    pub async fn summary(&self) -> BatchSummary {
        BatchSummary::from_tasks(self.list_tasks(&TaskFilter::default()).await)
    }

    // ── Scheduling ───────────────────────────────────────────────────────

    /// Start the scheduling loop and the bridge watcher.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let _ = self.spawn_bridge_watcher();

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orchestrator.config.schedule_interval);
            loop {
                tokio::select! {
                    _ = orchestrator.wake.notified() => {}
                    _ = ticker.tick() => {}
                }
                orchestrator.schedule_pass().await;
            }
        })
    }

    /// Tear down idle sandboxes whose worker left the bridge.
    fn spawn_bridge_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut rx = self.bridge.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(BridgeEvent::AgentLeft { agent_id, reason, .. }) => {
                        orchestrator.on_agent_left(&agent_id, &reason).await;
                    }
                    Ok(BridgeEvent::AgentJoined(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Bridge event watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn on_agent_left(&self, agent_id: &str, reason: &str) {
        let Some(entry) = self.pool.entry_for_agent(agent_id).await else {
            return;
        };
        // Busy workers are handled by their attempt driver, whose request
        // fails with a connection error.
        match self.pool.destroy_if_idle(entry.id).await {
            Ok(true) => {
                info!(agent_id = %agent_id, reason = %reason, "Idle worker left, destroyed its sandbox");
                self.wake.notify_one();
            }
            Ok(false) => {}
            Err(e) => {
                warn!(environment_id = %entry.id, error = %e, "Failed to destroy abandoned sandbox");
            }
        }
    }

    /// One pass over the queue: assign every ready task whose category has
    /// capacity, in priority order. Returns the number of tasks assigned.
    pub async fn schedule_pass(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let candidates: Vec<Uuid> = state.queue.iter().collect();
        let mut full: HashSet<String> = HashSet::new();
        let mut assigned = 0;

        for id in candidates {
            let Some(task) = state.tasks.get(&id) else {
                continue;
            };
            if !task.is_ready(now) || full.contains(&task.spec.category) {
                continue;
            }
            let category = task.spec.category.clone();

            match self.pool.lease(&category).await {
                Ok(Some(lease)) => {
                    self.assign(&mut state, id, lease);
                    assigned += 1;
                }
                Ok(None) => {
                    debug!(category = %category, "Category at capacity, task stays queued");
                    full.insert(category);
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Task cannot be scheduled");
                    let state = &mut *state;
                    if let Some(task) = state.tasks.get_mut(&id) {
                        state.queue.remove(task);
                        task.record_error(e.kind(), e.to_string());
                        // Queued → Assigned → Failed keeps the lifecycle intact.
                        let _ = task.transition_to(TaskStatus::Assigned);
                        let _ = task.transition_to(TaskStatus::Failed);
                    }
                    self.finalize(state, id);
                }
            }
        }

        if assigned > 0 {
            debug!(assigned, queued = state.queued(), "Scheduling pass");
        }
        assigned
    }

    fn assign(self: &Arc<Self>, state: &mut SchedulerState, id: Uuid, lease: Lease) {
        let Some(task) = state.tasks.get_mut(&id) else {
            return;
        };
        if task.transition_to(TaskStatus::Assigned).is_err() {
            return;
        }
        task.assigned_worker_id = Some(lease.agent_id.clone());
        task.environment_id = Some(lease.environment_id);
        task.not_before = None;
        let payload = task.spec.payload.clone();
        let snapshot = task.clone();

        state.queue.remove(&snapshot);
        self.emit(&snapshot);
        info!(
            task_id = %id,
            agent_id = %lease.agent_id,
            environment_id = %lease.environment_id,
            reused = lease.reused,
            attempt = snapshot.retry_count + 1,
            "Task assigned"
        );

        let orchestrator = Arc::clone(self);
        let driver = tokio::spawn(async move {
            let outcome = orchestrator.run_attempt(id, &lease, payload).await;
            orchestrator.finish_attempt(id, lease, outcome).await;
        });
        state.drivers.insert(id, driver);
    }

    /// Bring the sandbox up, wait for its worker and run the task on it.
    async fn run_attempt(&self, id: Uuid, lease: &Lease, payload: Value) -> Result<Value, Error> {
        let environment = EnvironmentConfig::new(self.config.room_id.clone(), TASK_ROLE);
        self.pool.provision_lease(lease, &environment).await?;
        self.bridge
            .wait_for_agent(&lease.agent_id, self.config.registration_timeout)
            .await?;

        self.bridge.mark_busy(&lease.agent_id).await;
        {
            let mut state = self.state.lock().await;
            let task = state
                .tasks
                .get_mut(&id)
                .ok_or(TaskError::NotFound { id })?;
            task.transition_to(TaskStatus::Running)?;
            self.emit(task);
        }
        info!(task_id = %id, agent_id = %lease.agent_id, "Task running");

        let content = WorkerRequest::execute(self.config.task_action.clone(), payload).to_content();
        self.bridge
            .send_request(&lease.agent_id, content, self.config.task_timeout)
            .await
    }

    async fn finish_attempt(self: &Arc<Self>, id: Uuid, lease: Lease, outcome: Result<Value, Error>) {
        let mut completed = None;
        let mut retry_after = None;

        let teardown = {
            let mut state = self.state.lock().await;
            state.drivers.remove(&id);
            let Some(task) = state.tasks.get_mut(&id) else {
                // Cancelled while the attempt was finishing.
                return;
            };

            match outcome {
                Ok(result) => {
                    task.result = Some(result);
                    task.error = None;
                    task.error_kind = None;
                    if let Err(e) = task.transition_to(TaskStatus::Completed) {
                        warn!(task_id = %id, error = %e, "Unexpected completion");
                    }
                    info!(task_id = %id, agent_id = %lease.agent_id, "Task completed");
                    completed = self.finalize(&mut state, id);
                    Teardown::Release
                }
                Err(e) => match self.retry.decide(task.retry_count, &e) {
                    RetryDecision::Retry { delay } => {
                        task.retry_count += 1;
                        task.record_error(e.kind(), e.to_string());
                        if let Err(err) = task.transition_to(TaskStatus::Queued) {
                            warn!(task_id = %id, error = %err, "Unexpected requeue");
                        }
                        task.not_before = Some(Instant::now() + delay);
                        warn!(
                            task_id = %id,
                            error = %e,
                            retry = task.retry_count,
                            delay_ms = delay.as_millis() as u64,
                            "Transient failure, task requeued"
                        );
                        let task = task.clone();
                        state.queue.push(&task);
                        self.emit(&task);
                        retry_after = Some(delay);
                        Teardown::Destroy
                    }
                    RetryDecision::Exhausted => {
                        task.record_error(e.kind(), e.to_string());
                        let _ = task.transition_to(TaskStatus::Failed);
                        warn!(task_id = %id, error = %e, retries = task.retry_count, "Retries exhausted, task failed");
                        self.finalize(&mut state, id);
                        Teardown::Destroy
                    }
                    RetryDecision::Fail => {
                        task.record_error(e.kind(), e.to_string());
                        let _ = task.transition_to(TaskStatus::Failed);
                        warn!(task_id = %id, error = %e, "Task failed");
                        self.finalize(&mut state, id);
                        Teardown::Release
                    }
                },
            }
        };

        self.teardown(&lease.agent_id, lease.environment_id, teardown, "attempt ended")
            .await;

        if let Some(snapshot) = completed {
            if let Err(e) = self.git.on_task_completed(&snapshot).await {
                warn!(task_id = %id, error = %e, "Git hand-off failed");
            }
        }

        if let Some(delay) = retry_after {
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                orchestrator.wake.notify_one();
            });
        }
        self.wake.notify_one();
    }

    async fn teardown(&self, agent_id: &str, environment_id: Uuid, teardown: Teardown, reason: &str) {
        match teardown {
            Teardown::Release => {
                self.bridge.mark_idle(agent_id).await;
                if !self.pool.release(environment_id).await {
                    debug!(environment_id = %environment_id, "Environment already gone on release");
                }
            }
            Teardown::Destroy => {
                self.bridge.disconnect(agent_id, reason).await;
                if let Err(e) = self.pool.destroy_environment(environment_id).await {
                    warn!(environment_id = %environment_id, error = %e, "Failed to destroy environment");
                }
            }
        }
    }

    /// Move a terminal task from the active set into history.
    fn finalize(&self, state: &mut SchedulerState, id: Uuid) -> Option<TaskSnapshot> {
        let task = state.tasks.remove(&id)?;
        self.emit(&task);
        let snapshot = task.snapshot();
        state.history.push_back(snapshot.clone());
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }
        Some(snapshot)
    }

    /// Abort all attempts and destroy every sandbox.
    pub async fn shutdown(&self) {
        let drivers: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock().await;
            state.drivers.drain().map(|(_, d)| d).collect()
        };
        for driver in drivers {
            driver.abort();
        }
        self.pool.shutdown().await;
        info!("Orchestrator stopped");
    }
}
