//! End-to-end scheduling tests.
//!
//! The bridge and REST router run on a random port. Sandboxes are
//! in-process [`WorkerClient`]s started by a test provider, so every task
//! really travels bridge → worker → bridge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use autocoder::api::{self, ApiState};
use autocoder::bridge::Bridge;
use autocoder::config::{
    BackoffConfig, BridgeConfig, CategoryConfig, PoolConfig, SchedulerConfig, WorkerConfig,
};
use autocoder::error::{ErrorKind, ProvisioningError};
use autocoder::git::{BranchTracker, PrState};
use autocoder::pool::{PoolManager, ProvisionRequest, SandboxProvider};
use autocoder::scheduler::{Orchestrator, TaskSpec, TaskStatus};
use autocoder::worker::{ActionError, ActionHandler, HandlerRegistry, WorkerClient};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const WAIT: Duration = Duration::from_secs(10);

/// Shared view of what the task action saw.
#[derive(Default)]
struct ActionLog {
    /// (task name, agent id) in execution order.
    runs: StdMutex<Vec<(String, String)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    /// Set once the first `hang` task has started.
    hung: Notify,
    hang_once: AtomicBool,
}

impl ActionLog {
    fn names(&self) -> Vec<String> {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// The `run-task` action used by test sandboxes.
///
/// Payload: `{"name": ..., "sleepMs": ..., "fail": bool, "hangOnce": bool}`.
struct RecordingAction {
    agent_id: String,
    log: Arc<ActionLog>,
}

#[async_trait]
impl ActionHandler for RecordingAction {
    fn name(&self) -> &str {
        "run-task"
    }

    fn description(&self) -> &str {
        "Record the task and optionally sleep, fail or hang"
    }

    async fn execute(&self, params: Value) -> Result<Value, ActionError> {
        let name = params["name"].as_str().unwrap_or_default().to_string();
        self.log
            .runs
            .lock()
            .unwrap()
            .push((name.clone(), self.agent_id.clone()));

        let now = self.log.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_active.fetch_max(now, Ordering::SeqCst);

        if params["hangOnce"] == true && !self.log.hang_once.swap(true, Ordering::SeqCst) {
            self.log.hung.notify_one();
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if let Some(ms) = params["sleepMs"].as_u64() {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        self.log.active.fetch_sub(1, Ordering::SeqCst);
        if params["fail"] == true {
            return Err(ActionError::Failed(format!("{name} broke")));
        }
        Ok(json!({"name": name, "agentId": self.agent_id}))
    }
}

/// Provisions each sandbox as an in-process worker client.
struct InProcessProvider {
    log: Arc<ActionLog>,
    clients: Mutex<HashMap<String, Arc<WorkerClient>>>,
    provisioned: AtomicUsize,
}

impl InProcessProvider {
    fn new(log: Arc<ActionLog>) -> Self {
        Self {
            log,
            clients: Mutex::new(HashMap::new()),
            provisioned: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SandboxProvider for InProcessProvider {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<String, ProvisioningError> {
        let mut config = WorkerConfig::new(
            request.agent_id.clone(),
            request.room_id.clone(),
            request.role.clone(),
            request.bridge_url.clone(),
        );
        config.heartbeat_interval = Duration::from_secs(1);
        config.reconnect = BackoffConfig {
            base: Duration::from_millis(20),
            max: Duration::from_millis(200),
            jitter: false,
        };

        let handlers = HandlerRegistry::new();
        handlers.register_sync(Arc::new(RecordingAction {
            agent_id: request.agent_id.clone(),
            log: Arc::clone(&self.log),
        }));
        let client = WorkerClient::new(config, Arc::new(handlers));
        tokio::spawn(Arc::clone(&client).run());

        let handle = request.environment_id.to_string();
        self.clients.lock().await.insert(handle.clone(), client);
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn destroy(&self, handle: &str) -> Result<(), ProvisioningError> {
        if let Some(client) = self.clients.lock().await.remove(handle) {
            client.shutdown();
        }
        Ok(())
    }
}

struct Harness {
    port: u16,
    orchestrator: Arc<Orchestrator>,
    bridge: Arc<Bridge>,
    provider: Arc<InProcessProvider>,
    branches: Arc<BranchTracker>,
    log: Arc<ActionLog>,
}

/// Start bridge + pool + orchestrator + REST API on a random port.
async fn start(ceiling: usize, max_retries: u32) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let bridge = Bridge::new(BridgeConfig {
        port,
        register_grace: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(10),
        request_timeout: Duration::from_secs(5),
        orchestrator_id: "orchestrator".to_string(),
    });

    let log = Arc::new(ActionLog::default());
    let provider = Arc::new(InProcessProvider::new(Arc::clone(&log)));
    let pool = PoolManager::new(
        PoolConfig {
            categories: HashMap::from([(
                "rust".to_string(),
                CategoryConfig { ceiling, weight: 1 },
            )]),
            provision_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            bridge_url: format!("ws://127.0.0.1:{port}/ws"),
        },
        provider.clone(),
    );

    let branches = Arc::new(BranchTracker::new());
    let orchestrator = Orchestrator::new(
        SchedulerConfig {
            max_retries,
            retry_backoff: BackoffConfig {
                base: Duration::from_millis(10),
                max: Duration::from_millis(50),
                jitter: false,
            },
            schedule_interval: Duration::from_millis(100),
            task_timeout: Duration::from_secs(5),
            registration_timeout: Duration::from_secs(5),
            max_queued: 0,
            history_limit: 100,
            task_action: "run-task".to_string(),
            room_id: "test-room".to_string(),
        },
        Arc::clone(&bridge),
        pool,
        branches.clone(),
    );

    let app = api::router(ApiState {
        orchestrator: Arc::clone(&orchestrator),
        branches: Arc::clone(&branches),
    });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        port,
        orchestrator,
        bridge,
        provider,
        branches,
        log,
    }
}

fn task(name: &str, priority: i32) -> TaskSpec {
    TaskSpec::new("rust", priority, json!({"name": name}))
}

fn task_with(priority: i32, payload: Value) -> TaskSpec {
    TaskSpec::new("rust", priority, payload)
}

// ── Ordering ─────────────────────────────────────────────────────────

#[tokio::test]
async fn equal_priority_runs_in_submission_order() {
    timeout(TEST_TIMEOUT, async {
        let h = start(1, 3).await;

        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            ids.push(h.orchestrator.submit_task(task(name, 0)).await.unwrap());
        }
        h.orchestrator.spawn();

        for id in &ids {
            let snap = h.orchestrator.wait_for_task(*id, WAIT).await.unwrap();
            assert_eq!(snap.status, TaskStatus::Completed);
        }
        assert_eq!(h.log.names(), vec!["a", "b", "c"]);

        // One sandbox, reused for every task.
        assert_eq!(h.provider.provisioned.load(Ordering::SeqCst), 1);

        // Each completed task reached the git hand-off, which runs just
        // after the completion event.
        for id in &ids {
            let record = loop {
                if let Some(record) = h.branches.get(*id).await {
                    break record;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            };
            assert_eq!(record.state, PrState::BranchPushed);
        }

        let summary = h.orchestrator.summary().await;
        assert_eq!(summary.completed, 3);
        assert!((summary.success_rate - 1.0).abs() < f64::EPSILON);

        h.orchestrator.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn higher_priority_runs_first() {
    timeout(TEST_TIMEOUT, async {
        let h = start(1, 3).await;

        let low = h.orchestrator.submit_task(task("low", 0)).await.unwrap();
        let mid = h.orchestrator.submit_task(task("mid", 5)).await.unwrap();
        let high = h.orchestrator.submit_task(task("high", 10)).await.unwrap();
        h.orchestrator.spawn();

        for id in [low, mid, high] {
            h.orchestrator.wait_for_task(id, WAIT).await.unwrap();
        }
        assert_eq!(h.log.names(), vec!["high", "mid", "low"]);

        h.orchestrator.shutdown().await;
    })
    .await
    .expect("test timed out");
}

// ── Capacity ─────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrency_never_exceeds_the_ceiling() {
    timeout(TEST_TIMEOUT, async {
        let h = start(2, 3).await;
        h.orchestrator.spawn();

        let mut ids = Vec::new();
        for i in 0..6 {
            let spec = task_with(0, json!({"name": format!("t{i}"), "sleepMs": 100}));
            ids.push(h.orchestrator.submit_task(spec).await.unwrap());
        }

        // While the batch runs, the pool never holds more than two sandboxes.
        let pool = Arc::clone(h.orchestrator.pool());
        let watcher = tokio::spawn(async move {
            let mut max_total = 0;
            for _ in 0..20 {
                let status = pool.get_pool_status().await;
                max_total = max_total.max(status["rust"].total);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            max_total
        });

        for id in &ids {
            let snap = h.orchestrator.wait_for_task(*id, WAIT).await.unwrap();
            assert_eq!(snap.status, TaskStatus::Completed);
        }
        assert!(watcher.await.unwrap() <= 2);
        assert!(h.log.max_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(h.log.names().len(), 6);

        h.orchestrator.shutdown().await;
    })
    .await
    .expect("test timed out");
}

// ── Cancellation ─────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_queued_task_never_runs() {
    timeout(TEST_TIMEOUT, async {
        let h = start(1, 3).await;
        h.orchestrator.spawn();

        let first = h
            .orchestrator
            .submit_task(task_with(0, json!({"name": "first", "sleepMs": 300})))
            .await
            .unwrap();
        let second = h.orchestrator.submit_task(task("second", 0)).await.unwrap();

        assert!(h.orchestrator.cancel_task(second).await.unwrap());
        let snap = h.orchestrator.get_task_status(second).await.unwrap();
        assert_eq!(snap.status, TaskStatus::Cancelled);

        let snap = h.orchestrator.wait_for_task(first, WAIT).await.unwrap();
        assert_eq!(snap.status, TaskStatus::Completed);

        // Give the scheduler a few passes to prove `second` stays put.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.log.names(), vec!["first"]);
        assert_eq!(
            h.orchestrator.get_task_status(second).await.unwrap().status,
            TaskStatus::Cancelled
        );

        h.orchestrator.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancelling_a_running_task_tears_down_its_sandbox() {
    timeout(TEST_TIMEOUT, async {
        let h = start(1, 3).await;
        h.orchestrator.spawn();

        let id = h
            .orchestrator
            .submit_task(task_with(0, json!({"name": "stuck", "hangOnce": true})))
            .await
            .unwrap();
        h.log.hung.notified().await;
        assert_eq!(
            h.orchestrator.get_task_status(id).await.unwrap().status,
            TaskStatus::Running
        );

        assert!(h.orchestrator.cancel_task(id).await.unwrap());
        let snap = h.orchestrator.get_task_status(id).await.unwrap();
        assert_eq!(snap.status, TaskStatus::Cancelled);
        assert_eq!(snap.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(h.orchestrator.pool().get_pool_status().await["rust"].total, 0);

        h.orchestrator.shutdown().await;
    })
    .await
    .expect("test timed out");
}

// ── Failures ─────────────────────────────────────────────────────────

#[tokio::test]
async fn worker_lost_mid_task_is_retried_on_a_new_worker() {
    timeout(TEST_TIMEOUT, async {
        let h = start(1, 3).await;
        h.orchestrator.spawn();

        let id = h
            .orchestrator
            .submit_task(task_with(0, json!({"name": "flaky", "hangOnce": true})))
            .await
            .unwrap();
        h.log.hung.notified().await;

        let first_worker = h
            .orchestrator
            .get_task_status(id)
            .await
            .unwrap()
            .assigned_worker_id
            .unwrap();
        assert!(h.bridge.disconnect(&first_worker, "sandbox crashed").await);

        let snap = h.orchestrator.wait_for_task(id, WAIT).await.unwrap();
        assert_eq!(snap.status, TaskStatus::Completed);
        assert_eq!(snap.retry_count, 1);
        let second_worker = snap.assigned_worker_id.unwrap();
        assert_ne!(second_worker, first_worker);
        assert_eq!(snap.result.unwrap()["agentId"], second_worker);

        let runs = h.log.runs.lock().unwrap().clone();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].1, first_worker);
        assert_eq!(runs[1].1, second_worker);

        h.orchestrator.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn remote_failure_is_not_retried() {
    timeout(TEST_TIMEOUT, async {
        let h = start(1, 3).await;
        h.orchestrator.spawn();

        let id = h
            .orchestrator
            .submit_task(task_with(0, json!({"name": "broken", "fail": true})))
            .await
            .unwrap();

        let snap = h.orchestrator.wait_for_task(id, WAIT).await.unwrap();
        assert_eq!(snap.status, TaskStatus::Failed);
        assert_eq!(snap.retry_count, 0);
        assert_eq!(snap.error_kind, Some(ErrorKind::RemoteExecution));
        assert!(snap.error.unwrap().contains("broken broke"));
        assert_eq!(h.log.names(), vec!["broken"]);

        // No git hand-off for failures.
        assert!(h.branches.get(id).await.is_none());

        h.orchestrator.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn exhausted_retries_fail_the_task() {
    timeout(TEST_TIMEOUT, async {
        let h = start(1, 0).await;
        h.orchestrator.spawn();

        let id = h
            .orchestrator
            .submit_task(task_with(0, json!({"name": "flaky", "hangOnce": true})))
            .await
            .unwrap();
        h.log.hung.notified().await;

        let worker = h
            .orchestrator
            .get_task_status(id)
            .await
            .unwrap()
            .assigned_worker_id
            .unwrap();
        h.bridge.disconnect(&worker, "sandbox crashed").await;

        let snap = h.orchestrator.wait_for_task(id, WAIT).await.unwrap();
        assert_eq!(snap.status, TaskStatus::Failed);
        assert_eq!(snap.error_kind, Some(ErrorKind::Connection));
        assert_eq!(h.log.names(), vec!["flaky"]);

        h.orchestrator.shutdown().await;
    })
    .await
    .expect("test timed out");
}

// ── REST ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn rest_api_drives_a_task_to_completion() {
    timeout(TEST_TIMEOUT, async {
        let h = start(1, 3).await;
        h.orchestrator.spawn();

        let base = format!("http://127.0.0.1:{}", h.port);
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/api/tasks"))
            .json(&json!({"category": "rust", "payload": {"name": "rest"}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let created: Value = resp.json().await.unwrap();
        let id = created["id"].as_str().unwrap().parse().unwrap();

        let snap = h.orchestrator.wait_for_task(id, WAIT).await.unwrap();
        assert_eq!(snap.status, TaskStatus::Completed);

        let resp = reqwest::get(format!("{base}/api/tasks/{id}")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let status: Value = resp.json().await.unwrap();
        assert_eq!(status["status"], "completed");

        let summary: Value = reqwest::get(format!("{base}/api/summary"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(summary["completed"], 1);

        let agents: Vec<Value> = reqwest::get(format!("{base}/api/agents"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(agents.len(), 1);

        h.orchestrator.shutdown().await;
    })
    .await
    .expect("test timed out");
}
