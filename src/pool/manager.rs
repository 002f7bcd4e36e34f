//! Sandbox pool: per-category accounting of live execution environments.
//!
//! The pool never queues. [`PoolManager::lease`] either hands out an
//! environment (an idle one first, otherwise a slot to provision) or
//! reports that the category is at its ceiling, and the scheduler keeps the
//! task queued until capacity frees up.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::provider::{ProvisionRequest, SandboxProvider};
use crate::config::{CategoryConfig, PoolConfig};
use crate::error::{Error, ProvisioningError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Idle,
    /// Leased to a task, or being provisioned for one.
    Busy,
    Terminating,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Terminating => write!(f, "terminating"),
        }
    }
}

/// One execution environment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntry {
    pub id: Uuid,
    pub category: String,
    pub status: EntryStatus,
    pub weight: usize,
    /// Identity injected into the sandbox's worker.
    pub agent_id: String,
    /// Provider handle, empty while provisioning.
    pub provider_handle: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub last_used: Instant,
}

/// Identity and extras for a new environment.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub room_id: String,
    pub role: String,
    pub env: HashMap<String, String>,
}

impl EnvironmentConfig {
    pub fn new(room_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            role: role.into(),
            env: HashMap::new(),
        }
    }
}

/// An environment leased to one task attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub environment_id: Uuid,
    pub agent_id: String,
    pub category: String,
    /// True if an idle environment was handed out instead of a new one.
    pub reused: bool,
}

/// Capacity of one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStatus {
    /// Live environments (idle + busy).
    pub total: usize,
    /// Tasks that could start right now: idle environments plus free slots.
    pub available: usize,
    pub busy: usize,
    pub ceiling: usize,
}

/// Per-category capacity report.
pub type PoolStatus = BTreeMap<String, CategoryStatus>;

pub struct PoolManager {
    config: PoolConfig,
    provider: Arc<dyn SandboxProvider>,
    entries: RwLock<HashMap<Uuid, PoolEntry>>,
}

impl PoolManager {
    pub fn new(config: PoolConfig, provider: Arc<dyn SandboxProvider>) -> Arc<Self> {
        Arc::new(Self {
            config,
            provider,
            entries: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.config.categories.keys().map(String::as_str)
    }

    fn category(&self, category: &str) -> Result<CategoryConfig, ProvisioningError> {
        self.config
            .categories
            .get(category)
            .copied()
            .ok_or_else(|| ProvisioningError::UnknownCategory {
                category: category.to_string(),
            })
    }

    /// Weight of live (non-terminating) environments in `category`.
    fn live_weight(entries: &HashMap<Uuid, PoolEntry>, category: &str) -> usize {
        entries
            .values()
            .filter(|e| e.category == category && e.status != EntryStatus::Terminating)
            .map(|e| e.weight)
            .sum()
    }

    /// Reserve a busy slot under the lock. The caller provisions it.
    async fn reserve(&self, category: &str, limits: CategoryConfig) -> Option<PoolEntry> {
        let mut entries = self.entries.write().await;
        if Self::live_weight(&entries, category) + limits.weight > limits.ceiling {
            return None;
        }
        let id = Uuid::new_v4();
        let short = id.simple().to_string();
        let entry = PoolEntry {
            id,
            category: category.to_string(),
            status: EntryStatus::Busy,
            weight: limits.weight,
            agent_id: format!("{category}-{}", &short[..8]),
            provider_handle: String::new(),
            created_at: Utc::now(),
            last_used: Instant::now(),
        };
        entries.insert(id, entry.clone());
        Some(entry)
    }

    /// Reserve an environment for one task attempt without waiting for it
    /// to start: an idle environment if there is one, otherwise a new busy
    /// slot that [`provision_lease`](Self::provision_lease) must bring up.
    /// Returns `Ok(None)` when the category is at its ceiling.
    pub async fn lease(&self, category: &str) -> Result<Option<Lease>, Error> {
        let limits = self.category(category)?;

        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries
                .values_mut()
                .filter(|e| e.category == category && e.status == EntryStatus::Idle)
                .min_by_key(|e| e.last_used)
            {
                entry.status = EntryStatus::Busy;
                entry.last_used = Instant::now();
                debug!(environment_id = %entry.id, category = %category, "Reusing idle sandbox");
                return Ok(Some(Lease {
                    environment_id: entry.id,
                    agent_id: entry.agent_id.clone(),
                    category: category.to_string(),
                    reused: true,
                }));
            }
        }

        Ok(self.reserve(category, limits).await.map(|entry| Lease {
            environment_id: entry.id,
            agent_id: entry.agent_id,
            category: category.to_string(),
            reused: false,
        }))
    }

    /// Start the sandbox behind a fresh lease. No-op for reused ones.
    pub async fn provision_lease(&self, lease: &Lease, config: &EnvironmentConfig) -> Result<(), Error> {
        if lease.reused {
            return Ok(());
        }
        let entry = self
            .entry(lease.environment_id)
            .await
            .ok_or_else(|| ProvisioningError::Failed {
                category: lease.category.clone(),
                reason: "environment was destroyed before it started".to_string(),
            })?;
        self.provision(&entry, config).await
    }

    /// Provision a new environment and leave it idle. Fails with
    /// `CapacityExceeded` when the category is at its ceiling.
    pub async fn create_environment(
        &self,
        category: &str,
        config: &EnvironmentConfig,
    ) -> Result<Uuid, Error> {
        let limits = self.category(category)?;
        let entry = self
            .reserve(category, limits)
            .await
            .ok_or_else(|| Error::CapacityExceeded {
                what: format!("sandbox category '{category}'"),
                limit: limits.ceiling,
            })?;
        self.provision(&entry, config).await?;
        self.release(entry.id).await;
        Ok(entry.id)
    }

    async fn provision(&self, entry: &PoolEntry, config: &EnvironmentConfig) -> Result<(), Error> {
        let request = ProvisionRequest {
            environment_id: entry.id,
            category: entry.category.clone(),
            agent_id: entry.agent_id.clone(),
            room_id: config.room_id.clone(),
            role: config.role.clone(),
            bridge_url: self.config.bridge_url.clone(),
            env: config.env.clone(),
        };

        let timeout = self.config.provision_timeout;
        let outcome = tokio::time::timeout(timeout, self.provider.provision(&request)).await;
        let error = match outcome {
            Ok(Ok(handle)) => {
                let kept = match self.entries.write().await.get_mut(&entry.id) {
                    Some(e) if e.status != EntryStatus::Terminating => {
                        e.provider_handle = handle.clone();
                        true
                    }
                    _ => false,
                };
                if !kept {
                    // Destroyed while starting up.
                    let _ = self.provider.destroy(&handle).await;
                    return Err(ProvisioningError::Failed {
                        category: entry.category.clone(),
                        reason: "environment was destroyed while starting".to_string(),
                    }
                    .into());
                }
                info!(
                    environment_id = %entry.id,
                    category = %entry.category,
                    agent_id = %entry.agent_id,
                    provider = self.provider.name(),
                    "Provisioned sandbox"
                );
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(_) => ProvisioningError::Timeout {
                category: entry.category.clone(),
                timeout,
            },
        };

        warn!(environment_id = %entry.id, error = %error, "Sandbox provisioning failed");
        self.entries.write().await.remove(&entry.id);
        // A slow provider may still have started something.
        if let Err(e) = self.provider.destroy(&entry.id.to_string()).await {
            debug!(environment_id = %entry.id, error = %e, "Cleanup after failed provisioning");
        }
        Err(error.into())
    }

    /// Return a leased environment to the idle set.
    pub async fn release(&self, id: Uuid) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&id) {
            Some(entry) if entry.status == EntryStatus::Busy => {
                entry.status = EntryStatus::Idle;
                entry.last_used = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Tear an environment down. Returns false if it was already gone.
    pub async fn destroy_environment(&self, id: Uuid) -> Result<bool, Error> {
        let Some(handle) = self.begin_terminate(id, |_| true).await else {
            return Ok(false);
        };
        self.terminate(id, handle).await
    }

    /// Tear an environment down only if it is idle. The status check and the
    /// switch to `Terminating` happen under one lock, so an entry leased in
    /// the meantime is left alone. Returns false if nothing was destroyed.
    pub async fn destroy_if_idle(&self, id: Uuid) -> Result<bool, Error> {
        let Some(handle) = self
            .begin_terminate(id, |e| e.status == EntryStatus::Idle)
            .await
        else {
            return Ok(false);
        };
        self.terminate(id, handle).await
    }

    /// Mark `id` terminating if it is live and passes `check`, returning its
    /// provider handle.
    async fn begin_terminate(&self, id: Uuid, check: impl Fn(&PoolEntry) -> bool) -> Option<String> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&id) {
            Some(entry) if entry.status != EntryStatus::Terminating && check(entry) => {
                entry.status = EntryStatus::Terminating;
                Some(entry.provider_handle.clone())
            }
            _ => None,
        }
    }

    async fn terminate(&self, id: Uuid, handle: String) -> Result<bool, Error> {
        // Without a handle the provider may still be mid-start; providers
        // key such sandboxes by environment id.
        let handle = if handle.is_empty() { id.to_string() } else { handle };
        let result = self.provider.destroy(&handle).await;
        self.entries.write().await.remove(&id);

        match result {
            Ok(()) => {
                info!(environment_id = %id, "Destroyed sandbox");
                Ok(true)
            }
            Err(e) => {
                warn!(environment_id = %id, error = %e, "Sandbox teardown reported an error");
                Err(e.into())
            }
        }
    }

    pub async fn get_pool_status(&self) -> PoolStatus {
        let entries = self.entries.read().await;
        self.config
            .categories
            .iter()
            .map(|(name, limits)| {
                let mut status = CategoryStatus {
                    total: 0,
                    available: 0,
                    busy: 0,
                    ceiling: limits.ceiling,
                };
                let mut idle = 0;
                for entry in entries.values().filter(|e| &e.category == name) {
                    match entry.status {
                        EntryStatus::Idle => idle += 1,
                        EntryStatus::Busy => status.busy += 1,
                        EntryStatus::Terminating => continue,
                    }
                    status.total += 1;
                }
                let free = limits
                    .ceiling
                    .saturating_sub(Self::live_weight(&entries, name))
                    / limits.weight;
                status.available = idle + free;
                (name.clone(), status)
            })
            .collect()
    }

    pub async fn entry(&self, id: Uuid) -> Option<PoolEntry> {
        self.entries.read().await.get(&id).cloned()
    }

    /// The environment hosting worker `agent_id`.
    pub async fn entry_for_agent(&self, agent_id: &str) -> Option<PoolEntry> {
        self.entries
            .read()
            .await
            .values()
            .find(|e| e.agent_id == agent_id)
            .cloned()
    }

    pub async fn entries(&self) -> Vec<PoolEntry> {
        let mut entries: Vec<PoolEntry> = self.entries.read().await.values().cloned().collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    /// Destroy idle environments unused for longer than the idle timeout.
    pub async fn reap_idle(&self) -> usize {
        let timeout = self.config.idle_timeout;
        let expired: Vec<Uuid> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.status == EntryStatus::Idle && e.last_used.elapsed() > timeout)
            .map(|e| e.id)
            .collect();

        let mut reaped = 0;
        for id in expired {
            // Re-checked under the lock: the entry may have been leased since.
            match self.destroy_if_idle(id).await {
                Ok(true) => reaped += 1,
                Ok(false) => {}
                Err(e) => warn!(environment_id = %id, error = %e, "Idle reaping failed"),
            }
        }
        if reaped > 0 {
            info!(count = reaped, "Reaped idle sandboxes");
        }
        reaped
    }

    pub fn spawn_idle_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = (pool.config.idle_timeout / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.reap_idle().await;
            }
        })
    }

    /// Destroy every environment.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.entries.read().await.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.destroy_environment(id).await {
                warn!(environment_id = %id, error = %e, "Teardown on shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProvider {
        destroyed: Mutex<Vec<String>>,
        fail: bool,
        delay: Option<Duration>,
        destroy_delay: Option<Duration>,
    }

    #[async_trait]
    impl SandboxProvider for RecordingProvider {
        fn name(&self) -> &str {
            "recording"
        }

        async fn provision(&self, request: &ProvisionRequest) -> Result<String, ProvisioningError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(ProvisioningError::Failed {
                    category: request.category.clone(),
                    reason: "boom".into(),
                });
            }
            Ok(format!("h-{}", request.environment_id))
        }

        async fn destroy(&self, handle: &str) -> Result<(), ProvisioningError> {
            if let Some(delay) = self.destroy_delay {
                tokio::time::sleep(delay).await;
            }
            self.destroyed.lock().unwrap().push(handle.to_string());
            Ok(())
        }
    }

    fn pool_with(provider: RecordingProvider, ceiling: usize, weight: usize) -> Arc<PoolManager> {
        let config = PoolConfig {
            categories: HashMap::from([("rust".to_string(), CategoryConfig { ceiling, weight })]),
            provision_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_millis(50),
            bridge_url: "ws://127.0.0.1:1/ws".to_string(),
        };
        PoolManager::new(config, Arc::new(provider))
    }

    fn env() -> EnvironmentConfig {
        EnvironmentConfig::new("room", "coder")
    }

    /// Lease and bring the sandbox up, the way an attempt driver does.
    async fn acquire(pool: &PoolManager, category: &str) -> Result<Option<Lease>, Error> {
        let Some(lease) = pool.lease(category).await? else {
            return Ok(None);
        };
        pool.provision_lease(&lease, &env()).await?;
        Ok(Some(lease))
    }

    #[tokio::test]
    async fn ceiling_caps_busy_entries() {
        let pool = pool_with(RecordingProvider::default(), 2, 1);
        let a = acquire(&pool, "rust").await.unwrap().unwrap();
        let b = acquire(&pool, "rust").await.unwrap().unwrap();
        assert_ne!(a.environment_id, b.environment_id);
        assert!(acquire(&pool, "rust").await.unwrap().is_none());

        let status = pool.get_pool_status().await["rust"];
        assert_eq!(status.busy, 2);
        assert_eq!(status.available, 0);

        assert!(pool.release(a.environment_id).await);
        let reused = acquire(&pool, "rust").await.unwrap().unwrap();
        assert!(reused.reused);
        assert_eq!(reused.environment_id, a.environment_id);
    }

    #[tokio::test]
    async fn weights_count_against_ceiling() {
        let pool = pool_with(RecordingProvider::default(), 5, 2);
        assert!(acquire(&pool, "rust").await.unwrap().is_some());
        assert!(acquire(&pool, "rust").await.unwrap().is_some());
        assert!(acquire(&pool, "rust").await.unwrap().is_none());
        assert_eq!(pool.get_pool_status().await["rust"].total, 2);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let pool = pool_with(RecordingProvider::default(), 1, 1);
        let lease = acquire(&pool, "rust").await.unwrap().unwrap();
        assert!(pool.destroy_environment(lease.environment_id).await.unwrap());
        assert!(!pool.destroy_environment(lease.environment_id).await.unwrap());
        assert_eq!(pool.get_pool_status().await["rust"].available, 1);
    }

    #[tokio::test]
    async fn destroy_if_idle_spares_leased_entries() {
        let pool = pool_with(RecordingProvider::default(), 2, 1);
        let busy = acquire(&pool, "rust").await.unwrap().unwrap();
        assert!(!pool.destroy_if_idle(busy.environment_id).await.unwrap());
        assert_eq!(
            pool.entry(busy.environment_id).await.unwrap().status,
            EntryStatus::Busy
        );

        pool.release(busy.environment_id).await;
        assert!(pool.destroy_if_idle(busy.environment_id).await.unwrap());
        assert!(pool.entry(busy.environment_id).await.is_none());
    }

    #[tokio::test]
    async fn failed_provisioning_frees_the_slot() {
        let provider = RecordingProvider {
            fail: true,
            ..Default::default()
        };
        let pool = pool_with(provider, 1, 1);
        let err = acquire(&pool, "rust").await.unwrap_err();
        assert!(matches!(err, Error::Provisioning(_)));
        assert!(err.is_transient());
        assert!(pool.entries().await.is_empty());
    }

    #[tokio::test]
    async fn provisioning_timeout_is_reported() {
        let provider = RecordingProvider {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let pool = pool_with(provider, 1, 1);
        let err = acquire(&pool, "rust").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Provisioning(ProvisioningError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_category_is_rejected() {
        let pool = pool_with(RecordingProvider::default(), 1, 1);
        let err = pool.lease("cobol").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Provisioning(ProvisioningError::UnknownCategory { .. })
        ));
    }

    #[tokio::test]
    async fn create_environment_leaves_it_idle_and_respects_ceiling() {
        let pool = pool_with(RecordingProvider::default(), 1, 1);
        let id = pool.create_environment("rust", &env()).await.unwrap();
        assert_eq!(pool.entry(id).await.unwrap().status, EntryStatus::Idle);
        let err = pool.create_environment("rust", &env()).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { limit: 1, .. }));
    }

    #[tokio::test]
    async fn idle_entries_are_reaped() {
        let pool = pool_with(RecordingProvider::default(), 2, 1);
        let a = acquire(&pool, "rust").await.unwrap().unwrap();
        let b = acquire(&pool, "rust").await.unwrap().unwrap();
        pool.release(a.environment_id).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(pool.reap_idle().await, 1);
        assert!(pool.entry(a.environment_id).await.is_none());
        assert_eq!(
            pool.entry(b.environment_id).await.unwrap().status,
            EntryStatus::Busy
        );
    }

    #[tokio::test]
    async fn entry_leased_during_reaping_survives() {
        let provider = RecordingProvider {
            destroy_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let pool = pool_with(provider, 2, 1);
        pool.create_environment("rust", &env()).await.unwrap();
        pool.create_environment("rust", &env()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let reaper = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.reap_idle().await })
        };
        // The reaper is now waiting on its first teardown.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let leased = pool.lease("rust").await.unwrap().unwrap();
        assert!(leased.reused);

        assert_eq!(reaper.await.unwrap(), 1);
        let entry = pool.entry(leased.environment_id).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Busy);
    }
}
