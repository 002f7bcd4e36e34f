//! Configuration types.
//!
//! Every component reads its settings from `AUTOCODER_*` environment
//! variables with a documented fallback. Worker identity is the exception:
//! it is injected by the pool manager at provisioning time and is mandatory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_AGENT_ID: &str = "AUTOCODER_AGENT_ID";
pub const ENV_ROOM_ID: &str = "AUTOCODER_ROOM_ID";
pub const ENV_ROLE: &str = "AUTOCODER_ROLE";
pub const ENV_BRIDGE_URL: &str = "AUTOCODER_BRIDGE_URL";
pub const ENV_CATEGORY: &str = "AUTOCODER_CATEGORY";

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_or(key, default))
}

fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_or(key, default))
}

fn require_env(key: &str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ConfigError::MissingEnvVar(key.to_string())),
    }
}

/// Communication bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Port the bridge listens on.
    pub port: u16,
    /// A new connection must register within this window or is dropped.
    pub register_grace: Duration,
    /// Expected heartbeat interval. Two silent windows evict the agent.
    pub heartbeat_interval: Duration,
    /// Deadline for requests issued by the bridge itself, and the lifetime
    /// of routing entries for forwarded requests.
    pub request_timeout: Duration,
    /// Agent id used as `fromAgentId` on requests the orchestrator sends.
    pub orchestrator_id: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: 8765,
            register_grace: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(25),
            request_timeout: Duration::from_secs(30),
            orchestrator_id: "orchestrator".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_or("AUTOCODER_BRIDGE_PORT", defaults.port),
            register_grace: env_secs("AUTOCODER_REGISTER_GRACE_SECS", 30),
            heartbeat_interval: env_secs("AUTOCODER_HEARTBEAT_SECS", 25),
            request_timeout: env_secs("AUTOCODER_REQUEST_TIMEOUT_SECS", 30),
            orchestrator_id: std::env::var("AUTOCODER_ORCHESTRATOR_ID")
                .unwrap_or(defaults.orchestrator_id),
        }
    }
}

/// Exponential backoff bounds.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    /// Apply ±50% random jitter to each delay.
    pub jitter: bool,
}

impl BackoffConfig {
    /// Delay before attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(30) as i32);
        let max_ms = self.max.as_millis() as f64;
        let base_ms = (self.base.as_millis() as f64 * factor).min(max_ms);

        let ms = if self.jitter {
            use rand::Rng;
            let jitter_factor = rand::thread_rng().gen_range(0.5..=1.5);
            base_ms * jitter_factor
        } else {
            base_ms
        };
        Duration::from_millis(ms.min(max_ms) as u64)
    }
}

/// Worker agent client configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub agent_id: String,
    pub room_id: String,
    pub role: String,
    /// Bridge WebSocket URL, e.g. `ws://127.0.0.1:8765/ws`.
    pub bridge_url: String,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    /// How long to wait for the `registered` acknowledgement.
    pub register_timeout: Duration,
    /// Maximum number of messages buffered while disconnected.
    pub outbound_queue_limit: usize,
    pub reconnect: BackoffConfig,
    /// Working directory for task actions.
    pub workdir: Option<PathBuf>,
}

impl WorkerConfig {
    /// Build a config with default timings for the given identity.
    pub fn new(
        agent_id: impl Into<String>,
        room_id: impl Into<String>,
        role: impl Into<String>,
        bridge_url: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            room_id: room_id.into(),
            role: role.into(),
            bridge_url: bridge_url.into(),
            heartbeat_interval: Duration::from_secs(25),
            request_timeout: Duration::from_secs(30),
            register_timeout: Duration::from_secs(30),
            outbound_queue_limit: 1024,
            reconnect: BackoffConfig {
                base: Duration::from_millis(500),
                max: Duration::from_secs(30),
                jitter: true,
            },
            workdir: None,
        }
    }

    /// Read identity and bridge address injected by the pool manager.
    pub fn from_env() -> Result<Self, ConfigError> {
        let agent_id = require_env(ENV_AGENT_ID)?;
        let bridge_url = require_env(ENV_BRIDGE_URL)?;
        let room_id = std::env::var(ENV_ROOM_ID).unwrap_or_else(|_| "default".to_string());
        let role = std::env::var(ENV_ROLE).unwrap_or_else(|_| "coder".to_string());

        let mut config = Self::new(agent_id, room_id, role, bridge_url);
        config.heartbeat_interval = env_secs("AUTOCODER_HEARTBEAT_SECS", 25);
        config.request_timeout = env_secs("AUTOCODER_REQUEST_TIMEOUT_SECS", 30);
        config.outbound_queue_limit = env_or("AUTOCODER_OUTBOUND_QUEUE_LIMIT", 1024);
        config.reconnect.base = env_millis("AUTOCODER_RECONNECT_BASE_MS", 500);
        config.reconnect.max = env_millis("AUTOCODER_RECONNECT_MAX_MS", 30_000);
        config.workdir = std::env::var("AUTOCODER_WORKDIR").ok().map(PathBuf::from);
        Ok(config)
    }
}

/// Task scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Transient failures tolerated per task before it is marked failed.
    pub max_retries: u32,
    pub retry_backoff: BackoffConfig,
    /// Periodic scheduling pass interval.
    pub schedule_interval: Duration,
    /// Deadline for one task attempt once the work request is sent.
    pub task_timeout: Duration,
    /// Time allowed for a freshly provisioned worker to register.
    pub registration_timeout: Duration,
    /// Maximum queued tasks (0 = unbounded).
    pub max_queued: usize,
    /// Terminal tasks retained for status queries.
    pub history_limit: usize,
    /// Action name the worker runs for a task payload.
    pub task_action: String,
    /// Room that workers spawned for tasks join.
    pub room_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: BackoffConfig {
                base: Duration::from_secs(1),
                max: Duration::from_secs(60),
                jitter: true,
            },
            schedule_interval: Duration::from_secs(5),
            task_timeout: Duration::from_secs(1800),
            registration_timeout: Duration::from_secs(120),
            max_queued: 0,
            history_limit: 1000,
            task_action: "run-task".to_string(),
            room_id: "default".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_or("AUTOCODER_MAX_RETRIES", defaults.max_retries),
            retry_backoff: BackoffConfig {
                base: env_millis("AUTOCODER_RETRY_BASE_MS", 1000),
                max: env_millis("AUTOCODER_RETRY_MAX_MS", 60_000),
                jitter: true,
            },
            schedule_interval: env_secs("AUTOCODER_SCHEDULE_INTERVAL_SECS", 5),
            task_timeout: env_secs("AUTOCODER_TASK_TIMEOUT_SECS", 1800),
            registration_timeout: env_secs("AUTOCODER_PROVISION_TIMEOUT_SECS", 120),
            max_queued: env_or("AUTOCODER_MAX_QUEUED", defaults.max_queued),
            history_limit: env_or("AUTOCODER_HISTORY_LIMIT", defaults.history_limit),
            task_action: defaults.task_action,
            room_id: std::env::var(ENV_ROOM_ID).unwrap_or(defaults.room_id),
        }
    }
}

/// Capacity settings for one sandbox category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryConfig {
    /// Maximum total weight of live sandboxes in this category.
    pub ceiling: usize,
    /// Weight each sandbox of this category counts against the ceiling.
    pub weight: usize,
}

/// Sandbox pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub categories: HashMap<String, CategoryConfig>,
    pub provision_timeout: Duration,
    /// Idle sandboxes older than this are destroyed.
    pub idle_timeout: Duration,
    /// Bridge URL injected into every sandbox.
    pub bridge_url: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            categories: HashMap::from([(
                "default".to_string(),
                CategoryConfig {
                    ceiling: 4,
                    weight: 1,
                },
            )]),
            provision_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(300),
            bridge_url: "ws://127.0.0.1:8765/ws".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let categories = match std::env::var("AUTOCODER_POOL_CEILINGS") {
            Ok(spec) => parse_ceilings(&spec)?,
            Err(_) => defaults.categories,
        };
        let port: u16 = env_or("AUTOCODER_BRIDGE_PORT", 8765);

        Ok(Self {
            categories,
            provision_timeout: env_secs("AUTOCODER_PROVISION_TIMEOUT_SECS", 120),
            idle_timeout: env_secs("AUTOCODER_POOL_IDLE_TIMEOUT_SECS", 300),
            bridge_url: std::env::var(ENV_BRIDGE_URL)
                .unwrap_or_else(|_| format!("ws://127.0.0.1:{port}/ws")),
        })
    }
}

/// Parse `category=ceiling[:weight],...`.
pub fn parse_ceilings(spec: &str) -> Result<HashMap<String, CategoryConfig>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "AUTOCODER_POOL_CEILINGS".to_string(),
        message,
    };

    let mut categories = HashMap::new();
    for entry in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, limits) = entry
            .split_once('=')
            .ok_or_else(|| invalid(format!("expected category=ceiling, got '{entry}'")))?;
        let (ceiling, weight) = match limits.split_once(':') {
            Some((c, w)) => (c, w),
            None => (limits, "1"),
        };
        let ceiling: usize = ceiling
            .trim()
            .parse()
            .map_err(|_| invalid(format!("bad ceiling in '{entry}'")))?;
        let weight: usize = weight
            .trim()
            .parse()
            .map_err(|_| invalid(format!("bad weight in '{entry}'")))?;
        if weight == 0 {
            return Err(invalid(format!("weight must be positive in '{entry}'")));
        }
        if ceiling < weight {
            return Err(invalid(format!(
                "ceiling must fit at least one sandbox of weight {weight} in '{entry}'"
            )));
        }
        categories.insert(name.trim().to_string(), CategoryConfig { ceiling, weight });
    }

    if categories.is_empty() {
        return Err(invalid("no categories configured".to_string()));
    }
    Ok(categories)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ceilings_with_and_without_weight() {
        let parsed = parse_ceilings("python=4, node=6:2").unwrap();
        assert_eq!(
            parsed["python"],
            CategoryConfig {
                ceiling: 4,
                weight: 1
            }
        );
        assert_eq!(
            parsed["node"],
            CategoryConfig {
                ceiling: 6,
                weight: 2
            }
        );
    }

    #[test]
    fn rejects_malformed_ceilings() {
        assert!(parse_ceilings("python").is_err());
        assert!(parse_ceilings("python=x").is_err());
        assert!(parse_ceilings("python=2:0").is_err());
        assert!(parse_ceilings(" , ").is_err());
        assert!(parse_ceilings("python=0").is_err());
        assert!(parse_ceilings("node=1:2").is_err());
        assert!(parse_ceilings("node=2:2").is_ok());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = BackoffConfig {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            jitter: false,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_jitter_stays_within_half_band() {
        let backoff = BackoffConfig {
            base: Duration::from_millis(1000),
            max: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..100 {
            let d = backoff.delay(0);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn jittered_backoff_never_exceeds_max() {
        let backoff = BackoffConfig {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            jitter: true,
        };
        for _ in 0..100 {
            let d = backoff.delay(10);
            assert!(d <= Duration::from_millis(1000), "{d:?} above max");
            assert!(d >= Duration::from_millis(500));
        }
    }
}
