//! Agent directory: live registrations keyed by agent id, indexed by room.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::WireMessage;

/// Lifecycle of one worker registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Socket open, no `register` yet.
    Connecting,
    /// `register` accepted, acknowledgement not yet sent.
    Registered,
    Idle,
    Busy,
    /// Terminal for this registration.
    Disconnected,
}

impl WorkerStatus {
    pub fn can_transition_to(&self, target: WorkerStatus) -> bool {
        use WorkerStatus::*;

        matches!(
            (self, target),
            (Connecting, Registered)
                | (Registered, Idle)
                | (Idle, Busy)
                | (Busy, Idle)
                | (Connecting, Disconnected)
                | (Registered, Disconnected)
                | (Idle, Disconnected)
                | (Busy, Disconnected)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Registered => "registered",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}

/// Outbound half of a bridge connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Unique per socket; distinguishes a reconnect from the stale socket it replaces.
    pub conn_id: Uuid,
    pub tx: mpsc::UnboundedSender<Outbound>,
}

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(WireMessage),
    Close(String),
}

impl ConnectionHandle {
    /// Queue a frame. Returns false if the writer is gone.
    pub fn send(&self, msg: WireMessage) -> bool {
        self.tx.send(Outbound::Frame(msg)).is_ok()
    }

    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Close(reason.into()));
    }
}

/// One live registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub agent_id: String,
    pub role: String,
    pub room_id: String,
    pub connection: ConnectionHandle,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: Instant,
    /// Whether a `ping` went out since the last inbound frame.
    pub pinged: bool,
}

/// Serializable view of a registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub agent_id: String,
    pub role: String,
    pub room_id: String,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub silent_for_ms: u64,
}

impl Registration {
    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            agent_id: self.agent_id.clone(),
            role: self.role.clone(),
            room_id: self.room_id.clone(),
            status: self.status,
            registered_at: self.registered_at,
            silent_for_ms: self.last_heartbeat_at.elapsed().as_millis() as u64,
        }
    }
}

/// Heartbeat sweep verdict for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Ping(String),
    Evict(String),
}

/// Registrations by agent id with a room secondary index.
#[derive(Debug, Default)]
pub struct AgentDirectory {
    agents: HashMap<String, Registration>,
    rooms: HashMap<String, HashSet<String>>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a registration, returning the one it replaces (same agent id).
    pub fn insert(&mut self, registration: Registration) -> Option<Registration> {
        let previous = self.remove(&registration.agent_id);
        self.rooms
            .entry(registration.room_id.clone())
            .or_default()
            .insert(registration.agent_id.clone());
        self.agents
            .insert(registration.agent_id.clone(), registration);
        previous
    }

    pub fn remove(&mut self, agent_id: &str) -> Option<Registration> {
        let mut registration = self.agents.remove(agent_id)?;
        if let Some(members) = self.rooms.get_mut(&registration.room_id) {
            members.remove(agent_id);
            if members.is_empty() {
                self.rooms.remove(&registration.room_id);
            }
        }
        registration.status = WorkerStatus::Disconnected;
        Some(registration)
    }

    /// Remove `agent_id` only if it is still bound to connection `conn_id`.
    pub fn remove_connection(&mut self, agent_id: &str, conn_id: Uuid) -> Option<Registration> {
        match self.agents.get(agent_id) {
            Some(r) if r.connection.conn_id == conn_id => self.remove(agent_id),
            _ => None,
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<&Registration> {
        self.agents.get(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Apply a status transition. Returns false if the agent is unknown or
    /// the transition is not allowed.
    pub fn set_status(&mut self, agent_id: &str, status: WorkerStatus) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(r) if r.status.can_transition_to(status) => {
                r.status = status;
                true
            }
            _ => false,
        }
    }

    /// Record inbound traffic from an agent's current connection.
    pub fn touch(&mut self, agent_id: &str, conn_id: Uuid) {
        if let Some(r) = self.agents.get_mut(agent_id)
            && r.connection.conn_id == conn_id
        {
            r.last_heartbeat_at = Instant::now();
            r.pinged = false;
        }
    }

    /// Other members of `agent_id`'s room.
    pub fn room_peers(&self, room_id: &str, except: &str) -> Vec<&Registration> {
        self.rooms
            .get(room_id)
            .into_iter()
            .flatten()
            .filter(|id| id.as_str() != except)
            .filter_map(|id| self.agents.get(id))
            .collect()
    }

    pub fn room_members(&self, room_id: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .rooms
            .get(room_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Decide which agents need a ping and which have been silent for two
    /// full windows. Marks pinged agents so they are pinged once per window.
    pub fn sweep(&mut self, interval: Duration, now: Instant) -> Vec<Liveness> {
        let mut verdicts = Vec::new();
        for registration in self.agents.values_mut() {
            let silent = now.saturating_duration_since(registration.last_heartbeat_at);
            if silent > interval * 2 {
                verdicts.push(Liveness::Evict(registration.agent_id.clone()));
            } else if silent > interval && !registration.pinged {
                registration.pinged = true;
                verdicts.push(Liveness::Ping(registration.agent_id.clone()));
            }
        }
        verdicts
    }

    pub fn snapshot(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<AgentInfo> = self.agents.values().map(Registration::info).collect();
        infos.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        infos
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
