//! The communication bridge every worker connects to.
//!
//! All bridge state lives inside one [`Bridge`] value and is reached only
//! through its methods. Each socket gets a reader loop (this module) and a
//! writer task fed by an unbounded mpsc channel, so frames from one
//! connection reach their target in send order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::directory::{
    AgentDirectory, AgentInfo, ConnectionHandle, Liveness, Outbound, Registration, WorkerStatus,
};
use crate::config::BridgeConfig;
use crate::correlation::PendingRequests;
use crate::error::{ConnectionError, Error, ErrorKind, ProvisioningError};
use crate::protocol::{WireMessage, error_content, response_result};

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Directory changes observed by in-process subscribers.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    AgentJoined(AgentInfo),
    AgentLeft {
        agent_id: String,
        role: String,
        room_id: String,
        reason: String,
    },
}

/// A request forwarded between two agents, awaiting its response.
#[derive(Debug)]
struct RouteEntry {
    origin: String,
    target: String,
    created_at: Instant,
}

/// Communication bridge.
pub struct Bridge {
    config: BridgeConfig,
    directory: RwLock<AgentDirectory>,
    /// Requests issued by the bridge owner (the orchestrator).
    pending: PendingRequests<Value>,
    /// Requests forwarded between agents: messageId → route.
    routes: Mutex<HashMap<String, RouteEntry>>,
    events: broadcast::Sender<BridgeEvent>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Arc::new(Self {
            config,
            directory: RwLock::new(AgentDirectory::new()),
            pending: PendingRequests::new(),
            routes: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Subscribe to join/leave events.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Router with the worker socket at `/ws`, plus health and directory views.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health))
            .route("/api/agents", get(list_agents))
            .with_state(Arc::clone(self))
    }

    // ── Directory queries ────────────────────────────────────────────────

    pub async fn agents(&self) -> Vec<AgentInfo> {
        self.directory.read().await.snapshot()
    }

    pub async fn agent(&self, agent_id: &str) -> Option<AgentInfo> {
        self.directory.read().await.get(agent_id).map(Registration::info)
    }

    pub async fn is_registered(&self, agent_id: &str) -> bool {
        self.directory.read().await.contains(agent_id)
    }

    pub async fn room_members(&self, room_id: &str) -> Vec<String> {
        self.directory.read().await.room_members(room_id)
    }

    /// Number of bridge-issued requests still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Number of agent-to-agent requests still awaiting a response.
    pub async fn pending_routes(&self) -> usize {
        self.routes.lock().await.len()
    }

    pub async fn mark_busy(&self, agent_id: &str) -> bool {
        self.directory
            .write()
            .await
            .set_status(agent_id, WorkerStatus::Busy)
    }

    pub async fn mark_idle(&self, agent_id: &str) -> bool {
        self.directory
            .write()
            .await
            .set_status(agent_id, WorkerStatus::Idle)
    }

    /// Wait until `agent_id` is registered.
    pub async fn wait_for_agent(&self, agent_id: &str, timeout: Duration) -> Result<AgentInfo, Error> {
        let mut rx = self.subscribe();
        if let Some(info) = self.agent(agent_id).await {
            return Ok(info);
        }

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(BridgeEvent::AgentJoined(info)) if info.agent_id == agent_id => {
                        return Some(info);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(info) = self.agent(agent_id).await {
                            return Some(info);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(info)) => Ok(info),
            _ => Err(ProvisioningError::RegistrationTimeout {
                agent_id: agent_id.to_string(),
                timeout,
            }
            .into()),
        }
    }

    // ── Outbound operations ──────────────────────────────────────────────

    /// Send a request to `target` as the orchestrator and wait for its response.
    pub async fn send_request(
        &self,
        target: &str,
        content: Value,
        timeout: Duration,
    ) -> Result<Value, Error> {
        let message_id = Uuid::new_v4().to_string();
        let waiter = self.pending.register(message_id.clone(), target)?;

        let msg = WireMessage::Request {
            message_id: message_id.clone(),
            target_agent_id: None,
            from_agent_id: Some(self.config.orchestrator_id.clone()),
            content,
            timestamp: Utc::now(),
        };
        self.send_to(target, msg).await?;

        debug!(target = %target, message_id = %message_id, "Request sent");
        let content = waiter.wait(timeout).await?;
        response_result(target, content)
    }

    /// Fire-and-forget request; the response, if any, is discarded.
    pub async fn notify(&self, target: &str, content: Value) -> Result<(), Error> {
        let msg = WireMessage::Request {
            message_id: Uuid::new_v4().to_string(),
            target_agent_id: None,
            from_agent_id: Some(self.config.orchestrator_id.clone()),
            content,
            timestamp: Utc::now(),
        };
        self.send_to(target, msg).await
    }

    /// Queue a frame for one agent.
    pub async fn send_to(&self, agent_id: &str, msg: WireMessage) -> Result<(), Error> {
        let directory = self.directory.read().await;
        let registration = directory.get(agent_id).ok_or_else(|| Error::Routing {
            target: agent_id.to_string(),
        })?;
        if registration.connection.send(msg) {
            Ok(())
        } else {
            Err(ConnectionError::SendOnClosed {
                agent_id: agent_id.to_string(),
            }
            .into())
        }
    }

    /// Send a frame to every member of `room_id` except `except`.
    pub async fn broadcast_room(&self, room_id: &str, except: &str, msg: &WireMessage) -> usize {
        let directory = self.directory.read().await;
        directory
            .room_peers(room_id, except)
            .into_iter()
            .filter(|peer| peer.connection.send(msg.clone()))
            .count()
    }

    /// Close `agent_id`'s registration. Returns false if it was not registered.
    pub async fn disconnect(&self, agent_id: &str, reason: &str) -> bool {
        let removed = self.directory.write().await.remove(agent_id);
        match removed {
            Some(registration) => {
                self.after_removal(registration, reason).await;
                true
            }
            None => false,
        }
    }

    // ── Liveness ─────────────────────────────────────────────────────────

    /// Ping quiet agents and evict those silent for two heartbeat windows.
    /// Returns the evicted agent ids.
    pub async fn sweep_heartbeats(&self) -> Vec<String> {
        let interval = self.config.heartbeat_interval;
        let mut evicted = Vec::new();
        {
            let mut directory = self.directory.write().await;
            for verdict in directory.sweep(interval, Instant::now()) {
                match verdict {
                    Liveness::Ping(agent_id) => {
                        if let Some(r) = directory.get(&agent_id) {
                            debug!(agent_id = %agent_id, "Pinging quiet agent");
                            r.connection.send(WireMessage::Ping);
                        }
                    }
                    Liveness::Evict(agent_id) => {
                        if let Some(r) = directory.remove(&agent_id) {
                            evicted.push(r);
                        }
                    }
                }
            }
        }

        let mut ids = Vec::with_capacity(evicted.len());
        for registration in evicted {
            warn!(
                agent_id = %registration.agent_id,
                room_id = %registration.room_id,
                "Agent missed two heartbeat windows, disconnecting"
            );
            ids.push(registration.agent_id.clone());
            let reason = ConnectionError::HeartbeatTimeout {
                agent_id: registration.agent_id.clone(),
            }
            .to_string();
            self.after_removal(registration, &reason).await;
        }

        self.prune_routes().await;
        ids
    }

    /// Spawn the periodic heartbeat sweep.
    pub fn spawn_heartbeat_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        let period = (bridge.config.heartbeat_interval / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                bridge.sweep_heartbeats().await;
            }
        })
    }

    /// Drop forwarded-request routes older than the request timeout.
    async fn prune_routes(&self) {
        let ttl = self.config.request_timeout;
        let mut routes = self.routes.lock().await;
        let before = routes.len();
        routes.retain(|_, r| r.created_at.elapsed() <= ttl);
        let pruned = before - routes.len();
        if pruned > 0 {
            debug!(count = pruned, "Pruned expired request routes");
        }
    }

    // ── Connection lifecycle ─────────────────────────────────────────────

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let conn_id = Uuid::new_v4();
        let (mut sink, mut stream) = socket.split();

        let grace = self.config.register_grace;
        let (agent_id, room_id, role) =
            match tokio::time::timeout(grace, wait_for_register(&mut stream)).await {
                Ok(Some(identity)) => identity,
                Ok(None) => {
                    debug!(conn_id = %conn_id, "Connection closed before registering");
                    return;
                }
                Err(_) => {
                    let reason = ConnectionError::RegistrationTimeout { grace }.to_string();
                    warn!(conn_id = %conn_id, "{reason}");
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: reason.into(),
                        })))
                        .await;
                    return;
                }
            };

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ConnectionHandle { conn_id, tx };
        let mut writer = tokio::spawn(write_loop(sink, rx));

        self.register(&agent_id, &room_id, &role, connection).await;

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match WireMessage::from_text(text.as_str()) {
                        Ok(msg) => self.handle_frame(&agent_id, conn_id, msg).await,
                        Err(e) => debug!(agent_id = %agent_id, error = %e, "Ignoring malformed frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(agent_id = %agent_id, "Agent closed connection");
                        break;
                    }
                    Some(Ok(_)) => {
                        self.directory.write().await.touch(&agent_id, conn_id);
                    }
                    Some(Err(e)) => {
                        warn!(agent_id = %agent_id, error = %e, "WebSocket error");
                        break;
                    }
                },
                _ = &mut writer => {
                    debug!(agent_id = %agent_id, "Writer finished, closing reader");
                    break;
                }
            }
        }

        let removed = self
            .directory
            .write()
            .await
            .remove_connection(&agent_id, conn_id);
        if let Some(registration) = removed {
            self.after_removal(registration, "connection closed").await;
        }
    }

    async fn register(&self, agent_id: &str, room_id: &str, role: &str, connection: ConnectionHandle) {
        let registration = Registration {
            agent_id: agent_id.to_string(),
            role: role.to_string(),
            room_id: room_id.to_string(),
            connection: connection.clone(),
            status: WorkerStatus::Registered,
            registered_at: Utc::now(),
            last_heartbeat_at: Instant::now(),
            pinged: false,
        };

        let reason = "replaced by new registration";
        let (previous, orphaned, info) = {
            let mut directory = self.directory.write().await;
            let was_busy = directory
                .get(agent_id)
                .is_some_and(|r| r.status == WorkerStatus::Busy);
            let previous = directory.insert(registration);
            // Requests sent to the old socket will never be answered. Fail
            // them before the new connection can receive any of its own.
            let orphaned = match previous {
                Some(_) => self.orphan_requests(agent_id, reason).await,
                None => Vec::new(),
            };
            connection.send(WireMessage::Registered);
            directory.set_status(agent_id, WorkerStatus::Idle);
            if was_busy {
                // The orchestrator still has a task on this worker.
                directory.set_status(agent_id, WorkerStatus::Busy);
            }
            (previous, orphaned, directory.get(agent_id).map(Registration::info))
        };

        if let Some(previous) = previous {
            info!(agent_id = %agent_id, "Agent re-registered, closing previous connection");
            previous.connection.close(reason);
            self.announce_departure(&previous, orphaned, reason).await;
        }

        info!(agent_id = %agent_id, room_id = %room_id, role = %role, "Agent registered");

        let joined = WireMessage::AgentJoined {
            agent_id: agent_id.to_string(),
            role: role.to_string(),
        };
        self.broadcast_room(room_id, agent_id, &joined).await;

        if let Some(info) = info {
            let _ = self.events.send(BridgeEvent::AgentJoined(info));
        }
    }

    /// Cleanup shared by socket close, heartbeat eviction and explicit kicks.
    async fn after_removal(&self, registration: Registration, reason: &str) {
        registration.connection.close(reason.to_string());
        let orphaned = self.orphan_requests(&registration.agent_id, reason).await;
        self.announce_departure(&registration, orphaned, reason).await;

        let _ = self.events.send(BridgeEvent::AgentLeft {
            agent_id: registration.agent_id.clone(),
            role: registration.role.clone(),
            room_id: registration.room_id.clone(),
            reason: reason.to_string(),
        });
    }

    /// Fail the bridge's own requests to `agent_id` and take the forwarded
    /// requests it will never answer, as (messageId, origin) pairs. Routes
    /// the agent itself originated are dropped.
    async fn orphan_requests(&self, agent_id: &str, reason: &str) -> Vec<(String, String)> {
        let failed = self.pending.fail_target(agent_id, reason);
        if failed > 0 {
            debug!(agent_id = %agent_id, count = failed, "Failed pending requests to departed agent");
        }

        let mut routes = self.routes.lock().await;
        routes.retain(|_, r| r.origin != agent_id);
        let ids: Vec<String> = routes
            .iter()
            .filter(|(_, r)| r.target == agent_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| routes.remove(&id).map(|r| (id, r.origin)))
            .collect()
    }

    /// Answer orphaned forwarded requests with a connection error and tell
    /// the room the registration is gone.
    async fn announce_departure(
        &self,
        registration: &Registration,
        orphaned: Vec<(String, String)>,
        reason: &str,
    ) {
        let agent_id = registration.agent_id.as_str();
        for (message_id, origin) in orphaned {
            let content = error_content(
                ErrorKind::Connection,
                format!("agent {agent_id} disconnected: {reason}"),
            );
            let _ = self
                .send_to(&origin, WireMessage::response(&message_id, content))
                .await;
        }

        info!(agent_id = %agent_id, room_id = %registration.room_id, reason = %reason, "Agent left");

        let left = WireMessage::AgentLeft {
            agent_id: agent_id.to_string(),
            role: registration.role.clone(),
        };
        self.broadcast_room(&registration.room_id, agent_id, &left).await;
    }

    async fn handle_frame(&self, agent_id: &str, conn_id: Uuid, msg: WireMessage) {
        let room_id = {
            let mut directory = self.directory.write().await;
            directory.touch(agent_id, conn_id);
            match directory.get(agent_id) {
                Some(r) if r.connection.conn_id == conn_id => r.room_id.clone(),
                _ => {
                    debug!(agent_id = %agent_id, "Frame from superseded connection dropped");
                    return;
                }
            }
        };

        match msg {
            WireMessage::Heartbeat { .. } => {}
            WireMessage::Request {
                message_id,
                target_agent_id,
                content,
                timestamp,
                ..
            } => {
                self.route_request(agent_id, message_id, target_agent_id, content, timestamp)
                    .await;
            }
            WireMessage::Response {
                correlation_id,
                content,
                ..
            } => self.route_response(agent_id, correlation_id, content).await,
            WireMessage::Message { content, .. } => {
                let msg = WireMessage::Message {
                    from_agent_id: Some(agent_id.to_string()),
                    content,
                };
                self.broadcast_room(&room_id, agent_id, &msg).await;
            }
            WireMessage::RoomUpdate { content, .. } => {
                let msg = WireMessage::RoomUpdate {
                    from_agent_id: Some(agent_id.to_string()),
                    content,
                };
                self.broadcast_room(&room_id, agent_id, &msg).await;
            }
            WireMessage::Register { .. } => {
                warn!(agent_id = %agent_id, "Duplicate register on an open connection ignored");
            }
            WireMessage::Registered
            | WireMessage::Ping
            | WireMessage::AgentJoined { .. }
            | WireMessage::AgentLeft { .. } => {
                debug!(agent_id = %agent_id, kind = msg.kind(), "Ignoring bridge-only frame from client");
            }
        }
    }

    async fn route_request(
        &self,
        origin: &str,
        message_id: String,
        target: Option<String>,
        content: Value,
        timestamp: chrono::DateTime<Utc>,
    ) {
        let Some(target) = target else {
            let content = error_content(ErrorKind::Routing, "request has no targetAgentId");
            let _ = self.send_to(origin, WireMessage::response(&message_id, content)).await;
            return;
        };

        if !self.is_registered(&target).await {
            debug!(origin = %origin, target = %target, "Routing failed: target not registered");
            let content = error_content(
                ErrorKind::Routing,
                Error::Routing {
                    target: target.clone(),
                }
                .to_string(),
            );
            let _ = self.send_to(origin, WireMessage::response(&message_id, content)).await;
            return;
        }

        {
            let mut routes = self.routes.lock().await;
            if routes.contains_key(&message_id) || self.pending.contains(&message_id) {
                drop(routes);
                let content = error_content(
                    ErrorKind::Internal,
                    Error::DuplicateRequest(message_id.clone()).to_string(),
                );
                let _ = self.send_to(origin, WireMessage::response(&message_id, content)).await;
                return;
            }
            routes.insert(
                message_id.clone(),
                RouteEntry {
                    origin: origin.to_string(),
                    target: target.clone(),
                    created_at: Instant::now(),
                },
            );
        }

        let forwarded = WireMessage::Request {
            message_id: message_id.clone(),
            target_agent_id: None,
            from_agent_id: Some(origin.to_string()),
            content,
            timestamp,
        };
        if let Err(e) = self.send_to(&target, forwarded).await {
            self.routes.lock().await.remove(&message_id);
            let content = error_content(e.kind(), e.to_string());
            let _ = self.send_to(origin, WireMessage::response(&message_id, content)).await;
        }
    }

    async fn route_response(&self, from: &str, correlation_id: String, content: Value) {
        if let Some(target) = self.pending.target_of(&correlation_id) {
            if target != from {
                warn!(
                    from = %from,
                    expected = %target,
                    correlation_id = %correlation_id,
                    "Discarding response from an agent the request was not sent to"
                );
            } else if !self.pending.resolve(&correlation_id, content) {
                debug!(from = %from, correlation_id = %correlation_id, "Response arrived after its request settled");
            }
            return;
        }

        let route = {
            let mut routes = self.routes.lock().await;
            let expected = routes
                .get(&correlation_id)
                .filter(|r| r.target != from)
                .map(|r| r.target.clone());
            if let Some(expected) = expected {
                warn!(
                    from = %from,
                    expected = %expected,
                    correlation_id = %correlation_id,
                    "Discarding response from an agent the request was not sent to"
                );
                return;
            }
            routes.remove(&correlation_id)
        };
        match route {
            Some(route) => {
                let msg = WireMessage::response(&correlation_id, content);
                if let Err(e) = self.send_to(&route.origin, msg).await {
                    debug!(origin = %route.origin, error = %e, "Could not deliver response to origin");
                }
            }
            None => {
                debug!(from = %from, correlation_id = %correlation_id, "Discarding unmatched response");
            }
        }
    }
}

/// Read frames until a `register` arrives. Anything else is ignored.
async fn wait_for_register(
    stream: &mut SplitStream<WebSocket>,
) -> Option<(String, String, String)> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match WireMessage::from_text(text.as_str()) {
                Ok(WireMessage::Register {
                    agent_id,
                    room_id,
                    role,
                    ..
                }) if !agent_id.is_empty() => return Some((agent_id, room_id, role)),
                Ok(other) => debug!(kind = other.kind(), "Frame before registration ignored"),
                Err(e) => debug!(error = %e, "Malformed frame before registration"),
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(msg) => {
                let text = match msg.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    debug!("Client disconnected during send");
                    break;
                }
            }
            Outbound::Close(reason) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

// ── HTTP handlers ────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    debug!("Worker connecting");
    ws.on_upgrade(move |socket| bridge.handle_socket(socket))
}

async fn health(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    let agents = bridge.directory.read().await.len();
    Json(serde_json::json!({
        "status": "ok",
        "service": "autocoder-bridge",
        "agents": agents,
    }))
}

async fn list_agents(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    Json(bridge.agents().await)
}
