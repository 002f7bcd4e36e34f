//! Worker agent client: the sandbox-side end of the bridge connection.
//!
//! One [`WorkerClient`] keeps a single logical session with the bridge
//! across any number of physical sockets. It registers, heartbeats, answers
//! requests through its [`HandlerRegistry`], and reconnects with backoff
//! when the socket drops. Sends made while not registered are queued and
//! flushed in order once the next registration is acknowledged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{Connection, ConnectionState, Delivery};
use super::handlers::HandlerRegistry;
use crate::config::WorkerConfig;
use crate::correlation::PendingRequests;
use crate::error::{ConnectionError, Error, ErrorKind};
use crate::protocol::{WireMessage, WorkerRequest, error_content, response_result};

const EVENT_CAPACITY: usize = 256;

pub struct WorkerClient {
    config: WorkerConfig,
    handlers: Arc<HandlerRegistry>,
    connection: Mutex<Connection>,
    pending: PendingRequests<Value>,
    /// Room traffic (messages, room updates, joins and leaves).
    events: broadcast::Sender<WireMessage>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    /// Requests being answered, by message id.
    inflight: StdMutex<HashMap<String, AbortHandle>>,
    started_at: Instant,
    active_actions: AtomicUsize,
}

impl WorkerClient {
    pub fn new(config: WorkerConfig, handlers: Arc<HandlerRegistry>) -> Arc<Self> {
        let connection = Connection::new(config.outbound_queue_limit, config.reconnect);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            handlers,
            connection: Mutex::new(connection),
            pending: PendingRequests::new(),
            events,
            state,
            shutdown,
            inflight: StdMutex::new(HashMap::new()),
            started_at: Instant::now(),
            active_actions: AtomicUsize::new(0),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Number of frames waiting for the next registration.
    pub async fn queued(&self) -> usize {
        self.connection.lock().await.queued()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WireMessage> {
        self.events.subscribe()
    }

    /// Wait until the client is registered with the bridge.
    pub async fn wait_until_registered(&self, timeout: Duration) -> Result<(), Error> {
        let mut rx = self.state.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| *s == ConnectionState::Registered)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(ConnectionError::RegistrationTimeout { grace: timeout }.into()),
        }
    }

    /// Stop the client. `run` returns once the current socket is closed.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Send a frame now, or queue it until the next registration.
    pub async fn send(&self, msg: WireMessage) -> Result<Delivery, Error> {
        self.connection.lock().await.send(msg)
    }

    /// Broadcast a message to the rest of the room.
    pub async fn send_message(&self, content: Value) -> Result<Delivery, Error> {
        self.send(WireMessage::Message {
            from_agent_id: None,
            content,
        })
        .await
    }

    /// Publish a shared-state update to the rest of the room.
    pub async fn send_room_update(&self, content: Value) -> Result<Delivery, Error> {
        self.send(WireMessage::RoomUpdate {
            from_agent_id: None,
            content,
        })
        .await
    }

    /// Send a request to another agent through the bridge and wait for the
    /// correlated response.
    pub async fn send_request(&self, target: &str, content: Value) -> Result<Value, Error> {
        let message_id = Uuid::new_v4().to_string();
        let waiter = self.pending.register(message_id.clone(), target)?;
        self.send(WireMessage::request_to(target, &message_id, content))
            .await?;
        let content = waiter.wait(self.config.request_timeout).await?;
        response_result(target, content)
    }

    // ── Connection loop ──────────────────────────────────────────────────

    /// Connect, serve, and reconnect until [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.connection.lock().await.begin_connect();
            self.state.send_replace(ConnectionState::Connecting);

            let outcome = self.session().await;

            let delay = self.connection.lock().await.disconnected();
            let previous = self.state.send_replace(ConnectionState::Disconnected);
            // The bridge drops routes for a departed agent, so requests that
            // went out on this socket will never be answered. Requests still
            // queued from before registration keep waiting.
            if previous == ConnectionState::Registered {
                let failed = self.pending.fail_all("connection to bridge lost");
                if failed > 0 {
                    debug!(agent_id = %self.config.agent_id, count = failed, "Failed in-flight requests");
                }
            }

            match outcome {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        agent_id = %self.config.agent_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Bridge connection lost"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(agent_id = %self.config.agent_id, "Worker client stopped");
        Ok(())
    }

    /// One physical connection. Returns `Ok` only on shutdown.
    async fn session(self: &Arc<Self>) -> Result<(), Error> {
        let url = self.config.bridge_url.as_str();
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| ConnectionError::Handshake {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        debug!(agent_id = %self.config.agent_id, url = %url, "Connected to bridge");

        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let text = match msg.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        {
            let mut conn = self.connection.lock().await;
            conn.attach(tx);
            conn.send_control(WireMessage::register(
                &self.config.agent_id,
                &self.config.room_id,
                &self.config.role,
            ));
        }

        let grace = self.config.register_timeout;
        match tokio::time::timeout(grace, self.await_registered(&mut stream)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ConnectionError::RegistrationTimeout { grace }.into()),
        }

        let flushed = self.connection.lock().await.registered();
        self.state.send_replace(ConnectionState::Registered);
        info!(
            agent_id = %self.config.agent_id,
            room_id = %self.config.room_id,
            flushed,
            "Registered with bridge"
        );

        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.send_heartbeat().await;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match WireMessage::from_text(text.as_str()) {
                        Ok(msg) => self.handle_frame(msg).await,
                        Err(e) => debug!(error = %e, "Ignoring malformed frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                        return Err(self.lost(format!("closed by bridge: {reason}")));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(self.lost(e.to_string())),
                    None => return Err(self.lost("stream ended".to_string())),
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Read until `registered`. Frames that arrive first are still handled;
    /// any replies they produce queue behind the registration.
    async fn await_registered<S>(self: &Arc<Self>, stream: &mut S) -> Result<(), Error>
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match WireMessage::from_text(text.as_str()) {
                    Ok(WireMessage::Registered) => return Ok(()),
                    Ok(other) => self.handle_frame(other).await,
                    Err(e) => debug!(error = %e, "Ignoring malformed frame"),
                },
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .unwrap_or_else(|| "closed during registration".to_string());
                    return Err(ConnectionError::RegistrationRejected(reason).into());
                }
                Ok(_) => {}
                Err(e) => return Err(self.lost(e.to_string())),
            }
        }
        Err(self.lost("closed during registration".to_string()))
    }

    fn lost(&self, reason: String) -> Error {
        ConnectionError::Lost {
            agent_id: self.config.agent_id.clone(),
            reason,
        }
        .into()
    }

    async fn send_heartbeat(&self) {
        let sent = self.connection.lock().await.send_control(WireMessage::Heartbeat {
            agent_id: self.config.agent_id.clone(),
        });
        if !sent {
            debug!(agent_id = %self.config.agent_id, "Heartbeat not sent: socket closed");
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    async fn handle_frame(self: &Arc<Self>, msg: WireMessage) {
        match msg {
            WireMessage::Request {
                message_id,
                from_agent_id,
                content,
                ..
            } => {
                if let Ok(WorkerRequest::Cancel { task_id }) =
                    serde_json::from_value::<WorkerRequest>(content.clone())
                {
                    let cancelled = self.cancel_inflight();
                    info!(agent_id = %self.config.agent_id, task_id = ?task_id, cancelled, "Cancel requested");
                    let reply = serde_json::json!({ "cancelled": cancelled });
                    if let Err(e) = self.send(WireMessage::response(&message_id, reply)).await {
                        warn!(message_id = %message_id, error = %e, "Could not acknowledge cancel");
                    }
                    return;
                }

                let client = Arc::clone(self);
                let id = message_id.clone();
                let mut inflight = self.inflight();
                let task = tokio::spawn(async move {
                    client.answer(message_id.clone(), from_agent_id, content).await;
                    client.inflight().remove(&message_id);
                });
                inflight.insert(id, task.abort_handle());
            }
            WireMessage::Response {
                correlation_id,
                content,
                ..
            } => {
                if !self.pending.resolve(&correlation_id, content) {
                    debug!(correlation_id = %correlation_id, "Discarding unmatched response");
                }
            }
            WireMessage::Ping => self.send_heartbeat().await,
            WireMessage::Message { .. }
            | WireMessage::RoomUpdate { .. }
            | WireMessage::AgentJoined { .. }
            | WireMessage::AgentLeft { .. } => {
                let _ = self.events.send(msg);
            }
            WireMessage::Registered | WireMessage::Register { .. } | WireMessage::Heartbeat { .. } => {
                debug!(kind = msg.kind(), "Ignoring unexpected frame");
            }
        }
    }

    fn inflight(&self) -> std::sync::MutexGuard<'_, HashMap<String, AbortHandle>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Abort every request still being answered. Their callers get no
    /// response; the orchestrator has already given up on them.
    fn cancel_inflight(&self) -> usize {
        let handles: Vec<AbortHandle> = self.inflight().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.abort();
        }
        if !handles.is_empty() {
            self.active_actions.store(0, Ordering::SeqCst);
        }
        handles.len()
    }

    /// Answer one request. The response goes through the offline queue, so
    /// a result produced while disconnected is delivered after reconnecting.
    async fn answer(&self, message_id: String, from: Option<String>, content: Value) {
        let from = from.unwrap_or_default();
        let reply = match serde_json::from_value::<WorkerRequest>(content) {
            Ok(WorkerRequest::GetStatus) => self.status().await,
            Ok(WorkerRequest::GetCapabilities) => self.handlers.capabilities().await,
            Ok(WorkerRequest::ExecuteAction { name, params }) => {
                self.run_action(&message_id, &from, &name, params).await
            }
            Ok(WorkerRequest::Cancel { .. }) => serde_json::json!({ "cancelled": 0 }),
            Err(e) => error_content(ErrorKind::RemoteExecution, format!("unsupported request: {e}")),
        };

        if let Err(e) = self.send(WireMessage::response(&message_id, reply)).await {
            warn!(message_id = %message_id, error = %e, "Could not send response");
        }
    }

    async fn run_action(&self, message_id: &str, from: &str, name: &str, params: Value) -> Value {
        info!(agent_id = %self.config.agent_id, action = %name, from = %from, "Running action");
        self.active_actions.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .send_room_update(serde_json::json!({
                "event": "action-started",
                "action": name,
                "requestId": message_id,
            }))
            .await;

        let started = Instant::now();
        let reply = self.handlers.execute(name, params).await;
        let success = crate::protocol::content_error(&reply).is_none();

        self.active_actions.fetch_sub(1, Ordering::SeqCst);
        let _ = self
            .send_room_update(serde_json::json!({
                "event": "action-finished",
                "action": name,
                "requestId": message_id,
                "success": success,
                "durationMs": started.elapsed().as_millis() as u64,
            }))
            .await;
        if success {
            info!(agent_id = %self.config.agent_id, action = %name, "Action completed");
        } else {
            warn!(agent_id = %self.config.agent_id, action = %name, "Action failed");
        }
        reply
    }

    async fn status(&self) -> Value {
        let active = self.active_actions.load(Ordering::SeqCst);
        serde_json::json!({
            "agentId": self.config.agent_id,
            "roomId": self.config.room_id,
            "role": self.config.role,
            "state": self.state().to_string(),
            "busy": active > 0,
            "activeActions": active,
            "queued": self.queued().await,
            "uptimeSecs": self.started_at.elapsed().as_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Arc<WorkerClient> {
        let config = WorkerConfig::new("w1", "room", "coder", "ws://127.0.0.1:9/ws");
        WorkerClient::new(config, Arc::new(HandlerRegistry::new()))
    }

    #[tokio::test]
    async fn sends_queue_before_first_connection() {
        let client = client();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        let delivery = client
            .send_message(serde_json::json!({"hello": 1}))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(client.queued().await, 1);
    }

    #[tokio::test]
    async fn status_reports_identity() {
        let status = client().status().await;
        assert_eq!(status["agentId"], "w1");
        assert_eq!(status["state"], "disconnected");
        assert_eq!(status["busy"], false);
    }

    #[tokio::test]
    async fn unmatched_response_is_discarded() {
        let client = client();
        client
            .handle_frame(WireMessage::response("nobody", serde_json::json!({})))
            .await;
        assert!(client.pending.is_empty());
    }

    #[tokio::test]
    async fn registration_wait_times_out() {
        let err = client()
            .wait_until_registered(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
