//! Wire protocol spoken between the bridge and worker agents.
//!
//! Every frame is a JSON object whose `type` field selects one of the
//! [`WireMessage`] variants. Field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConnectionError, Error, ErrorKind};

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Client → bridge: first frame on every connection.
    #[serde(rename_all = "camelCase")]
    Register {
        agent_id: String,
        room_id: String,
        role: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// Bridge → client: registration accepted.
    Registered,

    /// Liveness signal. Clients send one every heartbeat interval and in
    /// answer to a `ping`.
    #[serde(rename_all = "camelCase")]
    Heartbeat { agent_id: String },

    /// Bridge → client: you have been quiet for a full window.
    Ping,

    /// Routed request. Clients fill `targetAgentId`; the bridge replaces it
    /// with `fromAgentId` when forwarding.
    #[serde(rename_all = "camelCase")]
    Request {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_agent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_agent_id: Option<String>,
        content: Value,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// Answer to a request, tagged with the request's `messageId`.
    #[serde(rename_all = "camelCase")]
    Response {
        correlation_id: String,
        content: Value,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// Free-form message broadcast to the sender's room.
    #[serde(rename_all = "camelCase")]
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_agent_id: Option<String>,
        content: Value,
    },

    /// Shared-state update broadcast to the sender's room.
    #[serde(rename_all = "camelCase")]
    RoomUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_agent_id: Option<String>,
        content: Value,
    },

    #[serde(rename_all = "camelCase")]
    AgentJoined { agent_id: String, role: String },

    #[serde(rename_all = "camelCase")]
    AgentLeft { agent_id: String, role: String },
}

impl WireMessage {
    pub fn register(agent_id: &str, room_id: &str, role: &str) -> Self {
        Self::Register {
            agent_id: agent_id.to_string(),
            room_id: room_id.to_string(),
            role: role.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn request_to(target: &str, message_id: &str, content: Value) -> Self {
        Self::Request {
            message_id: message_id.to_string(),
            target_agent_id: Some(target.to_string()),
            from_agent_id: None,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn response(correlation_id: &str, content: Value) -> Self {
        Self::Response {
            correlation_id: correlation_id.to_string(),
            content,
            timestamp: Utc::now(),
        }
    }

    /// The `type` tag of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Registered => "registered",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Ping => "ping",
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Message { .. } => "message",
            Self::RoomUpdate { .. } => "room-update",
            Self::AgentJoined { .. } => "agent-joined",
            Self::AgentLeft { .. } => "agent-left",
        }
    }

    pub fn to_text(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Content of a `request` addressed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum WorkerRequest {
    GetStatus,
    GetCapabilities,
    ExecuteAction {
        name: String,
        #[serde(default)]
        params: Value,
    },
    /// Abort every action still running on the worker.
    Cancel {
        #[serde(default, rename = "taskId", skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
}

impl WorkerRequest {
    pub fn execute(name: impl Into<String>, params: Value) -> Self {
        Self::ExecuteAction {
            name: name.into(),
            params,
        }
    }

    pub fn to_content(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Build the content of a failed response.
pub fn error_content(kind: ErrorKind, message: impl Into<String>) -> Value {
    serde_json::json!({
        "error": message.into(),
        "errorKind": kind,
    })
}

/// Error message carried by a response, if it is a failure.
pub fn content_error(content: &Value) -> Option<(&str, Option<ErrorKind>)> {
    let message = content.get("error")?.as_str()?;
    let kind = content
        .get("errorKind")
        .and_then(|k| serde_json::from_value(k.clone()).ok());
    Some((message, kind))
}

/// Interpret response content from `agent_id`: error payloads become
/// errors, anything else is the successful result.
pub fn response_result(agent_id: &str, content: Value) -> Result<Value, Error> {
    match content_error(&content) {
        Some((_, Some(ErrorKind::Routing))) => Err(Error::Routing {
            target: agent_id.to_string(),
        }),
        Some((message, Some(ErrorKind::Connection))) => Err(ConnectionError::Lost {
            agent_id: agent_id.to_string(),
            reason: message.to_string(),
        }
        .into()),
        Some((message, _)) => Err(Error::RemoteExecution {
            agent_id: agent_id.to_string(),
            message: message.to_string(),
        }),
        None => Ok(content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_uses_camel_case_fields() {
        let msg = WireMessage::register("coder-1", "room-a", "coder");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "register");
        assert_eq!(value["agentId"], "coder-1");
        assert_eq!(value["roomId"], "room-a");
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn unit_variants_are_bare_type_objects() {
        assert_eq!(
            serde_json::to_value(WireMessage::Registered).unwrap(),
            json!({"type": "registered"})
        );
        let ping: WireMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, WireMessage::Ping);
    }

    #[test]
    fn request_without_timestamp_parses() {
        let msg = WireMessage::from_text(
            r#"{"type":"request","messageId":"m1","targetAgentId":"b","content":{"action":"get-status"}}"#,
        )
        .unwrap();
        match msg {
            WireMessage::Request {
                message_id,
                target_agent_id,
                from_agent_id,
                ..
            } => {
                assert_eq!(message_id, "m1");
                assert_eq!(target_agent_id.as_deref(), Some("b"));
                assert!(from_agent_id.is_none());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn room_update_tag_is_kebab_case() {
        let msg = WireMessage::RoomUpdate {
            from_agent_id: None,
            content: json!({"progress": 50}),
        };
        let text = msg.to_text().unwrap();
        assert!(text.contains(r#""type":"room-update""#));
        assert!(!text.contains("fromAgentId"));
        assert_eq!(msg.kind(), "room-update");
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(WireMessage::from_text(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn worker_request_content_shape() {
        let req = WorkerRequest::execute("run-task", json!({"command": "ls"}));
        assert_eq!(
            req.to_content(),
            json!({"action": "execute-action", "name": "run-task", "params": {"command": "ls"}})
        );
        let status: WorkerRequest = serde_json::from_value(json!({"action": "get-status"})).unwrap();
        assert_eq!(status, WorkerRequest::GetStatus);
        let cancel = WorkerRequest::Cancel {
            task_id: Some("t1".into()),
        };
        assert_eq!(cancel.to_content(), json!({"action": "cancel", "taskId": "t1"}));
    }

    #[test]
    fn response_result_maps_error_payloads() {
        let ok = response_result("w1", json!({"output": "done"})).unwrap();
        assert_eq!(ok["output"], "done");

        let remote = response_result("w1", error_content(ErrorKind::RemoteExecution, "boom"));
        assert!(matches!(remote, Err(Error::RemoteExecution { message, .. }) if message == "boom"));

        let routing = response_result("w9", error_content(ErrorKind::Routing, "not registered"));
        assert!(matches!(routing, Err(Error::Routing { target }) if target == "w9"));

        let lost = response_result("w2", error_content(ErrorKind::Connection, "gone")).unwrap_err();
        assert!(lost.is_transient());
    }
}
