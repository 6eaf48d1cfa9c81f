//! Bridge protocol: WebSocket frames between the kernel and the local
//! tool-execution server.
//!
//! The kernel connects out to the bridge, sends `invoke` frames, and
//! receives outputs plus `invoke.*` lifecycle events. `{id, sessionId}`
//! is the logical dedup key: the server executes each key once per
//! distinct args and replays the cached response afterwards.

use serde::{Deserialize, Serialize};

/// Wire protocol version, sent as a query param on connect.
pub const PROTOCOL_VERSION: u32 = 1;

/// Max serialized invoke result size in bytes (4 MB). Servers should
/// truncate larger results and flag them in `data`.
pub const MAX_INVOKE_RESULT_BYTES: usize = 4 * 1024 * 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typed frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frames carrying a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Kernel → bridge: run a tool.
    Invoke {
        /// Client-generated, stable across retries of one logical invocation.
        id: String,
        tool: String,
        /// Always an object, never an array.
        args: serde_json::Value,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "parentSessionId", default, skip_serializing_if = "Option::is_none")]
        parent_session_id: Option<String>,
        #[serde(rename = "agentId", default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },

    /// Bridge → kernel: invoke lifecycle notification.
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        data: serde_json::Value,
    },

    /// Bidirectional heartbeat.
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
}

/// Bridge → kernel: the result of one invoke. Carries no `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeOutput {
    pub id: String,
    pub ok: bool,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "agentId", default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeError>,
}

/// Error payload surfaced verbatim to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl BridgeError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Fixed retryability mapping for bridge error codes.
    pub fn retryable(&self) -> bool {
        matches!(
            self.code.as_str(),
            "E_BUSY" | "E_BRIDGE_DISCONNECTED" | "E_TIMEOUT"
        )
    }
}

/// Everything the bridge can send: a typed frame or an invoke output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Control(Frame),
    Output(InvokeOutput),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event names
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const EVENT_INVOKE_STARTED: &str = "invoke.started";
pub const EVENT_INVOKE_STDERR: &str = "invoke.stderr";
pub const EVENT_INVOKE_FINISHED: &str = "invoke.finished";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_serializes_camel_case() {
        let frame = Frame::Invoke {
            id: "inv-1".into(),
            tool: "fs.read".into(),
            args: serde_json::json!({"path": "/tmp/a"}),
            session_id: "s1".into(),
            parent_session_id: None,
            agent_id: Some("a1".into()),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "invoke");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["agentId"], "a1");
        assert!(json.get("parentSessionId").is_none());
    }

    #[test]
    fn server_message_disambiguates_output_and_event() {
        let output: ServerMessage = serde_json::from_str(
            r#"{"id":"inv-1","ok":true,"sessionId":"s1","agentId":"a1","data":{"x":1}}"#,
        )
        .unwrap();
        assert!(matches!(output, ServerMessage::Output(_)));

        let event: ServerMessage = serde_json::from_str(
            r#"{"type":"event","event":"invoke.started","id":"inv-1","data":{}}"#,
        )
        .unwrap();
        match event {
            ServerMessage::Control(Frame::Event { event, .. }) => {
                assert_eq!(event, EVENT_INVOKE_STARTED);
            }
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[test]
    fn error_output_round_trips() {
        let output = InvokeOutput {
            id: "inv-2".into(),
            ok: false,
            session_id: "s1".into(),
            agent_id: Some("a2".into()),
            data: None,
            error: Some(
                BridgeError::new("E_BUSY", "session saturated")
                    .with_details(serde_json::json!({"logicalSessionId": "s1"})),
            ),
        };
        let json = serde_json::to_string(&output).unwrap();
        let back: InvokeOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back, output);
        assert!(back.error.unwrap().retryable());
    }

    #[test]
    fn retryable_mapping_fixed() {
        assert!(BridgeError::new("E_BRIDGE_DISCONNECTED", "").retryable());
        assert!(BridgeError::new("E_TIMEOUT", "").retryable());
        assert!(!BridgeError::new("E_ARGS", "").retryable());
        assert!(!BridgeError::new("E_AUTH", "").retryable());
    }
}
