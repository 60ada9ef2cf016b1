//! Realtime state protocol messages
//!
//! Inbound messages are classified exactly once by [`ServerMessage::decode`];
//! anything that does not fit one of the known variants is rejected with an
//! error the caller logs and drops.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::sync::PatchOp;

/// Opaque log record relayed to the external log sink
pub type LogEntry = Value;

// ─────────────────────────────────────────────────────────────────
// Server → Client
// ─────────────────────────────────────────────────────────────────

/// Full state replacement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Version of the document carried in `data`
    pub state_version: u64,

    /// The document itself
    pub data: Value,

    /// Optional server-side settings shipped alongside the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_config: Option<Value>,
}

/// Incremental, version-bounded edit set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePatch {
    /// Version the edits apply on top of
    pub from_version: u64,

    /// Version the document is at after the edits
    pub to_version: u64,

    /// Ordered edit operations
    pub patch: Vec<PatchOp>,
}

/// A batch of log entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogBatch {
    #[serde(default)]
    pub entries: Vec<LogEntry>,
}

/// All messages the server may send
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// `state.snapshot`
    StateSnapshot(StateSnapshot),

    /// `state.patch`
    StatePatch(StatePatch),

    /// `logs.history`: replaces the whole log history
    LogsHistory(LogBatch),

    /// `logs.append`: appends to the log history
    LogsAppend(LogBatch),
}

impl ServerMessage {
    pub const SNAPSHOT: &'static str = "state.snapshot";
    pub const PATCH: &'static str = "state.patch";
    pub const LOGS_HISTORY: &'static str = "logs.history";
    pub const LOGS_APPEND: &'static str = "logs.append";

    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::malformed(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Decode a binary frame carrying UTF-8 JSON
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::malformed(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Classify an already parsed JSON value
    pub fn from_value(mut value: Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::malformed("missing string field 'type'"))?
            .to_string();

        let message = match kind.as_str() {
            Self::SNAPSHOT => ServerMessage::StateSnapshot(decode_body(&kind, value)?),
            Self::PATCH => {
                // Patch fields may arrive nested under `payload`.
                let body = match value.get_mut("payload") {
                    Some(payload) if payload.is_object() => payload.take(),
                    _ => value,
                };
                ServerMessage::StatePatch(decode_body(&kind, body)?)
            }
            Self::LOGS_HISTORY => ServerMessage::LogsHistory(decode_body(&kind, value)?),
            Self::LOGS_APPEND => ServerMessage::LogsAppend(decode_body(&kind, value)?),
            other => {
                return Err(Error::ProtocolUnexpected {
                    message: format!("unknown message type '{}'", other),
                })
            }
        };

        Ok(message)
    }

    /// Get the wire type name
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::StateSnapshot(_) => Self::SNAPSHOT,
            ServerMessage::StatePatch(_) => Self::PATCH,
            ServerMessage::LogsHistory(_) => Self::LOGS_HISTORY,
            ServerMessage::LogsAppend(_) => Self::LOGS_APPEND,
        }
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::malformed(format!("invalid '{}' message: {}", kind, e)))
}

// ─────────────────────────────────────────────────────────────────
// Client → Server
// ─────────────────────────────────────────────────────────────────

/// Capability announcement sent first on every connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub capabilities: Vec<String>,
}

/// Subscription request sent after `hello`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub include_snapshot: bool,
}

/// All messages the client sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum ClientMessage {
    Hello(HelloPayload),
    Subscribe(SubscribePayload),
}

impl ClientMessage {
    /// `hello` with the given capabilities
    pub fn hello<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientMessage::Hello(HelloPayload {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        })
    }

    /// `subscribe` requesting a full snapshot
    pub fn subscribe_with_snapshot() -> Self {
        ClientMessage::Subscribe(SubscribePayload {
            include_snapshot: true,
        })
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Get the wire type name
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Hello(_) => "hello",
            ClientMessage::Subscribe(_) => "subscribe",
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::PathStep;
    use serde_json::json;

    #[test]
    fn test_decode_snapshot() {
        let msg = ServerMessage::decode(
            r#"{"type":"state.snapshot","stateVersion":5,"data":{"count":1},"serverConfig":{"tz":"UTC"}}"#,
        )
        .unwrap();

        match msg {
            ServerMessage::StateSnapshot(snap) => {
                assert_eq!(snap.state_version, 5);
                assert_eq!(snap.data, json!({"count": 1}));
                assert_eq!(snap.server_config, Some(json!({"tz": "UTC"})));
            }
            other => panic!("Expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_patch_top_level() {
        let msg = ServerMessage::decode(
            r#"{"type":"state.patch","fromVersion":5,"toVersion":6,"patch":[{"op":"replace","path":["count"],"value":2}]}"#,
        )
        .unwrap();

        match msg {
            ServerMessage::StatePatch(patch) => {
                assert_eq!(patch.from_version, 5);
                assert_eq!(patch.to_version, 6);
                assert_eq!(
                    patch.patch,
                    vec![PatchOp::Replace {
                        path: vec![PathStep::Key("count".into())].into(),
                        value: json!(2),
                    }]
                );
            }
            other => panic!("Expected patch, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_patch_nested_under_payload() {
        let msg = ServerMessage::decode(
            r#"{"type":"state.patch","payload":{"fromVersion":1,"toVersion":2,"patch":[{"op":"remove","path":"/rows/0"}]}}"#,
        )
        .unwrap();

        assert_eq!(msg.type_name(), "state.patch");
        match msg {
            ServerMessage::StatePatch(patch) => {
                assert_eq!(patch.from_version, 1);
                assert_eq!(patch.patch.len(), 1);
            }
            other => panic!("Expected patch, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_logs() {
        let msg = ServerMessage::decode(r#"{"type":"logs.append","entries":[{"line":"a"}]}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::LogsAppend(LogBatch {
                entries: vec![json!({"line": "a"})]
            })
        );

        let msg = ServerMessage::decode(r#"{"type":"logs.history"}"#).unwrap();
        assert_eq!(msg, ServerMessage::LogsHistory(LogBatch::default()));
    }

    #[test]
    fn test_decode_rejects_unknown_and_malformed() {
        let err = ServerMessage::decode(r#"{"type":"state.teleport"}"#).unwrap_err();
        assert!(matches!(err, Error::ProtocolUnexpected { .. }));

        let err = ServerMessage::decode(r#"{"stateVersion":1}"#).unwrap_err();
        assert!(matches!(err, Error::ProtocolMalformed { .. }));

        let err = ServerMessage::decode("not json").unwrap_err();
        assert!(matches!(err, Error::ProtocolMalformed { .. }));

        let err = ServerMessage::decode(r#"{"type":"state.patch","fromVersion":"x"}"#).unwrap_err();
        assert!(matches!(err, Error::ProtocolMalformed { .. }));
    }

    #[test]
    fn test_client_message_wire_shape() {
        let hello = ClientMessage::hello(["state.patch", "logs"]);
        assert_eq!(
            serde_json::to_value(&hello).unwrap(),
            json!({"type": "hello", "payload": {"capabilities": ["state.patch", "logs"]}})
        );

        let subscribe = ClientMessage::subscribe_with_snapshot();
        assert_eq!(
            serde_json::to_value(&subscribe).unwrap(),
            json!({"type": "subscribe", "payload": {"includeSnapshot": true}})
        );
        assert_eq!(subscribe.type_name(), "subscribe");
    }
}
