//! Protocol message types for bridge communication.
//!
//! Every frame is a JSON text message tagged by `type`.

use hostlink_core::{BridgeError, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::version::ProtocolVersion;

/// Envelope keys a handler result may not overwrite when flattened.
const RESERVED_KEYS: [&str; 4] = ["type", "requestId", "success", "error"];

/// A command request from the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    /// Client correlation id, echoed on the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Registered command name
    pub command: String,

    /// Operation within the command (may instead be given as `payload.operation`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    /// Operation arguments
    #[serde(default)]
    pub payload: Value,
}

impl RequestEnvelope {
    pub fn new(
        request_id: impl Into<String>,
        command: impl Into<String>,
        operation: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            request_id: Some(request_id.into()),
            command: command.into(),
            operation: Some(operation.into()),
            payload,
        }
    }

    /// Resolves the operation name from the envelope or the payload.
    pub fn operation_name(&self) -> Option<&str> {
        self.operation
            .as_deref()
            .or_else(|| self.payload.get("operation").and_then(Value::as_str))
            .filter(|op| !op.is_empty())
    }
}

/// Error details carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// The bridge's answer to a request.
///
/// Successful object results are flattened next to `success`; non-object
/// results are carried under `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,

    #[serde(flatten)]
    pub result: Map<String, Value>,
}

impl ResponseEnvelope {
    /// Creates a success envelope from a handler result.
    pub fn success(request_id: Option<String>, result: Value) -> Self {
        let mut fields = match result {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                map
            }
        };
        for key in RESERVED_KEYS {
            fields.remove(key);
        }

        Self {
            request_id,
            success: true,
            error: None,
            result: fields,
        }
    }

    /// Creates an error envelope.
    pub fn failure(request_id: Option<String>, error: &BridgeError) -> Self {
        Self::failure_with_message(request_id, error.kind(), error.to_string())
    }

    /// Creates an error envelope from a kind and an already-prepared message.
    pub fn failure_with_message(
        request_id: Option<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            success: false,
            error: Some(ErrorBody {
                kind,
                message: message.into(),
            }),
            result: Map::new(),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Returns the result fields as a JSON object.
    pub fn result_value(&self) -> Value {
        Value::Object(self.result.clone())
    }
}

/// Messages sent by clients to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Command request
    Command(RequestEnvelope),

    /// Application-level liveness probe
    Ping {
        #[serde(default)]
        seq: u64,
    },

    /// Answer to a server probe
    Pong {
        #[serde(default)]
        seq: u64,
    },
}

impl ClientMessage {
    pub fn command(
        request_id: impl Into<String>,
        command: impl Into<String>,
        operation: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::Command(RequestEnvelope::new(request_id, command, operation, payload))
    }

    pub fn ping(seq: u64) -> Self {
        Self::Ping { seq }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }
}

/// Messages sent from the bridge to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after the upgrade completes
    Welcome {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "protocolVersion")]
        protocol_version: ProtocolVersion,
        #[serde(rename = "serverVersion")]
        server_version: String,
    },

    /// Response to a command request
    Response(ResponseEnvelope),

    /// Answer to a client `ping`
    Pong { seq: u64 },
}

impl ServerMessage {
    pub fn welcome(session_id: impl Into<String>, server_version: impl Into<String>) -> Self {
        Self::Welcome {
            session_id: session_id.into(),
            protocol_version: ProtocolVersion::CURRENT,
            server_version: server_version.into(),
        }
    }

    pub fn response(envelope: ResponseEnvelope) -> Self {
        Self::Response(envelope)
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    /// Serializes the message to a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
