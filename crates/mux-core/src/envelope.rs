//! Wire envelope encoding and inbound frame classification.
//!
//! The client core only needs three shapes from the protocol:
//!
//! | Direction | Shape                 | Meaning                         |
//! |-----------|-----------------------|---------------------------------|
//! | out       | `{id, method, params}`| operation request               |
//! | in        | `{id, result}`        | successful response             |
//! | in        | `{id, error}`         | failed response                 |
//! | in        | `{channel, data}`     | push for a subscribed channel   |
//!
//! Everything else about field naming sits behind [`WireFormat`]. The default
//! [`JsonRpc`] format speaks JSON-RPC 2.0 with pushes delivered as
//! `{"method": "subscription", "params": {"channel": .., "data": ..}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MuxError;

pub const JSON_RPC_VERSION: &str = "2.0";

/// Outbound JSON-RPC request.
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'a str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

/// Error payload carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RemoteError {
    /// JSON-RPC "internal error" code, used for error payloads that do not
    /// carry their own.
    pub const INTERNAL: i64 = -32603;

    /// Parse an `error` member. Payloads that are not `{code, message}`
    /// objects still fail the request, with the raw payload kept in `data`.
    pub fn from_payload(payload: Value) -> Self {
        if let Ok(error) = serde_json::from_value::<RemoteError>(payload.clone()) {
            return error;
        }
        let message = match &payload {
            Value::String(text) => text.clone(),
            Value::Object(obj) => obj
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| payload.to_string(), str::to_string),
            other => other.to_string(),
        };
        RemoteError {
            code: Self::INTERNAL,
            message,
            data: Some(payload),
        }
    }
}

/// A decoded push notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    pub channel: String,
    pub data: Value,
}

/// Classification of one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Response correlated to an outbound request by id.
    Response {
        id: u64,
        outcome: Result<Value, RemoteError>,
    },
    /// Notification for a channel.
    Push(Push),
    /// Well-formed but neither a response nor a push.
    Unrecognized,
}

/// Encodes requests and classifies inbound frames for one protocol dialect.
pub trait WireFormat: Send + Sync + 'static {
    /// Serialize an operation request.
    fn encode_request(&self, id: u64, method: &str, params: &Value) -> Result<String, MuxError>;

    /// Classify a single inbound text frame.
    ///
    /// Returns [`MuxError::Protocol`] only for frames that cannot be parsed at
    /// all; parseable frames of unknown shape are [`Inbound::Unrecognized`].
    fn decode(&self, text: &str) -> Result<Inbound, MuxError>;
}

/// JSON-RPC 2.0 dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpc;

impl WireFormat for JsonRpc {
    fn encode_request(&self, id: u64, method: &str, params: &Value) -> Result<String, MuxError> {
        let request = JsonRpcRequest {
            jsonrpc: JSON_RPC_VERSION,
            id,
            method,
            params,
        };
        serde_json::to_string(&request)
            .map_err(|e| MuxError::Protocol(format!("failed to encode {method}: {e}")))
    }

    fn decode(&self, text: &str) -> Result<Inbound, MuxError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| MuxError::Protocol(format!("invalid JSON frame: {e}")))?;
        let Value::Object(mut obj) = value else {
            return Ok(Inbound::Unrecognized);
        };

        if let Some(id) = obj.get("id").and_then(Value::as_u64) {
            if let Some(error) = obj.remove("error").filter(|e| !e.is_null()) {
                let error = RemoteError::from_payload(error);
                return Ok(Inbound::Response {
                    id,
                    outcome: Err(error),
                });
            }
            if let Some(result) = obj.remove("result") {
                return Ok(Inbound::Response {
                    id,
                    outcome: Ok(result),
                });
            }
            return Ok(Inbound::Unrecognized);
        }

        // Subscription push: channel either nested under params or flat.
        let source = match obj.remove("params") {
            Some(Value::Object(params)) if params.contains_key("channel") => params,
            _ => obj,
        };
        Ok(take_push(source).map_or(Inbound::Unrecognized, Inbound::Push))
    }
}

fn take_push(mut source: Map<String, Value>) -> Option<Push> {
    let channel = match source.remove("channel")? {
        Value::String(channel) => channel,
        _ => return None,
    };
    let data = source.remove("data").unwrap_or(Value::Null);
    Some(Push { channel, data })
}

/// Params for a channel activation/deactivation request.
pub fn channels_params(channels: &[String]) -> Value {
    serde_json::json!({ "channels": channels })
}
