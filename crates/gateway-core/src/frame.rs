use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON-RPC id: the wire format allows either a string or an integer
/// (§3 "MCP frame"). The teacher's stdio transport only ever minted
/// numeric ids for its own requests, but backends in this gateway are
/// third-party and may echo a string id back, so both are accepted.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameId {
    Number(u64),
    Text(String),
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameId::Number(n) => write!(f, "{n}"),
            FrameId::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for FrameId {
    fn from(value: u64) -> Self {
        FrameId::Number(value)
    }
}

/// Monotonic generator for request ids, one per adapter instance.
#[derive(Debug, Default)]
pub struct FrameIdGenerator(AtomicU64);

impl FrameIdGenerator {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> FrameId {
        FrameId::Number(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

/// A single MCP (JSON-RPC 2.0) frame: a request/notification (`method`
/// [+ `params`]) or a response (`result`/`error`), correlated by `id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McpFrame {
    pub jsonrpc: JsonRpcVersion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<FrameId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

/// A fixed literal so `{"jsonrpc":"2.0",...}` round-trips without the
/// caller needing to remember the version string.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s != "2.0" {
            return Err(serde::de::Error::custom(format!(
                "unsupported jsonrpc version `{s}`"
            )));
        }
        Ok(JsonRpcVersion)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McpError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpFrame {
    pub fn request(id: FrameId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id),
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: None,
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn response_ok(id: FrameId, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn response_err(id: FrameId, error: McpError) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    /// True when this frame is a request or notification (has `method`).
    pub fn is_outbound_call(&self) -> bool {
        self.method.is_some()
    }

    /// True when this frame is a response (has `result` or `error`, no
    /// `method`) — used by adapters to route into the pending table versus
    /// the general `receive()` queue.
    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Methods the dispatcher considers safe to retry without risk of
/// duplicate side effects (§4.8 "never retry a frame that may have had
/// observable effects").
pub const IDEMPOTENT_READ_METHODS: &[&str] = &["tools/list", "tools/describe"];

pub fn is_idempotent_read(method: &str) -> bool {
    IDEMPOTENT_READ_METHODS.contains(&method)
}
