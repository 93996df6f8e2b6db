//! The wire envelope and its id normalisation.
//!
//! Request ids are the one place the JSON-RPC wire format is ambiguous:
//! `1` and `1.0` are the same JSON number but deserialize to different Rust
//! types unless normalised. [`RequestId`] performs that normalisation once,
//! at construction, so every later comparison (registering a waiter,
//! matching a child response) is a plain equality check.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcErrorKind;

/// A JSON-RPC request/response id, normalised per the data model:
/// integral JSON numbers become [`RequestId::Number`], non-integral numbers
/// stay [`RequestId::Float`], and strings stay [`RequestId::Str`].
#[derive(Debug, Clone)]
pub enum RequestId {
    Number(i64),
    Float(f64),
    Str(String),
}

impl PartialEq for RequestId {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RequestId::Number(a), RequestId::Number(b)) => a == b,
            (RequestId::Float(a), RequestId::Float(b)) => a.to_bits() == b.to_bits(),
            (RequestId::Str(a), RequestId::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for RequestId {}

impl std::hash::Hash for RequestId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            RequestId::Number(n) => {
                0u8.hash(state);
                n.hash(state);
            }
            RequestId::Float(f) => {
                1u8.hash(state);
                f.to_bits().hash(state);
            }
            RequestId::Str(s) => {
                2u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Float(x) => write!(f, "{x}"),
            RequestId::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl RequestId {
    /// Normalises a decoded `id` field. Returns `None` for `null`/absent,
    /// which callers treat as "this is a notification, not a request".
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(RequestId::Str(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(RequestId::Number(i))
                } else if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                        Some(RequestId::Number(f as i64))
                    } else {
                        Some(RequestId::Float(f))
                    }
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => Value::from(*n),
            RequestId::Float(f) => {
                Value::from(serde_json::Number::from_f64(*f).unwrap_or_else(|| 0.into()))
            }
            RequestId::Str(s) => Value::String(s.clone()),
        }
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        RequestId::from_value(&value).ok_or_else(|| de::Error::custom("invalid request id"))
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind) -> Self {
        RpcError {
            code: kind.code(),
            message: kind.message().to_string(),
            data: None,
        }
    }

    pub fn with_data(kind: RpcErrorKind, data: Value) -> Self {
        RpcError {
            code: kind.code(),
            message: kind.message().to_string(),
            data: Some(data),
        }
    }
}

/// One JSON-RPC 2.0 envelope: request, notification, success response, or
/// error response. Fields beyond `jsonrpc`/`id` are all optional on the
/// wire; [`Frame::kind`] classifies which shape this instance holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Notification,
    Response,
}

impl Frame {
    pub fn request(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Frame {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Frame {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn success(id: RequestId, result: Value) -> Self {
        Frame {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(id: Option<RequestId>, error: RpcError) -> Self {
        Frame {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    /// Classifies the frame. A frame with a `method` and no `id` is a
    /// notification; with a `method` and an `id`, a request; otherwise, if
    /// it has an id (and no method), a response.
    pub fn kind(&self) -> FrameKind {
        if self.method.is_some() {
            if self.id.is_some() {
                FrameKind::Request
            } else {
                FrameKind::Notification
            }
        } else {
            FrameKind::Response
        }
    }

    pub fn is_valid_version(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION
    }
}
