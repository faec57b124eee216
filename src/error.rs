use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    pub stack: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: stack.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallError {
    pub message: String,
    pub properties: BTreeMap<String, Value>,
}

impl CallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CallError {}

impl From<&str> for CallError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for CallError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<RpcError> for CallError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote(remote) => Self {
                message: remote.message,
                properties: remote.properties,
            },
            other => Self::new(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("No host endpoint could be detected")]
    NoHost,

    #[error("Required endpoint argument was absent")]
    InvalidTarget,

    #[error("Connection {0} is already registered")]
    DuplicateConnection(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation not supported by this peer: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Registration rejected by relay: {code}: {message}")]
    HandshakeRejected { code: String, message: String },

    #[error("Evicted from channel: {code}")]
    Evicted { code: String },

    #[error("Relay client is closed")]
    Closed,

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

pub type Result<T> = std::result::Result<T, RpcError>;
pub type RelayResult<T> = std::result::Result<T, RelayError>;

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}
