use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemoteError;
use crate::transfer::TransferList;

pub const ID_LEN: usize = 10;

pub const DEFAULT_CHANNEL: &str = "__default__";

/// Random alphanumeric identifier; uniqueness is statistical, not guaranteed.
pub fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}

/// Messages exchanged by the RPC engine. Correlation ids travel inside the
/// envelope, never in transport metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcEnvelope {
    HandshakeRequest {
        methods: Vec<String>,
        schema: Value,
    },
    // First reply (host to guest) carries the advertisement; the guest's
    // second reply carries the id alone, or raises `abort` to discard.
    HandshakeReply {
        connection_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        methods: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        abort: bool,
    },
    RpcRequest {
        connection_id: String,
        call_id: String,
        method: String,
        args: Vec<Value>,
        #[serde(skip, default)]
        transfers: TransferList,
    },
    RpcResolve {
        connection_id: String,
        call_id: String,
        method: String,
        result: Value,
        #[serde(skip, default)]
        transfers: TransferList,
    },
    RpcReject {
        connection_id: String,
        call_id: String,
        method: String,
        error: RemoteError,
    },
}

pub const ERR_DUPLICATE_TAB_ID: &str = "DUPLICATE_TAB_ID";
pub const ERR_INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
pub const ERR_UNKNOWN: &str = "UNKNOWN_ERROR";

/// Messages understood by the relay. A distinct namespace: the relay holds
/// no RPC logic and the engine never sees bridge tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeEnvelope {
    BridgeHandshake {
        tab_id: String,
        channel: String,
        methods: Vec<String>,
        schema: Value,
    },
    BridgeHandshakeAck {
        tab_id: String,
        channel: String,
        state: Value,
    },
    BridgeHandshakeError {
        code: String,
        message: String,
        tab_id: String,
        channel: String,
    },
    BridgeBroadcast {
        sender: String,
        channel: String,
        method: String,
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_error: Option<RemoteError>,
    },
    BridgeDirectMessage {
        sender: String,
        target: String,
        channel: String,
        method: String,
        args: Vec<Value>,
    },
    BridgeRelay {
        sender: String,
        method: String,
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_error: Option<RemoteError>,
    },
    BridgeDisconnect {
        tab_id: String,
        channel: String,
    },
    BridgeGetState {
        channel: String,
    },
    BridgeStateResponse {
        channel: String,
        state: Value,
    },
    BridgeSetState {
        channel: String,
        key: String,
        value: Value,
    },
    BridgeStateUpdate {
        channel: String,
        key: String,
        value: Value,
    },
    BridgeGetTabs {
        channel: String,
    },
    BridgeTabsResponse {
        channel: String,
        tabs: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Rpc(RpcEnvelope),
    Bridge(BridgeEnvelope),
}

impl From<RpcEnvelope> for Envelope {
    fn from(msg: RpcEnvelope) -> Self {
        Envelope::Rpc(msg)
    }
}

impl From<BridgeEnvelope> for Envelope {
    fn from(msg: BridgeEnvelope) -> Self {
        Envelope::Bridge(msg)
    }
}

impl Envelope {
    pub(crate) fn detach_transfers(&mut self) {
        let rail = match self {
            Envelope::Rpc(RpcEnvelope::RpcRequest { transfers, .. })
            | Envelope::Rpc(RpcEnvelope::RpcResolve { transfers, .. }) => transfers,
            _ => return,
        };
        *rail = rail.detach_for_send();
    }

    pub fn as_rpc(&self) -> Option<&RpcEnvelope> {
        match self {
            Envelope::Rpc(msg) => Some(msg),
            Envelope::Bridge(_) => None,
        }
    }

    pub fn as_bridge(&self) -> Option<&BridgeEnvelope> {
        match self {
            Envelope::Bridge(msg) => Some(msg),
            Envelope::Rpc(_) => None,
        }
    }
}
