
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::error::{RelayError, RelayResult, Result, RpcError};
use crate::protocol::{random_id, BridgeEnvelope, DEFAULT_CHANNEL};
use crate::rpc::serialize_error;
use crate::schema::{CallContext, MethodMap, PeerHandle, Schema};
use crate::transport::{Endpoint, HandlerId, PortEvent};

#[derive(Default)]
pub struct RelayOptions {
    relay: Option<Endpoint>,
    channel: Option<String>,
    tab_id: Option<String>,
}

impl RelayOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relay(mut self, endpoint: Endpoint) -> Self {
        self.relay = Some(endpoint);
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_tab_id(mut self, tab_id: impl Into<String>) -> Self {
        self.tab_id = Some(tab_id.into());
        self
    }
}

type AckResult = std::result::Result<Value, (String, String)>;

struct ClientInner {
    tab_id: String,
    channel: String,
    port: Endpoint,
    methods: MethodMap,
    mirror: Mutex<Map<String, Value>>,
    ack_waiter: Mutex<Option<oneshot::Sender<AckResult>>>,
    tabs_waiters: Mutex<Vec<oneshot::Sender<Vec<String>>>>,
    state_waiters: Mutex<Vec<oneshot::Sender<Value>>>,
    closed: AtomicBool,
    evicted: Mutex<Option<String>>,
    listener: Mutex<Option<HandlerId>>,
}

impl ClientInner {
    fn handle_event(self: &Arc<Self>, event: &PortEvent) {
        let Some(msg) = event.payload().as_bridge() else {
            return;
        };
        match msg {
            BridgeEnvelope::BridgeHandshakeAck {
                tab_id,
                channel,
                state,
            } if *tab_id == self.tab_id && *channel == self.channel => {
                if let Value::Object(map) = state {
                    *self.mirror.lock() = map.clone();
                }
                if let Some(tx) = self.ack_waiter.lock().take() {
                    let _ = tx.send(Ok(state.clone()));
                }
            }
            BridgeEnvelope::BridgeHandshakeError {
                code,
                message,
                tab_id,
                channel,
            } if *tab_id == self.tab_id && *channel == self.channel => {
                if let Some(tx) = self.ack_waiter.lock().take() {
                    let _ = tx.send(Err((code.clone(), message.clone())));
                } else {
                    // Post-handshake: another client took our tab id and the
                    // relay evicted us.
                    tracing::warn!(tab = %self.tab_id, code = %code, "evicted from channel");
                    *self.evicted.lock() = Some(code.clone());
                    self.closed.store(true, Ordering::Release);
                }
            }
            BridgeEnvelope::BridgeRelay {
                sender,
                method,
                args,
                ..
            } => {
                self.deliver(sender.clone(), method.clone(), args.clone());
            }
            BridgeEnvelope::BridgeStateUpdate {
                channel,
                key,
                value,
            } if *channel == self.channel => {
                self.mirror.lock().insert(key.clone(), value.clone());
            }
            BridgeEnvelope::BridgeStateResponse { channel, state }
                if *channel == self.channel =>
            {
                if let Value::Object(map) = state {
                    *self.mirror.lock() = map.clone();
                }
                if let Some(tx) = pop_first(&self.state_waiters) {
                    let _ = tx.send(state.clone());
                }
            }
            BridgeEnvelope::BridgeTabsResponse { channel, tabs }
                if *channel == self.channel =>
            {
                if let Some(tx) = pop_first(&self.tabs_waiters) {
                    let _ = tx.send(tabs.clone());
                }
            }
            _ => {}
        }
    }

    fn deliver(self: &Arc<Self>, sender: String, method: String, args: Vec<Value>) {
        let Some(func) = self.methods.get(&method).cloned() else {
            tracing::warn!(tab = %self.tab_id, method = %method, "relayed call to unknown method");
            return;
        };
        let remote = RelayRemote {
            inner: self.clone(),
        };
        let ctx = CallContext::relayed(Arc::new(remote), Some(sender), self.channel.clone());
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(err) = func(args, ctx).await {
                tracing::warn!(tab = %inner.tab_id, method = %method, %err, "relayed invocation failed");
            }
        });
    }

    async fn run_and_dispatch(
        self: &Arc<Self>,
        method: &str,
        args: Vec<Value>,
        target: Option<String>,
    ) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        let func = self
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| RpcError::UnknownMethod(method.to_string()))?;

        let remote = RelayRemote {
            inner: self.clone(),
        };
        let ctx = CallContext::relayed(Arc::new(remote), None, self.channel.clone());
        let local = func(args.clone(), ctx).await;

        let envelope = match target {
            Some(target) => BridgeEnvelope::BridgeDirectMessage {
                sender: self.tab_id.clone(),
                target,
                channel: self.channel.clone(),
                method: method.to_string(),
                args,
            },
            None => BridgeEnvelope::BridgeBroadcast {
                sender: self.tab_id.clone(),
                channel: self.channel.clone(),
                method: method.to_string(),
                args,
                sender_result: local.as_ref().ok().map(|p| p.value.clone()),
                sender_error: local
                    .as_ref()
                    .err()
                    .map(|e| serialize_error(e.clone())),
            },
        };
        if let Err(err) = self.port.send(envelope.into(), None) {
            tracing::warn!(tab = %self.tab_id, %err, "relay dispatch failed");
        }

        match local {
            Ok(payload) => Ok(payload.value),
            Err(err) => Err(RpcError::Remote(serialize_error(err))),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let disconnect = BridgeEnvelope::BridgeDisconnect {
            tab_id: self.tab_id.clone(),
            channel: self.channel.clone(),
        };
        if let Err(err) = self.port.send(disconnect.into(), None) {
            tracing::debug!(tab = %self.tab_id, %err, "disconnect not delivered");
        }
        if let Some(id) = self.listener.lock().take() {
            self.port.unsubscribe(id);
        }
        self.port.close();
    }
}

fn pop_first<T>(waiters: &Mutex<Vec<oneshot::Sender<T>>>) -> Option<oneshot::Sender<T>> {
    let mut waiters = waiters.lock();
    if waiters.is_empty() {
        None
    } else {
        Some(waiters.remove(0))
    }
}

pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl RelayClient {
    pub async fn connect(schema: Schema, options: RelayOptions) -> RelayResult<RelayClient> {
        let port = options.relay.ok_or(RpcError::InvalidTarget)?;
        let tab_id = options.tab_id.unwrap_or_else(random_id);
        let channel = options
            .channel
            .unwrap_or_else(|| DEFAULT_CHANNEL.to_string());
        let (methods, data) = schema.extract();

        let (ack_tx, ack_rx) = oneshot::channel();
        let inner = Arc::new(ClientInner {
            tab_id: tab_id.clone(),
            channel: channel.clone(),
            port: port.clone(),
            methods,
            mirror: Mutex::new(Map::new()),
            ack_waiter: Mutex::new(Some(ack_tx)),
            tabs_waiters: Mutex::new(Vec::new()),
            state_waiters: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            evicted: Mutex::new(None),
            listener: Mutex::new(None),
        });

        let weak: Weak<ClientInner> = Arc::downgrade(&inner);
        let id = port.subscribe(Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(event);
            }
        }));
        *inner.listener.lock() = Some(id);

        let methods = inner.methods.names();
        let handshake = BridgeEnvelope::BridgeHandshake {
            tab_id,
            channel,
            methods,
            schema: data,
        };
        port.send(handshake.into(), None).map_err(RelayError::Rpc)?;

        match ack_rx.await {
            Ok(Ok(_state)) => Ok(RelayClient { inner }),
            Ok(Err((code, message))) => Err(RelayError::HandshakeRejected { code, message }),
            Err(_) => Err(RelayError::Rpc(RpcError::ConnectionClosed)),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn remote(&self) -> RelayRemote {
        RelayRemote {
            inner: self.inner.clone(),
        }
    }

    pub async fn connected_tabs(&self) -> Result<Vec<String>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.inner.tabs_waiters.lock().push(tx);
        let request = BridgeEnvelope::BridgeGetTabs {
            channel: self.inner.channel.clone(),
        };
        self.inner.port.send(request.into(), None)?;
        rx.await.map_err(|_| RpcError::ConnectionClosed)
    }

    pub async fn fetch_state(&self) -> Result<Value> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.inner.state_waiters.lock().push(tx);
        let request = BridgeEnvelope::BridgeGetState {
            channel: self.inner.channel.clone(),
        };
        self.inner.port.send(request.into(), None)?;
        rx.await.map_err(|_| RpcError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn eviction(&self) -> Option<String> {
        self.inner.evicted.lock().clone()
    }

    pub fn close(&self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("tab_id", &self.inner.tab_id)
            .field("channel", &self.inner.channel)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Clone)]
pub struct RelayRemote {
    inner: Arc<ClientInner>,
}

impl RelayRemote {
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.inner.run_and_dispatch(method, args, None).await
    }

    pub fn to(&self, tab_id: impl Into<String>) -> DirectRemote {
        DirectRemote {
            inner: self.inner.clone(),
            target: tab_id.into(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.mirror.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        self.inner.mirror.lock().insert(key.clone(), value.clone());
        let update = BridgeEnvelope::BridgeSetState {
            channel: self.inner.channel.clone(),
            key,
            value,
        };
        self.inner.port.send(update.into(), None)
    }
}

impl std::fmt::Debug for RelayRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRemote")
            .field("tab_id", &self.inner.tab_id)
            .field("channel", &self.inner.channel)
            .finish()
    }
}

#[async_trait]
impl PeerHandle for RelayRemote {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.inner.run_and_dispatch(method, args, None).await
    }

    fn state(&self, key: &str) -> Option<Value> {
        self.get(key)
    }

    fn set_state(&self, key: &str, value: Value) -> Result<()> {
        self.set(key, value)
    }
}

pub struct DirectRemote {
    inner: Arc<ClientInner>,
    target: String,
}

impl DirectRemote {
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.inner
            .run_and_dispatch(method, args, Some(self.target.clone()))
            .await
    }
}
