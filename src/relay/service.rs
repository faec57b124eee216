//! The shared relay agent: per-channel tab rosters, shared-state
//! dictionaries, and message routing. It holds no RPC logic.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::protocol::{
    BridgeEnvelope, ERR_DUPLICATE_TAB_ID, ERR_INVALID_PAYLOAD,
};
use crate::transport::{Endpoint, PortEvent, PortId};

struct TabEntry {
    tab_id: String,
    port: Endpoint,
    #[allow(dead_code)]
    methods: Vec<String>,
}

#[derive(Default)]
struct ChannelState {
    tabs: Vec<TabEntry>,
    state: Map<String, Value>,
}

impl ChannelState {
    fn snapshot(&self) -> Value {
        Value::Object(self.state.clone())
    }

    fn tab_ids(&self) -> Vec<String> {
        self.tabs.iter().map(|t| t.tab_id.clone()).collect()
    }
}

struct RelayInner {
    channels: Mutex<HashMap<String, ChannelState>>,
    ports: Mutex<HashMap<PortId, Endpoint>>,
}

#[derive(Clone)]
pub struct RelayService {
    inner: Arc<RelayInner>,
}

impl Default for RelayService {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayService {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RelayInner {
                channels: Mutex::new(HashMap::new()),
                ports: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn connect(&self) -> Endpoint {
        let (tab_side, relay_side) = Endpoint::port_pair();
        let port_id = relay_side.port_id();
        let weak: Weak<RelayInner> = Arc::downgrade(&self.inner);
        relay_side.subscribe(Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle(port_id, event);
            }
        }));
        self.inner.ports.lock().insert(port_id, relay_side);
        tab_side
    }

    pub fn tabs_on(&self, channel: &str) -> Vec<String> {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map(ChannelState::tab_ids)
            .unwrap_or_default()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }
}

impl std::fmt::Debug for RelayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayService")
            .field("channels", &self.inner.channels.lock().len())
            .field("ports", &self.inner.ports.lock().len())
            .finish()
    }
}

impl RelayInner {
    fn handle(self: &Arc<Self>, port_id: PortId, event: &PortEvent) {
        let Some(port) = self.ports.lock().get(&port_id).cloned() else {
            return;
        };
        // Anything that is not a bridge message is ignored.
        let Some(msg) = event.payload().as_bridge() else {
            return;
        };
        match msg.clone() {
            BridgeEnvelope::BridgeHandshake {
                tab_id,
                channel,
                methods,
                schema,
            } => self.register(port, tab_id, channel, methods, schema),
            BridgeEnvelope::BridgeBroadcast {
                sender,
                channel,
                method,
                args,
                sender_result,
                sender_error,
            } => {
                let skip = sender.clone();
                self.fan_out(
                    &channel,
                    Some(&skip),
                    BridgeEnvelope::BridgeRelay {
                        sender,
                        method,
                        args,
                        sender_result,
                        sender_error,
                    },
                );
            }
            BridgeEnvelope::BridgeDirectMessage {
                sender,
                target,
                channel,
                method,
                args,
            } => self.direct(&channel, &target, BridgeEnvelope::BridgeRelay {
                sender,
                method,
                args,
                sender_result: None,
                sender_error: None,
            }),
            BridgeEnvelope::BridgeGetState { channel } => {
                let state = self
                    .channels
                    .lock()
                    .get(&channel)
                    .map(ChannelState::snapshot)
                    .unwrap_or_else(|| Value::Object(Map::new()));
                send_or_log(&port, BridgeEnvelope::BridgeStateResponse { channel, state });
            }
            BridgeEnvelope::BridgeSetState {
                channel,
                key,
                value,
            } => self.set_state(&channel, key, value),
            BridgeEnvelope::BridgeGetTabs { channel } => {
                let tabs = self
                    .channels
                    .lock()
                    .get(&channel)
                    .map(ChannelState::tab_ids)
                    .unwrap_or_default();
                send_or_log(&port, BridgeEnvelope::BridgeTabsResponse { channel, tabs });
            }
            BridgeEnvelope::BridgeDisconnect { tab_id, channel } => {
                self.remove_tab(&channel, &tab_id);
            }
            // Relay-to-tab tags arriving at the relay: ignored.
            _ => {}
        }
    }

    fn register(
        self: &Arc<Self>,
        port: Endpoint,
        tab_id: String,
        channel: String,
        methods: Vec<String>,
        schema: Value,
    ) {
        if tab_id.is_empty() || channel.is_empty() || !schema.is_object() {
            send_or_log(
                &port,
                BridgeEnvelope::BridgeHandshakeError {
                    code: ERR_INVALID_PAYLOAD.into(),
                    message: "handshake needs a tab id, a channel, and an object schema".into(),
                    tab_id,
                    channel,
                },
            );
            return;
        }

        let evicted = {
            let mut channels = self.channels.lock();
            let chan = channels.entry(channel.clone()).or_insert_with(|| {
                tracing::debug!(channel = %channel, "creating channel");
                let mut fresh = ChannelState::default();
                // The first tab to join seeds the shared state from its
                // declared data leaves. Later joins never re-seed.
                if let Value::Object(map) = &schema {
                    fresh.state = map.clone();
                }
                fresh
            });

            let evicted = chan
                .tabs
                .iter()
                .position(|t| t.tab_id == tab_id)
                .map(|idx| chan.tabs.remove(idx));

            chan.tabs.push(TabEntry {
                tab_id: tab_id.clone(),
                port: port.clone(),
                methods,
            });
            (evicted, chan.snapshot())
        };
        let (old_holder, snapshot) = evicted;

        if let Some(old) = old_holder {
            if old.port.port_id() != port.port_id() {
                tracing::warn!(tab = %tab_id, channel = %channel, "duplicate tab id, evicting previous holder");
                send_or_log(
                    &old.port,
                    BridgeEnvelope::BridgeHandshakeError {
                        code: ERR_DUPLICATE_TAB_ID.into(),
                        message: format!("tab id {} re-registered on channel {}", tab_id, channel),
                        tab_id: tab_id.clone(),
                        channel: channel.clone(),
                    },
                );
                self.drop_port(&old.port);
            }
        }

        send_or_log(
            &port,
            BridgeEnvelope::BridgeHandshakeAck {
                tab_id,
                channel,
                state: snapshot,
            },
        );
    }

    fn fan_out(self: &Arc<Self>, channel: &str, skip: Option<&str>, msg: BridgeEnvelope) {
        let recipients: Vec<(String, Endpoint)> = match self.channels.lock().get(channel) {
            Some(chan) => chan
                .tabs
                .iter()
                .filter(|t| skip != Some(t.tab_id.as_str()))
                .map(|t| (t.tab_id.clone(), t.port.clone()))
                .collect(),
            None => return,
        };

        let mut dead = Vec::new();
        for (tab_id, port) in recipients {
            if let Err(err) = port.send(msg.clone().into(), None) {
                tracing::error!(tab = %tab_id, channel, %err, "relay write failed, pruning tab");
                dead.push(tab_id);
            }
        }
        for tab_id in dead {
            self.remove_tab(channel, &tab_id);
        }
    }

    fn direct(self: &Arc<Self>, channel: &str, target: &str, msg: BridgeEnvelope) {
        let port = self
            .channels
            .lock()
            .get(channel)
            .and_then(|chan| chan.tabs.iter().find(|t| t.tab_id == target))
            .map(|t| t.port.clone());
        match port {
            Some(port) => {
                if let Err(err) = port.send(msg.into(), None) {
                    tracing::error!(tab = target, channel, %err, "relay write failed, pruning tab");
                    self.remove_tab(channel, target);
                }
            }
            None => {
                tracing::debug!(tab = target, channel, "direct message to unknown tab dropped");
            }
        }
    }

    fn set_state(self: &Arc<Self>, channel: &str, key: String, value: Value) {
        {
            let mut channels = self.channels.lock();
            let Some(chan) = channels.get_mut(channel) else {
                return;
            };
            chan.state.insert(key.clone(), value.clone());
        }
        // Everyone converges, the setter included.
        self.fan_out(
            channel,
            None,
            BridgeEnvelope::BridgeStateUpdate {
                channel: channel.to_string(),
                key,
                value,
            },
        );
    }

    fn remove_tab(self: &Arc<Self>, channel: &str, tab_id: &str) {
        let removed = {
            let mut channels = self.channels.lock();
            let Some(chan) = channels.get_mut(channel) else {
                return;
            };
            let removed = chan
                .tabs
                .iter()
                .position(|t| t.tab_id == tab_id)
                .map(|idx| chan.tabs.remove(idx));
            if chan.tabs.is_empty() {
                // Last tab gone: the channel and its state die with it.
                channels.remove(channel);
                tracing::debug!(channel, "channel dropped");
            }
            removed
        };
        if let Some(entry) = removed {
            self.drop_port(&entry.port);
        }
    }

    fn drop_port(&self, port: &Endpoint) {
        self.ports.lock().remove(&port.port_id());
        port.close();
    }
}

fn send_or_log(port: &Endpoint, msg: BridgeEnvelope) {
    if let Err(err) = port.send(msg.into(), None) {
        tracing::warn!(%err, "relay could not write to port");
    }
}
