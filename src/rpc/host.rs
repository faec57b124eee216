
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::{Result, RpcError};
use crate::protocol::{random_id, RpcEnvelope};
use crate::rpc::connection::Connection;
use crate::schema::{MethodMap, Schema};
use crate::transport::{Endpoint, HandlerId, PortEvent};

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> ConnectionRegistry {
        static GLOBAL: OnceLock<ConnectionRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ConnectionRegistry::new).clone()
    }

    pub fn register(&self, id: &str) -> Result<()> {
        if !self.ids.lock().insert(id.to_string()) {
            return Err(RpcError::DuplicateConnection(id.to_string()));
        }
        Ok(())
    }

    pub fn release(&self, id: &str) {
        self.ids.lock().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("count", &self.ids.lock().len())
            .finish()
    }
}

struct HostInner {
    endpoint: Endpoint,
    methods: MethodMap,
    data: Value,
    registry: ConnectionRegistry,
    pending: Mutex<HashMap<String, Connection>>,
    ready_tx: mpsc::UnboundedSender<Connection>,
    listener: Mutex<Option<HandlerId>>,
}

impl HostInner {
    fn handle_event(self: &Arc<Self>, event: &PortEvent) {
        // All handshake traffic on frame endpoints is validated; failures
        // are dropped without a diagnostic reaching the sender.
        if !self.endpoint.is_valid_frame_message(event) {
            tracing::debug!("dropping handshake message failing origin/source validation");
            return;
        }
        match event.payload().as_rpc() {
            Some(RpcEnvelope::HandshakeRequest { methods, schema }) => {
                self.accept_request(methods.clone(), schema.clone());
            }
            Some(RpcEnvelope::HandshakeReply {
                connection_id,
                methods: None,
                schema: None,
                abort,
            }) => {
                if *abort {
                    self.discard(connection_id);
                } else {
                    self.confirm(connection_id);
                }
            }
            _ => {}
        }
    }

    fn accept_request(self: &Arc<Self>, guest_methods: Vec<String>, guest_schema: Value) {
        let connection_id = random_id();
        if let Err(err) = self.registry.register(&connection_id) {
            tracing::error!(%err, "rejecting handshake: connection id collision");
            return;
        }

        let connection = Connection::establish(
            connection_id.clone(),
            self.endpoint.clone(),
            self.methods.clone(),
            guest_methods,
            guest_schema,
            Some(self.registry.clone()),
            true,
        );
        self.pending
            .lock()
            .insert(connection_id.clone(), connection);

        let reply = RpcEnvelope::HandshakeReply {
            connection_id: connection_id.clone(),
            methods: Some(self.methods.names()),
            schema: Some(self.data.clone()),
            abort: false,
        };
        if let Err(err) = self
            .endpoint
            .send(reply.into(), self.endpoint.origin_of().as_deref())
        {
            tracing::warn!(connection = %connection_id, %err, "failed to send handshake reply");
            self.discard(&connection_id);
        } else {
            tracing::debug!(connection = %connection_id, "handshake reply sent");
        }
    }

    fn confirm(&self, connection_id: &str) {
        let Some(connection) = self.pending.lock().remove(connection_id) else {
            tracing::debug!(connection = connection_id, "ignoring unknown confirmation");
            return;
        };
        tracing::debug!(connection = connection_id, "connection ready");
        let _ = self.ready_tx.send(connection);
    }

    // Guest aborted before confirming: drop the half-built connection and
    // release its id so the endpoint can handshake again.
    fn discard(&self, connection_id: &str) {
        let Some(connection) = self.pending.lock().remove(connection_id) else {
            tracing::debug!(connection = connection_id, "ignoring unknown abort");
            return;
        };
        tracing::debug!(connection = connection_id, "handshake aborted, discarding");
        connection.discard();
    }
}

pub struct RpcHost {
    inner: Arc<HostInner>,
    ready_rx: AsyncMutex<mpsc::UnboundedReceiver<Connection>>,
}

impl RpcHost {
    pub fn listen(endpoint: Endpoint, schema: Schema) -> RpcHost {
        Self::listen_with_registry(endpoint, schema, ConnectionRegistry::global())
    }

    pub fn listen_with_registry(
        endpoint: Endpoint,
        schema: Schema,
        registry: ConnectionRegistry,
    ) -> RpcHost {
        let (methods, data) = schema.extract();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(HostInner {
            endpoint,
            methods,
            data,
            registry,
            pending: Mutex::new(HashMap::new()),
            ready_tx,
            listener: Mutex::new(None),
        });

        let weak: Weak<HostInner> = Arc::downgrade(&inner);
        let id = inner.endpoint.subscribe(Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(event);
            }
        }));
        *inner.listener.lock() = Some(id);

        RpcHost {
            inner,
            ready_rx: AsyncMutex::new(ready_rx),
        }
    }

    pub async fn accept(&self) -> Result<Connection> {
        let mut rx = self.ready_rx.lock().await;
        rx.recv().await.ok_or(RpcError::ConnectionClosed)
    }

    pub fn close(&self) {
        if let Some(id) = self.inner.listener.lock().take() {
            self.inner.endpoint.unsubscribe(id);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl std::fmt::Debug for RpcHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcHost")
            .field("endpoint", &self.inner.endpoint)
            .field("pending", &self.inner.pending.lock().len())
            .finish()
    }
}
