
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{CallError, RemoteError, Result, RpcError};
use crate::protocol::{random_id, RpcEnvelope};
use crate::rpc::host::ConnectionRegistry;
use crate::schema::{data_at, CallContext, MethodMap, PeerHandle};
use crate::transfer::{Payload, TransferBuf, TransferList};
use crate::transport::{Endpoint, EndpointKind, HandlerId, PortEvent};

struct PendingCall {
    method: String,
    tx: oneshot::Sender<std::result::Result<Payload, RemoteError>>,
}

pub(crate) struct ConnectionShared {
    pub(crate) id: String,
    pub(crate) endpoint: Endpoint,
    local_methods: MethodMap,
    peer_methods: HashSet<String>,
    peer_data: Value,
    pending: Mutex<HashMap<String, PendingCall>>,
    listener: Mutex<Option<HandlerId>>,
    closed: AtomicBool,
    registry: Option<ConnectionRegistry>,
    terminate_worker: bool,
}

impl ConnectionShared {
    fn origin_hint(&self) -> Option<String> {
        self.endpoint.origin_of()
    }

    fn handle_event(self: &Arc<Self>, event: &PortEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(msg) = event.payload().as_rpc() else {
            return;
        };
        match msg {
            RpcEnvelope::RpcRequest {
                connection_id,
                call_id,
                method,
                args,
                transfers,
            } if *connection_id == self.id => {
                self.dispatch_request(
                    call_id.clone(),
                    method.clone(),
                    args.clone(),
                    transfers.clone(),
                );
            }
            RpcEnvelope::RpcResolve {
                connection_id,
                call_id,
                method,
                result,
                transfers,
            } if *connection_id == self.id => {
                self.settle(call_id, method, Ok(Payload {
                    value: result.clone(),
                    transfers: transfers.clone(),
                }));
            }
            RpcEnvelope::RpcReject {
                connection_id,
                call_id,
                method,
                error,
            } if *connection_id == self.id => {
                self.settle(call_id, method, Err(error.clone()));
            }
            _ => {}
        }
    }

    fn settle(
        &self,
        call_id: &str,
        method: &str,
        outcome: std::result::Result<Payload, RemoteError>,
    ) {
        let mut pending = self.pending.lock();
        let matches = pending
            .get(call_id)
            .map(|call| call.method == method)
            .unwrap_or(false);
        if !matches {
            tracing::debug!(call_id, method, "ignoring unmatched reply");
            return;
        }
        if let Some(call) = pending.remove(call_id) {
            let _ = call.tx.send(outcome);
        }
    }

    fn dispatch_request(
        self: &Arc<Self>,
        call_id: String,
        method: String,
        args: Vec<Value>,
        transfers: TransferList,
    ) {
        let shared = self.clone();
        tokio::spawn(async move {
            let reply = match shared.local_methods.get(&method) {
                Some(func) => {
                    let remote = Remote {
                        shared: shared.clone(),
                    };
                    let ctx = CallContext::direct(Arc::new(remote)).with_transfers(transfers);
                    match func(args, ctx).await {
                        Ok(payload) => RpcEnvelope::RpcResolve {
                            connection_id: shared.id.clone(),
                            call_id,
                            method,
                            result: payload.value,
                            transfers: payload.transfers,
                        },
                        Err(err) => RpcEnvelope::RpcReject {
                            connection_id: shared.id.clone(),
                            call_id,
                            method,
                            error: serialize_error(err),
                        },
                    }
                }
                None => RpcEnvelope::RpcReject {
                    connection_id: shared.id.clone(),
                    call_id,
                    method: method.clone(),
                    error: serialize_error(CallError::new(format!(
                        "Unknown method: {}",
                        method
                    ))),
                },
            };
            if let Err(err) = shared
                .endpoint
                .send(reply.into(), shared.origin_hint().as_deref())
            {
                tracing::warn!(connection = %shared.id, %err, "failed to send reply");
            }
        });
    }

    pub(crate) fn close(&self) {
        self.shutdown(true);
    }

    // Teardown for a half-built connection: the subscription, pending
    // calls, and registry entry go, but the endpoint stays usable for a
    // fresh handshake.
    pub(crate) fn discard(&self) {
        self.shutdown(false);
    }

    fn shutdown(&self, terminate: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = self.listener.lock().take() {
            self.endpoint.unsubscribe(id);
        }
        // Dropping the resolvers settles outstanding calls with
        // ConnectionClosed; replies arriving later find nothing to match.
        self.pending.lock().clear();
        if let Some(registry) = &self.registry {
            registry.release(&self.id);
        }
        if terminate && self.terminate_worker {
            self.endpoint.terminate();
        }
    }
}

pub(crate) fn serialize_error(err: CallError) -> RemoteError {
    RemoteError {
        message: err.message,
        stack: std::backtrace::Backtrace::force_capture().to_string(),
        properties: err.properties,
    }
}

pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn establish(
        id: String,
        endpoint: Endpoint,
        local_methods: MethodMap,
        peer_methods: Vec<String>,
        peer_data: Value,
        registry: Option<ConnectionRegistry>,
        host_side: bool,
    ) -> Connection {
        let terminate_worker = host_side && *endpoint.kind() == EndpointKind::Worker;
        let shared = Arc::new(ConnectionShared {
            id,
            endpoint,
            local_methods,
            peer_methods: peer_methods.into_iter().collect(),
            peer_data,
            pending: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
            registry,
            terminate_worker,
        });
        attach_listener(&shared);
        Connection { shared }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn remote(&self) -> Remote {
        Remote {
            shared: self.shared.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub(crate) fn discard(&self) {
        self.shared.discard();
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("closed", &self.is_closed())
            .field("pending", &self.shared.pending.lock().len())
            .finish()
    }
}

fn attach_listener(shared: &Arc<ConnectionShared>) {
    let weak: Weak<ConnectionShared> = Arc::downgrade(shared);
    let id = shared.endpoint.subscribe(Arc::new(move |event| {
        if let Some(shared) = weak.upgrade() {
            shared.handle_event(event);
        }
    }));
    *shared.listener.lock() = Some(id);
}

#[derive(Clone)]
pub struct Remote {
    shared: Arc<ConnectionShared>,
}

impl Remote {
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_full(method, args, Vec::new())
            .await
            .map(|payload| payload.value)
    }

    pub async fn call_full(
        &self,
        method: &str,
        args: Vec<Value>,
        transfers: Vec<TransferBuf>,
    ) -> Result<Payload> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        if !shared.peer_methods.contains(method) {
            return Err(RpcError::UnknownMethod(method.to_string()));
        }

        let call_id = random_id();
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().insert(
            call_id.clone(),
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );

        let request = RpcEnvelope::RpcRequest {
            connection_id: shared.id.clone(),
            call_id: call_id.clone(),
            method: method.to_string(),
            args,
            transfers: transfers.into(),
        };
        if let Err(err) = shared
            .endpoint
            .send(request.into(), shared.origin_hint().as_deref())
        {
            shared.pending.lock().remove(&call_id);
            return Err(err);
        }

        match rx.await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(remote_err)) => Err(RpcError::Remote(remote_err)),
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    pub fn data(&self, path: &str) -> Option<Value> {
        data_at(&self.shared.peer_data, path).cloned()
    }

    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.peer_methods.iter().cloned().collect();
        names.sort();
        names
    }

    pub fn connection_id(&self) -> &str {
        &self.shared.id
    }
}

#[async_trait]
impl PeerHandle for Remote {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call(method, args).await
    }

    fn state(&self, key: &str) -> Option<Value> {
        self.data(key)
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("connection", &self.shared.id)
            .field("methods", &self.methods())
            .finish()
    }
}
