
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{CallError, Result, RpcError};
use crate::protocol::RpcEnvelope;
use crate::rpc::connection::{Connection, Remote};
use crate::schema::Schema;
use crate::transport::{self, Endpoint};

pub type SetupHook =
    Box<dyn FnOnce(Remote) -> BoxFuture<'static, std::result::Result<(), CallError>> + Send>;

#[derive(Default)]
pub struct ConnectOptions {
    host: Option<Endpoint>,
    on_setup: Option<SetupHook>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, endpoint: Endpoint) -> Self {
        self.host = Some(endpoint);
        self
    }

    pub fn with_setup(mut self, hook: SetupHook) -> Self {
        self.on_setup = Some(hook);
        self
    }
}

pub async fn connect(schema: Schema, options: ConnectOptions) -> Result<Connection> {
    let endpoint = match options.host {
        Some(endpoint) => endpoint,
        None => transport::auto_host()?,
    };

    let (methods, data) = schema.extract();
    let origin_hint = endpoint.origin_of();

    // The reply listener goes up before the request goes out.
    let (reply_tx, reply_rx) = oneshot::channel::<(String, Vec<String>, Value)>();
    let reply_tx = Mutex::new(Some(reply_tx));
    let listener = endpoint.subscribe(Arc::new(move |event| {
        if let Some(RpcEnvelope::HandshakeReply {
            connection_id,
            methods: Some(methods),
            schema: Some(schema),
            ..
        }) = event.payload().as_rpc()
        {
            if let Some(tx) = reply_tx.lock().take() {
                let _ = tx.send((connection_id.clone(), methods.clone(), schema.clone()));
            }
        }
    }));

    let request = RpcEnvelope::HandshakeRequest {
        methods: methods.names(),
        schema: data,
    };
    if let Err(err) = endpoint.send(request.into(), origin_hint.as_deref()) {
        endpoint.unsubscribe(listener);
        return Err(err);
    }

    let outcome = reply_rx.await;
    endpoint.unsubscribe(listener);
    let (connection_id, peer_methods, peer_schema) = outcome
        .map_err(|_| RpcError::HandshakeFailed("endpoint gone before host replied".into()))?;
    tracing::debug!(connection = %connection_id, "handshake reply received");

    let connection = Connection::establish(
        connection_id.clone(),
        endpoint.clone(),
        methods,
        peer_methods,
        peer_schema,
        None,
        false,
    );

    if let Some(hook) = options.on_setup {
        if let Err(err) = hook(connection.remote()).await {
            // Tell the host to drop its half too; without this its pending
            // connection and registry entry would outlive the handshake.
            let abort = RpcEnvelope::HandshakeReply {
                connection_id,
                methods: None,
                schema: None,
                abort: true,
            };
            if let Err(send_err) = endpoint.send(abort.into(), origin_hint.as_deref()) {
                tracing::warn!(%send_err, "handshake abort not delivered");
            }
            connection.discard();
            return Err(RpcError::HandshakeFailed(format!(
                "setup hook failed: {}",
                err
            )));
        }
    }

    let confirm = RpcEnvelope::HandshakeReply {
        connection_id,
        methods: None,
        schema: None,
        abort: false,
    };
    endpoint.send(confirm.into(), origin_hint.as_deref())?;

    Ok(connection)
}
