pub mod error;
pub mod protocol;
pub mod relay;
pub mod rpc;
pub mod schema;
pub mod transfer;
pub mod transport;

pub use error::{CallError, RelayError, RelayResult, RemoteError, Result, RpcError};
pub use protocol::{random_id, BridgeEnvelope, Envelope, RpcEnvelope, DEFAULT_CHANNEL};
pub use relay::{DirectRemote, RelayClient, RelayOptions, RelayRemote, RelayService};
pub use rpc::{connect, ConnectOptions, Connection, ConnectionRegistry, Remote, RpcHost};
pub use schema::{CallContext, MethodFn, MethodMap, MethodResult, PeerHandle, Schema};
pub use transfer::{with_transfer, Payload, TransferBuf, TransferList};
pub use transport::{
    auto_host, clear_host, install_host, normalize_origin, Endpoint, EndpointKind, HandlerId,
    PortEvent, PortStats,
};
