
mod connection;
mod guest;
mod host;

pub use connection::{Connection, Remote};
pub use guest::{connect, ConnectOptions, SetupHook};
pub use host::{ConnectionRegistry, RpcHost};

pub(crate) use connection::serialize_error;
