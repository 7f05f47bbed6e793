//! sockbinder-core: remote objects over sockets.
//!
//! Two processes connected by one or more sockets form an [`RpcSession`].
//! Either side can hand the other references to its objects ([`SpBinder`])
//! inside a [`Parcel`]; the receiver gets a proxy that forwards
//! transactions back to the owner. Object lifetimes are tracked with
//! strong and weak counts in a per-session reference table, so an object
//! lives exactly as long as someone, local or remote, holds it.
//!
//! This crate defines:
//! - Object handles and the handler trait ([`Binder`], [`SpBinder`], [`WeakBinder`])
//! - Payloads ([`Parcel`])
//! - Sessions and servers ([`RpcSession`], [`RpcServer`])
//! - Status codes ([`StatusCode`], [`Status`])
//! - Wire framing ([`wire`])
//! - An in-process registry of a foreign reference domain ([`LocalServiceRegistry`])
//!
//! # Example
//!
//! ```ignore
//! let server = RpcServer::new();
//! server.set_root_object(SpBinder::new(MyService::default()));
//! let port = server.setup_inet_server("127.0.0.1", 0)?;
//! server.start();
//!
//! let session = RpcSession::new();
//! session.setup_inet_client("127.0.0.1", port).await?;
//! let root = session.get_root_object().await?.expect("server has a root");
//! root.ping().await?;
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

mod binder;
mod config;
mod dispatch;
mod error;
mod parcel;
mod protocol;
mod registry;
mod server;
mod session;
mod table;
mod transport;
pub mod wire;

pub use binder::{
    Binder, CallContext, FIRST_CALL_TRANSACTION, INTERFACE_TRANSACTION, LAST_CALL_TRANSACTION,
    PING_TRANSACTION, SpBinder, WeakBinder,
};
pub use config::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_PENDING_ONEWAY, Limits,
    RpcServerConfig, RpcSessionConfig,
};
pub use error::{Status, StatusCode, TransportError};
pub use parcel::Parcel;
pub use registry::{
    LocalServiceRegistry, REGISTRY_ADD_SERVICE, REGISTRY_GET_SERVICE, REGISTRY_LIST_SERVICES,
};
pub use server::{RpcServer, ServerState, WeakServer};
pub use session::{RpcSession, SessionState, WeakSession};
pub use transport::SocketAddress;
pub use wire::{ConnectionOptions, TransactFlags};
