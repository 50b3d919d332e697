//! Request/response RPC over synchronized datasite directories.
//! A call is a request file written into the callee's endpoint directory; the answer is a
//! response file next to it. No sockets: the sync layer moves the files.

pub mod address;
pub mod client;
pub mod error;
pub mod future;
pub mod handler;
pub mod identity;
pub mod permission;
pub mod protocol;
pub mod route;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod watch;
pub mod wire;

pub use address::{Address, AddressError, Datasites};
pub use client::{Call, Client, SendOptions};
pub use error::{Error, Result, RpcError};
pub use future::{FutureState, RpcFuture};
pub use handler::{handler_fn, Context, Handler, HandlerError, Json, Reply};
pub use identity::{Fingerprint, RequestId};
pub use permission::{PermissionEngine, Right, Rights};
pub use protocol::{Request, Response, StatusCode, PROTOCOL_VERSION};
pub use route::{RegistrationError, Router};
pub use runtime::{PreflightPolicy, Runtime, RuntimeConfig};
pub use server::{Server, ServerHandle};
pub use store::{DirFutureStore, FutureStore, MemoryFutureStore};
pub use wire::{decode_request, decode_response, encode_request, encode_response, CodecError};
