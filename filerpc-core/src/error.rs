//! Crate-level error types.

use std::path::PathBuf;
use std::time::Duration;

use crate::address::AddressError;
use crate::identity::RequestId;
use crate::permission::PermissionError;
use crate::protocol::StatusCode;
use crate::route::RegistrationError;
use crate::store::StoreError;
use crate::wire::{CodecError, EncodeError};

/// Everything a caller can observe going wrong with a single call.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("{principal} may not write {}", .path.display())]
    PermissionDenied { principal: String, path: PathBuf },
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("request {0} expired without a response")]
    Expired(RequestId),
    #[error("remote error {status}: {message}")]
    Remote { status: StatusCode, message: String },
    #[error("request {id} was never delivered: {reason}")]
    SendFailed { id: RequestId, reason: String },
    #[error("response id {found} does not match request {expected}")]
    CorrelationMismatch {
        expected: RequestId,
        found: RequestId,
    },
    #[error("future store: {0}")]
    Store(#[from] StoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from setting up or running the runtime and server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
