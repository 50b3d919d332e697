//! Envelope codec: fixed file header + bincode payload.
//!
//! Layout: `b"FRPC"` magic, version byte, kind byte, payload length (4 bytes LE), payload.
//! Identical field values always produce identical bytes.

use std::io::{self, Write};
use std::path::Path;

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::identity::RequestId;
use crate::protocol::{Request, Response, PROTOCOL_VERSION};

const MAGIC: &[u8; 4] = b"FRPC";

/// Bytes before the payload. Anything shorter is never a complete envelope file.
pub const HEADER_LEN: usize = MAGIC.len() + 1 + 1 + 4;

const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024; // 64 MiB

/// Which envelope a file carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Request = 1,
    Response = 2,
}

impl Kind {
    fn from_u8(b: u8) -> Option<Kind> {
        match b {
            1 => Some(Kind::Request),
            2 => Some(Kind::Response),
            _ => None,
        }
    }
}

/// Envelope types that can be written to disk.
pub trait Wire: Serialize + DeserializeOwned {
    const KIND: Kind;
}

impl Wire for Request {
    const KIND: Kind = Kind::Request;
}

impl Wire for Response {
    const KIND: Kind = Kind::Response;
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(u64::from(MAX_PAYLOAD_LEN))
        .reject_trailing_bytes()
}

/// Encode an envelope into file bytes.
pub fn encode<M: Wire>(msg: &M) -> Result<Vec<u8>, EncodeError> {
    let payload = options().serialize(msg).map_err(EncodeError::Encode)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD_LEN)
        .ok_or(EncodeError::TooLarge)?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.push(PROTOCOL_VERSION);
    out.push(M::KIND as u8);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode file bytes into an envelope of the expected kind.
pub fn decode<M: Wire>(bytes: &[u8]) -> Result<M, CodecError> {
    let kind = peek_kind(bytes)?;
    if kind != M::KIND {
        return Err(CodecError::WrongKind {
            expected: M::KIND,
            found: kind,
        });
    }
    let len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
    if len > MAX_PAYLOAD_LEN {
        return Err(CodecError::TooLarge(len));
    }
    let end = HEADER_LEN + len as usize;
    if bytes.len() < end {
        return Err(CodecError::Truncated {
            expected: end,
            actual: bytes.len(),
        });
    }
    if bytes.len() > end {
        return Err(CodecError::TrailingBytes(bytes.len() - end));
    }
    options()
        .deserialize(&bytes[HEADER_LEN..end])
        .map_err(CodecError::Malformed)
}

/// Validate the header and report which envelope kind follows.
pub fn peek_kind(bytes: &[u8]) -> Result<Kind, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            expected: HEADER_LEN,
            actual: bytes.len(),
        });
    }
    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    if bytes[4] != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(bytes[4]));
    }
    Kind::from_u8(bytes[5]).ok_or(CodecError::UnknownKind(bytes[5]))
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>, EncodeError> {
    encode(request)
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, CodecError> {
    decode(bytes)
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>, EncodeError> {
    encode(response)
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, CodecError> {
    decode(bytes)
}

pub const REQUEST_EXTENSION: &str = "request";
pub const RESPONSE_EXTENSION: &str = "response";

pub fn request_file_name(id: RequestId) -> String {
    format!("{id}.{REQUEST_EXTENSION}")
}

pub fn response_file_name(id: RequestId) -> String {
    format!("{id}.{RESPONSE_EXTENSION}")
}

/// Whether `path` names a finished request file. Dot-prefixed names are in-progress temp files.
pub fn is_request_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.')
        && path.extension().and_then(|e| e.to_str()) == Some(REQUEST_EXTENSION)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    /// Fail with [`Written::AlreadyExists`] rather than replace an existing file.
    NoClobber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Written {
    Created,
    AlreadyExists,
}

/// Write `bytes` to `path` so readers never observe a partial file.
///
/// Data goes to a dot-prefixed temp file in the same directory and is then moved into place.
pub fn persist(path: &Path, bytes: &[u8], mode: WriteMode) -> io::Result<Written> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::Builder::new()
        .prefix(".tmp-")
        .suffix(".part")
        .tempfile_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    let persisted = match mode {
        WriteMode::Overwrite => temp.persist(path).map(drop),
        WriteMode::NoClobber => temp.persist_noclobber(path).map(drop),
    };
    match persisted {
        Ok(()) => Ok(Written::Created),
        Err(e)
            if mode == WriteMode::NoClobber && e.error.kind() == io::ErrorKind::AlreadyExists =>
        {
            Ok(Written::AlreadyExists)
        }
        Err(e) => Err(e.error),
    }
}

/// Error encoding an envelope (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Encode(bincode::Error),
    #[error("envelope too large")]
    TooLarge,
}

/// Error decoding envelope bytes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("truncated envelope: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("not an envelope file")]
    BadMagic,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown envelope kind {0}")]
    UnknownKind(u8),
    #[error("expected {expected:?} envelope, found {found:?}")]
    WrongKind { expected: Kind, found: Kind },
    #[error("envelope payload of {0} bytes exceeds limit")]
    TooLarge(u32),
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
    #[error("malformed envelope: {0}")]
    Malformed(bincode::Error),
}
