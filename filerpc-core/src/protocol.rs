//! Envelope types exchanged as request and response files.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::RpcError;
use crate::identity::{Fingerprint, RequestId};

/// Current envelope format version. Written into every file header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fields shared by requests and responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: RequestId,
    pub sender: String,
    pub url: Address,
    /// Ordered so the encoded bytes never depend on insertion order.
    pub headers: BTreeMap<String, String>,
    /// Already-serialized payload; carried byte-for-byte.
    pub body: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Envelope {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left until `expires_at`, zero once it has passed.
    pub fn time_to_expiry(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Body viewed as UTF-8 text.
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    /// Body viewed as a JSON document of type `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// A call: envelope plus the logical operation name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub envelope: Envelope,
    pub method: String,
}

impl Request {
    /// New request with a fresh id, `created_at = now` and `expires_at = now + expiry`.
    pub fn new(
        sender: impl Into<String>,
        url: Address,
        method: impl Into<String>,
        body: impl Into<Vec<u8>>,
        expiry: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            envelope: Envelope {
                id: RequestId::generate(),
                sender: sender.into(),
                url,
                headers: BTreeMap::new(),
                body: body.into(),
                created_at,
                expires_at: expiry_after(created_at, expiry),
            },
            method: method.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.envelope.headers.insert(name.into(), value.into());
        self
    }

    pub fn id(&self) -> RequestId {
        self.envelope.id
    }

    pub fn url(&self) -> &Address {
        &self.envelope.url
    }

    pub fn sender(&self) -> &str {
        &self.envelope.sender
    }

    pub fn body(&self) -> &[u8] {
        &self.envelope.body
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.method, self.url(), self.body(), self.sender())
    }
}

/// The answer to a request; shares the request's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub envelope: Envelope,
    pub status_code: StatusCode,
}

impl Response {
    /// Response to `request`, produced by `sender` (the serving identity).
    pub fn for_request(
        request: &Request,
        sender: impl Into<String>,
        status_code: StatusCode,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            envelope: Envelope {
                id: request.id(),
                sender: sender.into(),
                url: request.url().clone(),
                headers: BTreeMap::new(),
                body: body.into(),
                created_at: Utc::now(),
                expires_at: request.envelope.expires_at,
            },
            status_code,
        }
    }

    pub fn id(&self) -> RequestId {
        self.envelope.id
    }

    pub fn body(&self) -> &[u8] {
        &self.envelope.body
    }

    pub fn is_success(&self) -> bool {
        self.status_code.is_success()
    }

    /// Turn an error-band status into [`RpcError::Remote`]; other responses pass through.
    pub fn error_for_status(self) -> Result<Self, RpcError> {
        if self.status_code.is_error() {
            return Err(RpcError::Remote {
                status: self.status_code,
                message: String::from_utf8_lossy(&self.envelope.body).into_owned(),
            });
        }
        Ok(self)
    }
}

/// Response status. `0` is pending; bands follow HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const PENDING: StatusCode = StatusCode(0);
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    /// The request expired before the server picked it up.
    pub const EXPIRED: StatusCode = StatusCode(419);
    pub const INTERNAL_ERROR: StatusCode = StatusCode(500);

    pub fn as_u16(self) -> u16 {
        self.0
    }

    pub fn is_pending(self) -> bool {
        self.0 == 0
    }

    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn is_client_error(self) -> bool {
        (400..500).contains(&self.0)
    }

    pub fn is_server_error(self) -> bool {
        (500..600).contains(&self.0)
    }

    pub fn is_error(self) -> bool {
        self.is_client_error() || self.is_server_error()
    }

    pub fn reason(self) -> &'static str {
        match self.0 {
            0 => "Pending",
            200 => "OK",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            419 => "Expired",
            500 => "Internal Error",
            _ => "",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            "" => write!(f, "{}", self.0),
            reason => write!(f, "{} {}", self.0, reason),
        }
    }
}

fn expiry_after(created_at: DateTime<Utc>, expiry: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(expiry)
        .ok()
        .and_then(|d| created_at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn fmt_envelope(f: &mut fmt::Formatter<'_>, envelope: &Envelope) -> fmt::Result {
    writeln!(f, "  url:        {}", envelope.url)?;
    writeln!(f, "  sender:     {}", envelope.sender)?;
    writeln!(f, "  created_at: {}", envelope.created_at.to_rfc3339())?;
    writeln!(f, "  expires_at: {}", envelope.expires_at.to_rfc3339())?;
    for (name, value) in &envelope.headers {
        writeln!(f, "  {name}: {value}")?;
    }
    match std::str::from_utf8(&envelope.body) {
        Ok(text) => write!(f, "  body:       {text:?}"),
        Err(_) => write!(f, "  body:       <{} bytes binary>", envelope.body.len()),
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "request {} {}", self.envelope.id, self.method)?;
        fmt_envelope(f, &self.envelope)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "response {} {}", self.envelope.id, self.status_code)?;
        fmt_envelope(f, &self.envelope)
    }
}
