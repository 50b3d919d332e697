//! Request identity: sortable request ids and content fingerprints for the call cache.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::address::Address;

/// Unique request id, assigned once when a request is created.
///
/// UUIDv7: the leading bits are a millisecond timestamp, so both the bytes and the
/// hyphenated text sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn generate() -> Self {
        RequestId(Uuid::now_v7())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(RequestId)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

/// SHA-256 over the fields that make two calls the same call: method, url, body, sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(method: &str, url: &Address, body: &[u8], sender: &str) -> Self {
        let url = url.to_string();
        let mut hasher = Sha256::new();
        hasher.update(b"filerpc-fingerprint-v1");
        // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
        for field in [method.as_bytes(), url.as_bytes(), body, sender.as_bytes()] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        Fingerprint(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn url() -> Address {
        Address::rpc("bob@x", "chat", "ping").unwrap()
    }

    #[test]
    fn ids_sort_by_creation() {
        let a = RequestId::generate();
        std::thread::sleep(Duration::from_millis(2));
        let b = RequestId::generate();
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn id_text_roundtrip() {
        let id = RequestId::generate();
        let parsed: RequestId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<RequestId>().is_err());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = Fingerprint::of("ping", &url(), b"hello", "alice@x");
        let b = Fingerprint::of("ping", &url(), b"hello", "alice@x");
        assert_eq!(a, b);
        assert_eq!(a.to_string().len(), 64);
    }

    #[test]
    fn fingerprint_covers_every_field() {
        let base = Fingerprint::of("ping", &url(), b"hello", "alice@x");
        let other_url = Address::rpc("bob@x", "chat", "pong").unwrap();
        assert_ne!(base, Fingerprint::of("post", &url(), b"hello", "alice@x"));
        assert_ne!(base, Fingerprint::of("ping", &other_url, b"hello", "alice@x"));
        assert_ne!(base, Fingerprint::of("ping", &url(), b"hello!", "alice@x"));
        assert_ne!(base, Fingerprint::of("ping", &url(), b"hello", "carol@x"));
    }
}
