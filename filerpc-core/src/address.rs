//! Addressing: `syft://<identity>/<path...>` URLs and where they live inside a datasite tree.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// URL scheme for datasite addresses.
pub const SCHEME: &str = "syft";

/// Directory under a datasite that holds per-application data.
pub const API_DATA_DIR: &str = "api_data";

/// Directory under an application that holds its RPC endpoints.
pub const RPC_DIR: &str = "rpc";

/// A location inside some peer's datasite: owner identity plus normalized path segments.
///
/// The identity is opaque (conventionally an email) and used for routing only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    identity: String,
    path: Vec<String>,
}

impl Address {
    /// Build an address from an identity and path pieces. Each piece may itself contain `/`.
    pub fn new<I, S>(identity: impl Into<String>, pieces: I) -> Result<Self, AddressError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let identity = identity.into();
        validate_identity(&identity)?;
        let mut path = Vec::new();
        for piece in pieces {
            push_segments(&mut path, piece.as_ref())?;
        }
        Ok(Self { identity, path })
    }

    /// Address of an RPC endpoint: `syft://<identity>/api_data/<app>/rpc/<endpoint>`.
    pub fn rpc(identity: &str, app_name: &str, endpoint: &str) -> Result<Self, AddressError> {
        validate_app_name(app_name)?;
        let address = Self::new(identity, [API_DATA_DIR, app_name, RPC_DIR, endpoint])?;
        if address.path.len() < 4 {
            return Err(AddressError::InvalidAddress("empty endpoint".to_string()));
        }
        Ok(address)
    }

    /// Parse `syft://<identity>/<path...>`. The scheme is matched case-insensitively.
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let prefix_len = SCHEME.len() + 3;
        let rest = match (text.get(..SCHEME.len()), text.get(SCHEME.len()..prefix_len)) {
            (Some(scheme), Some("://")) if scheme.eq_ignore_ascii_case(SCHEME) => {
                &text[prefix_len..]
            }
            _ => {
                return Err(AddressError::InvalidAddress(format!(
                    "expected {SCHEME}:// prefix in {text:?}"
                )))
            }
        };
        let (identity, path) = match rest.split_once('/') {
            Some((identity, path)) => (identity, path),
            None => (rest, ""),
        };
        Self::new(identity, [path])
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Append path pieces, with the same validation as [`Address::new`].
    pub fn join(&self, piece: &str) -> Result<Self, AddressError> {
        let mut path = self.path.clone();
        push_segments(&mut path, piece)?;
        Ok(Self {
            identity: self.identity.clone(),
            path,
        })
    }

    /// `(app_name, endpoint segments)` when this address points at an RPC endpoint.
    pub fn rpc_target(&self) -> Option<(&str, &[String])> {
        match self.path.as_slice() {
            [api, app, rpc, endpoint @ ..]
                if api == API_DATA_DIR && rpc == RPC_DIR && !endpoint.is_empty() =>
            {
                Some((app.as_str(), endpoint))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}://{}", self.identity)?;
        for segment in &self.path {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        Address::parse(&text).map_err(serde::de::Error::custom)
    }
}

fn validate_identity(identity: &str) -> Result<(), AddressError> {
    if identity == "." || identity == ".." {
        return Err(AddressError::PathEscape(identity.to_string()));
    }
    if identity.is_empty()
        || identity
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_whitespace())
    {
        return Err(AddressError::InvalidAddress(format!(
            "invalid identity {identity:?}"
        )));
    }
    Ok(())
}

fn push_segments(path: &mut Vec<String>, piece: &str) -> Result<(), AddressError> {
    for segment in piece.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(AddressError::PathEscape(piece.to_string())),
            s if s.contains('\\') || s.contains('\0') => {
                return Err(AddressError::InvalidAddress(format!(
                    "invalid path segment {s:?}"
                )))
            }
            s => path.push(s.to_string()),
        }
    }
    Ok(())
}

/// An application name is a single, non-relative path segment.
pub fn validate_app_name(app_name: &str) -> Result<(), AddressError> {
    if app_name.is_empty()
        || app_name == "."
        || app_name == ".."
        || app_name.contains(['/', '\\', '\0'])
    {
        return Err(AddressError::InvalidAddress(format!(
            "invalid application name {app_name:?}"
        )));
    }
    Ok(())
}

/// Root of the synchronized tree holding every known peer's datasite.
///
/// All location math goes through here so independent processes compute
/// byte-identical paths for the same logical endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datasites {
    root: PathBuf,
}

impl Datasites {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<identity>`
    pub fn datasite_dir(&self, identity: &str) -> PathBuf {
        self.root.join(identity)
    }

    /// `<root>/<identity>/api_data/<app>`
    pub fn app_dir(&self, identity: &str, app_name: &str) -> PathBuf {
        self.datasite_dir(identity).join(API_DATA_DIR).join(app_name)
    }

    /// `<root>/<identity>/api_data/<app>/rpc`
    pub fn rpc_dir(&self, identity: &str, app_name: &str) -> PathBuf {
        self.app_dir(identity, app_name).join(RPC_DIR)
    }

    /// Local filesystem location of an address.
    pub fn local_path(&self, address: &Address) -> PathBuf {
        let mut path = self.datasite_dir(address.identity());
        for segment in address.path() {
            path.push(segment);
        }
        path
    }

    /// Endpoint directory for `(identity, app, endpoint)`.
    pub fn resolve(
        &self,
        identity: &str,
        app_name: &str,
        endpoint: &str,
    ) -> Result<PathBuf, AddressError> {
        Ok(self.local_path(&Address::rpc(identity, app_name, endpoint)?))
    }

    /// Reverse of [`Datasites::local_path`] for paths under the root.
    pub fn address_of(&self, path: &Path) -> Option<Address> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                _ => return None,
            }
        }
        let (identity, rest) = parts.split_first()?;
        Address::new(identity.clone(), rest).ok()
    }
}

/// Error parsing or building an address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("path escapes its datasite: {0}")]
    PathEscape(String),
}
