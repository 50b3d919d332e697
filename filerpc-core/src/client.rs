//! Caller side: turn a call into a request file and hand back a future for its response.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::address::{Address, AddressError};
use crate::error::RpcError;
use crate::future::{Failure, RpcFuture};
use crate::identity::RequestId;
use crate::permission::Right;
use crate::protocol::Request;
use crate::runtime::{lock, CacheEntry, PreflightPolicy, Runtime};
use crate::wire::{self, WriteMode};

/// What to call: everything about a request the caller chooses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub url: Address,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Call {
    pub fn new(url: Address, method: impl Into<String>) -> Self {
        Self {
            url,
            method: method.into(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialize `value` as the JSON body and set `content-type`.
    pub fn json<T: serde::Serialize>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.body = serde_json::to_vec(value)?;
        Ok(self.header("content-type", "application/json"))
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Request lifetime; the runtime default when `None`.
    pub expiry: Option<Duration>,
    /// Reuse the future of an identical live call instead of sending again.
    pub cache: bool,
}

impl SendOptions {
    pub fn expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }
}

#[derive(Clone)]
pub struct Client {
    runtime: Arc<Runtime>,
}

impl Client {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Write a request file for `call` and return the future tracking its response.
    ///
    /// Invalid addresses and unencodable envelopes are errors. A request that could not be
    /// written (filesystem failure, or a denial under [`PreflightPolicy::Enforce`]) comes back
    /// as a future in the `Failed` state.
    pub fn send(&self, call: Call, options: SendOptions) -> Result<Arc<RpcFuture>, RpcError> {
        if call.url.rpc_target().is_none() {
            return Err(AddressError::InvalidAddress(format!(
                "{} is not an rpc endpoint",
                call.url
            ))
            .into());
        }
        let request = self.prepare(call, &options);
        if !options.cache {
            return self.issue(request);
        }

        let fingerprint = request.fingerprint();
        // Held across the write so concurrent identical calls issue one request.
        let mut cache = lock(&self.runtime.cache);
        let now = Utc::now();
        if let Some(entry) = cache.get(&fingerprint) {
            if entry.is_live(now) {
                tracing::debug!(id = %entry.future.id(), %fingerprint, "call served from cache");
                return Ok(entry.future.clone());
            }
            cache.remove(&fingerprint);
        }
        cache.retain(|_, entry| entry.is_live(now));

        let future = self.issue(request)?;
        if !future.is_failed() {
            cache.insert(
                fingerprint,
                CacheEntry {
                    future: future.clone(),
                    expires_at: future.request().envelope.expires_at,
                },
            );
        }
        Ok(future)
    }

    /// A future this process issued or loaded that is still alive.
    pub fn get(&self, id: RequestId) -> Option<Arc<RpcFuture>> {
        self.runtime.lookup(id)
    }

    /// Like [`Client::get`], falling back to the future store (e.g. after a restart).
    pub fn load(&self, id: RequestId) -> Result<Option<Arc<RpcFuture>>, RpcError> {
        if let Some(future) = self.get(id) {
            return Ok(Some(future));
        }
        let Some(request) = self.runtime.store().load(id)? else {
            return Ok(None);
        };
        let endpoint_dir = self.runtime.datasites().local_path(request.url());
        let future = Arc::new(RpcFuture::new(
            request,
            &endpoint_dir,
            self.runtime.config().poll_interval,
            self.runtime.store().clone(),
            None,
        ));
        self.runtime.register(&future);
        tracing::debug!(%id, "future restored from store");
        Ok(Some(future))
    }

    /// Stamp a call with this caller's identity, a fresh id and its expiry.
    fn prepare(&self, call: Call, options: &SendOptions) -> Request {
        let expiry = options.expiry.unwrap_or(self.runtime.config().default_expiry);
        let mut request = Request::new(
            self.runtime.identity(),
            call.url,
            call.method,
            call.body,
            expiry,
        );
        request.envelope.headers = call.headers;
        request
    }

    fn issue(&self, request: Request) -> Result<Arc<RpcFuture>, RpcError> {
        let config = self.runtime.config();
        let bytes = wire::encode_request(&request)?;

        let id = request.id();
        let endpoint_dir = self.runtime.datasites().local_path(request.url());
        let request_path = endpoint_dir.join(wire::request_file_name(id));

        let mut failure = None;
        if !self
            .runtime
            .permissions()
            .check(&request_path, self.runtime.identity(), Right::Write)
        {
            match config.preflight {
                PreflightPolicy::Advisory => tracing::warn!(
                    %id,
                    url = %request.url(),
                    "local rules deny writing this request; sending anyway"
                ),
                PreflightPolicy::Enforce => {
                    failure = Some(Failure::PermissionDenied {
                        principal: self.runtime.identity().to_string(),
                        path: request_path.clone(),
                    })
                }
            }
        }
        if failure.is_none() {
            let written = fs::create_dir_all(&endpoint_dir)
                .and_then(|()| wire::persist(&request_path, &bytes, WriteMode::NoClobber));
            if let Err(e) = written {
                tracing::warn!(%id, path = %request_path.display(), "request not written: {e}");
                failure = Some(Failure::Io(e.to_string()));
            }
        }

        let failed = failure.is_some();
        if !failed {
            if let Err(e) = self.runtime.store().save(&request) {
                tracing::warn!(%id, "could not persist future: {e}");
            }
            tracing::debug!(%id, method = %request.method, url = %request.url(), "request sent");
        }
        let future = Arc::new(RpcFuture::new(
            request,
            &endpoint_dir,
            config.poll_interval,
            self.runtime.store().clone(),
            failure,
        ));
        if !failed {
            self.runtime.register(&future);
        }
        Ok(future)
    }
}
