//! Shared runtime: configuration plus the state every client and server of one identity shares.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::{AddressError, Datasites};
use crate::client::Client;
use crate::future::RpcFuture;
use crate::identity::{Fingerprint, RequestId};
use crate::permission::PermissionEngine;
use crate::server::Server;
use crate::store::{FutureStore, MemoryFutureStore};

/// Registry entries beyond this trigger a sweep of dead weak references.
const REGISTRY_SWEEP_THRESHOLD: usize = 1024;

/// What a caller does when its own view of permissions says the write will be refused.
///
/// The caller's view can be stale or partial; the callee always re-checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreflightPolicy {
    /// Log a warning and send anyway.
    #[default]
    Advisory,
    /// Do not write the request; the returned future is failed.
    Enforce,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root holding one directory per identity.
    pub datasites: PathBuf,
    /// The local identity; sender of outgoing requests and owner of served endpoints.
    pub identity: String,
    pub poll_interval: Duration,
    pub rescan_interval: Duration,
    /// Lifetime of a request when the caller gives none.
    pub default_expiry: Duration,
    pub preflight: PreflightPolicy,
    pub max_workers: usize,
    /// Buffered file events before native notifications are dropped in favor of the rescan.
    pub queue_capacity: usize,
    /// Put handler error text into 500 response bodies instead of a generic message.
    pub expose_handler_errors: bool,
    /// Write a wildcard read/write rule file into a new app's rpc directory.
    pub publish_default_permissions: bool,
}

impl RuntimeConfig {
    pub fn new(datasites: impl Into<PathBuf>, identity: impl Into<String>) -> Self {
        Self {
            datasites: datasites.into(),
            identity: identity.into(),
            poll_interval: Duration::from_millis(500),
            rescan_interval: Duration::from_secs(2),
            default_expiry: Duration::from_secs(15 * 60),
            preflight: PreflightPolicy::default(),
            max_workers: 4,
            queue_capacity: 1024,
            expose_handler_errors: false,
            publish_default_permissions: true,
        }
    }
}

pub(crate) struct CacheEntry {
    pub(crate) future: Arc<RpcFuture>,
    pub(crate) expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub(crate) fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at && !self.future.is_failed()
    }
}

/// Process-wide context for one identity.
///
/// Cheap to share behind an `Arc`; clients and servers built from it see the same future
/// registry, call cache and store.
pub struct Runtime {
    config: RuntimeConfig,
    datasites: Datasites,
    permissions: PermissionEngine,
    store: Arc<dyn FutureStore>,
    pub(crate) futures: Mutex<HashMap<RequestId, Weak<RpcFuture>>>,
    pub(crate) cache: Mutex<HashMap<Fingerprint, CacheEntry>>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Self::with_store(config, Arc::new(MemoryFutureStore::new()))
    }

    pub fn with_store(config: RuntimeConfig, store: Arc<dyn FutureStore>) -> Arc<Self> {
        let datasites = Datasites::new(config.datasites.clone());
        tracing::debug!(
            identity = %config.identity,
            root = %datasites.root().display(),
            "runtime created"
        );
        Arc::new(Self {
            permissions: PermissionEngine::new(datasites.clone()),
            datasites,
            config,
            store,
            futures: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn datasites(&self) -> &Datasites {
        &self.datasites
    }

    pub fn permissions(&self) -> &PermissionEngine {
        &self.permissions
    }

    pub fn store(&self) -> &Arc<dyn FutureStore> {
        &self.store
    }

    pub fn client(self: &Arc<Self>) -> Client {
        Client::new(self.clone())
    }

    /// A server for `app_name` under this identity's datasite.
    pub fn server(self: &Arc<Self>, app_name: &str) -> Result<Server, AddressError> {
        Server::new(self.clone(), app_name)
    }

    pub(crate) fn register(&self, future: &Arc<RpcFuture>) {
        let mut futures = lock(&self.futures);
        if futures.len() >= REGISTRY_SWEEP_THRESHOLD {
            futures.retain(|_, weak| weak.strong_count() > 0);
        }
        futures.insert(future.id(), Arc::downgrade(future));
    }

    pub(crate) fn lookup(&self, id: RequestId) -> Option<Arc<RpcFuture>> {
        lock(&self.futures).get(&id).and_then(Weak::upgrade)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
