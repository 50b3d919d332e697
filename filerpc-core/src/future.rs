//! Handle to a call awaiting its response file.
//!
//! A future starts `Pending` and moves exactly once to `Resolved`, `Expired` or `Failed`.
//! A timed-out wait is local: the future stays `Pending` and can be waited on again.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::RpcError;
use crate::identity::RequestId;
use crate::protocol::{Request, Response};
use crate::runtime::lock;
use crate::store::FutureStore;
use crate::watch::{DirWatcher, WatchOptions};
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    Pending,
    Resolved,
    Expired,
    /// The request never reached the endpoint directory.
    Failed,
}

impl fmt::Display for FutureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FutureState::Pending => "pending",
            FutureState::Resolved => "resolved",
            FutureState::Expired => "expired",
            FutureState::Failed => "failed",
        })
    }
}

/// Why a request was never written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    PermissionDenied { principal: String, path: PathBuf },
    Io(String),
}

impl Failure {
    fn to_error(&self, id: RequestId) -> RpcError {
        match self {
            Failure::PermissionDenied { principal, path } => RpcError::PermissionDenied {
                principal: principal.clone(),
                path: path.clone(),
            },
            Failure::Io(reason) => RpcError::SendFailed {
                id,
                reason: reason.clone(),
            },
        }
    }
}

enum Slot {
    Pending,
    Resolved(Response),
    Expired,
    Failed(Failure),
}

pub struct RpcFuture {
    request: Request,
    request_path: PathBuf,
    response_path: PathBuf,
    poll_interval: Duration,
    store: Arc<dyn FutureStore>,
    slot: Mutex<Slot>,
}

impl RpcFuture {
    pub(crate) fn new(
        request: Request,
        endpoint_dir: &Path,
        poll_interval: Duration,
        store: Arc<dyn FutureStore>,
        failure: Option<Failure>,
    ) -> Self {
        let slot = match failure {
            Some(failure) => Slot::Failed(failure),
            None => Slot::Pending,
        };
        Self {
            request_path: endpoint_dir.join(wire::request_file_name(request.id())),
            response_path: endpoint_dir.join(wire::response_file_name(request.id())),
            request,
            poll_interval,
            store,
            slot: Mutex::new(slot),
        }
    }

    pub fn id(&self) -> RequestId {
        self.request.id()
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_path(&self) -> &Path {
        &self.request_path
    }

    pub fn response_path(&self) -> &Path {
        &self.response_path
    }

    pub fn state(&self) -> FutureState {
        match &*lock(&self.slot) {
            Slot::Pending => FutureState::Pending,
            Slot::Resolved(_) => FutureState::Resolved,
            Slot::Expired => FutureState::Expired,
            Slot::Failed(_) => FutureState::Failed,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state() == FutureState::Failed
    }

    /// Non-blocking check for the response.
    ///
    /// `Ok(None)` while still pending. A resolved future keeps returning its response.
    pub fn poll(&self) -> Result<Option<Response>, RpcError> {
        let id = self.id();
        let mut slot = lock(&self.slot);
        match &*slot {
            Slot::Resolved(response) => return Ok(Some(response.clone())),
            Slot::Expired => return Err(RpcError::Expired(id)),
            Slot::Failed(failure) => return Err(failure.to_error(id)),
            Slot::Pending => {}
        }

        match fs::read(&self.response_path) {
            Ok(bytes) => {
                let response = match wire::decode_response(&bytes) {
                    Ok(response) => response,
                    // An unreadable response cannot hold the request past its expiry.
                    Err(_) if self.request.envelope.is_expired() => {
                        tracing::debug!(%id, "request expired with an unreadable response");
                        *slot = Slot::Expired;
                        drop(slot);
                        self.forget();
                        return Err(RpcError::Expired(id));
                    }
                    Err(e) => return Err(e.into()),
                };
                if response.id() != id {
                    return Err(RpcError::CorrelationMismatch {
                        expected: id,
                        found: response.id(),
                    });
                }
                tracing::debug!(%id, status = %response.status_code, "response received");
                *slot = Slot::Resolved(response.clone());
                drop(slot);
                self.forget();
                return Ok(Some(response));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if self.request.envelope.is_expired() {
            tracing::debug!(%id, "request expired without a response");
            *slot = Slot::Expired;
            drop(slot);
            self.forget();
            return Err(RpcError::Expired(id));
        }
        Ok(None)
    }

    /// Wait up to `timeout` for the response.
    ///
    /// Returns [`RpcError::Timeout`] if the wait ran out first and the future is still pending,
    /// or [`RpcError::Expired`] once the request's own expiry has passed.
    pub async fn wait(&self, timeout: Duration) -> Result<Response, RpcError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut watcher: Option<DirWatcher> = None;
        let mut watching = false;
        loop {
            match self.poll() {
                Ok(Some(response)) => return Ok(response),
                Ok(None) => {}
                // A response still being synced can look truncated; try again next round.
                Err(RpcError::Codec(e)) => {
                    tracing::debug!(id = %self.id(), "response not readable yet: {e}");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            let remaining = match deadline {
                Some(deadline) if now >= deadline => return Err(RpcError::Timeout(timeout)),
                Some(deadline) => deadline - now,
                None => Duration::MAX,
            };

            if !watching {
                watching = true;
                if let Some(dir) = self.response_path.parent() {
                    let notify_only = WatchOptions {
                        recursive: false,
                        rescan_interval: None,
                        capacity: 16,
                    };
                    watcher = Some(DirWatcher::watch(dir, notify_only));
                }
            }

            let nap = self
                .poll_interval
                .min(remaining)
                .min(self.request.envelope.time_to_expiry())
                .max(Duration::from_millis(1));
            let closed = match watcher.as_mut() {
                Some(w) => tokio::select! {
                    event = w.next() => event.is_none(),
                    _ = tokio::time::sleep(nap) => false,
                },
                None => {
                    tokio::time::sleep(nap).await;
                    false
                }
            };
            if closed {
                watcher = None;
            }
        }
    }

    fn forget(&self) {
        if let Err(e) = self.store.remove(self.id()) {
            tracing::warn!(id = %self.id(), "could not drop stored future: {e}");
        }
    }
}

impl fmt::Debug for RpcFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcFuture")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("response_path", &self.response_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::protocol::StatusCode;
    use crate::store::MemoryFutureStore;
    use crate::wire::WriteMode;

    fn pending(dir: &Path, expiry: Duration) -> (RpcFuture, Arc<MemoryFutureStore>) {
        let store = Arc::new(MemoryFutureStore::new());
        let request = Request::new(
            "alice@x",
            Address::rpc("bob@x", "chat", "ping").unwrap(),
            "ping",
            "hello",
            expiry,
        );
        store.save(&request).unwrap();
        let future = RpcFuture::new(
            request,
            dir,
            Duration::from_millis(20),
            store.clone(),
            None,
        );
        (future, store)
    }

    fn respond(future: &RpcFuture, body: &str) {
        let response = Response::for_request(future.request(), "bob@x", StatusCode::OK, body);
        let bytes = wire::encode_response(&response).unwrap();
        wire::persist(future.response_path(), &bytes, WriteMode::NoClobber).unwrap();
    }

    #[test]
    fn poll_resolves_once_response_exists() {
        let dir = tempfile::tempdir().unwrap();
        let (future, store) = pending(dir.path(), Duration::from_secs(60));
        assert_eq!(future.poll().unwrap(), None);
        assert_eq!(future.state(), FutureState::Pending);

        respond(&future, "pong:hello");
        let response = future.poll().unwrap().unwrap();
        assert_eq!(response.body(), b"pong:hello");
        assert_eq!(future.state(), FutureState::Resolved);
        assert!(store.is_empty());

        fs::remove_file(future.response_path()).unwrap();
        assert_eq!(future.poll().unwrap().unwrap(), response);
    }

    #[test]
    fn poll_rejects_foreign_response() {
        let dir = tempfile::tempdir().unwrap();
        let (future, _) = pending(dir.path(), Duration::from_secs(60));
        let (other, _) = pending(dir.path(), Duration::from_secs(60));
        let stray = Response::for_request(other.request(), "bob@x", StatusCode::OK, "x");
        fs::write(
            future.response_path(),
            wire::encode_response(&stray).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            future.poll(),
            Err(RpcError::CorrelationMismatch { .. })
        ));
        assert_eq!(future.state(), FutureState::Pending);
    }

    #[test]
    fn failed_future_reports_its_cause() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request::new(
            "evil@x",
            Address::rpc("bob@x", "chat", "ping").unwrap(),
            "ping",
            "",
            Duration::from_secs(60),
        );
        let future = RpcFuture::new(
            request,
            dir.path(),
            Duration::from_millis(20),
            Arc::new(MemoryFutureStore::new()),
            Some(Failure::PermissionDenied {
                principal: "evil@x".into(),
                path: dir.path().to_path_buf(),
            }),
        );
        assert_eq!(future.state(), FutureState::Failed);
        assert!(matches!(
            future.poll(),
            Err(RpcError::PermissionDenied { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_times_out_and_stays_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (future, _) = pending(dir.path(), Duration::from_secs(60));
        let started = std::time::Instant::now();
        let err = future.wait(Duration::from_millis(150)).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(150 + 20 + 500));
        assert_eq!(future.state(), FutureState::Pending);

        respond(&future, "late");
        let response = future.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.body(), b"late");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_wakes_on_response() {
        let dir = tempfile::tempdir().unwrap();
        let (future, _) = pending(dir.path(), Duration::from_secs(60));
        let future = Arc::new(future);
        let writer = future.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            respond(&writer, "pong");
        });
        let response = future.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.body(), b"pong");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_stops_at_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let (future, _) = pending(dir.path(), Duration::from_millis(100));
        let err = future.wait(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, RpcError::Expired(_)));
        assert_eq!(future.state(), FutureState::Expired);
        assert!(matches!(future.poll(), Err(RpcError::Expired(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreadable_response_does_not_outlive_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let (future, store) = pending(dir.path(), Duration::from_millis(100));
        fs::write(future.response_path(), vec![0xabu8; 64]).unwrap();
        assert!(matches!(future.poll(), Err(RpcError::Codec(_))));

        let started = std::time::Instant::now();
        let err = future.wait(Duration::MAX).await.unwrap_err();
        assert!(matches!(err, RpcError::Expired(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(future.state(), FutureState::Expired);
        assert!(store.is_empty());
    }
}
