//! Callee side: watch an application's rpc directory and answer request files.
//!
//! Routes are registered on a [`Server`]; [`Server::start`] consumes it, so the route table
//! is frozen once dispatch begins.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::address::{self, Address, AddressError, API_DATA_DIR, RPC_DIR};
use crate::error::Result;
use crate::handler::{Context, Handler, HandlerError, Reply, State};
use crate::identity::RequestId;
use crate::permission::{PermissionRule, Right, RuleFile, WILDCARD};
use crate::protocol::{Request, Response, StatusCode};
use crate::route::{RegistrationError, Router};
use crate::runtime::{lock, Runtime};
use crate::scheduler::WorkerPool;
use crate::watch::{DirWatcher, WatchOptions};
use crate::wire::{self, WriteMode, Written, HEADER_LEN};

/// Machine-readable reason attached to responses the engine writes itself.
pub const ERROR_HEADER: &str = "x-filerpc-error";

/// Endpoint listing published next to the routes.
pub const SCHEMA_FILE_NAME: &str = "rpc.schema.json";

const SEEN_SWEEP_THRESHOLD: usize = 10_000;

pub struct Server {
    runtime: Arc<Runtime>,
    app_name: String,
    base: Address,
    router: Router,
    state: Option<State>,
}

impl Server {
    pub fn new(runtime: Arc<Runtime>, app_name: &str) -> Result<Self, AddressError> {
        address::validate_app_name(app_name)?;
        let base = Address::new(runtime.identity(), [API_DATA_DIR, app_name, RPC_DIR])?;
        Ok(Self {
            runtime,
            app_name: app_name.to_string(),
            base,
            router: Router::new(),
            state: None,
        })
    }

    pub fn register<H: Handler>(
        &mut self,
        pattern: &str,
        handler: H,
    ) -> Result<&mut Self, RegistrationError> {
        self.router.register(pattern, handler)?;
        Ok(self)
    }

    /// Mount a whole router under `prefix`.
    pub fn register_router(
        &mut self,
        prefix: &str,
        router: Router,
    ) -> Result<&mut Self, RegistrationError> {
        self.router.register_router(prefix, router)?;
        Ok(self)
    }

    /// State every handler can reach through [`Context::state`].
    pub fn with_state<T: std::any::Any + Send + Sync>(mut self, state: T) -> Self {
        self.state = Some(Arc::new(state));
        self
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn rpc_dir(&self) -> PathBuf {
        self.runtime.datasites().local_path(&self.base)
    }

    /// Publish the app's files and begin dispatching. Must be called within a tokio runtime.
    pub fn start(self) -> Result<ServerHandle> {
        let config = self.runtime.config().clone();
        let rpc_dir = self.rpc_dir();
        fs::create_dir_all(&rpc_dir)?;
        if config.publish_default_permissions {
            publish_default_permissions(&rpc_dir)?;
        }
        self.publish_schema(&rpc_dir)?;
        if self.router.is_empty() {
            tracing::warn!(app = %self.app_name, "starting server with no routes");
        }

        let watcher = DirWatcher::watch(
            &rpc_dir,
            WatchOptions {
                recursive: true,
                rescan_interval: Some(config.rescan_interval),
                capacity: config.queue_capacity,
            },
        );
        let pool = WorkerPool::new(config.max_workers);
        tracing::info!(
            app = %self.app_name,
            rpc_dir = %rpc_dir.display(),
            routes = self.router.len(),
            workers = pool.size(),
            "server started"
        );

        let dispatcher = Arc::new(Dispatcher {
            runtime: self.runtime,
            rpc_dir: rpc_dir.clone(),
            router: self.router,
            state: self.state,
            seen: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            claimed: Mutex::new(HashSet::new()),
        });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(event_loop(dispatcher, watcher, pool, shutdown_rx));
        Ok(ServerHandle {
            rpc_dir,
            shutdown: shutdown_tx,
            task,
        })
    }

    /// Serve for the rest of the process lifetime.
    pub async fn run(self) -> Result<()> {
        self.start()?.join().await
    }

    /// Serve until `signal` completes, then stop gracefully.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let handle = self.start()?;
        signal.await;
        handle.stop().await
    }

    fn publish_schema(&self, rpc_dir: &Path) -> Result<()> {
        #[derive(Serialize)]
        struct Endpoint {
            pattern: String,
            url: String,
        }
        #[derive(Serialize)]
        struct Schema<'a> {
            app: &'a str,
            identity: &'a str,
            endpoints: Vec<Endpoint>,
        }

        let schema = Schema {
            app: &self.app_name,
            identity: self.runtime.identity(),
            endpoints: self
                .router
                .patterns()
                .map(|pattern| Endpoint {
                    pattern: pattern.to_string(),
                    url: format!("{}{pattern}", self.base),
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&schema)?;
        wire::persist(&rpc_dir.join(SCHEMA_FILE_NAME), &json, WriteMode::Overwrite)?;
        Ok(())
    }
}

/// Leave an existing rule file alone; otherwise let anyone read and write the rpc tree.
fn publish_default_permissions(rpc_dir: &Path) -> Result<()> {
    match RuleFile::load(rpc_dir) {
        Ok(Some(_)) => return Ok(()),
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(dir = %rpc_dir.display(), "keeping unreadable rule file: {e}");
            return Ok(());
        }
    }
    let rules = RuleFile {
        rules: vec![PermissionRule::new(
            WILDCARD,
            &[Right::Read, Right::Write],
            false,
        )],
    };
    let path = rules.save(rpc_dir)?;
    tracing::info!(path = %path.display(), "published default permissions");
    Ok(())
}

/// A running server. Dropping the handle also stops it.
pub struct ServerHandle {
    rpc_dir: PathBuf,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn rpc_dir(&self) -> &Path {
        &self.rpc_dir
    }

    /// Stop discovering new requests and wait for in-flight ones to finish.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task.await?;
        Ok(())
    }

    /// Wait for the dispatch loop to end without asking it to.
    pub async fn join(self) -> Result<()> {
        let ServerHandle { shutdown, task, .. } = self;
        let result = task.await;
        drop(shutdown);
        result?;
        Ok(())
    }
}

/// `(length, mtime)` of a request file when it was last handled.
type Stamp = (u64, Option<SystemTime>);

struct Job {
    path: PathBuf,
    endpoint: String,
    stamp: Stamp,
    handler: Arc<dyn Handler>,
    params: HashMap<String, String>,
}

enum Outcome {
    Responded { id: RequestId, status: StatusCode },
    Duplicate { id: RequestId },
    Malformed(wire::CodecError),
    /// Retried on the next rescan.
    Unfinished(String),
}

struct Dispatcher {
    runtime: Arc<Runtime>,
    rpc_dir: PathBuf,
    router: Router,
    state: Option<State>,
    seen: Mutex<HashMap<PathBuf, Stamp>>,
    /// Request files currently being processed.
    active: Mutex<HashSet<PathBuf>>,
    /// Request ids currently being processed, whatever file they came from.
    claimed: Mutex<HashSet<RequestId>>,
}

impl Dispatcher {
    /// Decide whether a file event is a request to process, and claim its path if so.
    fn discover(&self, path: &Path) -> Option<Job> {
        if !wire::is_request_file(path) {
            return None;
        }
        let endpoint = endpoint_of(&self.rpc_dir, path)?;
        let metadata = fs::metadata(path).ok()?;
        // Shorter than a header: still being written or synced.
        if !metadata.is_file() || metadata.len() < HEADER_LEN as u64 {
            return None;
        }
        let stamp = (metadata.len(), metadata.modified().ok());
        if lock(&self.seen).get(path) == Some(&stamp) {
            return None;
        }

        let Some(route) = self.router.resolve(&endpoint) else {
            tracing::debug!(path = %path.display(), "no route for request file");
            self.mark_seen(path, stamp);
            return None;
        };
        let job = Job {
            path: path.to_path_buf(),
            endpoint: endpoint.join("/"),
            stamp,
            handler: route.handler.clone(),
            params: route.params,
        };
        if !lock(&self.active).insert(job.path.clone()) {
            return None;
        }
        Some(job)
    }

    async fn process(self: Arc<Self>, job: Job) {
        let outcome = self.dispatch(&job).await;
        let retry = match &outcome {
            Outcome::Responded { id, status } => {
                tracing::info!(%id, endpoint = %job.endpoint, %status, "request answered");
                false
            }
            Outcome::Duplicate { id } => {
                tracing::debug!(%id, endpoint = %job.endpoint, "request already answered");
                false
            }
            Outcome::Malformed(e) => {
                tracing::warn!(path = %job.path.display(), "skipping malformed request: {e}");
                false
            }
            Outcome::Unfinished(reason) => {
                tracing::warn!(
                    path = %job.path.display(),
                    "request not answered, will retry: {reason}"
                );
                true
            }
        };
        lock(&self.active).remove(&job.path);
        if !retry {
            self.mark_seen(&job.path, job.stamp);
        }
    }

    async fn dispatch(&self, job: &Job) -> Outcome {
        let bytes = match tokio::fs::read(&job.path).await {
            Ok(bytes) => bytes,
            Err(e) => return Outcome::Unfinished(format!("reading request: {e}")),
        };
        let request = match wire::decode_request(&bytes) {
            Ok(request) => request,
            Err(e) => return Outcome::Malformed(e),
        };
        let id = request.id();
        let response_path = job.path.with_file_name(wire::response_file_name(id));
        if response_path.exists() {
            return Outcome::Duplicate { id };
        }
        let claimed = lock(&self.claimed).insert(id);
        if !claimed {
            return Outcome::Duplicate { id };
        }

        let reply = self.answer(job, request.clone()).await;
        let outcome = self.respond(&request, reply, &response_path);
        lock(&self.claimed).remove(&id);
        outcome
    }

    async fn answer(&self, job: &Job, request: Request) -> Reply {
        let id = request.id();
        if request.envelope.is_expired() {
            tracing::debug!(%id, endpoint = %job.endpoint, "request expired before dispatch");
            return Reply::new(StatusCode::EXPIRED, "request expired before it was handled")
                .with_header(ERROR_HEADER, "Expired");
        }

        let permissions = self.runtime.permissions();
        if !permissions.check(&job.path, request.sender(), Right::Write) {
            tracing::warn!(
                %id,
                sender = %request.sender(),
                endpoint = %job.endpoint,
                "rejecting request: sender may not write to this endpoint"
            );
            return Reply::new(
                StatusCode::FORBIDDEN,
                format!(
                    "permission denied: {} may not call {}",
                    request.sender(),
                    job.endpoint
                ),
            )
            .with_header(ERROR_HEADER, "PermissionDenied");
        }

        let expose = self.runtime.config().expose_handler_errors;
        let ctx = Context::new(&request, job.params.clone(), self.state.clone());
        // Spawned so a panicking handler only fails its own request.
        match tokio::spawn(job.handler.call(request, ctx)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                if err.status().is_server_error() {
                    tracing::warn!(%id, endpoint = %job.endpoint, "handler failed: {err}");
                } else {
                    tracing::debug!(%id, endpoint = %job.endpoint, "handler refused: {err}");
                }
                err.into_reply(expose)
            }
            Err(e) => {
                tracing::error!(%id, endpoint = %job.endpoint, "handler panicked: {e}");
                HandlerError::internal(anyhow::anyhow!("handler panicked")).into_reply(expose)
            }
        }
    }

    fn respond(&self, request: &Request, reply: Reply, path: &Path) -> Outcome {
        let id = request.id();
        let status = reply.status;
        let mut response =
            Response::for_request(request, self.runtime.identity(), status, reply.body);
        response.envelope.headers = reply.headers;
        let bytes = match wire::encode_response(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(%id, "response not encodable, answering 500: {e}");
                let fallback = Response::for_request(
                    request,
                    self.runtime.identity(),
                    StatusCode::INTERNAL_ERROR,
                    "response could not be encoded",
                );
                match wire::encode_response(&fallback) {
                    Ok(bytes) => bytes,
                    Err(e) => return Outcome::Unfinished(format!("encoding response: {e}")),
                }
            }
        };
        match wire::persist(path, &bytes, WriteMode::NoClobber) {
            Ok(Written::Created) => Outcome::Responded { id, status },
            Ok(Written::AlreadyExists) => Outcome::Duplicate { id },
            Err(e) => Outcome::Unfinished(format!("writing response: {e}")),
        }
    }

    fn mark_seen(&self, path: &Path, stamp: Stamp) {
        let mut seen = lock(&self.seen);
        if seen.len() >= SEEN_SWEEP_THRESHOLD {
            seen.retain(|path, _| path.exists());
        }
        seen.insert(path.to_path_buf(), stamp);
    }
}

/// Endpoint segments of a request file: its directory relative to the rpc root.
fn endpoint_of(rpc_dir: &Path, path: &Path) -> Option<Vec<String>> {
    let relative = path.parent()?.strip_prefix(rpc_dir).ok()?;
    let segments = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str().map(str::to_string),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    (!segments.is_empty()).then_some(segments)
}

async fn event_loop(
    dispatcher: Arc<Dispatcher>,
    mut watcher: DirWatcher,
    pool: WorkerPool,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            _ = &mut shutdown => break,
            event = watcher.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(job) = dispatcher.discover(&event.path) else {
            continue;
        };
        if pool.busy() == pool.size() {
            tracing::debug!(
                workers = pool.size(),
                path = %event.path.display(),
                "all workers busy"
            );
        }
        // Blocks discovery while every worker is busy.
        tokio::select! {
            _ = &mut shutdown => break,
            spawned = pool.spawn(dispatcher.clone().process(job)) => {
                if spawned.is_err() {
                    break;
                }
            }
        }
    }
    drop(watcher);
    pool.drain().await;
    tracing::info!(rpc_dir = %dispatcher.rpc_dir.display(), "server stopped");
}
