//! Filesystem event source: native notifications backed by a bounded-interval rescan.
//!
//! Native delivery is best-effort (full channel, unsupported filesystems, sync tools that
//! bypass inotify), so consumers must treat the periodic rescan as the source of truth.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use walkdir::WalkDir;

const MIN_RESCAN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    /// Reported by the periodic rescan, whether or not the file changed.
    Rescanned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub recursive: bool,
    /// `None` disables the rescan; only native notifications are delivered.
    pub rescan_interval: Option<Duration>,
    pub capacity: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            rescan_interval: Some(Duration::from_secs(2)),
            capacity: 1024,
        }
    }
}

/// Lazy, unbounded sequence of file events under one directory.
///
/// Dropping the watcher stops both the native watch and the rescan task.
pub struct DirWatcher {
    rx: mpsc::Receiver<FileEvent>,
    _native: Option<RecommendedWatcher>,
    rescan: Option<JoinHandle<()>>,
}

impl DirWatcher {
    /// Start watching `root`. Must be called from within a tokio runtime when a rescan is enabled.
    pub fn watch(root: &Path, options: WatchOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.capacity.max(1));
        let native = match native_watcher(root, options.recursive, tx.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(
                    root = %root.display(),
                    "native file notifications unavailable, relying on rescan: {e}"
                );
                None
            }
        };
        let rescan = options.rescan_interval.map(|interval| {
            tokio::spawn(rescan_loop(
                root.to_path_buf(),
                options.recursive,
                interval.max(MIN_RESCAN_INTERVAL),
                tx,
            ))
        });
        Self {
            rx,
            _native: native,
            rescan,
        }
    }

    /// Next event. `None` once no source can produce events any more.
    pub async fn next(&mut self) -> Option<FileEvent> {
        self.rx.recv().await
    }

    pub fn has_native(&self) -> bool {
        self._native.is_some()
    }
}

impl Drop for DirWatcher {
    fn drop(&mut self) {
        if let Some(task) = &self.rescan {
            task.abort();
        }
    }
}

fn native_watcher(
    root: &Path,
    recursive: bool,
    tx: mpsc::Sender<FileEvent>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let Ok(event) = res else {
            return;
        };
        let kind = match event.kind {
            EventKind::Create(_) => ChangeKind::Created,
            // Renames into the directory arrive as Modify(Name(..)).
            EventKind::Modify(_) => ChangeKind::Modified,
            _ => return,
        };
        for path in event.paths {
            // Dropped when full; the rescan reports it later.
            let _ = tx.try_send(FileEvent { path, kind });
        }
    })?;
    let mode = if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher.watch(root, mode)?;
    Ok(watcher)
}

async fn rescan_loop(
    root: PathBuf,
    recursive: bool,
    interval: Duration,
    tx: mpsc::Sender<FileEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        // First tick fires immediately, reporting files that predate the watch.
        ticker.tick().await;
        let scan_root = root.clone();
        let files = match tokio::task::spawn_blocking(move || scan(&scan_root, recursive)).await {
            Ok(files) => files,
            Err(_) => return,
        };
        for path in files {
            let event = FileEvent {
                path,
                kind: ChangeKind::Rescanned,
            };
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

/// Regular files under `root`, sorted so ids embedded in names come out oldest first.
fn scan(root: &Path, recursive: bool) -> Vec<PathBuf> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}
