//! Persistence for outstanding requests, so a restarted caller can pick its futures back up.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::identity::RequestId;
use crate::protocol::Request;
use crate::wire::{self, CodecError, EncodeError, WriteMode};

const RECORD_EXTENSION: &str = "future";

/// A directory store sweeps expired records after this many saves.
const DIR_SWEEP_EVERY: usize = 64;

/// Where pending requests are remembered until they resolve or expire.
pub trait FutureStore: Send + Sync {
    fn save(&self, request: &Request) -> Result<(), StoreError>;
    fn load(&self, id: RequestId) -> Result<Option<Request>, StoreError>;
    /// Forget a record. Removing an unknown id is not an error.
    fn remove(&self, id: RequestId) -> Result<(), StoreError>;
    /// Drop every record whose request has expired. Returns how many were dropped.
    fn sweep_expired(&self) -> Result<usize, StoreError>;
}

/// Process-local store; records die with the process. Expired records go on the next save.
#[derive(Debug, Default)]
pub struct MemoryFutureStore {
    records: Mutex<HashMap<RequestId, Request>>,
}

impl MemoryFutureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FutureStore for MemoryFutureStore {
    fn save(&self, request: &Request) -> Result<(), StoreError> {
        self.sweep_expired()?;
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.id(), request.clone());
        Ok(())
    }

    fn load(&self, id: RequestId) -> Result<Option<Request>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    fn remove(&self, id: RequestId) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        Ok(())
    }

    fn sweep_expired(&self) -> Result<usize, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, request| !request.envelope.is_expired());
        Ok(before - records.len())
    }
}

/// One `<id>.future` file per pending request, holding the encoded request envelope.
///
/// Expired and unreadable records are swept on open and periodically while saving.
#[derive(Debug, Clone)]
pub struct DirFutureStore {
    dir: PathBuf,
    saves: Arc<AtomicUsize>,
}

impl DirFutureStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let store = Self {
            dir,
            saves: Arc::new(AtomicUsize::new(0)),
        };
        let swept = store.sweep_expired()?;
        if swept > 0 {
            tracing::debug!(dir = %store.dir.display(), swept, "dropped expired future records");
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: RequestId) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXTENSION}"))
    }

    /// Ids of all stored records, oldest first.
    pub fn ids(&self) -> Result<Vec<RequestId>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl FutureStore for DirFutureStore {
    fn save(&self, request: &Request) -> Result<(), StoreError> {
        if self.saves.fetch_add(1, Ordering::Relaxed) % DIR_SWEEP_EVERY == DIR_SWEEP_EVERY - 1 {
            self.sweep_expired()?;
        }
        let bytes = wire::encode_request(request)?;
        wire::persist(&self.record_path(request.id()), &bytes, WriteMode::Overwrite)?;
        Ok(())
    }

    fn load(&self, id: RequestId) -> Result<Option<Request>, StoreError> {
        match fs::read(self.record_path(id)) {
            Ok(bytes) => Ok(Some(wire::decode_request(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, id: RequestId) -> Result<(), StoreError> {
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn sweep_expired(&self) -> Result<usize, StoreError> {
        let mut swept = 0;
        for id in self.ids()? {
            let keep = match self.load(id) {
                Ok(Some(request)) => !request.envelope.is_expired(),
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(%id, "dropping unreadable future record: {e}");
                    false
                }
            };
            if !keep {
                self.remove(id)?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
