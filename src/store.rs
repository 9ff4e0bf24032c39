//! Configuration store access.
//!
//! The store owns every configuration record. The supervisor only reads
//! snapshots and watches the change-sequence counter, which increases by
//! one for each accepted write. Writes pass through the validators before
//! they are applied, so a rejected write leaves the store, its counter and
//! the running service untouched.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::ConfigSnapshot;
use crate::validate::validate_snapshot;

/// A watchable source of configuration snapshots.
pub trait ConfigStore {
    /// Pulls pending updates from the backing store.
    fn run(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Resolves once new data may be available. Callers follow up with
    /// [`ConfigStore::run`] and compare [`ConfigStore::change_seqno`].
    fn changed(&mut self) -> impl Future<Output = ()> + Send;

    /// Counter bumped once per accepted change.
    fn change_seqno(&self) -> u64;

    /// Configuration generation; zero until the system has finished
    /// restoring its startup configuration.
    fn cur_cfg(&self) -> u64;

    fn is_configured(&self) -> bool {
        self.cur_cfg() > 0
    }

    fn snapshot(&self) -> ConfigSnapshot;

    fn close(&mut self) {}
}

/// Store document as kept on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub cur_cfg: u64,
    #[serde(flatten)]
    pub config: ConfigSnapshot,
}

impl StoreDocument {
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Parses and validates a document, as a store would before committing it.
    pub fn parse_validated(content: &str) -> Result<Self> {
        let document = Self::parse(content)?;
        validate_snapshot(&document.config)?;
        Ok(document)
    }
}

/// Store backed by a JSON document on disk.
///
/// Every content change of the file counts as one write. A change that
/// fails to parse or validate is rejected: it is logged with its message
/// and the previously accepted document stays in force.
///
/// The parent directory is watched with `notify`, so replacing the file by
/// rename is seen as well as writing it in place.
pub struct FileStore {
    path: PathBuf,
    settle: Duration,
    document: StoreDocument,
    seqno: u64,
    last_content: Option<String>,
    events: watch::Receiver<u64>,
    _watcher: RecommendedWatcher,
}

impl fmt::Debug for FileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("seqno", &self.seqno)
            .finish_non_exhaustive()
    }
}

impl FileStore {
    /// Opens the store. Fails with [`Error::StoreUnavailable`] when the
    /// document does not exist or cannot be watched.
    ///
    /// `settle` is how long to wait after a change notification before the
    /// store is read, so a burst of writes is picked up as one.
    pub fn open(path: impl Into<PathBuf>, settle: Duration) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(Error::StoreUnavailable(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let (sender, events) = watch::channel(0u64);
        let watched = path.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) if touches(&event, &watched) => {
                    sender.send_modify(|count| *count += 1);
                }
                Ok(_) => {}
                Err(error) => warn!("store watch error: {}", error),
            }
        })
        .map_err(|error| watch_error(&path, error))?;

        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|error| watch_error(&path, error))?;

        Ok(Self {
            path,
            settle,
            document: StoreDocument::default(),
            seqno: 0,
            last_content: None,
            events,
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn touches(event: &Event, path: &Path) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    let name = path.file_name();
    event
        .paths
        .iter()
        .any(|changed| changed.file_name() == name)
}

fn watch_error(path: &Path, error: notify::Error) -> Error {
    Error::StoreUnavailable(format!("cannot watch {}: {}", path.display(), error))
}

impl ConfigStore for FileStore {
    async fn run(&mut self) -> Result<()> {
        self.events.mark_unchanged();
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|error| {
            Error::StoreUnavailable(format!("{}: {}", self.path.display(), error))
        })?;

        if self.last_content.as_deref() == Some(content.as_str()) {
            return Ok(());
        }

        match StoreDocument::parse_validated(&content) {
            Ok(document) => {
                self.document = document;
                self.seqno += 1;
                info!(
                    "store {} accepted, seqno {}",
                    self.path.display(),
                    self.seqno
                );
            }
            Err(error) => {
                warn!("store {} rejected: {}", self.path.display(), error);
            }
        }
        self.last_content = Some(content);
        Ok(())
    }

    async fn changed(&mut self) {
        if self.events.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.settle).await;
    }

    fn change_seqno(&self) -> u64 {
        self.seqno
    }

    fn cur_cfg(&self) -> u64 {
        self.document.cur_cfg
    }

    fn snapshot(&self) -> ConfigSnapshot {
        self.document.config.clone()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    document: StoreDocument,
    seqno: u64,
}

/// In-process store. Writes go through a [`MemoryStoreHandle`].
#[derive(Debug)]
pub struct MemoryStore {
    shared: Arc<Mutex<MemoryState>>,
    notify: watch::Receiver<u64>,
    document: StoreDocument,
    seqno: u64,
}

/// Write side of a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryStoreHandle {
    shared: Arc<Mutex<MemoryState>>,
    notify: Arc<watch::Sender<u64>>,
}

impl MemoryStore {
    pub fn new(document: StoreDocument) -> (Self, MemoryStoreHandle) {
        let shared = Arc::new(Mutex::new(MemoryState { document, seqno: 0 }));
        let (sender, receiver) = watch::channel(0);
        let store = Self {
            shared: Arc::clone(&shared),
            notify: receiver,
            document: StoreDocument::default(),
            seqno: 0,
        };
        let handle = MemoryStoreHandle {
            shared,
            notify: Arc::new(sender),
        };
        (store, handle)
    }
}

impl MemoryStoreHandle {
    /// Applies `change` to a copy of the current document and commits it
    /// if the result validates. Returns the new sequence number.
    pub fn commit<F>(&self, change: F) -> Result<u64>
    where
        F: FnOnce(&mut StoreDocument),
    {
        let mut state = self
            .shared
            .lock()
            .map_err(|_| Error::StoreUnavailable("memory store poisoned".to_string()))?;
        let mut document = state.document.clone();
        change(&mut document);
        validate_snapshot(&document.config)?;

        state.document = document;
        state.seqno += 1;
        let seqno = state.seqno;
        drop(state);

        self.notify.send_replace(seqno);
        Ok(seqno)
    }
}

impl ConfigStore for MemoryStore {
    async fn run(&mut self) -> Result<()> {
        let state = self
            .shared
            .lock()
            .map_err(|_| Error::StoreUnavailable("memory store poisoned".to_string()))?;
        self.document = state.document.clone();
        self.seqno = state.seqno;
        drop(state);
        self.notify.mark_unchanged();
        Ok(())
    }

    async fn changed(&mut self) {
        if self.notify.changed().await.is_err() {
            // All handles dropped: nothing can change any more.
            std::future::pending::<()>().await;
        }
    }

    fn change_seqno(&self) -> u64 {
        self.seqno
    }

    fn cur_cfg(&self) -> u64 {
        self.document.cur_cfg
    }

    fn snapshot(&self) -> ConfigSnapshot {
        self.document.config.clone()
    }
}
