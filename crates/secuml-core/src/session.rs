//! Persistent store and transactional sessions.
//!
//! A [`Store`] is a cloneable handle to one backend. A [`Session`] is a unit
//! of work on top of it: changes are staged locally, visible only through
//! the session that staged them, and reach the backend in a single atomic
//! [`Backend::apply`] call on commit. Rollback therefore only has to forget
//! the staged changes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use arrow::record_batch::RecordBatch;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Configuration, ConnectionDescriptor};
use crate::error::CoreError;
use crate::storage;

type Result<T> = std::result::Result<T, CoreError>;

/// A value held by the store.
#[derive(Debug, Clone)]
pub enum Record {
    Document(serde_yaml::Value),
    Table(RecordBatch),
}

#[derive(Debug, Clone)]
pub enum Change {
    Put { key: String, record: Record },
    Delete { key: String },
}

impl Change {
    pub fn key(&self) -> &str {
        match self {
            Change::Put { key, .. } | Change::Delete { key } => key,
        }
    }
}

/// Storage engine behind a [`Store`].
pub trait Backend: Send + Sync + fmt::Debug {
    /// Apply every change or none of them.
    fn apply(&self, changes: &[Change]) -> Result<()>;

    fn read(&self, key: &str) -> Result<Option<Record>>;

    /// Committed keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Keys are relative, `/`-separated, and never climb out of the store.
fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && !key.contains('\\')
        && key
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != ".." && !seg.starts_with(".~"));
    if valid {
        Ok(())
    } else {
        Err(CoreError::Persistence(format!("invalid record key '{key}'")))
    }
}

// ─── Store ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Store {
    descriptor: ConnectionDescriptor,
    backend: Arc<dyn Backend>,
}

impl Store {
    /// Connect to the store named by the configuration.
    pub fn connect(conf: &Configuration) -> Result<Self> {
        let descriptor = conf.db().clone();
        let backend: Arc<dyn Backend> = match &descriptor {
            ConnectionDescriptor::File(root) => Arc::new(FileBackend::open(root)?),
            ConnectionDescriptor::Memory => Arc::new(MemoryBackend::new()),
        };
        info!(db = %descriptor, "connected to store");
        Ok(Self {
            descriptor,
            backend,
        })
    }

    pub fn from_backend(descriptor: ConnectionDescriptor, backend: Arc<dyn Backend>) -> Self {
        Self {
            descriptor,
            backend,
        }
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Start a new unit of work.
    pub fn session(&self) -> Session {
        Session::new(self.clone())
    }
}

/// Connect to the configured store and start a session on it.
pub fn open(conf: &Configuration) -> Result<Session> {
    Ok(Store::connect(conf)?.session())
}

// ─── Session ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing staged.
    Clean,
    /// Changes staged since the last commit or rollback.
    Dirty,
    /// A commit failed; only rollback is allowed.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub commits: usize,
    pub rollbacks: usize,
    pub closes: usize,
}

pub struct Session {
    id: Uuid,
    store: Store,
    pending: Vec<Change>,
    failed: bool,
    closed: bool,
    stats: SessionStats,
}

impl Session {
    fn new(store: Store) -> Self {
        let id = Uuid::new_v4();
        debug!(session = %id, db = %store.descriptor, "session opened");
        Self {
            id,
            store,
            pending: vec![],
            failed: false,
            closed: false,
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn state(&self) -> SessionState {
        if self.failed {
            SessionState::Failed
        } else if self.pending.is_empty() {
            SessionState::Clean
        } else {
            SessionState::Dirty
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn stage(&mut self, change: Change) -> Result<()> {
        if self.failed {
            return Err(CoreError::Persistence(
                "session must be rolled back before it is reused".to_string(),
            ));
        }
        validate_key(change.key())?;
        self.pending.retain(|c| c.key() != change.key());
        self.pending.push(change);
        Ok(())
    }

    pub fn put(&mut self, key: impl Into<String>, record: Record) -> Result<()> {
        self.stage(Change::Put {
            key: key.into(),
            record,
        })
    }

    pub fn put_document<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let doc = serde_yaml::to_value(value).map_err(CoreError::persistence)?;
        self.put(key, Record::Document(doc))
    }

    pub fn put_table(&mut self, key: impl Into<String>, batch: RecordBatch) -> Result<()> {
        self.put(key, Record::Table(batch))
    }

    pub fn delete(&mut self, key: impl Into<String>) -> Result<()> {
        self.stage(Change::Delete { key: key.into() })
    }

    /// Read a record, seeing this session's own staged changes.
    pub fn get(&self, key: &str) -> Result<Option<Record>> {
        match self.pending.iter().rev().find(|c| c.key() == key) {
            Some(Change::Put { record, .. }) => Ok(Some(record.clone())),
            Some(Change::Delete { .. }) => Ok(None),
            None => self.store.backend.read(key),
        }
    }

    pub fn get_document<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(Record::Document(doc)) => serde_yaml::from_value(doc)
                .map(Some)
                .map_err(CoreError::persistence),
            Some(Record::Table(_)) => Err(CoreError::Persistence(format!(
                "record '{key}' is a table, not a document"
            ))),
            None => Ok(None),
        }
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: BTreeSet<String> = self.store.backend.list(prefix)?.into_iter().collect();
        for change in self.pending.iter().filter(|c| c.key().starts_with(prefix)) {
            match change {
                Change::Put { key, .. } => keys.insert(key.clone()),
                Change::Delete { key } => keys.remove(key),
            };
        }
        Ok(keys.into_iter().collect())
    }

    /// Atomically persist every staged change.
    ///
    /// On failure the store is unchanged and the session stays failed until
    /// [`Session::rollback`] is called.
    pub fn commit(&mut self) -> Result<()> {
        if self.failed {
            return Err(CoreError::Persistence(
                "cannot commit a failed session, roll it back first".to_string(),
            ));
        }
        if let Err(e) = self.store.backend.apply(&self.pending) {
            self.failed = true;
            warn!(session = %self.id, error = %e, "commit failed");
            return Err(e);
        }
        debug!(session = %self.id, changes = self.pending.len(), "session committed");
        self.pending.clear();
        self.stats.commits += 1;
        Ok(())
    }

    /// Discard every change staged since the last commit.
    pub fn rollback(&mut self) {
        debug!(session = %self.id, discarded = self.pending.len(), "session rolled back");
        self.pending.clear();
        self.failed = false;
        self.stats.rollbacks += 1;
    }

    /// Release the session. Refused while work is pending or unrolled-back.
    pub fn close(mut self) -> Result<SessionStats> {
        match self.state() {
            SessionState::Clean => {
                self.closed = true;
                self.stats.closes += 1;
                debug!(session = %self.id, "session closed");
                Ok(self.stats)
            }
            SessionState::Dirty => Err(CoreError::Persistence(format!(
                "session {} has {} uncommitted change(s); commit or roll back before closing",
                self.id,
                self.pending.len()
            ))),
            SessionState::Failed => Err(CoreError::Persistence(format!(
                "session {} failed; roll back before closing",
                self.id
            ))),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("db", &self.store.descriptor)
            .field("state", &self.state())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed && self.state() != SessionState::Clean {
            warn!(
                session = %self.id,
                discarded = self.pending.len(),
                "session dropped with unfinished work, discarding it"
            );
            self.pending.clear();
        }
    }
}

// ─── Memory backend ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryInner {
    records: BTreeMap<String, Record>,
    applied: usize,
    fail_next: Option<String>,
}

/// Process-local backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| CoreError::Persistence("memory store lock poisoned".to_string()))
    }

    /// Number of change sets applied so far.
    pub fn applied(&self) -> usize {
        self.lock().map(|inner| inner.applied).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.records.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next `apply` fail with `reason` without touching the records.
    pub fn fail_next_apply(&self, reason: impl Into<String>) {
        if let Ok(mut inner) = self.lock() {
            inner.fail_next = Some(reason.into());
        }
    }
}

impl Backend for MemoryBackend {
    fn apply(&self, changes: &[Change]) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(reason) = inner.fail_next.take() {
            return Err(CoreError::Persistence(reason));
        }
        for change in changes {
            match change {
                Change::Put { key, record } => {
                    inner.records.insert(key.clone(), record.clone());
                }
                Change::Delete { key } => {
                    inner.records.remove(key);
                }
            }
        }
        inner.applied += 1;
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Record>> {
        Ok(self.lock()?.records.get(key).cloned())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .records
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ─── File backend ─────────────────────────────────────────────────────────────

/// Backend rooted at a directory. Documents are YAML files, tables are
/// Parquet files (keys ending in `.parquet`).
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    commit_lock: Mutex<()>,
}

/// One step of an in-flight file commit, kept so it can be undone.
enum Applied {
    /// `target` did not exist before.
    Created { target: PathBuf },
    /// `target` existed and was moved to `backup`.
    Replaced { target: PathBuf, backup: PathBuf },
}

impl FileBackend {
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(CoreError::Connection {
                descriptor: format!("file://{}", root.display()),
                reason: "store directory does not exist".to_string(),
            });
        }
        Ok(Self {
            root: root.to_path_buf(),
            commit_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        key.split('/').fold(self.root.clone(), |p, seg| p.join(seg))
    }

    fn write_record(path: &Path, record: &Record) -> Result<()> {
        if let Some(parent) = path.parent() {
            storage::ensure_dir(parent)?;
        }
        match record {
            Record::Document(doc) => storage::save_yaml(path, doc),
            Record::Table(batch) => storage::write_parquet(path, batch),
        }
    }

    fn scratch(path: &Path, tag: &str, txid: Uuid) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".~{name}.{tag}-{txid}"))
    }

    fn undo(applied: Vec<Applied>) {
        for step in applied.into_iter().rev() {
            let restored = match &step {
                Applied::Created { target } => fs::remove_file(target),
                Applied::Replaced { target, backup } => fs::rename(backup, target),
            };
            if let Err(e) = restored {
                warn!(error = %e, "failed to undo partial commit step");
            }
        }
    }
}

impl Backend for FileBackend {
    fn apply(&self, changes: &[Change]) -> Result<()> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| CoreError::Persistence("file store lock poisoned".to_string()))?;
        let txid = Uuid::new_v4();

        // Records are files; a key naming a directory would swap out a whole tree.
        if let Some(change) = changes.iter().find(|c| self.path(c.key()).is_dir()) {
            return Err(CoreError::Persistence(format!(
                "record key '{}' names a directory",
                change.key()
            )));
        }

        // Stage every record next to its target first.
        let mut staged: Vec<(PathBuf, Option<PathBuf>)> = Vec::with_capacity(changes.len());
        for change in changes {
            let target = self.path(change.key());
            let tmp = match change {
                Change::Put { record, .. } => {
                    let tmp = Self::scratch(&target, "new", txid);
                    if let Err(e) = Self::write_record(&tmp, record) {
                        let _ = fs::remove_file(&tmp);
                        for (_, tmp) in &staged {
                            if let Some(tmp) = tmp {
                                let _ = fs::remove_file(tmp);
                            }
                        }
                        return Err(e);
                    }
                    Some(tmp)
                }
                Change::Delete { .. } => None,
            };
            staged.push((target, tmp));
        }

        // Swap them in, remembering how to undo each step.
        let mut applied = Vec::with_capacity(staged.len());
        let mut failure = None;
        for (target, tmp) in &staged {
            if target.exists() {
                let backup = Self::scratch(target, "old", txid);
                if let Err(e) = fs::rename(target, &backup) {
                    failure = Some(e);
                    break;
                }
                applied.push(Applied::Replaced {
                    target: target.clone(),
                    backup,
                });
            }
            if let Some(tmp) = tmp {
                if let Err(e) = fs::rename(tmp, target) {
                    failure = Some(e);
                    break;
                }
                if !matches!(applied.last(), Some(Applied::Replaced { target: t, .. }) if t == target)
                {
                    applied.push(Applied::Created {
                        target: target.clone(),
                    });
                }
            }
        }

        if let Some(e) = failure {
            Self::undo(applied);
            for (_, tmp) in &staged {
                if let Some(tmp) = tmp {
                    let _ = fs::remove_file(tmp);
                }
            }
            return Err(CoreError::persistence(e));
        }

        for step in applied {
            if let Applied::Replaced { backup, .. } = step {
                if let Err(e) = fs::remove_file(&backup) {
                    warn!(error = %e, backup = %backup.display(), "failed to remove commit backup");
                }
            }
        }
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Record>> {
        validate_key(key)?;
        let path = self.path(key);
        if !path.is_file() {
            return Ok(None);
        }
        let record = if key.ends_with(".parquet") {
            Record::Table(storage::read_parquet(&path)?)
        } else {
            Record::Document(storage::load_yaml_value(&path)?)
        };
        Ok(Some(record))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = vec![];
        storage::list_files(&self.root, &self.root, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix) && validate_key(k).is_ok());
        keys.sort();
        Ok(keys)
    }
}
