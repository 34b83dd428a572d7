//! Pluggable storage adapters
//!
//! The core persists processed trace events, resolutions, and session
//! records through the [`StorageAdapter`] trait. In-memory storage is the
//! default; the JSONL file adapter matches the TRACE on-disk format
//! (one event per line, per-session files, artifacts beside the log).

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::carp::Resolution;
use crate::error::{Result, WardenError};
use crate::session::{SessionFilter, SessionInfo, SessionPatch};
use crate::trace::{EventFilter, TraceEvent};

/// Abstract persistence consumed by the core
///
/// Implementations must preserve intra-session append order. All methods
/// take `&self` to allow interior mutability.
pub trait StorageAdapter: Send + Sync {
    /// Durably append processed events, preserving intra-session order
    fn append_events(&self, events: &[TraceEvent]) -> Result<()>;

    /// Read events passing `filter`, in per-session sequence order
    fn read_events(&self, filter: &EventFilter) -> Result<Vec<TraceEvent>>;

    /// Persist a resolution
    fn save_resolution(&self, resolution: &Resolution) -> Result<()>;

    /// Fetch a resolution by id
    fn get_resolution(&self, resolution_id: &str) -> Result<Option<Resolution>>;

    /// Remove a resolution by id
    fn delete_resolution(&self, resolution_id: &str) -> Result<()>;

    /// Persist a session record
    fn save_session(&self, info: &SessionInfo) -> Result<()>;

    /// Apply a partial update to a stored session
    fn update_session(&self, session_id: &str, patch: &SessionPatch) -> Result<()>;

    /// List sessions passing `filter`
    fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionInfo>>;

    /// Adapter name for diagnostics
    fn name(&self) -> &'static str;
}

/// In-memory adapter (default)
///
/// Events, resolutions, and sessions live in RwLock'd maps and are lost on
/// drop. Suitable for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    events: RwLock<HashMap<String, Vec<TraceEvent>>>,
    resolutions: RwLock<HashMap<String, Resolution>>,
    sessions: RwLock<HashMap<String, SessionInfo>>,
}

impl InMemoryStorage {
    /// Create an empty in-memory adapter
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored events across all sessions
    pub fn total_events(&self) -> usize {
        self.events
            .read()
            .map(|e| e.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// All session ids with stored events
    pub fn session_ids(&self) -> Vec<String> {
        self.events
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop everything
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.write() {
            events.clear();
        }
        if let Ok(mut resolutions) = self.resolutions.write() {
            resolutions.clear();
        }
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.clear();
        }
    }
}

fn lock_poisoned() -> WardenError {
    WardenError::Storage {
        reason: "storage lock poisoned".to_string(),
    }
}

impl StorageAdapter for InMemoryStorage {
    fn append_events(&self, events: &[TraceEvent]) -> Result<()> {
        let mut store = self.events.write().map_err(|_| lock_poisoned())?;
        for event in events {
            store
                .entry(event.session_id.clone())
                .or_default()
                .push(event.clone());
        }
        Ok(())
    }

    fn read_events(&self, filter: &EventFilter) -> Result<Vec<TraceEvent>> {
        let store = self.events.read().map_err(|_| lock_poisoned())?;
        let out: Vec<TraceEvent> = match &filter.session_id {
            Some(session_id) => {
                let mut events: Vec<TraceEvent> = store
                    .get(session_id)
                    .map(|events| {
                        events.iter().filter(|e| filter.matches(e)).cloned().collect()
                    })
                    .unwrap_or_default();
                // Delayed parked batches may append out of order; reads
                // guarantee sequence order per session
                events.sort_by_key(|e| e.sequence);
                events
            }
            None => {
                let mut all: Vec<TraceEvent> = store
                    .values()
                    .flatten()
                    .filter(|e| filter.matches(e))
                    .cloned()
                    .collect();
                all.sort_by(|a, b| {
                    a.session_id
                        .cmp(&b.session_id)
                        .then(a.sequence.cmp(&b.sequence))
                });
                all
            }
        };
        Ok(out)
    }

    fn save_resolution(&self, resolution: &Resolution) -> Result<()> {
        let mut store = self.resolutions.write().map_err(|_| lock_poisoned())?;
        store.insert(resolution.resolution_id.clone(), resolution.clone());
        Ok(())
    }

    fn get_resolution(&self, resolution_id: &str) -> Result<Option<Resolution>> {
        let store = self.resolutions.read().map_err(|_| lock_poisoned())?;
        Ok(store.get(resolution_id).cloned())
    }

    fn delete_resolution(&self, resolution_id: &str) -> Result<()> {
        let mut store = self.resolutions.write().map_err(|_| lock_poisoned())?;
        store.remove(resolution_id);
        Ok(())
    }

    fn save_session(&self, info: &SessionInfo) -> Result<()> {
        let mut store = self.sessions.write().map_err(|_| lock_poisoned())?;
        store.insert(info.session_id.clone(), info.clone());
        Ok(())
    }

    fn update_session(&self, session_id: &str, patch: &SessionPatch) -> Result<()> {
        let mut store = self.sessions.write().map_err(|_| lock_poisoned())?;
        let session = store
            .get_mut(session_id)
            .ok_or_else(|| WardenError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        patch.apply(session);
        Ok(())
    }

    fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionInfo>> {
        let store = self.sessions.read().map_err(|_| lock_poisoned())?;
        let mut out: Vec<SessionInfo> = store
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

/// JSONL file adapter
///
/// One `<timestamp>-<traceprefix>.trace.jsonl` file per session, one event
/// per line in sequence order. Resolutions and sessions are stored as
/// individual JSON documents. External artifact payloads are written
/// beside the logs under the artifact root.
#[derive(Debug)]
pub struct FileStorage {
    directory: PathBuf,
    artifact_root: PathBuf,
    /// session_id -> trace file path, fixed at first append
    trace_files: RwLock<HashMap<String, PathBuf>>,
    resolutions: RwLock<HashMap<String, Resolution>>,
    sessions: RwLock<HashMap<String, SessionInfo>>,
}

impl FileStorage {
    /// Create a file adapter rooted at `directory`
    pub fn new<P: Into<PathBuf>>(directory: P) -> Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        let artifact_root = directory.join("artifacts");
        std::fs::create_dir_all(&artifact_root)?;
        Ok(Self {
            directory,
            artifact_root,
            trace_files: RwLock::new(HashMap::new()),
            resolutions: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Override the artifact root
    pub fn with_artifact_root<P: Into<PathBuf>>(mut self, root: P) -> Result<Self> {
        self.artifact_root = root.into();
        std::fs::create_dir_all(&self.artifact_root)?;
        Ok(self)
    }

    /// Write an external artifact payload; `reference` is the
    /// `<artifact_id>-artifact.<ext>` name carried in the event
    pub fn store_artifact(&self, reference: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.artifact_root.join(reference);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Path a stored artifact would have
    pub fn artifact_path(&self, reference: &str) -> PathBuf {
        self.artifact_root.join(reference)
    }

    /// `YYYY-MM-DDTHH-MM-SS-<traceprefix>.trace.jsonl`
    fn trace_file_name(event: &TraceEvent) -> String {
        let stamp = event.timestamp.format("%Y-%m-%dT%H-%M-%S");
        let prefix: String = event.trace_id.chars().take(8).collect();
        format!("{}-{}.trace.jsonl", stamp, prefix)
    }

    fn trace_file_for(&self, event: &TraceEvent) -> Result<PathBuf> {
        let mut files = self.trace_files.write().map_err(|_| lock_poisoned())?;
        let path = files
            .entry(event.session_id.clone())
            .or_insert_with(|| self.directory.join(Self::trace_file_name(event)));
        Ok(path.clone())
    }

    fn read_all_events(&self) -> Result<Vec<TraceEvent>> {
        let files = self.trace_files.read().map_err(|_| lock_poisoned())?;
        let mut events = Vec::new();
        for path in files.values() {
            events.extend(Self::read_trace_file(path)?);
        }
        Ok(events)
    }

    /// Parse one JSONL trace file
    pub fn read_trace_file(path: &Path) -> Result<Vec<TraceEvent>> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    fn resolution_path(&self, resolution_id: &str) -> PathBuf {
        self.directory.join(format!("{}.resolution.json", resolution_id))
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.directory.join(format!("{}.session.json", session_id))
    }
}

impl StorageAdapter for FileStorage {
    fn append_events(&self, events: &[TraceEvent]) -> Result<()> {
        for event in events {
            let path = self.trace_file_for(event)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            let line = serde_json::to_string(event)?;
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }

    fn read_events(&self, filter: &EventFilter) -> Result<Vec<TraceEvent>> {
        let mut events = match &filter.session_id {
            Some(session_id) => {
                let files = self.trace_files.read().map_err(|_| lock_poisoned())?;
                match files.get(session_id) {
                    Some(path) => Self::read_trace_file(path)?,
                    None => Vec::new(),
                }
            }
            None => self.read_all_events()?,
        };
        events.retain(|e| filter.matches(e));
        events.sort_by(|a, b| {
            a.session_id
                .cmp(&b.session_id)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(events)
    }

    fn save_resolution(&self, resolution: &Resolution) -> Result<()> {
        let path = self.resolution_path(&resolution.resolution_id);
        std::fs::write(&path, serde_json::to_string_pretty(resolution)?)?;
        let mut cache = self.resolutions.write().map_err(|_| lock_poisoned())?;
        cache.insert(resolution.resolution_id.clone(), resolution.clone());
        Ok(())
    }

    fn get_resolution(&self, resolution_id: &str) -> Result<Option<Resolution>> {
        {
            let cache = self.resolutions.read().map_err(|_| lock_poisoned())?;
            if let Some(resolution) = cache.get(resolution_id) {
                return Ok(Some(resolution.clone()));
            }
        }
        let path = self.resolution_path(resolution_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn delete_resolution(&self, resolution_id: &str) -> Result<()> {
        let mut cache = self.resolutions.write().map_err(|_| lock_poisoned())?;
        cache.remove(resolution_id);
        let path = self.resolution_path(resolution_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn save_session(&self, info: &SessionInfo) -> Result<()> {
        let path = self.session_path(&info.session_id);
        std::fs::write(&path, serde_json::to_string_pretty(info)?)?;
        let mut cache = self.sessions.write().map_err(|_| lock_poisoned())?;
        cache.insert(info.session_id.clone(), info.clone());
        Ok(())
    }

    fn update_session(&self, session_id: &str, patch: &SessionPatch) -> Result<()> {
        let updated = {
            let mut cache = self.sessions.write().map_err(|_| lock_poisoned())?;
            let session = cache
                .get_mut(session_id)
                .ok_or_else(|| WardenError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;
            patch.apply(session);
            session.clone()
        };
        let path = self.session_path(session_id);
        std::fs::write(&path, serde_json::to_string_pretty(&updated)?)?;
        Ok(())
    }

    fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionInfo>> {
        let cache = self.sessions.read().map_err(|_| lock_poisoned())?;
        let mut out: Vec<SessionInfo> = cache
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "file-jsonl"
    }
}
