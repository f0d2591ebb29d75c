use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{AsyncSubagentRecord, SubagentMode, SubagentStatus};
use crate::{AgentError, SubagentConfig};

const INDEX_FILE_NAME: &str = "index.json";
const RESULTS_DIR_NAME: &str = "results";

/// Lightweight index entry; the full record lives in `results/<id>.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub name: String,
    pub mode: SubagentMode,
    pub status: SubagentStatus,
    pub start_time: DateTime<Utc>,
    pub duration_ms: i64,
}

impl From<&AsyncSubagentRecord> for HistoryEntry {
    fn from(record: &AsyncSubagentRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            mode: record.mode,
            status: record.status,
            start_time: record.start_time,
            duration_ms: record.duration_ms,
        }
    }
}

/// Newest-first history of finished subagents under one root directory.
///
/// Every public operation swallows I/O failures: they are logged and turn
/// into an empty or zero result.
#[derive(Debug)]
pub struct SubagentHistoryStore {
    root: PathBuf,
    capacity: usize,
    write_lock: Mutex<()>,
}

impl SubagentHistoryStore {
    pub fn new(root: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            root: root.into(),
            capacity: capacity.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn for_work_dir(work_dir: &Path, config: &SubagentConfig) -> Self {
        Self::new(work_dir.join(&config.state_dir), config.history_capacity)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn save(&self, record: &AsyncSubagentRecord) {
        let _guard = self.lock();
        if let Err(error) = self.try_save(record) {
            tracing::warn!(
                subagent_id = %record.id,
                root = %self.root.display(),
                %error,
                "failed to persist subagent record"
            );
        }
    }

    /// Up to `limit` full records, newest first. Unreadable records are skipped.
    pub fn get_history(&self, limit: usize) -> Vec<AsyncSubagentRecord> {
        self.read_index()
            .iter()
            .filter_map(|entry| self.load_record(&entry.id))
            .take(limit)
            .collect()
    }

    pub fn load_record(&self, id: &str) -> Option<AsyncSubagentRecord> {
        let path = self.record_path(id)?;
        let loaded = fs::read(&path)
            .map_err(AgentError::from)
            .and_then(|raw| serde_json::from_slice(&raw).map_err(AgentError::from));
        match loaded {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!(subagent_id = %id, %error, "skipping unreadable subagent record");
                None
            }
        }
    }

    pub fn history_count(&self) -> usize {
        self.read_index().len()
    }

    /// Deletes every record file under `results/`, listed in the index or
    /// not, then the index. Returns how many entries the index held.
    pub fn clear_history(&self) -> usize {
        let _guard = self.lock();
        let count = self.read_index().len();
        let results = self.root.join(RESULTS_DIR_NAME);
        match fs::read_dir(&results) {
            Ok(listing) => {
                for path in listing.flatten().map(|entry| entry.path()) {
                    if is_record_file(&path) {
                        remove_quietly(&path);
                    }
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(path = %results.display(), %error, "failed to list subagent records");
            }
        }
        remove_quietly(&self.index_path());
        count
    }

    fn try_save(&self, record: &AsyncSubagentRecord) -> Result<(), AgentError> {
        let record_path = self
            .record_path(&record.id)
            .ok_or_else(|| AgentError::Persistence(format!("invalid record id: {}", record.id)))?;
        fs::create_dir_all(self.root.join(RESULTS_DIR_NAME))?;
        write_atomically(&record_path, &serde_json::to_vec_pretty(record)?)?;

        let mut entries = self.read_index();
        entries.retain(|entry| entry.id != record.id);
        entries.insert(0, HistoryEntry::from(record));
        if entries.len() > self.capacity {
            for pruned in entries.split_off(self.capacity) {
                if let Some(path) = self.record_path(&pruned.id) {
                    remove_quietly(&path);
                }
            }
        }
        write_atomically(&self.index_path(), &serde_json::to_vec_pretty(&entries)?)
    }

    fn read_index(&self) -> Vec<HistoryEntry> {
        let path = self.index_path();
        if !path.exists() {
            return Vec::new();
        }
        let loaded = fs::read(&path)
            .map_err(AgentError::from)
            .and_then(|raw| serde_json::from_slice(&raw).map_err(AgentError::from));
        match loaded {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "failed to read subagent history index");
                Vec::new()
            }
        }
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE_NAME)
    }

    fn record_path(&self, id: &str) -> Option<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        valid.then(|| {
            self.root
                .join(RESULTS_DIR_NAME)
                .join(format!("{}.json", id))
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn write_atomically(path: &Path, raw: &[u8]) -> Result<(), AgentError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, raw)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn is_record_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(".json") || name.ends_with(".json.tmp"))
}

fn remove_quietly(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        if error.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), %error, "failed to remove subagent history file");
        }
    }
}
