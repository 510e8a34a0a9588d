use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Write `data` to `path` atomically: readers see either the old file or the
/// new one, never a partial write.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent dir for {}", path.display()))?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}

// ── Scheduled tasks ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Cron,
    Interval,
    Once,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Cron => write!(f, "cron"),
            TaskKind::Interval => write!(f, "interval"),
            TaskKind::Once => write!(f, "once"),
        }
    }
}

/// One scheduled task record. Cancellation flips `active` instead of deleting
/// the record so the task file doubles as an audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub prompt: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub value: String,
    pub channel: String,
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_tier: Option<String>,
}

/// Generate an 8-char task id that does not collide with any existing record,
/// active or not.
pub fn generate_task_id(existing: &[ScheduledTask]) -> String {
    loop {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        if !existing.iter().any(|t| t.id == id) {
            return id;
        }
    }
}

/// Sole owner of the scheduled-tasks file. Every read and write goes through
/// [`TaskStore::lock`]; the returned guard is the process-wide advisory lock
/// shared by the scheduler and the schedule/cancel tools.
pub struct TaskStore {
    path: PathBuf,
    lock: Mutex<()>,
}

pub struct TaskStoreGuard<'a> {
    path: &'a Path,
    _held: MutexGuard<'a, ()>,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn lock(&self) -> TaskStoreGuard<'_> {
        TaskStoreGuard {
            path: &self.path,
            _held: self.lock.lock().await,
        }
    }
}

impl TaskStoreGuard<'_> {
    /// Load the full task list. A missing file is an empty list; a corrupt
    /// file is a hard error — records are never silently discarded.
    pub fn load(&self) -> Result<Vec<ScheduledTask>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(self.path)
            .with_context(|| format!("reading tasks file {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("tasks file {} is corrupt", self.path.display()))
    }

    pub fn replace(&self, tasks: &[ScheduledTask]) -> Result<()> {
        let data = serde_json::to_vec_pretty(tasks)?;
        write_atomic(self.path, &data)
            .with_context(|| format!("writing tasks file {}", self.path.display()))
    }
}

// ── Generic JSON key/value store ──

/// JSON-file-backed key/value store for small state that must survive
/// restarts (bridge user sessions, session-reset counters). Reads come from
/// the in-memory cache; every mutation rewrites the file atomically while
/// holding the store mutex.
pub struct JsonStore {
    path: PathBuf,
    data: Mutex<HashMap<String, serde_json::Value>>,
}

impl JsonStore {
    /// Open a store, loading existing contents. A missing file starts empty;
    /// a corrupt file is a hard error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading state file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("state file {} is corrupt", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.data.lock().await;
        data.get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut data = self.data.lock().await;
        data.insert(key.to_string(), serde_json::to_value(value)?);
        self.save(&data)
    }

    /// Remove a key. Returns true if it was present.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut data = self.data.lock().await;
        if data.remove(key).is_some() {
            self.save(&data)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn all(&self) -> HashMap<String, serde_json::Value> {
        self.data.lock().await.clone()
    }

    fn save(&self, data: &HashMap<String, serde_json::Value>) -> Result<()> {
        let raw = serde_json::to_vec_pretty(data)?;
        write_atomic(&self.path, &raw)
            .with_context(|| format!("writing state file {}", self.path.display()))?;
        debug!("Persisted {} ({} keys)", self.path.display(), data.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(id: &str) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            prompt: "check the weather".to_string(),
            kind: TaskKind::Interval,
            value: "3600".to_string(),
            channel: "telegram".to_string(),
            chat_id: "42".to_string(),
            created_at: Utc::now(),
            last_run: None,
            active: true,
            model_tier: None,
        }
    }

    #[tokio::test]
    async fn missing_tasks_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks.json"));
        let guard = store.lock().await;
        assert!(guard.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks.json"));
        let guard = store.lock().await;
        let tasks = vec![sample_task("ab12cd34")];
        guard.replace(&tasks).unwrap();
        assert_eq!(guard.load().unwrap(), tasks);
    }

    #[tokio::test]
    async fn corrupt_tasks_file_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, "[{\"id\": truncated").unwrap();
        let store = TaskStore::new(&path);
        let guard = store.lock().await;
        assert!(guard.load().is_err());
    }

    #[test]
    fn task_id_is_eight_chars_and_avoids_collisions() {
        let existing = vec![sample_task("ab12cd34")];
        for _ in 0..32 {
            let id = generate_task_id(&existing);
            assert_eq!(id.len(), 8);
            assert_ne!(id, "ab12cd34");
        }
    }

    #[test]
    fn task_serializes_with_type_field() {
        let json = serde_json::to_value(sample_task("ab12cd34")).unwrap();
        assert_eq!(json["type"], "interval");
        assert_eq!(json["active"], true);
        assert!(json.get("model_tier").is_none());
    }

    #[tokio::test]
    async fn json_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = JsonStore::open(&path).unwrap();
            store.set("telegram_42", &7u64).await.unwrap();
        }
        let store = JsonStore::open(&path).unwrap();
        assert_eq!(store.get::<u64>("telegram_42").await, Some(7));
        assert!(store.delete("telegram_42").await.unwrap());
        assert!(!store.delete("telegram_42").await.unwrap());
    }

    #[tokio::test]
    async fn json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(JsonStore::open(&path).is_err());
    }
}
