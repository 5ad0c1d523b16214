use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tracing::{debug, info, warn};

use super::{read_optional, validate_module, write_atomic, PersistenceError, WriterMetadata};
use crate::collaborators::{Checkpoint, CheckpointSink, CheckpointTrigger, SessionManager};

const SESSION_FILE: &str = "session.json";
const CHECKPOINT_DIR: &str = "checkpoints";
const LATEST_FILE: &str = "latest.json";

/// Checkpoint files kept per module unless configured otherwise
pub const DEFAULT_MAX_CHECKPOINTS: usize = 200;

fn checkpoint_file_name(sequence: u64, trigger: CheckpointTrigger) -> String {
    format!("{:06}-{}.json", sequence, trigger.slug())
}

fn file_sequence(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    if !name.ends_with(".json") {
        return None;
    }
    name.split('-').next()?.parse().ok()
}

/// One module's session as stored in `session.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub module: String,
    pub created_at: DateTime<Utc>,
    pub last_resumed_at: DateTime<Utc>,
    pub resume_count: u32,
    pub writer: WriterMetadata,
}

/// A checkpoint plus its position in the module's checkpoint sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCheckpoint {
    pub sequence: u64,
    #[serde(flatten)]
    pub checkpoint: Checkpoint,
    pub writer: WriterMetadata,
}

/// Sessions and checkpoints under `<state_dir>/<module>/`
///
/// Only the newest `max_checkpoints` checkpoint files are kept per module.
/// The last sequence number is read from disk once per module and then
/// tracked in memory, shared between clones of the store.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    state_dir: PathBuf,
    max_checkpoints: usize,
    sequences: Arc<Mutex<HashMap<String, u64>>>,
}

impl FileSessionStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
            sequences: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 0 keeps every checkpoint
    pub fn with_max_checkpoints(mut self, max_checkpoints: usize) -> Self {
        self.max_checkpoints = max_checkpoints;
        self
    }

    fn sequences(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.sequences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn module_dir(&self, module: &str) -> Result<PathBuf, PersistenceError> {
        validate_module(module)?;
        Ok(self.state_dir.join(module))
    }

    fn checkpoint_dir(&self, module: &str) -> Result<PathBuf, PersistenceError> {
        Ok(self.module_dir(module)?.join(CHECKPOINT_DIR))
    }

    pub async fn load_session(&self, module: &str) -> Result<Option<SessionRecord>, PersistenceError> {
        let path = self.module_dir(module)?.join(SESSION_FILE);
        match read_optional(&path).await? {
            Some(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            None => Ok(None),
        }
    }

    /// Resume the stored session, or start a new one when none exists or the
    /// stored one cannot be read
    pub async fn open_session(&self, module: &str) -> Result<SessionRecord, PersistenceError> {
        let path = self.module_dir(module)?.join(SESSION_FILE);
        let now = Utc::now();

        let existing = match self.load_session(module).await {
            Ok(existing) => existing,
            Err(PersistenceError::SerializationError(e)) => {
                warn!(module = %module, file = ?path, error = %e, "Session file unreadable, starting a new session");
                None
            }
            Err(e) => return Err(e),
        };

        let record = match existing {
            Some(mut record) => {
                record.last_resumed_at = now;
                record.resume_count = record.resume_count.saturating_add(1);
                record.writer = WriterMetadata::current();
                info!(
                    module = %module,
                    session_id = %record.session_id,
                    resume_count = record.resume_count,
                    "Resuming session"
                );
                record
            }
            None => {
                let record = SessionRecord {
                    session_id: uuid::Uuid::new_v4().to_string(),
                    module: module.to_string(),
                    created_at: now,
                    last_resumed_at: now,
                    resume_count: 0,
                    writer: WriterMetadata::current(),
                };
                info!(module = %module, session_id = %record.session_id, "Created session");
                record
            }
        };

        write_atomic(&path, serde_json::to_string_pretty(&record)?.as_bytes()).await?;
        Ok(record)
    }

    /// Sequenced checkpoint files in the directory, in no particular order
    async fn scan_checkpoints(&self, dir: &Path) -> Result<Vec<(u64, PathBuf)>, PersistenceError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(sequence) = file_sequence(&path) {
                files.push((sequence, path));
            }
        }
        Ok(files)
    }

    /// Reserve the next sequence number. The second value is true when the
    /// directory had to be scanned.
    async fn next_sequence(&self, module: &str, dir: &Path) -> Result<(u64, bool), PersistenceError> {
        let cached = self.sequences().get_mut(module).map(|last| {
            *last += 1;
            *last
        });
        if let Some(sequence) = cached {
            return Ok((sequence, false));
        }

        let on_disk = self
            .scan_checkpoints(dir)
            .await?
            .into_iter()
            .map(|(sequence, _)| sequence)
            .max()
            .unwrap_or(0);
        let mut sequences = self.sequences();
        let last = sequences.entry(module.to_string()).or_insert(on_disk);
        *last += 1;
        Ok((*last, true))
    }

    async fn remove_checkpoint_file(&self, path: &Path) -> bool {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!(file = ?path, "Removed old checkpoint file");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(file = ?path, error = %e, "Failed to remove old checkpoint file");
                false
            }
        }
    }

    /// Drop checkpoint files older than the newest `max_checkpoints`. After a
    /// scan every stale file goes; otherwise only the one just pushed out.
    async fn prune_checkpoints(&self, module: &str, dir: &Path, newest: u64, scanned: bool) {
        if self.max_checkpoints == 0 {
            return;
        }
        let Some(cutoff) = newest.checked_sub(self.max_checkpoints as u64) else {
            return;
        };
        if cutoff == 0 {
            return;
        }

        if scanned {
            let files = match self.scan_checkpoints(dir).await {
                Ok(files) => files,
                Err(e) => {
                    warn!(module = %module, error = %e, "Could not list checkpoints for cleanup");
                    return;
                }
            };
            let mut cleaned_count = 0;
            for (_, path) in files.iter().filter(|(sequence, _)| *sequence <= cutoff) {
                if self.remove_checkpoint_file(path).await {
                    cleaned_count += 1;
                }
            }
            if cleaned_count > 0 {
                info!(module = %module, cleaned_count, "Cleaned up old checkpoints");
            }
        } else {
            for trigger in CheckpointTrigger::ALL {
                self.remove_checkpoint_file(&dir.join(checkpoint_file_name(cutoff, trigger)))
                    .await;
            }
        }
    }

    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<StoredCheckpoint, PersistenceError> {
        let dir = self.checkpoint_dir(&checkpoint.module)?;
        fs::create_dir_all(&dir).await?;

        let (sequence, scanned) = self.next_sequence(&checkpoint.module, &dir).await?;
        let stored = StoredCheckpoint {
            sequence,
            checkpoint: checkpoint.clone(),
            writer: WriterMetadata::current(),
        };
        let serialized = serde_json::to_string_pretty(&stored)?;

        let file = dir.join(checkpoint_file_name(sequence, checkpoint.trigger));
        write_atomic(&file, serialized.as_bytes()).await?;
        write_atomic(
            &self.module_dir(&checkpoint.module)?.join(LATEST_FILE),
            serialized.as_bytes(),
        )
        .await?;

        debug!(
            module = %checkpoint.module,
            sequence = stored.sequence,
            trigger = ?checkpoint.trigger,
            file = ?file,
            "Checkpoint written"
        );

        self.prune_checkpoints(&checkpoint.module, &dir, sequence, scanned)
            .await;
        Ok(stored)
    }

    pub async fn load_latest(&self, module: &str) -> Result<Option<StoredCheckpoint>, PersistenceError> {
        let path = self.module_dir(module)?.join(LATEST_FILE);
        let Some(contents) = read_optional(&path).await? else {
            return Ok(None);
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| PersistenceError::StateCorruption {
                path,
                reason: e.to_string(),
            })
    }

    /// All checkpoints for a module, oldest first
    pub async fn list_checkpoints(&self, module: &str) -> Result<Vec<StoredCheckpoint>, PersistenceError> {
        let dir = self.checkpoint_dir(module)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(&path).await?;
            match serde_json::from_str::<StoredCheckpoint>(&contents) {
                Ok(stored) => checkpoints.push(stored),
                Err(e) => warn!(file = ?path, error = %e, "Skipping unreadable checkpoint"),
            }
        }

        checkpoints.sort_by_key(|c| c.sequence);
        Ok(checkpoints)
    }
}

#[async_trait]
impl SessionManager for FileSessionStore {
    async fn create_or_resume(&self, module: &str) -> anyhow::Result<String> {
        Ok(self.open_session(module).await?.session_id)
    }
}

#[async_trait]
impl CheckpointSink for FileSessionStore {
    async fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        self.save_checkpoint(checkpoint).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CheckpointMetrics, CheckpointTrigger};
    use crate::workflow::WorkflowStep;
    use tempfile::TempDir;

    fn checkpoint(module: &str, trigger: CheckpointTrigger, iteration: u32) -> Checkpoint {
        Checkpoint {
            trigger,
            session_id: "session-1".to_string(),
            module: module.to_string(),
            step: WorkflowStep::BreakIntoTasks,
            phase: WorkflowStep::BreakIntoTasks.phase(),
            iteration,
            metrics: CheckpointMetrics {
                total_tokens: 1200,
                premium_requests: 1,
                consecutive_failures: 0,
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_session_is_resumed() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp_dir.path());

        let first = store.open_session("billing").await.unwrap();
        let second = store.open_session("billing").await.unwrap();

        assert_eq!(first.session_id, second.session_id);
        assert_eq!(first.resume_count, 0);
        assert_eq!(second.resume_count, 1);
        assert_eq!(second.writer.pid, std::process::id());
    }

    #[tokio::test]
    async fn test_corrupt_session_starts_fresh() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("billing")).unwrap();
        std::fs::write(temp_dir.path().join("billing/session.json"), "{not json").unwrap();

        let store = FileSessionStore::new(temp_dir.path());
        let record = store.open_session("billing").await.unwrap();
        assert_eq!(record.resume_count, 0);
        assert_eq!(store.load_session("billing").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_checkpoints_are_sequenced() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp_dir.path());

        store
            .save_checkpoint(&checkpoint("billing", CheckpointTrigger::StepCompletion, 1))
            .await
            .unwrap();
        let second = store
            .save_checkpoint(&checkpoint("billing", CheckpointTrigger::PhaseTransition, 2))
            .await
            .unwrap();

        assert_eq!(second.sequence, 2);
        assert!(temp_dir
            .path()
            .join("billing/checkpoints/000002-phase-transition.json")
            .exists());

        let latest = store.load_latest("billing").await.unwrap().unwrap();
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.checkpoint.trigger, CheckpointTrigger::PhaseTransition);

        let all = store.list_checkpoints("billing").await.unwrap();
        let iterations: Vec<u32> = all.iter().map(|c| c.checkpoint.iteration).collect();
        assert_eq!(iterations, vec![1, 2]);
    }

    fn checkpoint_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.join("billing/checkpoints"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_only_the_newest_checkpoints_are_kept() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp_dir.path()).with_max_checkpoints(5);

        for iteration in 1..=40 {
            let trigger = CheckpointTrigger::ALL[iteration as usize % CheckpointTrigger::ALL.len()];
            store
                .save_checkpoint(&checkpoint("billing", trigger, iteration))
                .await
                .unwrap();
        }

        assert_eq!(checkpoint_files(temp_dir.path()).len(), 5);
        let sequences: Vec<u64> = store
            .list_checkpoints("billing")
            .await
            .unwrap()
            .iter()
            .map(|c| c.sequence)
            .collect();
        assert_eq!(sequences, vec![36, 37, 38, 39, 40]);
        assert_eq!(store.load_latest("billing").await.unwrap().unwrap().sequence, 40);
    }

    #[tokio::test]
    async fn test_new_store_continues_sequence_and_prunes_backlog() {
        let temp_dir = TempDir::new().unwrap();
        let unlimited = FileSessionStore::new(temp_dir.path()).with_max_checkpoints(0);
        for iteration in 1..=6 {
            unlimited
                .save_checkpoint(&checkpoint("billing", CheckpointTrigger::StepCompletion, iteration))
                .await
                .unwrap();
        }
        assert_eq!(checkpoint_files(temp_dir.path()).len(), 6);

        let limited = FileSessionStore::new(temp_dir.path()).with_max_checkpoints(2);
        let stored = limited
            .save_checkpoint(&checkpoint("billing", CheckpointTrigger::UserPause, 7))
            .await
            .unwrap();

        assert_eq!(stored.sequence, 7);
        assert_eq!(
            checkpoint_files(temp_dir.path()),
            vec!["000006-step-completion.json", "000007-user-pause.json"]
        );
    }

    #[tokio::test]
    async fn test_clones_share_the_sequence() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp_dir.path());
        let clone = store.clone();

        store
            .save_checkpoint(&checkpoint("billing", CheckpointTrigger::StepCompletion, 1))
            .await
            .unwrap();
        let second = clone
            .save_checkpoint(&checkpoint("billing", CheckpointTrigger::StepCompletion, 2))
            .await
            .unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(checkpoint_files(temp_dir.path()).len(), 2);
    }

    #[tokio::test]
    async fn test_missing_module_has_no_checkpoints() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp_dir.path());
        assert!(store.load_latest("billing").await.unwrap().is_none());
        assert!(store.list_checkpoints("billing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_like_module_names() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp_dir.path());
        assert!(matches!(
            store.open_session("../escape").await,
            Err(PersistenceError::InvalidModule { .. })
        ));
    }
}
