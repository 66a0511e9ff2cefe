use crate::errors::SongbirdError;
use crate::logging::append_run_log;
use crate::runtime::{format_rfc3339, Clock, FileSystem};
use crate::task_identity::compute_task_id;
use crate::types::{RecordingMeasurement, SessionState, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CHECKPOINT_VERSION: u32 = 1;
pub const INTERRUPTED_DETAIL: &str = "interrupted before completion";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub version: u32,
    pub created_at: String,
    pub last_updated: String,
    pub session_state: SessionState,
    pub sessions_started: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingTask {
    pub task_id: String,
    pub speaker: String,
    pub mode: String,
    pub source_file: String,
    pub output_path: PathBuf,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
    pub attempts: u32,
    pub validation: Option<RecordingMeasurement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CheckpointDocument {
    metadata: CheckpointMetadata,
    tasks: BTreeMap<String, RecordingTask>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed
    }
}

/// Legal task transitions. COMPLETED → FAILED is re-validation demotion and
/// FAILED → PENDING is an explicit reset.
pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), SongbirdError> {
    let allowed = matches!(
        (from, to),
        (TaskStatus::Pending, TaskStatus::Running)
            | (TaskStatus::Running, TaskStatus::Completed)
            | (TaskStatus::Running, TaskStatus::Failed)
            | (TaskStatus::Failed, TaskStatus::Running)
            | (TaskStatus::Failed, TaskStatus::Pending)
            | (TaskStatus::Completed, TaskStatus::Failed)
    );
    if allowed {
        Ok(())
    } else {
        Err(SongbirdError::Checkpoint(format!(
            "invalid task transition {} -> {}",
            from.as_str(),
            to.as_str()
        )))
    }
}

/// Persisted registry of recording tasks for one results directory.
/// Every mutation rewrites the whole document through a temp file and rename.
pub struct CheckpointStore {
    path: PathBuf,
    file_system: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    doc: CheckpointDocument,
}

impl CheckpointStore {
    /// Loads the checkpoint at `path`, or creates it. Tasks left RUNNING by a crashed
    /// session are demoted to FAILED.
    pub fn open(
        path: impl AsRef<Path>,
        file_system: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SongbirdError> {
        let path = path.as_ref().to_path_buf();
        if !file_system.exists(&path) {
            let now = format_rfc3339(clock.now());
            let mut store = Self {
                doc: fresh_document(&now),
                path,
                file_system,
                clock,
            };
            store.persist()?;
            append_run_log(
                "info",
                "checkpoint.created",
                json!({ "path": store.path.display().to_string() }),
            );
            return Ok(store);
        }

        let raw = file_system.read_to_string(&path)?;
        let doc: CheckpointDocument = serde_json::from_str(&raw).map_err(|e| {
            SongbirdError::Checkpoint(format!("corrupt checkpoint {}: {e}", path.display()))
        })?;
        if doc.metadata.version > CHECKPOINT_VERSION {
            return Err(SongbirdError::Checkpoint(format!(
                "checkpoint {} has version {}, newer than supported {}",
                path.display(),
                doc.metadata.version,
                CHECKPOINT_VERSION
            )));
        }

        let mut store = Self {
            path,
            file_system,
            clock,
            doc,
        };
        let demoted = store.demote_interrupted()?;
        append_run_log(
            "info",
            "checkpoint.loaded",
            json!({
                "path": store.path.display().to_string(),
                "tasks": store.doc.tasks.len(),
                "interrupted_demoted": demoted,
            }),
        );
        Ok(store)
    }

    fn demote_interrupted(&mut self) -> Result<usize, SongbirdError> {
        let now = self.now();
        let mut demoted = 0;
        for task in self.doc.tasks.values_mut() {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Failed;
                task.last_error = Some(INTERRUPTED_DETAIL.to_string());
                task.updated_at = now.clone();
                demoted += 1;
            }
        }
        if demoted > 0 {
            self.persist()?;
        }
        Ok(demoted)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &CheckpointMetadata {
        &self.doc.metadata
    }

    /// Idempotent: an identity already present keeps its status and history.
    pub fn register_task(
        &mut self,
        speaker: &str,
        mode: &str,
        source_file: &str,
        output_path: &Path,
    ) -> Result<String, SongbirdError> {
        let task_id = compute_task_id(speaker, mode, source_file);
        if self.doc.tasks.contains_key(&task_id) {
            return Ok(task_id);
        }
        let task = RecordingTask {
            task_id: task_id.clone(),
            speaker: speaker.trim().to_string(),
            mode: mode.trim().to_string(),
            source_file: source_file.trim().to_string(),
            output_path: output_path.to_path_buf(),
            status: TaskStatus::Pending,
            last_error: None,
            completed_at: None,
            updated_at: self.now(),
            attempts: 0,
            validation: None,
        };
        self.doc.tasks.insert(task_id.clone(), task);
        self.persist()?;
        Ok(task_id)
    }

    pub fn is_completed(&self, speaker: &str, mode: &str, source_file: &str) -> bool {
        self.doc
            .tasks
            .get(&compute_task_id(speaker, mode, source_file))
            .is_some_and(|task| task.status == TaskStatus::Completed)
    }

    pub fn get(&self, task_id: &str) -> Option<&RecordingTask> {
        self.doc.tasks.get(task_id)
    }

    /// All tasks ordered by speaker, source file, then mode.
    pub fn tasks(&self) -> Vec<&RecordingTask> {
        let mut tasks = self.doc.tasks.values().collect::<Vec<_>>();
        tasks.sort_by(|a, b| {
            (&a.speaker, &a.source_file, &a.mode).cmp(&(&b.speaker, &b.source_file, &b.mode))
        });
        tasks
    }

    pub fn failed_tasks(&self) -> Vec<&RecordingTask> {
        self.tasks()
            .into_iter()
            .filter(|task| task.status == TaskStatus::Failed)
            .collect()
    }

    pub fn mark_running(&mut self, task_id: &str) -> Result<(), SongbirdError> {
        self.transition(task_id, TaskStatus::Running, |task| {
            task.attempts += 1;
            task.last_error = None;
        })
    }

    pub fn mark_completed(
        &mut self,
        task_id: &str,
        measurement: Option<RecordingMeasurement>,
    ) -> Result<(), SongbirdError> {
        let now = self.now();
        self.transition(task_id, TaskStatus::Completed, move |task| {
            task.completed_at = Some(now);
            task.last_error = None;
            task.validation = measurement;
        })
    }

    /// Also used to demote a COMPLETED task whose output failed re-validation.
    pub fn mark_failed(&mut self, task_id: &str, detail: &str) -> Result<(), SongbirdError> {
        self.transition(task_id, TaskStatus::Failed, |task| {
            task.last_error = Some(detail.to_string());
            task.completed_at = None;
        })
    }

    fn transition(
        &mut self,
        task_id: &str,
        to: TaskStatus,
        update: impl FnOnce(&mut RecordingTask),
    ) -> Result<(), SongbirdError> {
        let now = self.now();
        let task = self
            .doc
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SongbirdError::Checkpoint(format!("unknown task {task_id}")))?;
        validate_transition(task.status, to)?;
        let from = task.status;
        task.status = to;
        task.updated_at = now;
        update(task);
        append_run_log(
            "debug",
            "checkpoint.task.transition",
            json!({ "task_id": task_id, "from": from.as_str(), "to": to.as_str() }),
        );
        self.persist()
    }

    pub fn summary(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.doc.tasks.values() {
            counts.add(task.status);
        }
        counts
    }

    /// FAILED → PENDING for every failed task. Returns how many were reset.
    pub fn reset_failed(&mut self) -> Result<usize, SongbirdError> {
        let now = self.now();
        let mut reset = 0;
        for task in self.doc.tasks.values_mut() {
            if task.status == TaskStatus::Failed {
                validate_transition(task.status, TaskStatus::Pending)?;
                task.status = TaskStatus::Pending;
                task.last_error = None;
                task.updated_at = now.clone();
                reset += 1;
            }
        }
        if reset > 0 {
            self.persist()?;
        }
        append_run_log("info", "checkpoint.failed_reset", json!({ "reset": reset }));
        Ok(reset)
    }

    /// Marks the start of a session run and bumps the run counter.
    pub fn begin_session(&mut self) -> Result<(), SongbirdError> {
        self.doc.metadata.sessions_started += 1;
        self.set_session_state(SessionState::Running)
    }

    pub fn set_session_state(&mut self, state: SessionState) -> Result<(), SongbirdError> {
        self.doc.metadata.session_state = state;
        self.persist()
    }

    /// Deletes the checkpoint file and forgets every task.
    pub fn clean(&mut self) -> Result<(), SongbirdError> {
        if self.file_system.exists(&self.path) {
            self.file_system.remove_file(&self.path)?;
        }
        let removed = self.doc.tasks.len();
        self.doc = fresh_document(&self.now());
        append_run_log(
            "info",
            "checkpoint.cleaned",
            json!({ "path": self.path.display().to_string(), "tasks_removed": removed }),
        );
        Ok(())
    }

    /// Pipe-delimited text export: `speaker|mode|source|output|status|timestamp`.
    pub fn export_legacy(&self, path: &Path) -> Result<usize, SongbirdError> {
        let mut out = String::new();
        out.push_str("# Recording progress checkpoint\n");
        out.push_str(&format!("# Generated on {}\n", self.now()));
        out.push_str("# Format: speaker|mode|source|output|status|timestamp\n");
        let tasks = self.tasks();
        for task in &tasks {
            let timestamp = task.completed_at.as_deref().unwrap_or(&task.updated_at);
            out.push_str(&format!(
                "{}|{}|{}|{}|{}|{}\n",
                task.speaker,
                task.mode,
                task.source_file,
                task.output_path.display(),
                task.status.as_str(),
                timestamp
            ));
        }
        self.file_system.write_string(path, &out)?;
        Ok(tasks.len())
    }

    fn persist(&mut self) -> Result<(), SongbirdError> {
        self.doc.metadata.last_updated = self.now();
        let payload = serde_json::to_string_pretty(&self.doc)
            .map_err(|e| SongbirdError::Checkpoint(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            self.file_system.create_dir_all(parent)?;
        }
        let tmp = temp_path(&self.path);
        self.file_system.write_string(&tmp, &payload)?;
        self.file_system.rename(&tmp, &self.path)
    }

    fn now(&self) -> String {
        format_rfc3339(self.clock.now())
    }
}

fn fresh_document(now: &str) -> CheckpointDocument {
    CheckpointDocument {
        metadata: CheckpointMetadata {
            version: CHECKPOINT_VERSION,
            created_at: now.to_string(),
            last_updated: now.to_string(),
            session_state: SessionState::Fresh,
            sessions_started: 0,
        },
        tasks: BTreeMap::new(),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
