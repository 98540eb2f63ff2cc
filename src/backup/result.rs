// pgvault/src/backup/result.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use super::writer::WrittenFile;
use crate::catalog::{DatabaseObject, ObjectId, ObjectKind};
use crate::errors::{BackupError, ErrorKind};
use crate::export::FormatOptions;

/// One object that was written in full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub object_id: ObjectId,
    pub kind: ObjectKind,
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

impl BackupFile {
    pub(crate) fn new(object: &DatabaseObject, written: WrittenFile) -> Self {
        Self {
            object_id: object.id.clone(),
            kind: object.kind,
            path: written.path,
            bytes: written.bytes,
            sha256: written.sha256,
        }
    }
}

/// Why one object did not make it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectError {
    pub object_id: ObjectId,
    pub kind: ErrorKind,
    pub message: String,
}

impl ObjectError {
    pub(crate) fn new(object_id: ObjectId, err: &BackupError) -> Self {
        Self {
            object_id,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum TaskOutcome {
    Done(BackupFile),
    Failed(ObjectError),
    /// `attempted` is false when the task never left the queue.
    Cancelled { object_id: ObjectId, attempted: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    PartiallyFailed,
    Cancelled,
    Aborted { reason: String },
}

/// Lifecycle of a run as seen through its handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    CatalogLoaded,
    Running,
    Finished(RunOutcome),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Finished(_))
    }
}

/// Aggregate outcome of a run. Also the shape of the run manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupResult {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    /// True only when every selected object was written.
    pub success: bool,
    pub options: FormatOptions,
    /// Sorted by object id.
    pub files: Vec<BackupFile>,
    pub errors: Vec<ObjectError>,
    pub cancelled: Vec<ObjectId>,
    pub total: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl BackupResult {
    pub(crate) fn aggregate(
        run_id: Uuid,
        options: FormatOptions,
        started_at: DateTime<Utc>,
        duration: Duration,
        outcomes: Vec<TaskOutcome>,
        abort_reason: Option<String>,
    ) -> Self {
        let total = outcomes.len();
        let mut files = Vec::new();
        let mut errors = Vec::new();
        let mut cancelled = Vec::new();
        let mut attempted = 0;

        for outcome in outcomes {
            match outcome {
                TaskOutcome::Done(file) => {
                    attempted += 1;
                    files.push(file);
                }
                TaskOutcome::Failed(err) => {
                    attempted += 1;
                    errors.push(err);
                }
                TaskOutcome::Cancelled { object_id, attempted: started } => {
                    if started {
                        attempted += 1;
                    }
                    cancelled.push(object_id);
                }
            }
        }
        files.sort_by(|a, b| a.object_id.cmp(&b.object_id));
        errors.sort_by(|a, b| a.object_id.cmp(&b.object_id));
        cancelled.sort();

        let outcome = if let Some(reason) = abort_reason {
            RunOutcome::Aborted { reason }
        } else if !cancelled.is_empty() {
            RunOutcome::Cancelled
        } else if errors.is_empty() {
            RunOutcome::Completed
        } else {
            RunOutcome::PartiallyFailed
        };

        Self {
            run_id,
            success: outcome == RunOutcome::Completed,
            outcome,
            options,
            succeeded: files.len(),
            files,
            errors,
            cancelled,
            total,
            attempted,
            started_at,
            finished_at: Utc::now(),
            duration,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
