// pgvault/src/backup/task.rs
//! One object's trip through export, compression and write.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use super::compression;
use super::logic::RunContext;
use super::result::{BackupFile, ObjectError, TaskOutcome};
use crate::catalog::{DatabaseObject, ObjectId};
use crate::errors::{BackupError, ErrorKind, Result};
use crate::progress::{EventKind, ProgressReporter};
use crate::source::ByteStream;

/// Progress for objects of unknown size is reported every this many bytes.
const UNKNOWN_SIZE_STEP: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Queued,
    Exporting,
    Compressing,
    Writing,
    Done,
    Failed,
    Cancelled,
}

impl TaskStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStage::Done | TaskStage::Failed | TaskStage::Cancelled)
    }

    /// Stages only move forward, one step at a time, until a terminal state.
    /// Failure and cancellation are reachable from any live stage.
    pub fn can_advance_to(&self, next: TaskStage) -> bool {
        use TaskStage::*;
        match (*self, next) {
            (Queued, Exporting) | (Exporting, Compressing) | (Compressing, Writing) | (Writing, Done) => {
                true
            }
            (current, Failed | Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupTask {
    pub object: DatabaseObject,
    pub destination: PathBuf,
    stage: TaskStage,
}

impl BackupTask {
    pub fn new(object: DatabaseObject, destination: PathBuf) -> Self {
        Self {
            object,
            destination,
            stage: TaskStage::Queued,
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.object.id
    }

    pub fn stage(&self) -> TaskStage {
        self.stage
    }

    pub fn advance(&mut self, next: TaskStage) -> Result<()> {
        if !self.stage.can_advance_to(next) {
            return Err(BackupError::Internal(format!(
                "illegal transition {:?} -> {:?} for {}",
                self.stage, next, self.object.id
            )));
        }
        self.stage = next;
        Ok(())
    }
}

/// Counts uncompressed bytes on their way to the compressor and reports them.
///
/// Percent is capped at 99 until the task completes, since the estimate can
/// undershoot.
fn track_progress(upstream: ByteStream, reporter: ProgressReporter, id: ObjectId, estimate: Option<u64>) -> ByteStream {
    let estimate = estimate.filter(|b| *b > 0);
    let mut seen: u64 = 0;
    let mut last_percent: Option<u8> = None;
    let mut last_report: u64 = 0;

    upstream
        .map(move |item| {
            if let Ok(chunk) = &item {
                seen += chunk.len() as u64;
                match estimate {
                    Some(total) => {
                        let percent = ((seen.saturating_mul(100)) / total).min(99) as u8;
                        if last_percent != Some(percent) {
                            last_percent = Some(percent);
                            reporter.task(&id, EventKind::Progress { percent: Some(percent), bytes: seen });
                        }
                    }
                    None => {
                        if seen - last_report >= UNKNOWN_SIZE_STEP {
                            last_report = seen;
                            reporter.task(&id, EventKind::Progress { percent: None, bytes: seen });
                        }
                    }
                }
            }
            item
        })
        .boxed()
}

impl RunContext {
    fn enter(&self, task: &mut BackupTask, stage: TaskStage) -> Result<()> {
        task.advance(stage)?;
        self.reporter.task(task.id(), EventKind::Stage { stage });
        Ok(())
    }

    fn cancel_task(&self, mut task: BackupTask, attempted: bool) -> TaskOutcome {
        if let Err(e) = task.advance(TaskStage::Cancelled) {
            error!(error = %e, "task state");
        }
        debug!(object = %task.id(), "task cancelled");
        self.reporter.task(task.id(), EventKind::Cancelled);
        TaskOutcome::Cancelled {
            object_id: task.object.id,
            attempted,
        }
    }

    fn fail_task(&self, mut task: BackupTask, err: BackupError) -> TaskOutcome {
        if let Err(e) = task.advance(TaskStage::Failed) {
            error!(error = %e, "task state");
        }
        match err.kind() {
            ErrorKind::Compression | ErrorKind::Internal => {
                error!(object = %task.id(), error = %err, "task failed")
            }
            _ => warn!(object = %task.id(), error = %err, "task failed"),
        }
        self.reporter.task(
            task.id(),
            EventKind::Failed {
                reason: err.to_string(),
            },
        );
        TaskOutcome::Failed(ObjectError::new(task.object.id, &err))
    }
}

/// Runs one task to a terminal stage. Never returns an error: failures and
/// cancellation are folded into the outcome so siblings are unaffected.
pub(crate) async fn run_task(ctx: Arc<RunContext>, slots: Arc<Semaphore>, mut task: BackupTask) -> TaskOutcome {
    ctx.reporter.task(task.id(), EventKind::Stage { stage: TaskStage::Queued });

    let _permit = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return ctx.cancel_task(task, false),
        permit = slots.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return ctx.cancel_task(task, false),
        },
    };
    if ctx.cancel.is_cancelled() {
        return ctx.cancel_task(task, false);
    }
    ctx.reporter.task(task.id(), EventKind::Started);

    if let Err(e) = ctx.enter(&mut task, TaskStage::Exporting) {
        return ctx.fail_task(task, e);
    }
    let exported = match ctx.source.open_export(&task.object, &ctx.options).await {
        Ok(stream) => stream,
        Err(e) => return ctx.fail_task(task, e),
    };
    if ctx.cancel.is_cancelled() {
        return ctx.cancel_task(task, true);
    }

    if let Err(e) = ctx.enter(&mut task, TaskStage::Compressing) {
        return ctx.fail_task(task, e);
    }
    let tracked = track_progress(
        exported,
        ctx.reporter.clone(),
        task.object.id.clone(),
        task.object.estimated_size.bytes,
    );
    let compressed = compression::wrap(
        tracked,
        ctx.options.compression,
        ctx.options.compression_level,
        task.object.id.as_str(),
    );
    if ctx.cancel.is_cancelled() {
        return ctx.cancel_task(task, true);
    }

    if let Err(e) = ctx.enter(&mut task, TaskStage::Writing) {
        return ctx.fail_task(task, e);
    }
    match ctx
        .writer
        .write_atomically(&task.destination, &ctx.temp_tag, compressed)
        .await
    {
        Ok(written) => {
            ctx.write_failures.record_success();
            if let Err(e) = task.advance(TaskStage::Done) {
                return ctx.fail_task(task, e);
            }
            ctx.reporter.task(
                task.id(),
                EventKind::Completed {
                    path: Some(written.path.clone()),
                    bytes: written.bytes,
                },
            );
            debug!(object = %task.id(), path = %written.path.display(), bytes = written.bytes, "task done");
            TaskOutcome::Done(BackupFile::new(&task.object, written))
        }
        Err(e) => {
            if e.kind() == ErrorKind::Write && ctx.write_failures.record_failure() {
                ctx.abort(format!(
                    "{} consecutive write failures, last: {}",
                    ctx.write_failures.threshold(),
                    e
                ));
            }
            ctx.fail_task(task, e)
        }
    }
}
