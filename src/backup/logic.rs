// pgvault/src/backup/logic.rs
//! Backup Orchestrator: validates a request, fans tasks out under a
//! concurrency bound and folds their outcomes into one [`BackupResult`].

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::result::{BackupResult, ObjectError, RunOutcome, RunState, TaskOutcome};
use super::task::{BackupTask, run_task};
use super::writer::{DestinationWriter, prepare_root};
use crate::catalog::{CatalogSnapshot, ObjectId, ObjectKind, read_catalog};
use crate::errors::{BackupError, Result};
use crate::export::FormatOptions;
use crate::progress::{EventKind, ProgressReporter, Subscription};
use crate::source::{ConnectionCheck, ConnectionDescriptor, Connector, DataSource};
use crate::utils::naming;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Tasks allowed past the Queued stage at once.
    pub concurrency: usize,
    pub progress_buffer: usize,
    /// Consecutive write failures that abort the run.
    pub write_failure_threshold: usize,
    pub write_manifest: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            progress_buffer: crate::progress::DEFAULT_BUFFER,
            write_failure_threshold: 3,
            write_manifest: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub connection: ConnectionDescriptor,
    pub objects: Vec<ObjectId>,
    pub destination_root: PathBuf,
    pub options: FormatOptions,
}

/// Counts write failures in a row; any successful write resets the count.
#[derive(Debug)]
pub(crate) struct WriteFailureTracker {
    consecutive: AtomicUsize,
    threshold: usize,
}

impl WriteFailureTracker {
    pub(crate) fn new(threshold: usize) -> Self {
        Self {
            consecutive: AtomicUsize::new(0),
            threshold: threshold.max(1),
        }
    }

    /// True once the threshold is reached.
    pub(crate) fn record_failure(&self) -> bool {
        self.consecutive.fetch_add(1, Ordering::SeqCst) + 1 >= self.threshold
    }

    pub(crate) fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    pub(crate) fn threshold(&self) -> usize {
        self.threshold
    }
}

/// Everything the tasks of one run share.
pub(crate) struct RunContext {
    pub(crate) run_id: Uuid,
    pub(crate) source: Arc<dyn DataSource>,
    pub(crate) options: FormatOptions,
    pub(crate) reporter: ProgressReporter,
    pub(crate) cancel: CancellationToken,
    pub(crate) writer: DestinationWriter,
    pub(crate) temp_tag: String,
    pub(crate) write_failures: WriteFailureTracker,
    abort_reason: Mutex<Option<String>>,
}

impl RunContext {
    /// Stops the run as if cancelled, remembering the first reason given.
    pub(crate) fn abort(&self, reason: String) {
        {
            let mut slot = self.abort_reason.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_some() {
                return;
            }
            warn!(run_id = %self.run_id, reason = %reason, "aborting run");
            self.reporter.log(format!("aborting run: {}", reason));
            *slot = Some(reason);
        }
        self.cancel.cancel();
    }

    fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Cancels a run from anywhere. Idempotent; a no-op once the run is finished.
#[derive(Debug, Clone)]
pub struct RunCanceller(CancellationToken);

impl RunCanceller {
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

/// A submitted run.
pub struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    reporter: ProgressReporter,
    state: watch::Receiver<RunState>,
    join: JoinHandle<BackupResult>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Queued tasks become Cancelled; in-flight tasks stop at their next stage
    /// boundary. Completed files are kept.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!(run_id = %self.run_id, "cancellation requested");
        }
        self.cancel.cancel();
    }

    pub fn canceller(&self) -> RunCanceller {
        RunCanceller(self.cancel.clone())
    }

    pub fn subscribe(&self) -> Subscription {
        self.reporter.subscribe()
    }

    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    /// Resolves once the run reaches a terminal state.
    pub async fn wait(self) -> Result<BackupResult> {
        let run_id = self.run_id;
        self.join.await.map_err(|e| {
            if e.is_cancelled() {
                BackupError::Cancelled(format!("run {} was torn down before it finished", run_id))
            } else {
                BackupError::Internal(format!("run {} did not finish: {}", run_id, e))
            }
        })
    }
}

pub struct BackupEngine {
    connector: Arc<dyn Connector>,
    settings: EngineSettings,
    writer: DestinationWriter,
    snapshots: Mutex<HashMap<String, Arc<CatalogSnapshot>>>,
}

impl BackupEngine {
    pub fn new(connector: Arc<dyn Connector>, settings: EngineSettings) -> Self {
        Self {
            connector,
            settings,
            writer: DestinationWriter::new(),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn test_connection(&self, descriptor: &ConnectionDescriptor) -> ConnectionCheck {
        info!(target_db = %descriptor.key(), "testing connection");
        self.connector.test_connection(descriptor).await
    }

    /// Reads the catalog and keeps it as the latest snapshot for this target.
    pub async fn list_catalog(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<CatalogSnapshot>> {
        let source = self.connector.connect(descriptor).await?;
        let snapshot = Arc::new(read_catalog(source.as_ref()).await?);
        self.remember(descriptor, &snapshot);
        Ok(snapshot)
    }

    pub fn latest_snapshot(&self, descriptor: &ConnectionDescriptor) -> Option<Arc<CatalogSnapshot>> {
        let snapshots = self.snapshots.lock().unwrap_or_else(|p| p.into_inner());
        snapshots.get(&descriptor.key()).cloned()
    }

    fn remember(&self, descriptor: &ConnectionDescriptor, snapshot: &Arc<CatalogSnapshot>) {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|p| p.into_inner());
        snapshots.insert(descriptor.key(), Arc::clone(snapshot));
    }

    /// Connects, loads a fresh catalog, validates the selection and starts the
    /// run. Anything that fails before tasks start is returned here and leaves
    /// nothing on disk.
    pub async fn submit(&self, request: BackupRequest) -> Result<RunHandle> {
        let started = Instant::now();
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(RunState::Pending);
        let reporter = ProgressReporter::new(self.settings.progress_buffer);

        info!(
            run_id = %run_id,
            target_db = %request.connection.key(),
            objects = request.objects.len(),
            destination = %request.destination_root.display(),
            "submitting backup run"
        );
        if request.objects.is_empty() {
            return Err(BackupError::Validation("no objects selected".into()));
        }

        let source = self.connector.connect(&request.connection).await?;
        let snapshot = Arc::new(read_catalog(source.as_ref()).await?);
        self.remember(&request.connection, &snapshot);
        state_tx.send_replace(RunState::CatalogLoaded);
        reporter.log(format!("catalog loaded: {} objects", snapshot.len()));

        let tasks = plan_tasks(&request, &snapshot, started_at, run_id)?;
        prepare_root(&request.destination_root).await?;

        let ctx = Arc::new(RunContext {
            run_id,
            source,
            options: request.options,
            reporter: reporter.clone(),
            cancel: CancellationToken::new(),
            writer: self.writer.clone(),
            temp_tag: naming::temp_tag(run_id),
            write_failures: WriteFailureTracker::new(self.settings.write_failure_threshold),
            abort_reason: Mutex::new(None),
        });
        state_tx.send_replace(RunState::Running);
        reporter.run(EventKind::Started);

        let run = RunExecution {
            ctx: Arc::clone(&ctx),
            concurrency: self.settings.concurrency,
            destination_root: request.destination_root,
            write_manifest: self.settings.write_manifest,
            started,
            started_at,
        };
        let join = tokio::spawn(run.execute(tasks, state_tx));

        Ok(RunHandle {
            run_id,
            cancel: ctx.cancel.clone(),
            reporter,
            state: state_rx,
            join,
        })
    }
}

/// Resolves the selection against the snapshot. Every id must exist, no two
/// tasks may share a destination and no destination may already be on disk.
fn plan_tasks(
    request: &BackupRequest,
    snapshot: &CatalogSnapshot,
    started_at: DateTime<Utc>,
    run_id: Uuid,
) -> Result<Vec<BackupTask>> {
    let mut seen = HashSet::new();
    let selected: Vec<&ObjectId> = request.objects.iter().filter(|id| seen.insert(*id)).collect();

    let missing: Vec<&str> = selected
        .iter()
        .filter(|id| !snapshot.contains(id))
        .map(|id| id.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(BackupError::Validation(format!(
            "objects not found in catalog: {}",
            missing.join(", ")
        )));
    }

    let mut destinations = HashSet::new();
    let mut tasks = Vec::with_capacity(selected.len());
    for id in selected {
        let Some(object) = snapshot.get(id) else {
            continue;
        };
        let destination = request
            .destination_root
            .join(naming::backup_file_name(object, &request.options, started_at, run_id));
        if matches!(destination.try_exists(), Ok(true)) || !destinations.insert(destination.clone()) {
            return Err(BackupError::DuplicateDestination { path: destination });
        }
        tasks.push(BackupTask::new(object.clone(), destination));
    }

    // Dependencies only shape submission order: relations and functions
    // before the views built on them.
    tasks.sort_by_key(|task| submission_rank(task.object.kind));
    Ok(tasks)
}

fn submission_rank(kind: ObjectKind) -> u8 {
    match kind {
        ObjectKind::Table => 0,
        ObjectKind::Function => 1,
        ObjectKind::View => 2,
        ObjectKind::MaterializedView => 3,
    }
}

struct RunExecution {
    ctx: Arc<RunContext>,
    concurrency: usize,
    destination_root: PathBuf,
    write_manifest: bool,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl RunExecution {
    async fn execute(self, tasks: Vec<BackupTask>, state: watch::Sender<RunState>) -> BackupResult {
        let ctx = self.ctx;
        let slots = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let mut set = JoinSet::new();

        for task in tasks {
            let id = task.id().clone();
            let fut = run_task(Arc::clone(&ctx), Arc::clone(&slots), task);
            set.spawn(async move {
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => TaskOutcome::Failed(ObjectError::new(
                        id,
                        &BackupError::Internal("task panicked".into()),
                    )),
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(run_id = %ctx.run_id, error = %e, "task join failed"),
            }
        }

        let result = BackupResult::aggregate(
            ctx.run_id,
            ctx.options,
            self.started_at,
            self.started.elapsed(),
            outcomes,
            ctx.abort_reason(),
        );
        info!(
            run_id = %ctx.run_id,
            outcome = ?result.outcome,
            succeeded = result.succeeded,
            failed = result.errors.len(),
            cancelled = result.cancelled.len(),
            duration_ms = result.duration.as_millis() as u64,
            "backup run finished"
        );

        if self.write_manifest {
            let path = self
                .destination_root
                .join(naming::manifest_file_name(ctx.run_id, self.started_at));
            match serde_json::to_vec_pretty(&result) {
                Ok(json) => match ctx.writer.write_bytes(&path, &ctx.temp_tag, json).await {
                    Ok(_) => ctx.reporter.log(format!("manifest written to {}", path.display())),
                    Err(e) => warn!(error = %e, "could not write run manifest"),
                },
                Err(e) => warn!(error = %e, "could not serialise run manifest"),
            }
        }

        match &result.outcome {
            RunOutcome::Completed => ctx.reporter.run(EventKind::Completed {
                path: None,
                bytes: result.bytes_written(),
            }),
            RunOutcome::Cancelled => ctx.reporter.run(EventKind::Cancelled),
            RunOutcome::PartiallyFailed => ctx.reporter.run(EventKind::Failed {
                reason: format!("{} of {} objects failed", result.errors.len(), result.total),
            }),
            RunOutcome::Aborted { reason } => ctx.reporter.run(EventKind::Failed {
                reason: reason.clone(),
            }),
        }
        state.send_replace(RunState::Finished(result.outcome.clone()));
        ctx.reporter.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::compression::{self, CompressionKind};
    use crate::backup::task::TaskStage;
    use crate::errors::ErrorKind;
    use crate::progress::{EventScope, ProgressEvent};
    use crate::source::Secret;
    use crate::source::fake::{FakeConnector, FakeSource, fake_object};
    use std::path::Path;
    use std::time::Duration;

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::new("localhost", 5432, "app", "backup", Secret::new("pw"))
    }

    fn tables(n: usize) -> Vec<crate::catalog::DatabaseObject> {
        (1..=n)
            .map(|i| fake_object(&format!("public.t{}", i), ObjectKind::Table, 200))
            .collect()
    }

    fn ids(n: usize) -> Vec<ObjectId> {
        (1..=n).map(|i| ObjectId::new(format!("public.t{}", i))).collect()
    }

    fn engine(source: &Arc<FakeSource>, concurrency: usize) -> BackupEngine {
        BackupEngine::new(
            Arc::new(FakeConnector::new(Arc::clone(source))),
            EngineSettings {
                concurrency,
                ..EngineSettings::default()
            },
        )
    }

    fn request(root: &Path, objects: Vec<ObjectId>) -> BackupRequest {
        BackupRequest {
            connection: descriptor(),
            objects,
            destination_root: root.to_path_buf(),
            options: FormatOptions::default(),
        }
    }

    /// Names in `dir`, split into backup files and everything else.
    fn backup_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|n| !n.starts_with("backup_run_"))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    async fn drain(mut sub: Subscription) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = sub.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_successful_run_writes_every_object() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = Arc::new(FakeSource::with_objects(tables(3)));
        let engine = engine(&source, 2);

        let handle = engine.submit(request(dir.path(), ids(3))).await?;
        let events = tokio::spawn(drain(handle.subscribe()));
        let result = handle.wait().await?;

        assert_eq!(result.outcome, RunOutcome::Completed);
        assert!(result.success);
        assert_eq!((result.total, result.attempted, result.succeeded), (3, 3, 3));
        for file in &result.files {
            let raw = std::fs::read(&file.path)?;
            let restored = compression::decompress(CompressionKind::Gzip, &raw)?;
            assert_eq!(restored, source.expected_payload(file.object_id.as_str()));
            assert_eq!(file.bytes, raw.len() as u64);
        }
        assert_eq!(backup_files(dir.path()).len(), 3);

        let manifest = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_string_lossy().starts_with("backup_run_"));
        let manifest = manifest.map(|e| e.path()).ok_or_else(|| anyhow::anyhow!("no manifest"))?;
        let saved: BackupResult = serde_json::from_slice(&std::fs::read(manifest)?)?;
        assert_eq!(saved.run_id, result.run_id);

        let events = events.await?;
        assert!(matches!(
            events.last().map(|e| (&e.scope, &e.kind)),
            Some((EventScope::Run, EventKind::Completed { .. }))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_export_still_writes_a_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = Arc::new(FakeSource::with_objects(tables(1)).chunks(0));
        let result = engine(&source, 1).submit(request(dir.path(), ids(1))).await?.wait().await?;

        assert_eq!(result.outcome, RunOutcome::Completed);
        let raw = std::fs::read(&result.files[0].path)?;
        assert!(compression::decompress(CompressionKind::Gzip, &raw)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_torn_down_run_reports_cancelled() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let gate = Arc::new(Semaphore::new(0));
        let source = Arc::new(FakeSource::with_objects(tables(2)).gated(gate));
        let handle = engine(&source, 2).submit(request(dir.path(), ids(2))).await?;

        handle.join.abort();
        let result = handle.wait().await;
        assert!(matches!(result, Err(BackupError::Cancelled(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_one_failure_does_not_affect_siblings() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = Arc::new(FakeSource::with_objects(tables(5)).fail_open("public.t3"));
        let result = engine(&source, 4).submit(request(dir.path(), ids(5))).await?.wait().await?;

        assert_eq!(result.outcome, RunOutcome::PartiallyFailed);
        assert!(!result.success);
        assert_eq!(result.files.len(), 4);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].object_id.as_str(), "public.t3");
        assert_eq!(result.errors[0].kind, ErrorKind::Export);
        assert_eq!(backup_files(dir.path()).len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_mid_stream_failure_leaves_no_partial_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = Arc::new(FakeSource::with_objects(tables(2)).fail_mid_stream("public.t1"));
        let result = engine(&source, 2).submit(request(dir.path(), ids(2))).await?.wait().await?;

        assert_eq!(result.outcome, RunOutcome::PartiallyFailed);
        let names = backup_files(dir.path());
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("table_public.t2_"));
        Ok(())
    }

    #[tokio::test]
    async fn test_all_failed_is_partially_failed_with_no_successes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = Arc::new(
            FakeSource::with_objects(tables(2))
                .fail_open("public.t1")
                .fail_open("public.t2"),
        );
        let result = engine(&source, 2).submit(request(dir.path(), ids(2))).await?.wait().await?;

        assert_eq!(result.outcome, RunOutcome::PartiallyFailed);
        assert_eq!(result.succeeded, 0);
        assert!(result.files.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_in_flight_tasks_never_exceed_bound() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = Arc::new(
            FakeSource::with_objects(tables(6)).delay(Duration::from_millis(10)),
        );
        let result = engine(&source, 2).submit(request(dir.path(), ids(6))).await?.wait().await?;

        assert_eq!(result.succeeded, 6);
        assert!(source.peak_in_flight() <= 2, "peak was {}", source.peak_in_flight());
        assert!(source.peak_in_flight() >= 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_keeps_finished_work_and_skips_the_rest() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let gate = Arc::new(Semaphore::new(0));
        let source = Arc::new(FakeSource::with_objects(tables(5)).gated(Arc::clone(&gate)));
        let handle = engine(&source, 2).submit(request(dir.path(), ids(5))).await?;

        let mut sub = handle.subscribe();
        let mut writing = 0;
        while writing < 2 {
            let Some(event) = sub.next().await else { break };
            if event.kind == (EventKind::Stage { stage: TaskStage::Writing }) {
                writing += 1;
            }
        }
        assert_eq!(writing, 2);

        handle.cancel();
        handle.cancel();
        gate.add_permits(10);
        let result = handle.wait().await?;

        assert_eq!(result.outcome, RunOutcome::Cancelled);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.cancelled.len(), 3);
        assert_eq!(result.attempted, 2);
        let names = backup_files(dir.path());
        assert_eq!(names.len(), 2);
        for id in &result.cancelled {
            let prefix = format!("table_{}_", naming::sanitize(id.as_str()));
            assert!(!names.iter().any(|n| n.starts_with(&prefix)));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_a_no_op() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = Arc::new(FakeSource::with_objects(tables(1)));
        let handle = engine(&source, 1).submit(request(dir.path(), ids(1))).await?;
        let canceller = handle.canceller();
        let result = handle.wait().await?;
        canceller.cancel();
        canceller.cancel();
        assert_eq!(result.outcome, RunOutcome::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_object_is_rejected_before_any_work() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("out");
        let source = Arc::new(FakeSource::with_objects(tables(2)));
        let mut objects = ids(2);
        objects.push(ObjectId::from("public.nope"));

        let result = engine(&source, 2).submit(request(&root, objects)).await;
        assert!(matches!(result, Err(BackupError::Validation(msg)) if msg.contains("public.nope")));
        assert!(!root.exists());
        assert_eq!(source.peak_in_flight(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_selection_is_rejected() {
        let source = Arc::new(FakeSource::with_objects(tables(1)));
        let result = engine(&source, 1).submit(request(Path::new("unused"), Vec::new())).await;
        assert!(matches!(result, Err(BackupError::Validation(_))));
    }

    #[tokio::test]
    async fn test_run_level_failures_are_errors() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let unreachable = BackupEngine::new(Arc::new(FakeConnector::unreachable()), EngineSettings::default());
        let result = unreachable.submit(request(dir.path(), ids(1))).await;
        assert!(matches!(result, Err(BackupError::Connection(_))));
        assert!(unreachable.list_catalog(&descriptor()).await.is_err());
        assert!(!unreachable.test_connection(&descriptor()).await.success);

        let broken = Arc::new(FakeSource::with_objects(tables(1)).fail_catalog());
        let result = engine(&broken, 1).submit(request(dir.path(), ids(1))).await;
        assert!(matches!(result, Err(BackupError::Query(_))));
        assert!(backup_files(dir.path()).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_task_events_follow_stage_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = Arc::new(FakeSource::with_objects(tables(3)));
        let handle = engine(&source, 3).submit(request(dir.path(), ids(3))).await?;
        let sub = handle.subscribe();
        handle.wait().await?;
        let events = drain(sub).await;

        for id in ids(3) {
            let stages: Vec<TaskStage> = events
                .iter()
                .filter(|e| e.object_id() == Some(&id))
                .filter_map(|e| match e.kind {
                    EventKind::Stage { stage } => Some(stage),
                    _ => None,
                })
                .collect();
            assert_eq!(
                stages,
                vec![TaskStage::Queued, TaskStage::Exporting, TaskStage::Compressing, TaskStage::Writing]
            );
            assert!(events
                .iter()
                .any(|e| e.object_id() == Some(&id) && matches!(e.kind, EventKind::Completed { .. })));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_state_is_observable_and_catalog_is_cached() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = Arc::new(FakeSource::with_objects(tables(2)));
        let engine = engine(&source, 1);
        assert!(engine.latest_snapshot(&descriptor()).is_none());

        let handle = engine.submit(request(dir.path(), ids(1))).await?;
        assert!(!matches!(handle.state(), RunState::Pending | RunState::CatalogLoaded));
        let mut state = handle.state.clone();
        handle.wait().await?;
        assert_eq!(*state.borrow_and_update(), RunState::Finished(RunOutcome::Completed));
        assert_eq!(engine.latest_snapshot(&descriptor()).map(|s| s.len()), Some(2));
        Ok(())
    }

    #[test]
    fn test_write_failures_trip_after_threshold() {
        let tracker = WriteFailureTracker::new(3);
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        tracker.record_success();
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());
    }

    #[test]
    fn test_duplicate_ids_collapse_and_views_go_last() -> anyhow::Result<()> {
        let snapshot = CatalogSnapshot::new(vec![
            fake_object("public.v", ObjectKind::View, 1),
            fake_object("public.t", ObjectKind::Table, 1),
        ]);
        let req = request(
            Path::new("/tmp/out"),
            vec![ObjectId::from("public.v"), ObjectId::from("public.t"), ObjectId::from("public.v")],
        );
        let tasks = plan_tasks(&req, &snapshot, Utc::now(), Uuid::new_v4())?;
        let order: Vec<&str> = tasks.iter().map(|t| t.id().as_str()).collect();
        assert_eq!(order, vec!["public.t", "public.v"]);
        Ok(())
    }

    #[test]
    fn test_colliding_destinations_are_rejected() {
        // Sanitising maps both ids onto the same file name.
        let snapshot = CatalogSnapshot::new(vec![
            fake_object("public.a b", ObjectKind::Table, 1),
            fake_object("public.a_b", ObjectKind::Table, 1),
        ]);
        let req = request(
            Path::new("/tmp/out"),
            vec![ObjectId::from("public.a b"), ObjectId::from("public.a_b")],
        );
        let result = plan_tasks(&req, &snapshot, Utc::now(), Uuid::new_v4());
        assert!(matches!(result, Err(BackupError::DuplicateDestination { .. })));
    }

    #[test]
    fn test_existing_destination_is_rejected_before_any_work() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let object = fake_object("public.t1", ObjectKind::Table, 1);
        let snapshot = CatalogSnapshot::new(vec![object.clone()]);
        let req = request(dir.path(), vec![object.id.clone()]);
        let (at, run_id) = (Utc::now(), Uuid::new_v4());
        let taken = dir
            .path()
            .join(naming::backup_file_name(&object, &req.options, at, run_id));
        std::fs::write(&taken, b"earlier backup")?;

        let result = plan_tasks(&req, &snapshot, at, run_id);
        assert!(matches!(result, Err(BackupError::DuplicateDestination { path }) if path == taken));
        assert_eq!(std::fs::read(&taken)?, b"earlier backup");
        Ok(())
    }

    #[tokio::test]
    async fn test_back_to_back_runs_into_same_directory_both_complete() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = Arc::new(FakeSource::with_objects(tables(5)));
        let engine = engine(&source, 4);

        let first = engine.submit(request(dir.path(), ids(5))).await?.wait().await?;
        let second = engine.submit(request(dir.path(), ids(5))).await?.wait().await?;

        assert_eq!(first.outcome, RunOutcome::Completed);
        assert_eq!(second.outcome, RunOutcome::Completed);
        assert_eq!(second.succeeded, 5);
        assert_eq!(backup_files(dir.path()).len(), 10);
        Ok(())
    }
}
