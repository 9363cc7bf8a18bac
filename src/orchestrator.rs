//! Job submission, execution and retrieval.
//!
//! Each job record lives in a `watch` channel. The sender is moved into whichever task
//! executes the job, so exactly one writer drives a job's transitions while any number
//! of pollers read whole snapshots through the registry's receivers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::engine::{AudioFormat, ResourceCache, StemCount};
use crate::error::ServiceError;
use crate::files::{FileManager, PackagedArchive, Upload};
use crate::metrics::MetricsRecorder;
use crate::state_machine::{
    ExecutionMode, Job, JobFailure, JobSnapshot, JobStatus, Stage, StateMachine, Transition,
};

/// Knobs the orchestrator reads from [`ServiceConfig`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub workers: usize,
    pub max_upload_bytes: u64,
    pub job_timeout: Duration,
    pub retention: Duration,
    pub release_on_retrieval: bool,
    /// Expected separation time for two stems; scaled up for more stems.
    pub expected_separation: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&ServiceConfig::default())
    }
}

impl From<&ServiceConfig> for OrchestratorSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            max_upload_bytes: config.max_upload_bytes(),
            job_timeout: config.job_timeout(),
            retention: config.retention(),
            release_on_retrieval: config.release_on_retrieval,
            expected_separation: config.expected_separation(),
        }
    }
}

impl OrchestratorSettings {
    fn expected_runtime(&self, stems: StemCount) -> Duration {
        self.expected_separation
            .mul_f64(f64::from(stems.get()) / 2.0)
    }
}

/// A request to separate one uploaded file.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub upload: Upload,
    /// Raw stem count as received; validated on submit.
    pub stem_count: u8,
    pub mode: ExecutionMode,
}

impl SubmitRequest {
    pub fn new(upload: Upload, stem_count: u8) -> Self {
        Self {
            upload,
            stem_count,
            mode: ExecutionMode::Deferred,
        }
    }

    pub fn immediate(mut self) -> Self {
        self.mode = ExecutionMode::Immediate;
        self
    }
}

/// A packaged result ready to hand to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveDownload {
    pub job_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub enum Submission {
    /// The job was queued; poll its status with the id.
    Deferred { job_id: String, status: JobStatus },
    /// The job ran on the calling path.
    Immediate(ArchiveDownload),
}

impl Submission {
    pub fn job_id(&self) -> &str {
        match self {
            Submission::Deferred { job_id, .. } => job_id,
            Submission::Immediate(download) => &download.job_id,
        }
    }
}

#[derive(Debug)]
pub enum JobResult {
    Ready(ArchiveDownload),
    /// Still pending or processing. Distinct from failure.
    NotReady(JobStatus),
}

/// Number of known jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// `separated_{n}stems_{short id}.zip`, limited to `[A-Za-z0-9._-]`.
pub fn download_name(stems: StemCount, short_id: &str) -> String {
    format!("separated_{}stems_{}.zip", stems.get(), short_id)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

struct WorkItem {
    job: watch::Sender<Job>,
    input: PathBuf,
}

struct Inner {
    settings: OrchestratorSettings,
    cache: Arc<ResourceCache>,
    files: Arc<FileManager>,
    metrics: Arc<MetricsRecorder>,
    jobs: RwLock<HashMap<String, watch::Receiver<Job>>>,
}

pub struct JobOrchestrator {
    inner: Arc<Inner>,
    queue: Mutex<Option<mpsc::UnboundedSender<WorkItem>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobOrchestrator {
    /// Start the orchestrator and its worker pool. Must be called inside a Tokio runtime.
    pub fn new(
        settings: OrchestratorSettings,
        cache: Arc<ResourceCache>,
        files: Arc<FileManager>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let worker_count = settings.workers.max(1);
        let inner = Arc::new(Inner {
            settings,
            cache,
            files,
            metrics,
            jobs: RwLock::new(HashMap::new()),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..worker_count)
            .map(|n| tokio::spawn(worker_loop(n, Arc::clone(&inner), Arc::clone(&rx))))
            .collect();
        tracing::info!(workers = worker_count, "job orchestrator started");

        Self {
            inner,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.inner.cache
    }

    pub fn files(&self) -> &Arc<FileManager> {
        &self.inner.files
    }

    /// Validate, stage and run or enqueue a job.
    ///
    /// Every validation failure is reported before a job exists: no id is issued and
    /// nothing reaches the engine.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission, ServiceError> {
        let SubmitRequest {
            upload,
            stem_count,
            mode,
        } = request;

        let stems = StemCount::try_from(stem_count).map_err(ServiceError::InvalidParameter)?;
        if upload.bytes.is_empty() {
            return Err(ServiceError::InvalidParameter(
                "No file provided or the uploaded file is empty.".into(),
            ));
        }
        let size = upload.bytes.len() as u64;
        if size > self.inner.settings.max_upload_bytes {
            return Err(ServiceError::PayloadTooLarge {
                size,
                limit: self.inner.settings.max_upload_bytes,
            });
        }
        self.inner.files.validate_filename(&upload.filename)?;
        if !self.accepting() {
            return Err(Self::closed());
        }

        let job = Job::new(stems, mode, self.inner.settings.expected_runtime(stems));
        let job_id = job.id.clone();

        let files = Arc::clone(&self.inner.files);
        let staged_id = job_id.clone();
        let input = tokio::task::spawn_blocking(move || files.stage(&staged_id, &upload))
            .await
            .map_err(|e| ServiceError::TransformationFailed(format!("staging aborted: {e}")))??;

        let (tx, rx) = watch::channel(job);
        self.register(&job_id, rx);
        tracing::info!(job_id = %job_id, stems = %stems, mode = ?mode, bytes = size, "job submitted");

        match mode {
            ExecutionMode::Deferred => {
                self.enqueue(&job_id, WorkItem { job: tx, input })?;
                Ok(Submission::Deferred {
                    job_id,
                    status: JobStatus::Pending,
                })
            }
            ExecutionMode::Immediate => {
                // Run as its own task so a dropped caller cannot strand the job mid-flight.
                let archive = tokio::spawn(execute(Arc::clone(&self.inner), tx, input))
                    .await
                    .map_err(|e| {
                        ServiceError::TransformationFailed(format!("job task aborted: {e}"))
                    })??;
                let download = self.download(&job_id, stems, &archive.path).await?;
                if self.inner.settings.release_on_retrieval {
                    self.release(&job_id);
                }
                Ok(Submission::Immediate(download))
            }
        }
    }

    fn register(&self, job_id: &str, rx: watch::Receiver<Job>) {
        let mut jobs = self.inner.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job_id.to_string(), rx);
    }

    fn accepting(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn closed() -> ServiceError {
        ServiceError::TransformationFailed("orchestrator is shutting down".into())
    }

    // Shutdown can still win the race after `accepting`; the job is then withdrawn
    // entirely rather than failed, so no record outlives the rejected submission.
    fn enqueue(&self, job_id: &str, item: WorkItem) -> Result<(), ServiceError> {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let sent = match queue.as_ref() {
            Some(tx) => tx.send(item).map_err(|e| e.0),
            None => Err(item),
        };
        let Err(item) = sent else {
            return Ok(());
        };

        self.inner
            .jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
        self.inner.files.remove_input(&item.input);
        Err(Self::closed())
    }

    fn receiver(&self, job_id: &str) -> Result<watch::Receiver<Job>, ServiceError> {
        let jobs = self.inner.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_id)
            .cloned()
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))
    }

    /// Current snapshot of a job. Never blocks on the job's execution.
    pub fn status(&self, job_id: &str) -> Result<JobSnapshot, ServiceError> {
        let rx = self.receiver(job_id)?;
        let snapshot = rx.borrow().snapshot();
        Ok(snapshot)
    }

    /// The job's archive once completed.
    ///
    /// Pending and processing jobs yield [`JobResult::NotReady`]; failed jobs yield
    /// [`ServiceError::JobFailed`] with the stored error.
    pub async fn result(&self, job_id: &str) -> Result<JobResult, ServiceError> {
        let rx = self.receiver(job_id)?;
        let (status, stems, path, failure) = {
            let job = rx.borrow();
            (
                job.status,
                job.stem_count,
                job.result_path.clone(),
                job.failure.clone(),
            )
        };

        match status {
            JobStatus::Pending | JobStatus::Processing => Ok(JobResult::NotReady(status)),
            JobStatus::Failed => Err(ServiceError::JobFailed(
                failure.map_or_else(|| "unknown error".to_string(), |f| f.message),
            )),
            JobStatus::Completed => {
                let path = path.ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))?;
                let download = self.download(job_id, stems, &path).await?;
                if self.inner.settings.release_on_retrieval {
                    self.release(job_id);
                }
                Ok(JobResult::Ready(download))
            }
        }
    }

    async fn download(
        &self,
        job_id: &str,
        stems: StemCount,
        path: &Path,
    ) -> Result<ArchiveDownload, ServiceError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(job_id, path = %path.display(), "result archive is gone");
                return Err(ServiceError::JobNotFound(job_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let short_id = job_id.get(..8).unwrap_or(job_id);
        Ok(ArchiveDownload {
            job_id: job_id.to_string(),
            filename: download_name(stems, short_id),
            bytes,
        })
    }

    /// Forget a finished job and delete its files. Running jobs are left alone.
    /// Returns how many paths were removed; calling it again is a no-op.
    /// Ids that were never issued, or are no longer registered, remove nothing.
    pub fn release(&self, job_id: &str) -> usize {
        if Uuid::parse_str(job_id).is_err() {
            tracing::debug!(job_id, "not a job id, nothing released");
            return 0;
        }
        {
            let mut jobs = self.inner.jobs.write().unwrap_or_else(|e| e.into_inner());
            let Some(rx) = jobs.get(job_id) else {
                return 0;
            };
            let status = rx.borrow().status;
            if !status.is_terminal() {
                tracing::debug!(job_id, %status, "job still running, not released");
                return 0;
            }
            jobs.remove(job_id);
        }
        self.inner.files.release(job_id)
    }

    /// Release terminal jobs that finished at least the retention period before `now`.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let retention = self.inner.settings.retention;
        let expired: Vec<String> = {
            let jobs = self.inner.jobs.read().unwrap_or_else(|e| e.into_inner());
            jobs.iter()
                .filter(|(_, rx)| {
                    rx.borrow()
                        .finished_for(now)
                        .is_some_and(|age| age >= retention)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in &expired {
            self.release(id);
        }
        if !expired.is_empty() {
            tracing::info!(
                count = expired.len(),
                retention_secs = retention.as_secs(),
                "expired jobs released"
            );
        }
        expired.len()
    }

    /// Snapshots of every known job, oldest first.
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let jobs = self.inner.jobs.read().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut snapshots: Vec<_> = jobs.values().map(|rx| rx.borrow().snapshot_at(now)).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    pub fn counts(&self) -> JobCounts {
        let jobs = self.inner.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut counts = JobCounts::default();
        for rx in jobs.values() {
            match rx.borrow().status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Stop accepting work and wait for the workers to drain the queue.
    pub async fn shutdown(&self) {
        drop(self.queue.lock().unwrap_or_else(|e| e.into_inner()).take());
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "worker ended abnormally");
            }
        }
        tracing::info!("job orchestrator stopped");
    }
}

async fn worker_loop(
    worker: usize,
    inner: Arc<Inner>,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
) {
    loop {
        let item = queue.lock().await.recv().await;
        let Some(WorkItem { job, input }) = item else {
            break;
        };
        // Failures are recorded on the job itself.
        let _ = execute(Arc::clone(&inner), job, input).await;
    }
    tracing::debug!(worker, "worker exiting");
}

// Apply a transition through the job's single sender. A rejected transition is a bug
// in the caller; it is logged and the record stays as it was.
fn transition(job: &watch::Sender<Job>, t: Transition) -> bool {
    let mut applied = false;
    job.send_if_modified(|job| match StateMachine::apply(job, t, Instant::now()) {
        Ok(_) => {
            applied = true;
            true
        }
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "rejected job transition");
            false
        }
    });
    applied
}

/// Run one job to a terminal state. The returned error is also stored on the job.
async fn execute(
    inner: Arc<Inner>,
    job: watch::Sender<Job>,
    input: PathBuf,
) -> Result<PackagedArchive, ServiceError> {
    let (job_id, stems) = {
        let j = job.borrow();
        (j.id.clone(), j.stem_count)
    };
    let span = tracing::info_span!("job", job_id = %job_id, stems = %stems);

    async {
        transition(&job, Transition::Start);
        tracing::info!("job started");
        let started = Instant::now();

        let ceiling = inner.settings.job_timeout;
        let outcome = inner
            .metrics
            .measure("job.execute", async {
                tokio::time::timeout(ceiling, run_steps(&inner, &job, &job_id, stems, &input))
                    .await
                    .unwrap_or(Err(ServiceError::Timeout(ceiling)))
            })
            .await;

        inner.files.remove_input(&input);

        match outcome {
            Ok(archive) => {
                transition(
                    &job,
                    Transition::Complete {
                        result_path: archive.path.clone(),
                        size: archive.size,
                    },
                );
                tracing::info!(
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    bytes = archive.size,
                    "job completed"
                );
                Ok(archive)
            }
            Err(err) => {
                // Partial artifacts go before the failure becomes visible.
                inner.files.release(&job_id);
                transition(&job, Transition::Fail(JobFailure::from(&err)));
                tracing::error!(
                    code = err.code(),
                    kind = %err.kind(),
                    error = %err,
                    "job failed"
                );
                Err(err)
            }
        }
    }
    .instrument(span)
    .await
}

async fn run_steps(
    inner: &Inner,
    job: &watch::Sender<Job>,
    job_id: &str,
    stems: StemCount,
    input: &Path,
) -> Result<PackagedArchive, ServiceError> {
    let handle = inner
        .metrics
        .measure("engine.acquire", inner.cache.acquire(stems))
        .await?;

    let workspace = Arc::new(inner.files.workspace(job_id)?);
    transition(job, Transition::Advance(Stage::Separating));
    inner
        .metrics
        .measure(
            "engine.separate",
            handle.run(
                input.to_path_buf(),
                workspace.path().to_path_buf(),
                Arc::clone(&workspace),
            ),
        )
        .await?;

    transition(job, Transition::Advance(Stage::Packaging));
    let files = Arc::clone(&inner.files);
    let format = handle.output_format();
    let ws = Arc::clone(&workspace);
    let id = job_id.to_string();
    let archive = inner
        .metrics
        .measure(
            "files.package",
            tokio::task::spawn_blocking(move || -> Result<PackagedArchive, ServiceError> {
                let root = output_root(ws.path())?;
                verify_output(&root, stems, format)?;
                Ok(files.package(&id, &root)?)
            }),
        )
        .await
        .map_err(|e| ServiceError::TransformationFailed(format!("packaging aborted: {e}")))??;

    if let Ok(workspace) = Arc::try_unwrap(workspace) {
        if let Err(e) = workspace.close() {
            tracing::warn!(error = %e, "failed to remove workspace");
        }
    }
    Ok(archive)
}

/// Descend through directories that are the only entry of their parent.
///
/// Some engines nest their stems under `<output>/<input name>/`; the innermost such
/// directory becomes the archive root.
fn output_root(dir: &Path) -> Result<PathBuf, ServiceError> {
    let mut root = dir.to_path_buf();
    loop {
        let mut entries = std::fs::read_dir(&root)?.collect::<Result<Vec<_>, _>>()?;
        if entries.len() == 1 && entries[0].file_type()?.is_dir() {
            root = entries.remove(0).path();
        } else {
            return Ok(root);
        }
    }
}

/// Every stem expected for `stems` must be present as a regular file under `root`.
fn verify_output(root: &Path, stems: StemCount, format: AudioFormat) -> Result<(), ServiceError> {
    let present: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| entry.path())
        .collect();

    let missing: Vec<String> = stems
        .stems()
        .iter()
        .filter(|stem| !present.iter().any(|path| stem.matches(path)))
        .map(|stem| stem.file_name(format))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ServiceError::TransformationFailed(format!(
            "output files were not found: {}",
            missing.join(", ")
        )))
    }
}
