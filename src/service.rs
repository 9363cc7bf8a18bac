//! Transport-facing facade wiring admission control, the orchestrator and maintenance.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use crate::engine::{EngineFactory, ResourceCache, StemCount};
use crate::error::ServiceError;
use crate::files::{FileManager, mount_point_of};
use crate::metrics::{MetricsRecorder, OperationStats};
use crate::orchestrator::{
    JobCounts, JobOrchestrator, JobResult, OrchestratorSettings, Submission, SubmitRequest,
};
use crate::rate_limit::{RateLimiter, RateStatus};
use crate::state_machine::JobSnapshot;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryHealth {
    pub upload_accessible: bool,
    pub output_accessible: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub service: &'static str,
    pub version: &'static str,
    pub max_file_size_mb: u64,
    pub allowed_extensions: Vec<String>,
    pub directories: DirectoryHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_space_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_ok: Option<bool>,
    pub cached_engines: Vec<StemCount>,
    pub jobs: JobCounts,
}

/// What one maintenance pass cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_jobs: usize,
    pub evicted_clients: usize,
}

pub struct SeparationService {
    config: ServiceConfig,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsRecorder>,
    orchestrator: Arc<JobOrchestrator>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SeparationService {
    /// Build the service from configuration. Must be called inside a Tokio runtime.
    pub fn new(config: ServiceConfig, factory: Arc<dyn EngineFactory>) -> Result<Self, ServiceError> {
        let files = FileManager::new(&config.upload_dir, &config.output_dir, config.file_limits())?;
        Ok(Self::with_files(config, factory, files))
    }

    /// Build the service around an already configured [`FileManager`].
    pub fn with_files(
        config: ServiceConfig,
        factory: Arc<dyn EngineFactory>,
        files: FileManager,
    ) -> Self {
        let metrics = Arc::new(MetricsRecorder::new(config.slow_threshold()));
        let cache = Arc::new(ResourceCache::new(factory, config.execution_policy));
        let orchestrator = Arc::new(JobOrchestrator::new(
            OrchestratorSettings::from(&config),
            cache,
            Arc::new(files),
            Arc::clone(&metrics),
        ));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_per_minute,
            Duration::from_secs(config.rate_window_secs),
            Duration::from_secs(config.rate_idle_evict_secs),
        ));

        Self {
            config,
            limiter,
            metrics,
            orchestrator,
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<JobOrchestrator> {
        &self.orchestrator
    }

    /// Start engine pre-warming and the periodic maintenance task.
    pub fn start(&self) {
        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());

        if !self.config.prewarm.is_empty() {
            let cache = Arc::clone(self.orchestrator.cache());
            let keys = self.config.prewarm.clone();
            background.push(tokio::spawn(async move {
                let ready = cache.prewarm(&keys).await;
                tracing::info!(ready, requested = keys.len(), "engine pre-warming finished");
            }));
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        let limiter = Arc::clone(&self.limiter);
        let every = self.config.sweep_interval();
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                maintain(&orchestrator, &limiter, Instant::now());
            }
        }));
    }

    /// Admit `client`, then hand the request to the orchestrator.
    pub async fn submit(
        &self,
        client: &str,
        request: SubmitRequest,
    ) -> Result<Submission, ServiceError> {
        self.limiter.check(client).into_result()?;
        self.orchestrator.submit(request).await
    }

    pub fn rate_status(&self, client: &str) -> RateStatus {
        self.limiter.status_at(client, Instant::now())
    }

    pub fn status(&self, job_id: &str) -> Result<JobSnapshot, ServiceError> {
        self.orchestrator.status(job_id)
    }

    pub async fn result(&self, job_id: &str) -> Result<JobResult, ServiceError> {
        self.orchestrator.result(job_id).await
    }

    pub fn release(&self, job_id: &str) -> usize {
        self.orchestrator.release(job_id)
    }

    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.orchestrator.jobs()
    }

    pub fn metrics(&self) -> BTreeMap<String, OperationStats> {
        self.metrics.snapshot()
    }

    /// Construct engines for `keys` now, timing each.
    pub async fn warmup(&self, keys: &[StemCount]) -> Vec<(StemCount, Result<Duration, ServiceError>)> {
        let mut out = Vec::with_capacity(keys.len());
        for &stems in keys {
            let started = Instant::now();
            let result = self
                .metrics
                .measure("engine.acquire", self.orchestrator.cache().acquire(stems))
                .await
                .map(|_| started.elapsed())
                .map_err(ServiceError::from);
            out.push((stems, result));
        }
        out
    }

    /// Drop every cached engine. Jobs already holding a handle keep using it.
    pub fn clear_engines(&self) {
        self.orchestrator.cache().clear();
    }

    /// Run one maintenance pass as of `now`.
    pub fn maintain(&self, now: Instant) -> MaintenanceReport {
        maintain(&self.orchestrator, &self.limiter, now)
    }

    pub fn health(&self) -> HealthReport {
        let files = self.orchestrator.files();
        let upload_accessible = is_writable(files.upload_dir());
        let output_accessible = is_writable(files.output_dir());
        let free = files.available_space(files.upload_dir());
        let disk_ok = free.map(|bytes| bytes > files.limits().min_free_bytes);

        let status = if upload_accessible && output_accessible && disk_ok.unwrap_or(true) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            service: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            max_file_size_mb: self.config.max_file_size_mb,
            allowed_extensions: self.config.allowed_extensions.iter().cloned().collect(),
            directories: DirectoryHealth {
                upload_accessible,
                output_accessible,
            },
            mount_point: mount_point_of(files.upload_dir()),
            disk_space_gb: free.map(|bytes| (bytes as f64 / GB * 100.0).round() / 100.0),
            disk_ok,
            cached_engines: self.orchestrator.cache().cached_keys(),
            jobs: self.orchestrator.counts(),
        }
    }

    /// Stop background tasks and drain the job queue.
    pub async fn shutdown(&self) {
        let background: Vec<_> = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in background {
            task.abort();
        }
        self.orchestrator.shutdown().await;
    }
}

fn maintain(orchestrator: &JobOrchestrator, limiter: &RateLimiter, now: Instant) -> MaintenanceReport {
    let report = MaintenanceReport {
        expired_jobs: orchestrator.sweep_expired(now),
        evicted_clients: limiter.evict_idle(now),
    };
    if report != MaintenanceReport::default() {
        tracing::info!(
            expired_jobs = report.expired_jobs,
            evicted_clients = report.evicted_clients,
            "maintenance pass"
        );
    }
    report
}

fn is_writable(dir: &Path) -> bool {
    tempfile::NamedTempFile::new_in(dir).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeFactory;
    use crate::files::{FileLimits, FixedSpace, Upload};
    use crate::state_machine::JobStatus;
    use tempfile::TempDir;

    fn service_with(config: ServiceConfig, free: Option<u64>) -> (TempDir, Arc<FakeFactory>, SeparationService) {
        let root = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            upload_dir: root.path().join("uploads"),
            output_dir: root.path().join("output"),
            ..config
        };
        let files = FileManager::new(&config.upload_dir, &config.output_dir, FileLimits::default())
            .unwrap()
            .with_probe(Arc::new(FixedSpace(free)));
        let factory = Arc::new(FakeFactory::new());
        let dyn_factory: Arc<dyn EngineFactory> = factory.clone();
        let service = SeparationService::with_files(config, dyn_factory, files);
        (root, factory, service)
    }

    fn request() -> SubmitRequest {
        SubmitRequest::new(Upload::new("track.wav", b"RIFF".to_vec()), 2)
    }

    #[tokio::test]
    async fn admission_runs_before_submission() {
        let config = ServiceConfig {
            rate_limit_per_minute: 2,
            ..ServiceConfig::default()
        };
        let (_root, _factory, service) = service_with(config, None);

        let bad = SubmitRequest::new(Upload::new("track.wav", b"RIFF".to_vec()), 3);
        assert!(matches!(
            service.submit("10.0.0.9", bad).await,
            Err(ServiceError::InvalidParameter(_))
        ));
        service.submit("10.0.0.9", request()).await.unwrap();

        let err = service.submit("10.0.0.9", request()).await.unwrap_err();
        assert!(matches!(err, ServiceError::RateLimited { .. }));
        assert_eq!(err.http_status(), 429);
        assert_eq!(service.jobs().len(), 1);
        assert_eq!(service.rate_status("10.0.0.9").remaining, 0);

        service.submit("10.0.0.10", request()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn immediate_submission_records_metrics() {
        let (_root, _factory, service) = service_with(ServiceConfig::default(), None);
        let submission = service
            .submit("client", request().immediate())
            .await
            .unwrap();
        assert!(matches!(submission, Submission::Immediate(_)));

        let metrics = service.metrics();
        for op in ["engine.acquire", "engine.separate", "files.package", "job.execute"] {
            assert_eq!(metrics[op].count, 1, "{op}");
        }
        assert_eq!(service.status(submission.job_id()).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn health_reports_directories_disk_and_engines() {
        let (_root, _factory, service) = service_with(ServiceConfig::default(), Some(50 * 1024 * 1024 * 1024));
        let report = service.warmup(&[StemCount::Four]).await;
        assert!(report[0].1.is_ok());

        let health = service.health();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.directories.upload_accessible);
        assert_eq!(health.disk_space_gb, Some(50.0));
        assert_eq!(health.cached_engines, vec![StemCount::Four]);

        service.clear_engines();
        assert!(service.health().cached_engines.is_empty());

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["cached_engines"], serde_json::json!([4]));
    }

    #[tokio::test]
    async fn low_disk_degrades_health() {
        let (_root, _factory, service) = service_with(ServiceConfig::default(), Some(1024));
        let health = service.health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.disk_ok, Some(false));
    }

    #[tokio::test]
    async fn unknown_disk_is_not_degraded() {
        let (_root, _factory, service) = service_with(ServiceConfig::default(), None);
        let health = service.health();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(serde_json::to_value(&health).unwrap().get("disk_ok").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn maintenance_expires_jobs_and_idle_clients() {
        let config = ServiceConfig {
            retention_secs: 10,
            rate_idle_evict_secs: 10,
            ..ServiceConfig::default()
        };
        let (_root, _factory, service) = service_with(config, None);
        service.submit("c", request().immediate()).await.unwrap();

        let report = service.maintain(Instant::now() + Duration::from_secs(120));
        assert_eq!(
            report,
            MaintenanceReport {
                expired_jobs: 1,
                evicted_clients: 1
            }
        );
        assert!(service.jobs().is_empty());
    }

    #[tokio::test]
    async fn start_prewarms_configured_engines() {
        let config = ServiceConfig {
            prewarm: vec![StemCount::Two, StemCount::Five],
            ..ServiceConfig::default()
        };
        let (_root, factory, service) = service_with(config, None);
        service.start();

        for _ in 0..200 {
            if service.orchestrator().cache().cached_keys().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            service.orchestrator().cache().cached_keys(),
            vec![StemCount::Two, StemCount::Five]
        );
        assert_eq!(factory.builds(), 2);
        service.shutdown().await;
    }
}
