use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::StemCount;

/// Tracks the lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Finer-grained position of a job inside `Processing`, used for progress estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    AcquiringEngine,
    Separating,
    Packaging,
    Done,
}

impl Stage {
    /// Progress reported as soon as the stage is entered.
    pub fn progress_floor(self) -> f64 {
        match self {
            Stage::Queued => 0.0,
            Stage::AcquiringEngine => 0.1,
            Stage::Separating => 0.3,
            Stage::Packaging => 0.7,
            Stage::Done => 1.0,
        }
    }
}

/// How a submission is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Queue the job and return its id right away.
    #[default]
    Deferred,
    /// Run on the caller's path and hand back the archive.
    Immediate,
}

/// Categorized failure cause stored on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub code: String,
    pub message: String,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&crate::error::ServiceError> for JobFailure {
    fn from(err: &crate::error::ServiceError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// Monotonic instants backing the elapsed-time fields.
#[derive(Debug, Clone)]
pub(super) struct JobClock {
    pub(super) created: Instant,
    pub(super) started: Option<Instant>,
    pub(super) stage_entered: Option<Instant>,
    pub(super) finished: Option<Instant>,
}

/// One unit of separation work.
///
/// Only [`StateMachine::apply`](super::StateMachine::apply) mutates the lifecycle
/// fields, which keeps status, stage, timestamps and result consistent.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub stem_count: StemCount,
    pub mode: ExecutionMode,
    pub status: JobStatus,
    pub stage: Stage,
    pub progress: f64,
    pub status_history: Vec<JobStatus>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_path: Option<PathBuf>,
    pub result_size: Option<u64>,
    pub failure: Option<JobFailure>,
    pub expected_runtime: Duration,
    pub(super) clock: JobClock,
}

impl Job {
    pub fn new(stem_count: StemCount, mode: ExecutionMode, expected_runtime: Duration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            stem_count,
            mode,
            status: JobStatus::Pending,
            stage: Stage::Queued,
            progress: 0.0,
            status_history: vec![JobStatus::Pending],
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result_path: None,
            result_size: None,
            failure: None,
            expected_runtime,
            clock: JobClock {
                created: Instant::now(),
                started: None,
                stage_entered: None,
                finished: None,
            },
        }
    }

    /// First eight characters of the id, used in download names and log lines.
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }

    /// Advisory progress in `[0, 1]` at `now`.
    ///
    /// While separating, progress creeps from the stage floor towards the next stage
    /// by elapsed time over the expected runtime, never reaching the packaging floor.
    /// Only a completed job reports 1.0.
    pub fn estimated_progress(&self, now: Instant) -> f64 {
        match self.status {
            JobStatus::Pending => 0.0,
            JobStatus::Completed => 1.0,
            JobStatus::Failed => self.progress,
            JobStatus::Processing => {
                let floor = self.stage.progress_floor();
                let estimate = match (self.stage, self.clock.stage_entered) {
                    (Stage::Separating, Some(entered)) => {
                        let ratio = if self.expected_runtime.is_zero() {
                            1.0
                        } else {
                            (now.saturating_duration_since(entered).as_secs_f64()
                                / self.expected_runtime.as_secs_f64())
                            .min(1.0)
                        };
                        let span = Stage::Packaging.progress_floor() - floor;
                        floor + span * ratio * 0.95
                    }
                    _ => floor,
                };
                estimate.max(self.progress).clamp(0.0, 0.99)
            }
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> JobSnapshot {
        let elapsed_seconds = match (self.status, self.clock.started) {
            (JobStatus::Processing, Some(started)) => {
                Some(round2(now.saturating_duration_since(started).as_secs_f64()))
            }
            _ => None,
        };
        let processing_time_seconds = match (self.clock.started, self.clock.finished) {
            (Some(started), Some(finished)) => Some(round2(
                finished.saturating_duration_since(started).as_secs_f64(),
            )),
            _ => None,
        };

        JobSnapshot {
            job_id: self.id.clone(),
            status: self.status,
            stem_count: self.stem_count,
            mode: self.mode,
            stage: self.stage,
            progress: self.estimated_progress(now),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            elapsed_seconds,
            processing_time_seconds,
            result_size_bytes: self.result_size,
            error: self.failure.as_ref().map(|f| f.message.clone()),
            error_code: self.failure.as_ref().map(|f| f.code.clone()),
        }
    }

    /// Time since the job reached a terminal state.
    pub fn finished_for(&self, now: Instant) -> Option<Duration> {
        self.clock
            .finished
            .map(|finished| now.saturating_duration_since(finished))
    }

    /// Time since the job was created.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.clock.created)
    }
}

/// Read-only view of a job, safe to hand across the polling boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub stem_count: StemCount,
    pub mode: ExecutionMode,
    pub stage: Stage,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
