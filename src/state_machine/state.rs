use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;

use super::job::{Job, JobFailure, JobStatus, Stage};

/// A requested change to a job's lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `Pending` → `Processing`.
    Start,
    /// Move forward inside `Processing`.
    Advance(Stage),
    /// `Processing` → `Completed` with a fully written archive.
    Complete { result_path: PathBuf, size: u64 },
    /// Any non-terminal status → `Failed`.
    Fail(JobFailure),
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Start => write!(f, "START"),
            Transition::Advance(stage) => write!(f, "ADVANCE({stage:?})"),
            Transition::Complete { .. } => write!(f, "COMPLETE"),
            Transition::Fail(_) => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("cannot apply {transition} to a job that is {status} ({stage:?})")]
pub struct InvalidTransition {
    pub status: JobStatus,
    pub stage: Stage,
    pub transition: String,
}

/// Drives a `Job` through `pending → processing → completed | failed`.
pub struct StateMachine;

impl StateMachine {
    /// Apply `transition` to `job`, returning the resulting status.
    ///
    /// - `Start` is accepted only from `Pending`.
    /// - `Advance` is accepted only while `Processing` and only to a later stage
    ///   short of `Done`.
    /// - `Complete` is accepted only from `Processing`.
    /// - `Fail` is accepted from any non-terminal status.
    ///
    /// A rejected transition leaves the job untouched.
    pub fn apply(
        job: &mut Job,
        transition: Transition,
        now: Instant,
    ) -> Result<JobStatus, InvalidTransition> {
        let allowed = match (&transition, job.status) {
            (Transition::Start, JobStatus::Pending) => true,
            (Transition::Advance(stage), JobStatus::Processing) => {
                *stage > job.stage && *stage < Stage::Done
            }
            (Transition::Complete { .. }, JobStatus::Processing) => true,
            (Transition::Fail(_), status) => !status.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(InvalidTransition {
                status: job.status,
                stage: job.stage,
                transition: transition.to_string(),
            });
        }

        match transition {
            Transition::Start => {
                job.status = JobStatus::Processing;
                job.stage = Stage::AcquiringEngine;
                job.progress = Stage::AcquiringEngine.progress_floor();
                job.started_at = Some(Utc::now());
                job.clock.started = Some(now);
                job.clock.stage_entered = Some(now);
                job.status_history.push(JobStatus::Processing);
            }
            Transition::Advance(stage) => {
                // Keep whatever the estimate already showed so progress never steps back.
                job.progress = job.estimated_progress(now).max(stage.progress_floor());
                job.stage = stage;
                job.clock.stage_entered = Some(now);
            }
            Transition::Complete { result_path, size } => {
                job.status = JobStatus::Completed;
                job.stage = Stage::Done;
                job.progress = 1.0;
                job.result_path = Some(result_path);
                job.result_size = Some(size);
                job.completed_at = Some(Utc::now());
                job.clock.finished = Some(now);
                job.status_history.push(JobStatus::Completed);
            }
            Transition::Fail(failure) => {
                job.progress = job.estimated_progress(now).min(0.99);
                job.status = JobStatus::Failed;
                job.failure = Some(failure);
                job.completed_at = Some(Utc::now());
                job.clock.finished = Some(now);
                job.status_history.push(JobStatus::Failed);
            }
        }

        Ok(job.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StemCount;
    use crate::state_machine::ExecutionMode;
    use std::time::Duration;

    fn make_job() -> Job {
        Job::new(
            StemCount::Four,
            ExecutionMode::Deferred,
            Duration::from_secs(30),
        )
    }

    fn failure(msg: &str) -> JobFailure {
        JobFailure {
            code: "transformation_failed".into(),
            message: msg.into(),
        }
    }

    #[test]
    fn happy_path_walks_all_statuses() {
        let mut job = make_job();
        let now = Instant::now();

        assert_eq!(
            StateMachine::apply(&mut job, Transition::Start, now),
            Ok(JobStatus::Processing)
        );
        assert!(job.started_at.is_some());
        assert_eq!(job.stage, Stage::AcquiringEngine);

        StateMachine::apply(&mut job, Transition::Advance(Stage::Separating), now).unwrap();
        StateMachine::apply(&mut job, Transition::Advance(Stage::Packaging), now).unwrap();
        assert_eq!(job.progress, 0.7);

        let status = StateMachine::apply(
            &mut job,
            Transition::Complete {
                result_path: PathBuf::from("/tmp/out.zip"),
                size: 12,
            },
            now,
        )
        .unwrap();
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(job.progress, 1.0);
        assert_eq!(job.result_path, Some(PathBuf::from("/tmp/out.zip")));
        assert_eq!(
            job.status_history,
            vec![JobStatus::Pending, JobStatus::Processing, JobStatus::Completed]
        );
    }

    #[test]
    fn terminal_states_are_final() {
        let mut job = make_job();
        let now = Instant::now();
        StateMachine::apply(&mut job, Transition::Start, now).unwrap();
        StateMachine::apply(&mut job, Transition::Fail(failure("boom")), now).unwrap();

        let err = StateMachine::apply(&mut job, Transition::Start, now).unwrap_err();
        assert_eq!(err.status, JobStatus::Failed);
        assert!(StateMachine::apply(&mut job, Transition::Fail(failure("again")), now).is_err());
        assert!(
            StateMachine::apply(
                &mut job,
                Transition::Complete {
                    result_path: PathBuf::from("x.zip"),
                    size: 1
                },
                now
            )
            .is_err()
        );
        assert_eq!(job.failure.as_ref().unwrap().message, "boom");
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn cannot_complete_a_pending_job() {
        let mut job = make_job();
        let res = StateMachine::apply(
            &mut job,
            Transition::Complete {
                result_path: PathBuf::from("x.zip"),
                size: 1,
            },
            Instant::now(),
        );
        assert!(res.is_err());
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.result_path.is_none());
    }

    #[test]
    fn stages_only_move_forward() {
        let mut job = make_job();
        let now = Instant::now();
        StateMachine::apply(&mut job, Transition::Start, now).unwrap();
        StateMachine::apply(&mut job, Transition::Advance(Stage::Packaging), now).unwrap();

        assert!(
            StateMachine::apply(&mut job, Transition::Advance(Stage::Separating), now).is_err()
        );
        assert!(StateMachine::apply(&mut job, Transition::Advance(Stage::Done), now).is_err());
        assert_eq!(job.stage, Stage::Packaging);
    }

    #[test]
    fn failing_freezes_progress_below_one() {
        let mut job = make_job();
        let now = Instant::now();
        StateMachine::apply(&mut job, Transition::Start, now).unwrap();
        StateMachine::apply(&mut job, Transition::Advance(Stage::Separating), now).unwrap();
        StateMachine::apply(
            &mut job,
            Transition::Fail(failure("engine crashed")),
            now + Duration::from_secs(15),
        )
        .unwrap();

        assert!(job.progress >= 0.3);
        assert!(job.progress < 1.0);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn pending_job_can_fail() {
        let mut job = make_job();
        StateMachine::apply(&mut job, Transition::Fail(failure("shutdown")), Instant::now())
            .unwrap();
        assert_eq!(job.status_history, vec![JobStatus::Pending, JobStatus::Failed]);
    }

    #[test]
    fn transition_display() {
        assert_eq!(Transition::Start.to_string(), "START");
        assert_eq!(
            Transition::Advance(Stage::Packaging).to_string(),
            "ADVANCE(Packaging)"
        );
    }
}
