mod job;
mod state;

pub use job::{ExecutionMode, Job, JobFailure, JobSnapshot, JobStatus, Stage};
pub use state::{InvalidTransition, StateMachine, Transition};
