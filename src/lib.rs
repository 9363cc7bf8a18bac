//! Job orchestration and engine caching for audio stem separation.
//!
//! A [`SeparationService`](service::SeparationService) accepts uploads, admits them
//! through a per-client rate window, and runs them on a pool of workers against cached
//! separation engines. Results are packaged into zip archives that live until they are
//! retrieved or the retention period runs out.

pub mod config;
pub mod engine;
pub mod error;
pub mod files;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod rate_limit;
pub mod service;
pub mod state_machine;

pub use config::ServiceConfig;
pub use error::{ErrorKind, ServiceError};
pub use orchestrator::{ArchiveDownload, JobOrchestrator, JobResult, Submission, SubmitRequest};
pub use service::SeparationService;
