use std::time::Duration;

use thiserror::Error;

use crate::engine::EngineError;
use crate::files::FileError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Payload too large: {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Insufficient storage: {available} bytes free, {required} required")]
    InsufficientStorage { available: u64, required: u64 },

    #[error("Engine initialization failed: {0}")]
    EngineInitFailed(String),

    #[error("Transformation failed: {0}")]
    TransformationFailed(String),

    #[error("Job exceeded the {}s execution ceiling", .0.as_secs())]
    Timeout(Duration),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Who is expected to act on an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// The request itself was wrong; retrying it unchanged will fail again.
    Client,
    /// The host is short of something (disk); the caller may retry later.
    Environment,
    /// Execution broke down; the job is marked failed and not retried.
    Processing,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Client => write!(f, "Client"),
            ErrorKind::Environment => write!(f, "Environment"),
            ErrorKind::Processing => write!(f, "Processing"),
        }
    }
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::InvalidParameter(_)
            | ServiceError::PayloadTooLarge { .. }
            | ServiceError::RateLimited { .. }
            | ServiceError::JobNotFound(_) => ErrorKind::Client,
            ServiceError::InsufficientStorage { .. } => ErrorKind::Environment,
            ServiceError::EngineInitFailed(_)
            | ServiceError::TransformationFailed(_)
            | ServiceError::Timeout(_)
            | ServiceError::JobFailed(_)
            | ServiceError::Io(_) => ErrorKind::Processing,
        }
    }

    /// Stable machine-readable code, stored on failed jobs.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidParameter(_) => "invalid_parameter",
            ServiceError::PayloadTooLarge { .. } => "payload_too_large",
            ServiceError::RateLimited { .. } => "rate_limited",
            ServiceError::InsufficientStorage { .. } => "insufficient_storage",
            ServiceError::EngineInitFailed(_) => "engine_init_failed",
            ServiceError::TransformationFailed(_) => "transformation_failed",
            ServiceError::Timeout(_) => "timeout",
            ServiceError::JobNotFound(_) => "job_not_found",
            ServiceError::JobFailed(_) => "job_failed",
            ServiceError::Io(_) => "io_error",
        }
    }

    /// Suggested HTTP status for a transport layer.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::InvalidParameter(_) => 400,
            ServiceError::PayloadTooLarge { .. } => 413,
            ServiceError::RateLimited { .. } => 429,
            ServiceError::InsufficientStorage { .. } => 507,
            ServiceError::JobNotFound(_) => 404,
            ServiceError::Timeout(_) => 504,
            ServiceError::EngineInitFailed(_)
            | ServiceError::TransformationFailed(_)
            | ServiceError::JobFailed(_)
            | ServiceError::Io(_) => 500,
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Init(msg) => ServiceError::EngineInitFailed(msg),
            other => ServiceError::TransformationFailed(other.to_string()),
        }
    }
}

impl From<FileError> for ServiceError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::InvalidFilename(msg) => ServiceError::InvalidParameter(msg),
            FileError::InsufficientStorage {
                available,
                required,
            } => ServiceError::InsufficientStorage {
                available,
                required,
            },
            FileError::Io(e) => ServiceError::Io(e),
            other => ServiceError::TransformationFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_follow_taxonomy() {
        assert_eq!(
            ServiceError::InvalidParameter("stems".into()).kind(),
            ErrorKind::Client
        );
        assert_eq!(
            ServiceError::RateLimited {
                retry_after_secs: 3
            }
            .kind(),
            ErrorKind::Client
        );
        assert_eq!(
            ServiceError::InsufficientStorage {
                available: 1,
                required: 2
            }
            .kind(),
            ErrorKind::Environment
        );
        assert_eq!(
            ServiceError::Timeout(Duration::from_secs(5)).kind(),
            ErrorKind::Processing
        );
    }

    #[test]
    fn timeout_display() {
        let err = ServiceError::Timeout(Duration::from_secs(90));
        assert_eq!(err.to_string(), "Job exceeded the 90s execution ceiling");
        assert_eq!(err.code(), "timeout");
        assert_eq!(err.http_status(), 504);
    }

    #[test]
    fn engine_errors_map_to_processing_variants() {
        let init: ServiceError = EngineError::Init("model missing".into()).into();
        assert!(matches!(init, ServiceError::EngineInitFailed(ref m) if m == "model missing"));

        let run: ServiceError = EngineError::Failed("bad frame".into()).into();
        assert!(matches!(run, ServiceError::TransformationFailed(_)));
    }

    #[test]
    fn file_errors_map_to_client_and_environment_variants() {
        let bad: ServiceError = FileError::InvalidFilename("a/../b".into()).into();
        assert_eq!(bad.kind(), ErrorKind::Client);

        let full: ServiceError = FileError::InsufficientStorage {
            available: 10,
            required: 20,
        }
        .into();
        assert_eq!(full.http_status(), 507);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ServiceError>();
    }
}
