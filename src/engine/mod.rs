//! The Separation Engine seam and the handles the cache hands out.
//!
//! Engines are blocking and potentially slow: construction loads a model, a run may
//! take minutes. Both are driven from `spawn_blocking` so async workers stay free.

mod cache;
mod command;
pub mod stems;
#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

pub use cache::ResourceCache;
pub use command::{CommandEngineFactory, EngineCommandConfig};
pub use stems::{AudioFormat, Stem, StemCount};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Construction (model load, warm-up) failed.
    #[error("{0}")]
    Init(String),

    /// The engine ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    #[error("engine IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking task running the engine panicked or was cancelled.
    #[error("engine task aborted: {0}")]
    Aborted(String),
}

/// A warm, reusable separator for one stem count.
pub trait SeparationEngine: Send + Sync {
    /// Separate `input` into stem files under `output_dir`.
    fn separate(&self, input: &Path, output_dir: &Path) -> Result<(), EngineError>;

    /// Format of the stem files this engine writes.
    fn output_format(&self) -> AudioFormat {
        AudioFormat::Wav
    }

    /// Whether two `separate` calls may overlap on the same instance.
    fn supports_concurrent_use(&self) -> bool {
        false
    }
}

/// Builds engines. Construction is the expensive warm-up the cache amortizes.
pub trait EngineFactory: Send + Sync {
    fn build(&self, stems: StemCount) -> Result<Arc<dyn SeparationEngine>, EngineError>;
}

/// How concurrent jobs share one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPolicy {
    /// One in-flight separation per handle; later callers queue in FIFO order.
    #[default]
    Serialized,
    /// Overlapping separations, honoured only for engines that declare support.
    Concurrent,
}

/// Cheap clone of a cached engine plus its execution gate.
#[derive(Clone)]
pub struct EngineHandle {
    stems: StemCount,
    engine: Arc<dyn SeparationEngine>,
    gate: Option<Arc<Mutex<()>>>,
    created_at: Instant,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("stems", &self.stems)
            .field("serialized", &self.gate.is_some())
            .finish()
    }
}

impl EngineHandle {
    pub(crate) fn new(
        stems: StemCount,
        engine: Arc<dyn SeparationEngine>,
        policy: ExecutionPolicy,
    ) -> Self {
        let concurrent = match policy {
            ExecutionPolicy::Concurrent if engine.supports_concurrent_use() => true,
            ExecutionPolicy::Concurrent => {
                tracing::warn!(
                    stems = %stems,
                    "engine does not support concurrent use, serializing runs"
                );
                false
            }
            ExecutionPolicy::Serialized => false,
        };
        Self {
            stems,
            engine,
            gate: (!concurrent).then(|| Arc::new(Mutex::new(()))),
            created_at: Instant::now(),
        }
    }

    pub fn stems(&self) -> StemCount {
        self.stems
    }

    pub fn output_format(&self) -> AudioFormat {
        self.engine.output_format()
    }

    pub fn is_serialized(&self) -> bool {
        self.gate.is_some()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// True when both handles wrap the same engine instance.
    pub fn same_engine(&self, other: &EngineHandle) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }

    /// Run one separation, waiting for the handle's turn under the serialized policy.
    ///
    /// `keep_alive` is moved into the blocking task and dropped only when the engine
    /// returns, so resources it owns (the job workspace) outlive an abandoned await.
    pub async fn run<K>(&self, input: PathBuf, output_dir: PathBuf, keep_alive: K) -> Result<(), EngineError>
    where
        K: Send + 'static,
    {
        let permit = match &self.gate {
            Some(gate) => Some(Arc::clone(gate).lock_owned().await),
            None => None,
        };
        let engine = Arc::clone(&self.engine);

        tokio::task::spawn_blocking(move || {
            let result = engine.separate(&input, &output_dir);
            drop(permit);
            drop(keep_alive);
            result
        })
        .await
        .map_err(|e| EngineError::Aborted(e.to_string()))?
    }
}
