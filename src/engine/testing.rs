//! Engine doubles shared by the unit tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{EngineError, EngineFactory, SeparationEngine, StemCount};

/// Writes one small file per expected stem.
pub(crate) struct FakeEngine {
    stems: StemCount,
    reentrant: bool,
    nested: Option<PathBuf>,
    delay: Duration,
    skip_last: bool,
}

impl FakeEngine {
    pub(crate) fn new(stems: StemCount) -> Self {
        Self {
            stems,
            reentrant: false,
            nested: None,
            delay: Duration::ZERO,
            skip_last: false,
        }
    }

    pub(crate) fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }

    /// Write stems under `output/<dir>/` the way the Spleeter CLI does.
    pub(crate) fn nested(mut self, dir: &str) -> Self {
        self.nested = Some(PathBuf::from(dir));
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Leave out the last stem, simulating an incomplete run.
    pub(crate) fn missing_stem(mut self) -> Self {
        self.skip_last = true;
        self
    }
}

impl SeparationEngine for FakeEngine {
    fn separate(&self, input: &Path, output_dir: &Path) -> Result<(), EngineError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let dir = match &self.nested {
            Some(sub) => output_dir.join(sub),
            None => output_dir.to_path_buf(),
        };
        std::fs::create_dir_all(&dir)?;

        let stems = self.stems.stems();
        let take = if self.skip_last { stems.len() - 1 } else { stems.len() };
        for stem in &stems[..take] {
            let body = format!("{} from {}", stem.name(), input.display());
            std::fs::write(dir.join(stem.file_name(self.output_format())), body)?;
        }
        Ok(())
    }

    fn supports_concurrent_use(&self) -> bool {
        self.reentrant
    }
}

/// Writes a partial artifact, then fails.
pub(crate) struct FailingEngine {
    pub(crate) message: String,
}

impl SeparationEngine for FailingEngine {
    fn separate(&self, _input: &Path, output_dir: &Path) -> Result<(), EngineError> {
        std::fs::write(output_dir.join("vocals.wav"), b"partial")?;
        Err(EngineError::Failed(self.message.clone()))
    }
}

/// Sleeps inside `separate` and records how many runs overlapped.
pub(crate) struct SlowEngine {
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    runs: AtomicUsize,
}

impl SlowEngine {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        }
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl SeparationEngine for SlowEngine {
    fn separate(&self, _input: &Path, _output_dir: &Path) -> Result<(), EngineError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type MakeEngine = Box<dyn Fn(StemCount) -> Arc<dyn SeparationEngine> + Send + Sync>;

/// Counts constructions; can be slowed down or made to fail its first builds.
pub(crate) struct FakeFactory {
    builds: AtomicUsize,
    failures_left: AtomicUsize,
    build_delay: Duration,
    make: MakeEngine,
}

impl FakeFactory {
    pub(crate) fn new() -> Self {
        Self::with_engine(|stems| Arc::new(FakeEngine::new(stems)))
    }

    pub(crate) fn with_engine<F>(make: F) -> Self
    where
        F: Fn(StemCount) -> Arc<dyn SeparationEngine> + Send + Sync + 'static,
    {
        Self {
            builds: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            build_delay: Duration::ZERO,
            make: Box::new(make),
        }
    }

    pub(crate) fn build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    pub(crate) fn fail_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub(crate) fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl EngineFactory for FakeFactory {
    fn build(&self, stems: StemCount) -> Result<Arc<dyn SeparationEngine>, EngineError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if !self.build_delay.is_zero() {
            std::thread::sleep(self.build_delay);
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EngineError::Init(format!("model {} unavailable", stems.model_name())));
        }
        Ok((self.make)(stems))
    }
}
