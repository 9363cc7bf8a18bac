//! Per-operation timing and memory aggregation.
//!
//! Samples are folded into running totals on record, so a snapshot is a cheap copy of
//! the aggregates. Operations slower than the threshold are logged at `warn`.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Aggregated statistics for one operation name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationStats {
    pub count: u64,
    pub avg_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
    pub total_secs: f64,
    pub avg_memory_mb: Option<f64>,
    pub max_memory_mb: Option<f64>,
}

#[derive(Debug, Clone, Default)]
struct Aggregate {
    count: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
    memory_samples: u64,
    memory_total: u128,
    memory_max: u64,
}

impl Aggregate {
    fn add(&mut self, duration: Duration, memory: Option<u64>) {
        self.count += 1;
        self.total += duration;
        self.min = Some(self.min.map_or(duration, |m| m.min(duration)));
        self.max = self.max.max(duration);
        if let Some(bytes) = memory {
            self.memory_samples += 1;
            self.memory_total += u128::from(bytes);
            self.memory_max = self.memory_max.max(bytes);
        }
    }

    fn stats(&self) -> OperationStats {
        let mb = |bytes: f64| bytes / (1024.0 * 1024.0);
        let total_secs = self.total.as_secs_f64();
        OperationStats {
            count: self.count,
            avg_secs: if self.count > 0 {
                total_secs / self.count as f64
            } else {
                0.0
            },
            min_secs: self.min.unwrap_or_default().as_secs_f64(),
            max_secs: self.max.as_secs_f64(),
            total_secs,
            avg_memory_mb: (self.memory_samples > 0)
                .then(|| mb(self.memory_total as f64 / self.memory_samples as f64)),
            max_memory_mb: (self.memory_samples > 0).then(|| mb(self.memory_max as f64)),
        }
    }
}

/// Samples the resident set size of this process.
pub struct MemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self {
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
        }
    }
}

impl MemoryProbe {
    /// Resident memory in bytes, if the platform reports it.
    pub fn sample(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        system.process(pid).map(|p| p.memory())
    }
}

pub struct MetricsRecorder {
    slow_threshold: Duration,
    memory: Option<MemoryProbe>,
    operations: RwLock<HashMap<String, Aggregate>>,
}

impl MetricsRecorder {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            slow_threshold,
            memory: Some(MemoryProbe::default()),
            operations: RwLock::new(HashMap::new()),
        }
    }

    /// Recorder that never samples memory.
    pub fn without_memory(slow_threshold: Duration) -> Self {
        Self {
            memory: None,
            ..Self::new(slow_threshold)
        }
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    pub fn record(&self, operation: &str, duration: Duration, memory_bytes: Option<u64>) {
        if duration > self.slow_threshold {
            tracing::warn!(
                operation,
                elapsed_secs = duration.as_secs_f64(),
                threshold_secs = self.slow_threshold.as_secs_f64(),
                "slow operation detected"
            );
        }
        let mut ops = self.operations.write().unwrap_or_else(|e| e.into_inner());
        ops.entry(operation.to_string())
            .or_default()
            .add(duration, memory_bytes);
    }

    /// Time `fut`, sample memory afterwards and record both under `operation`.
    /// Recorded whether the future succeeds or fails.
    pub async fn measure<F, T>(&self, operation: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let started = Instant::now();
        let out = fut.await;
        let memory = self.memory.as_ref().and_then(MemoryProbe::sample);
        self.record(operation, started.elapsed(), memory);
        out
    }

    pub fn snapshot(&self) -> BTreeMap<String, OperationStats> {
        let ops = self.operations.read().unwrap_or_else(|e| e.into_inner());
        ops.iter()
            .map(|(name, agg)| (name.clone(), agg.stats()))
            .collect()
    }

    pub fn reset(&self) {
        self.operations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
