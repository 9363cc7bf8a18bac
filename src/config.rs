//! Configuração do stemsplit carregada a partir de `stemsplit.toml`.
//!
//! A struct [`ServiceConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis; arquivo ausente
//! significa todos os defaults. As variáveis `STEMSPLIT_*` têm precedência sobre o arquivo.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::{EngineCommandConfig, ExecutionPolicy, StemCount};
use crate::files::FileLimits;

pub const DEFAULT_CONFIG_FILE: &str = "stemsplit.toml";

const MB: u64 = 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Where uploads are staged.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// Where workspaces and archives live.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Accepted upload extensions, without the dot.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: BTreeSet<String>,

    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    #[serde(default = "default_max_filename_len")]
    pub max_filename_len: usize,

    /// Free space that must remain after any write.
    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: u64,

    #[serde(default = "default_max_archive_size_mb")]
    pub max_archive_size_mb: u64,

    /// Requests admitted per client per window.
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,

    /// Idle time after which a client's window is forgotten.
    #[serde(default = "default_rate_idle_evict_secs")]
    pub rate_idle_evict_secs: u64,

    /// Worker tasks draining the deferred queue.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Wall-clock ceiling for one job execution.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// How long terminal jobs and their files are kept.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Release a job's files as soon as its result has been read.
    #[serde(default)]
    pub release_on_retrieval: bool,

    /// Operations slower than this are logged as slow.
    #[serde(default = "default_slow_operation_ms")]
    pub slow_operation_ms: u64,

    /// Rough separation time for a two-stem job, used for progress estimates.
    #[serde(default = "default_expected_separation_secs")]
    pub expected_separation_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `compact` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default)]
    pub execution_policy: ExecutionPolicy,

    /// Stem counts whose engines are built at start-up.
    #[serde(default = "default_prewarm")]
    pub prewarm: Vec<StemCount>,

    #[serde(default)]
    pub engine: EngineCommandConfig,
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("temp/uploads")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("temp/output")
}

fn default_allowed_extensions() -> BTreeSet<String> {
    FileLimits::default().allowed_extensions
}

fn default_max_file_size_mb() -> u64 {
    100
}

fn default_max_filename_len() -> usize {
    255
}

fn default_min_free_space_mb() -> u64 {
    200
}

fn default_max_archive_size_mb() -> u64 {
    500
}

fn default_rate_limit_per_minute() -> u32 {
    30
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_rate_idle_evict_secs() -> u64 {
    600
}

fn default_workers() -> usize {
    3
}

fn default_job_timeout_secs() -> u64 {
    1800
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_slow_operation_ms() -> u64 {
    1000
}

fn default_expected_separation_secs() -> u64 {
    90
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_prewarm() -> Vec<StemCount> {
    vec![StemCount::Two, StemCount::Four]
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            output_dir: default_output_dir(),
            allowed_extensions: default_allowed_extensions(),
            max_file_size_mb: default_max_file_size_mb(),
            max_filename_len: default_max_filename_len(),
            min_free_space_mb: default_min_free_space_mb(),
            max_archive_size_mb: default_max_archive_size_mb(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            rate_window_secs: default_rate_window_secs(),
            rate_idle_evict_secs: default_rate_idle_evict_secs(),
            workers: default_workers(),
            job_timeout_secs: default_job_timeout_secs(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            release_on_retrieval: false,
            slow_operation_ms: default_slow_operation_ms(),
            expected_separation_secs: default_expected_separation_secs(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            execution_policy: ExecutionPolicy::default(),
            prewarm: default_prewarm(),
            engine: EngineCommandConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load `stemsplit.toml` from the working directory, or defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<ServiceConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    // Environment variables win over the file.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        let set = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = set("STEMSPLIT_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(dir) = set("STEMSPLIT_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(level) = set("STEMSPLIT_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(workers) = set("STEMSPLIT_WORKERS") {
            self.workers = workers
                .trim()
                .parse()
                .with_context(|| format!("STEMSPLIT_WORKERS is not a number: {workers}"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        // Accept ".mp3" as well as "mp3".
        self.allowed_extensions = self
            .allowed_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        anyhow::ensure!(self.workers > 0, "workers must be at least 1");
        anyhow::ensure!(self.rate_window_secs > 0, "rate_window_secs must be positive");
        anyhow::ensure!(self.job_timeout_secs > 0, "job_timeout_secs must be positive");
        anyhow::ensure!(
            self.sweep_interval_secs > 0,
            "sweep_interval_secs must be positive"
        );
        Ok(())
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_file_size_mb * MB
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_operation_ms)
    }

    pub fn expected_separation(&self) -> Duration {
        Duration::from_secs(self.expected_separation_secs)
    }

    pub fn file_limits(&self) -> FileLimits {
        FileLimits {
            allowed_extensions: self.allowed_extensions.clone(),
            max_filename_len: self.max_filename_len,
            min_free_bytes: self.min_free_space_mb * MB,
            max_archive_bytes: self.max_archive_size_mb * MB,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.rate_limit_per_minute, 30);
        assert_eq!(config.workers, 3);
        assert_eq!(config.max_upload_bytes(), 100 * MB);
        assert_eq!(config.retention(), Duration::from_secs(3600));
        assert_eq!(config.execution_policy, ExecutionPolicy::Serialized);
        assert_eq!(config.prewarm, vec![StemCount::Two, StemCount::Four]);
        assert!(config.allowed_extensions.contains("m4a"));
        assert!(!config.release_on_retrieval);
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            workers = 8
            execution_policy = "concurrent"
            prewarm = [5]
            allowed_extensions = [".WAV", "mp3"]

            [engine]
            program = "/opt/spleeter/bin/spleeter"
        "#;
        let mut config: ServiceConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.execution_policy, ExecutionPolicy::Concurrent);
        assert_eq!(config.prewarm, vec![StemCount::Five]);
        assert_eq!(config.engine.program, "/opt/spleeter/bin/spleeter");
        assert_eq!(
            config.allowed_extensions.iter().cloned().collect::<Vec<_>>(),
            vec!["mp3", "wav"]
        );
        assert_eq!(config.rate_window_secs, 60);
    }

    #[test]
    fn invalid_prewarm_stem_count_is_rejected() {
        assert!(toml::from_str::<ServiceConfig>("prewarm = [3]").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = ServiceConfig::default();
        config
            .apply_env(|key| match key {
                "STEMSPLIT_OUTPUT_DIR" => Some("/srv/out".into()),
                "STEMSPLIT_WORKERS" => Some(" 6 ".into()),
                "STEMSPLIT_LOG_LEVEL" => Some(String::new()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/srv/out"));
        assert_eq!(config.workers, 6);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn bad_worker_env_is_an_error() {
        let mut config = ServiceConfig::default();
        let res = config.apply_env(|key| (key == "STEMSPLIT_WORKERS").then(|| "many".into()));
        assert!(res.is_err());
    }

    #[test]
    fn zero_workers_fail_validation() {
        let mut config = ServiceConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.job_timeout_secs, 1800);
    }

    #[test]
    fn load_from_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stemsplit.toml");
        std::fs::write(&path, "workers = \"three\"").unwrap();
        let err = ServiceConfig::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("stemsplit.toml"));
    }
}
