//! External separator program (the Spleeter CLI by default) as a Separation Engine.

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{AudioFormat, EngineError, EngineFactory, SeparationEngine, StemCount};

/// `[engine]` table of the service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCommandConfig {
    /// Executable to run.
    #[serde(default = "default_program")]
    pub program: String,

    /// Argument template; `{input}`, `{output}` and `{stems}` are substituted.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Run once while constructing the engine, e.g. to fetch and load the model.
    #[serde(default)]
    pub warmup_args: Option<Vec<String>>,

    /// Format of the stem files the program writes.
    #[serde(default)]
    pub output_format: AudioFormat,

    /// Whether separate invocations may run side by side.
    #[serde(default)]
    pub concurrent: bool,
}

fn default_program() -> String {
    "spleeter".to_string()
}

fn default_args() -> Vec<String> {
    ["separate", "-p", "spleeter:{stems}stems", "-o", "{output}", "{input}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for EngineCommandConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            warmup_args: None,
            output_format: AudioFormat::default(),
            concurrent: false,
        }
    }
}

fn render(template: &[String], stems: StemCount, input: &Path, output: &Path) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{stems}", &stems.get().to_string())
                .replace("{input}", &input.to_string_lossy())
                .replace("{output}", &output.to_string_lossy())
        })
        .collect()
}

// Last few lines of stderr, enough to explain a failure without flooding the job record.
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().rev().take(5).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join("\n")
}

/// Builds [`CommandEngine`]s from an [`EngineCommandConfig`].
pub struct CommandEngineFactory {
    config: EngineCommandConfig,
}

impl CommandEngineFactory {
    pub fn new(config: EngineCommandConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for CommandEngineFactory {
    fn build(&self, stems: StemCount) -> Result<Arc<dyn SeparationEngine>, EngineError> {
        if let Some(warmup) = &self.config.warmup_args {
            let args = render(warmup, stems, Path::new(""), Path::new(""));
            let output = Command::new(&self.config.program)
                .args(&args)
                .stdin(Stdio::null())
                .output()
                .map_err(|e| {
                    EngineError::Init(format!("cannot start {}: {e}", self.config.program))
                })?;
            if !output.status.success() {
                return Err(EngineError::Init(format!(
                    "warm-up of {} exited with {}: {}",
                    stems.model_name(),
                    output.status,
                    stderr_tail(&output.stderr)
                )));
            }
        }

        Ok(Arc::new(CommandEngine {
            stems,
            config: self.config.clone(),
        }))
    }
}

/// One configured invocation of the external program per separation.
pub struct CommandEngine {
    stems: StemCount,
    config: EngineCommandConfig,
}

impl SeparationEngine for CommandEngine {
    fn separate(&self, input: &Path, output_dir: &Path) -> Result<(), EngineError> {
        let args = render(&self.config.args, self.stems, input, output_dir);
        tracing::debug!(program = %self.config.program, ?args, "running separator");

        let output = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()?;

        if output.status.success() {
            Ok(())
        } else {
            Err(EngineError::Failed(format!(
                "{} exited with {}: {}",
                self.config.program,
                output.status,
                stderr_tail(&output.stderr)
            )))
        }
    }

    fn output_format(&self) -> AudioFormat {
        self.config.output_format
    }

    fn supports_concurrent_use(&self) -> bool {
        self.config.concurrent
    }
}
