mod cli;
mod ui;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use cli::{Cli, Command};
use stemsplit::engine::{CommandEngineFactory, StemCount};
use stemsplit::files::Upload;
use stemsplit::{JobResult, SeparationService, ServiceConfig, Submission, SubmitRequest};
use ui::JobProgress;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServiceConfig::load_from(path)?,
        None => ServiceConfig::load()?,
    };
    if cli.verbose {
        config.log_level = "debug".to_string();
    }

    if matches!(cli.command, Command::Config) {
        println!("{}", toml::to_string_pretty(&config).context("failed to render config")?);
        return Ok(());
    }

    stemsplit::logging::init_logging(&config.log_level, &config.log_format)?;
    let factory = Arc::new(CommandEngineFactory::new(config.engine.clone()));

    match cli.command {
        Command::Separate {
            file,
            stems,
            immediate,
            out,
        } => {
            // The CLI runs one job; no need to pre-build other engines.
            config.prewarm.clear();
            let service = SeparationService::new(config, factory)?;
            let result = separate(&service, &file, stems, immediate, &out, cli.verbose).await;
            service.shutdown().await;
            result
        }
        Command::Warmup { stems } => {
            let keys = if stems.is_empty() {
                config.prewarm.clone()
            } else {
                stems
                    .into_iter()
                    .map(|n| StemCount::try_from(n).map_err(anyhow::Error::msg))
                    .collect::<Result<Vec<_>>>()?
            };
            let service = SeparationService::new(config, factory)?;
            let results = service.warmup(&keys).await;
            ui::print_warmup(&results);
            service.shutdown().await;
            if results.iter().any(|(_, r)| r.is_err()) {
                bail!("some engines failed to initialize");
            }
            Ok(())
        }
        Command::Config => Ok(()),
    }
}

async fn separate(
    service: &SeparationService,
    file: &Path,
    stems: u8,
    immediate: bool,
    out: &Path,
    verbose: bool,
) -> Result<()> {
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", file.display()))?;
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let mut request = SubmitRequest::new(Upload::new(filename, bytes), stems);
    if immediate {
        request = request.immediate();
    }

    let progress = JobProgress::start(filename);
    if immediate {
        progress.message(&format!("separating {filename} into {stems} stems"));
    }
    let submission = match service.submit("cli", request).await {
        Ok(submission) => submission,
        Err(e) => {
            progress.fail(&e);
            return Err(e.into());
        }
    };

    let job_id = submission.job_id().to_string();
    let download = match submission {
        Submission::Immediate(download) => download,
        Submission::Deferred { job_id, .. } => loop {
            let snapshot = service.status(&job_id)?;
            progress.update(&snapshot);
            if snapshot.status.is_terminal() {
                match service.result(&job_id).await {
                    Ok(JobResult::Ready(download)) => break download,
                    Ok(JobResult::NotReady(status)) => bail!("job {job_id} is still {status}"),
                    Err(e) => {
                        progress.fail(&e);
                        return Err(e.into());
                    }
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        },
    };

    tokio::fs::create_dir_all(out)
        .await
        .with_context(|| format!("failed to create {}", out.display()))?;
    let dest = out.join(&download.filename);
    tokio::fs::write(&dest, &download.bytes)
        .await
        .with_context(|| format!("failed to write {}", dest.display()))?;
    progress.complete(&dest, download.bytes.len());

    if verbose {
        if let Ok(snapshot) = service.status(&job_id) {
            progress.print_snapshot(&snapshot);
        }
    }
    service.release(&job_id);
    Ok(())
}
