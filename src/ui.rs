//! Interface de terminal do stemsplit: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente
//! a execução de um job no terminal a partir dos snapshots de status.

use std::fmt::Display;
use std::path::Path;
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use stemsplit::engine::StemCount;
use stemsplit::state_machine::{JobSnapshot, JobStatus};

/// Indicador visual de progresso para a execução de um job no terminal.
///
/// Exibe um spinner animado durante o processamento e mensagens
/// coloridas para sucesso (verde) e falha (vermelho).
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    /// Inicia o spinner com o nome do arquivo e retorna a instância de progresso.
    pub fn start(label: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("submitting {label}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza a mensagem do spinner com status, etapa e progresso estimado.
    pub fn update(&self, snapshot: &JobSnapshot) {
        self.pb.set_message(format!(
            "{} {:?} {:>3.0}%",
            snapshot.status,
            snapshot.stage,
            snapshot.progress * 100.0
        ));
    }

    /// Mensagem livre enquanto o job roda no caminho da chamada.
    pub fn message(&self, msg: &str) {
        self.pb.set_message(msg.to_string());
    }

    /// Finaliza o spinner e mostra onde o zip foi gravado.
    pub fn complete(&self, path: &Path, bytes: usize) {
        self.pb.finish_and_clear();
        println!(
            "  {} Wrote {} ({bytes} bytes)",
            self.green.apply_to("✓"),
            path.display()
        );
    }

    /// Finaliza o spinner com a mensagem de erro em vermelho.
    pub fn fail(&self, err: &dyn Display) {
        self.pb.finish_and_clear();
        println!("  {} Job failed: {err}", self.red.apply_to("✗"));
    }

    /// Imprime o snapshot do job formatado em JSON com estilo colorido.
    pub fn print_snapshot(&self, snapshot: &JobSnapshot) {
        let status_style = match snapshot.status {
            JobStatus::Completed => &self.green,
            JobStatus::Failed => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", status_style.apply_to("─── Job ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(snapshot).unwrap_or_default()
        );
    }
}

/// Uma linha por engine aquecido: verde com o tempo, vermelho com o erro.
pub fn print_warmup<E: Display>(results: &[(StemCount, Result<Duration, E>)]) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    for (stems, result) in results {
        match result {
            Ok(elapsed) => println!(
                "  {} {} ready in {:.2}s",
                green.apply_to("✓"),
                stems.model_name(),
                elapsed.as_secs_f64()
            ),
            Err(e) => println!("  {} {}: {e}", red.apply_to("✗"), stems.model_name()),
        }
    }
}
