//! Interface de linha de comando do stemsplit baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (separate, warmup, config)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// stemsplit: separação de faixas de áudio em stems com jobs em segundo plano.
#[derive(Debug, Parser)]
#[command(name = "stemsplit", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho para o arquivo de configuração (padrão: ./stemsplit.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Separa um arquivo de áudio e grava o arquivo zip com os stems.
    Separate {
        /// Arquivo de áudio de entrada.
        file: PathBuf,

        /// Número de stems: 2, 4 ou 5.
        #[arg(long, short, default_value_t = 2)]
        stems: u8,

        /// Executa no caminho da chamada em vez de enfileirar o job.
        #[arg(long, default_value_t = false)]
        immediate: bool,

        /// Diretório onde o zip é gravado.
        #[arg(long, short, default_value = ".")]
        out: PathBuf,
    },

    /// Constrói os engines antecipadamente e mostra o tempo de cada um.
    Warmup {
        /// Números de stems a aquecer (padrão: `prewarm` da configuração).
        #[arg(long, short)]
        stems: Vec<u8>,
    },

    /// Mostra a configuração efetiva.
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_separate_subcommand() {
        let cli = Cli::parse_from(["stemsplit", "separate", "song.mp3", "--stems", "4"]);
        match cli.command {
            Command::Separate {
                file,
                stems,
                immediate,
                out,
            } => {
                assert_eq!(file, PathBuf::from("song.mp3"));
                assert_eq!(stems, 4);
                assert!(!immediate);
                assert_eq!(out, PathBuf::from("."));
            }
            _ => panic!("expected Separate command"),
        }
    }

    #[test]
    fn separate_defaults_to_two_stems() {
        let cli = Cli::parse_from(["stemsplit", "separate", "a.wav", "--immediate", "-o", "/tmp/out"]);
        match cli.command {
            Command::Separate {
                stems,
                immediate,
                out,
                ..
            } => {
                assert_eq!(stems, 2);
                assert!(immediate);
                assert_eq!(out, PathBuf::from("/tmp/out"));
            }
            _ => panic!("expected Separate command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "stemsplit",
            "--config",
            "/etc/stemsplit.toml",
            "--verbose",
            "config",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/stemsplit.toml")));
        assert!(matches!(cli.command, Command::Config));
    }

    #[test]
    fn cli_parses_repeated_warmup_stems() {
        let cli = Cli::parse_from(["stemsplit", "warmup", "-s", "2", "--stems", "5"]);
        match cli.command {
            Command::Warmup { stems } => assert_eq!(stems, vec![2, 5]),
            _ => panic!("expected Warmup command"),
        }
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
