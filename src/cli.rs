//! Interface de linha de comando do contaforge baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (demo, config)
//! e flags globais (--config, --verbose).

use clap::{Parser, Subcommand};

/// contaforge — Motor de orquestração de criação de contas em lote.
#[derive(Debug, Parser)]
#[command(name = "contaforge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho para o arquivo de configuração TOML.
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa a demonstração embutida com o executor simulado.
    Demo {
        /// Número de perfis no lote de demonstração.
        #[arg(long, default_value_t = 3)]
        profiles: usize,

        /// Teto de execuções simultâneas do lote.
        #[arg(long)]
        max_concurrent: Option<usize>,
    },

    /// Mostra a configuração efetiva do motor.
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_demo_subcommand() {
        let cli = Cli::parse_from(["contaforge", "demo", "--profiles", "5"]);
        match cli.command {
            Command::Demo {
                profiles,
                max_concurrent,
            } => {
                assert_eq!(profiles, 5);
                assert!(max_concurrent.is_none());
            }
            _ => panic!("expected Demo command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "contaforge",
            "--config",
            "custom.toml",
            "--verbose",
            "config",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config.as_deref(), Some("custom.toml"));
        assert!(matches!(cli.command, Command::Config));
    }

    #[test]
    fn cli_demo_defaults() {
        let cli = Cli::parse_from(["contaforge", "demo"]);
        match cli.command {
            Command::Demo { profiles, .. } => assert_eq!(profiles, 3),
            _ => panic!("expected Demo command"),
        }
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
