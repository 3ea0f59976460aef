use clap::{Parser, Subcommand};
use std::path::PathBuf;
use trafcacc_core::Role;

#[derive(Debug, Parser)]
#[command(
    name = "trafcacc",
    version,
    about = "Multipath TCP/UDP traffic accelerator"
)]
pub struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Accept application connections and spread them over the links
    Frontend {
        #[command(subcommand)]
        action: Action,
    },

    /// Accept links and forward connections to the real service
    Backend {
        #[command(subcommand)]
        action: Action,
    },

    /// Run either role from flags alone, without a config file
    Accelerate {
        /// Address ranges to listen on (`tcp://host:port-port,...`)
        #[arg(long)]
        listen: String,

        /// Address ranges to forward to
        #[arg(long)]
        upstream: String,

        /// frontend or backend
        #[arg(long)]
        role: Role,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum Action {
    /// Run in the foreground
    Run,

    /// Write a default config file (does not overwrite unless --force)
    InitConfig {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },

    /// Print the resolved config file path
    PrintConfigPath,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_accelerate() {
        let cli = Cli::try_parse_from([
            "trafcacc",
            "accelerate",
            "--listen",
            "tcp://127.0.0.1:1080",
            "--upstream",
            "tcp://10.0.0.2:41000-41003",
            "--role",
            "frontend",
        ])
        .unwrap();
        match cli.command {
            Command::Accelerate { role, .. } => assert_eq!(role, Role::Frontend),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_backend_init_config() {
        let cli = Cli::try_parse_from([
            "trafcacc",
            "--config",
            "/tmp/b.toml",
            "backend",
            "init-config",
            "--force",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/b.toml")));
        assert!(matches!(
            cli.command,
            Command::Backend {
                action: Action::InitConfig { force: true }
            }
        ));
    }
}
