use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use trafcacc::cli::{Action, Cli, Command};
use trafcacc::config;
use trafcacc_core::accelerate::{self, LogFn};
use trafcacc_core::{BackendConfig, EngineConfig, FrontendConfig, Role};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Frontend { action } => run_role(Role::Frontend, cli.config, action).await,
        Command::Backend { action } => run_role(Role::Backend, cli.config, action).await,
        Command::Accelerate {
            listen,
            upstream,
            role,
        } => {
            let stop = stop_on_ctrl_c();
            accelerate::accelerate(&listen, &upstream, role, EngineConfig::default(), stop, log_fn()).await
        }
    }
}

async fn run_role(role: Role, config_override: Option<PathBuf>, action: Action) -> Result<()> {
    let config_path = match config_override {
        Some(p) => p,
        None => config::default_config_path(role)?,
    };

    match action {
        Action::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        Action::InitConfig { force } => {
            match role {
                Role::Frontend => config::save(&config_path, &FrontendConfig::default(), force)?,
                Role::Backend => config::save(&config_path, &BackendConfig::default(), force)?,
            }
            println!("Wrote default config to {}", config_path.display());
            Ok(())
        }
        Action::Run => run(role, &config_path).await,
    }
}

async fn run(role: Role, config_path: &Path) -> Result<()> {
    let stop = stop_on_ctrl_c();
    match role {
        Role::Frontend => {
            let cfg: FrontendConfig = config::load(config_path)?;
            accelerate::run_frontend(cfg, stop, log_fn()).await
        }
        Role::Backend => {
            let cfg: BackendConfig = config::load(config_path)?;
            accelerate::run_backend(cfg, stop, log_fn()).await
        }
    }
}

fn log_fn() -> LogFn {
    Box::new(|m| tracing::info!("{m}"))
}

fn stop_on_ctrl_c() -> watch::Receiver<bool> {
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received");
            let _ = stop_tx.send(true);
        }
        // Hold the sender until every receiver is gone.
        stop_tx.closed().await;
    });
    stop_rx
}
