//! portwardend
//!
//! Boots the host described by a TOML file, then supervises it until SIGINT
//! or SIGTERM.

use anyhow::Context;
use clap::Parser;
use daemon::{bootstrap, load_config, shutdown_signal, HostOptions};
use portwarden_core::ledger::DEFAULT_SWEEP_GRACE;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "portwardend")]
#[command(about = "Supervise local services and terminal servers")]
#[command(version)]
struct Cli {
    /// Host file with [supervisor], [terminal], [[services]] and [[terminals]]
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Pid ledger path (defaults to PORTWARDEN_LEDGER or the temp dir)
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Validate the host file and exit
    #[arg(long)]
    check: bool,

    /// Print the JSON schema of the host file and exit
    #[arg(long)]
    print_schema: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.print_schema {
        let schema = schemars::schema_for!(portwarden_core::HostConfig);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }
    portwarden_core::utils::init_tracing(&cli.log_level)?;

    if cli.check {
        let config = load_config(cli.config.as_deref())?;
        println!(
            "ok: {} services, {} terminals",
            config.services.len(),
            config.terminals.len()
        );
        return Ok(());
    }

    info!("Starting portwardend {}", env!("CARGO_PKG_VERSION"));
    let host = bootstrap(HostOptions {
        config_path: cli.config,
        ledger_path: cli.ledger,
        sweep_grace: DEFAULT_SWEEP_GRACE,
    })
    .await
    .context("host failed to boot")?;
    host.log_status();

    shutdown_signal().await.context("failed to listen for shutdown signals")?;
    info!("Shutdown signal received");
    host.shutdown().await;
    Ok(())
}
