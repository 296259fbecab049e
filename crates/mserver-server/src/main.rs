//! mserver - multi-process line service entry point

mod echo;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use logging::Streams;
use mserver_common::config::Config;
use mserver_core::{describe_exit, Connection, ListenerConfig, Supervisor};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "mserver", version)]
#[command(about = "Fork-per-connection line echo server", long_about = None)]
struct Cli {
    /// Configuration file (default: ./mserver.toml, then /etc/mserver/mserver.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stay in the foreground instead of detaching
    #[arg(short, long)]
    foreground: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_layered(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::load()?,
    };
    config.validate()?;

    let streams = if config.server.mode.is_stdio() {
        Streams::Session
    } else if cli.check || cli.foreground || config.server.foreground {
        Streams::Free
    } else {
        Streams::Detached
    };
    logging::init_logging(&config.logging, streams)?;

    let mut supervisor = Supervisor::from_config(&config.server, &config.listeners)?;
    if cli.check {
        println!(
            "configuration OK: {} listener(s)",
            supervisor.configured_count()
        );
        return Ok(());
    }
    if cli.foreground {
        supervisor.set_foreground(true);
    }
    supervisor.set_strexit(describe_exit);

    let ident = config
        .server
        .ident
        .clone()
        .unwrap_or_else(|| "mserver".to_string());
    supervisor.set_handler(move |conn: Connection, _: &ListenerConfig| {
        echo::serve_connection(conn, &ident)
    });

    if supervisor.mode().is_stdio() {
        let status = supervisor.serve_stdio()?;
        std::process::exit(status);
    }

    info!("Starting mserver...");
    supervisor.start()?;
    supervisor.run()?;
    supervisor.stop()?;

    Ok(())
}
