//! SFTP server binary
//!
//! Run with: cargo run --bin kestrel-sftp-server

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use kestrel_sftp::{Config, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Root directory clients are jailed to
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(root) = args.root {
        config.root_dir = root;
    }

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr(),
        root_dir = ?config.root_dir,
        "starting Kestrel SFTP server"
    );

    if !config.root_dir.exists() {
        std::fs::create_dir_all(&config.root_dir)
            .with_context(|| format!("creating root directory {}", config.root_dir.display()))?;
    }

    let server = Server::new(config).context("creating server")?;
    server.run().context("running server")?;

    info!(event = "server_shutdown", "server shutdown complete");
    Ok(())
}
