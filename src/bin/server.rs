//! # Server Binary Entry Point
//!
//! Thin wrapper that loads the configuration, wires the session engine to
//! the stand-in inference probe, and serves until ctrl-c.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin server -- --config config/server.toml
//! ```

use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Arc;

use pestdetect::common::config::load_config;
use pestdetect::inference::ImageProbeEngine;
use pestdetect::server::{shutdown_channel, ServerConfig, SessionServer};

/// Command-line arguments for the server binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the server configuration file (TOML format)
    ///
    /// Example: config/server.toml
    #[arg(short, long)]
    config: Option<String>,
}

/// Initialize the logging system with timestamp, level, and message formatting.
///
/// Logs are printed to stdout with INFO level by default.
/// Format: `[HH:MM:SS] [LEVEL] message`
fn init_logger() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter_level(LevelFilter::Info)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();
    let config: ServerConfig = match args.config {
        Some(path) => load_config(&path)?,
        None => ServerConfig::default(),
    };

    let server = Arc::new(SessionServer::new(config, Arc::new(ImageProbeEngine))?);
    let (handle, token) = shutdown_channel();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("🛑 ctrl-c received, shutting down");
            handle.trigger();
        }
    });

    server.run(token).await
}
