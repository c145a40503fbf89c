//! # Client Binary Entry Point
//!
//! Connects, authenticates, sends every image it was pointed at, and
//! optionally exports transfer metrics.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin client -- --config config/client.toml \
//!   --password jagapadi2024 \
//!   --image-dir ./test_images \
//!   --metrics-output ./metrics/run1.json
//! ```

use clap::Parser;
use env_logger::Builder;
use log::{error, info, LevelFilter};
use std::io::Write;
use std::path::PathBuf;

use pestdetect::client::{ClientConfig, ClientConnection, ClientMetrics};
use pestdetect::common::config::load_config;

/// Command-line arguments for the client binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the client configuration file (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// Session password
    #[arg(short, long)]
    password: String,

    /// Single image to send
    #[arg(long)]
    image: Option<PathBuf>,

    /// Directory of images to send, in directory order
    #[arg(long)]
    image_dir: Option<PathBuf>,

    /// Path to write metrics JSON output (optional)
    #[arg(long)]
    metrics_output: Option<String>,
}

/// Initialize the logging system with timestamp, level, and message formatting.
///
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

fn collect_images(args: &Args) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    if let Some(image) = &args.image {
        paths.push(image.clone());
    }
    if let Some(dir) = &args.image_dir {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() {
                paths.push(path);
            }
        }
    }
    if paths.is_empty() {
        anyhow::bail!("nothing to send: pass --image or --image-dir");
    }
    Ok(paths)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();
    let config: ClientConfig = match &args.config {
        Some(path) => load_config(path)?,
        None => ClientConfig::default(),
    };
    let images = collect_images(&args)?;

    let mut client = ClientConnection::new(config)?;
    let report = client.connect(&args.password).await;
    if !report.success {
        anyhow::bail!("{}", report.message);
    }

    let mut metrics = ClientMetrics::new("pestdetect-client".to_string());
    for path in &images {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.jpg")
            .to_string();
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("skipping {}: {e}", path.display());
                metrics.record_failure(&name, format!("read failed: {e}"));
                continue;
            }
        };
        match client.send_image(&name, &bytes).await {
            Ok(transfer) => {
                info!(
                    "result for {name}: {} ({} bytes) -> {}",
                    transfer.format_hint,
                    transfer.plaintext_bytes,
                    transfer.output_path.display()
                );
                metrics.record_success(&transfer);
            }
            Err(e) => {
                error!("transfer failed for {name}: {e}");
                metrics.record_failure(&name, e.to_string());
                if !client.connected() {
                    let retry = client.connect(&args.password).await;
                    if !retry.success {
                        error!("reconnect failed: {}", retry.message);
                        break;
                    }
                }
            }
        }
    }

    client.disconnect().await;

    if let Some(output_path) = args.metrics_output {
        metrics.export_to_json(&output_path)?;
        info!("metrics exported to: {output_path}");
    }

    Ok(())
}
