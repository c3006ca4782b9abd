//! hopmesh CLI — runs one overlay server.

mod cli;
mod ui;

use clap::Parser;
use cli::Cli;
use hopmesh_kernel::config::{default_config_path, load_config};
use hopmesh_kernel::HopmeshKernel;
use std::path::Path;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Trace to stderr and append the same events to the activity log.
fn init_tracing(log_path: &Path) {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path);

    match file {
        Ok(file) => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(
                    fmt::layer()
                        .with_writer(std::sync::Mutex::new(file))
                        .with_ansi(false),
                )
                .init();
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(std::io::stderr)
                .init();
            warn!(
                path = %log_path.display(),
                error = %e,
                "Cannot open activity log, logging to stderr only"
            );
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref());
    cli.apply(&mut config);
    let log_path = config.log_path();
    init_tracing(&log_path);

    info!("=== New server instance started ===");
    info!(
        group_id = %config.group_id,
        port = config.listen_port,
        scan = config.scan_on_start,
        seeds = config.seeds.len(),
        "Server starting"
    );

    ui::banner(&config.group_id, config.listen_port);
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    ui::kv("Config", &config_path.display().to_string());
    ui::kv("Log", &log_path.display().to_string());

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to create Tokio runtime: {e}"));
            std::process::exit(1);
        }
    };

    let result = rt.block_on(async move {
        let kernel = HopmeshKernel::boot(config).await?;
        kernel.run().await
    });

    if let Err(e) = result {
        error!(error = %e, "Server stopped");
        ui::error(&e.to_string());
        std::process::exit(1);
    }
    info!("Server stopped");
}
