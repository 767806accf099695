//! Mowfleet Backend
//!
//! Device-facing backend for a fleet of remotely operated lawnmowers. Binds
//! one TCP listener per provisioned device and speaks the authenticated
//! framed protocol the mowers implement in firmware.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mowfleet_backend::registry::DeviceRegistry;
use mowfleet_backend::server;
use mowfleet_backend::telemetry::{InMemoryTelemetry, TelemetrySink};

/// Mowfleet Backend - device protocol engine for the mowfleet management system
#[derive(Parser, Debug)]
#[command(name = "mowfleet-backend")]
#[command(about = "Fleet management backend for remotely operated lawnmowers")]
#[command(version)]
struct Args {
    /// Path to the provisioned-device registry (JSON array)
    #[arg(short, long, default_value = "devices.json")]
    registry: PathBuf,

    /// Run in background (minimal output)
    #[arg(long)]
    background: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    if !args.background {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };

        FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .compact()
            .init();
    }

    let registry = Arc::new(DeviceRegistry::load(&args.registry)?);
    if registry.is_empty() {
        warn!("Device registry {} is empty", args.registry.display());
    }

    let sink: Arc<dyn TelemetrySink> = Arc::new(InMemoryTelemetry::new());

    // Print startup banner
    if !args.background {
        println!();
        println!("╔═══════════════════════════════════════════════════════════╗");
        println!("║            Mowfleet Backend v{}                         ║", env!("CARGO_PKG_VERSION"));
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║  Provisioned devices: {:<4}                                ║", registry.len());
        for device in registry.list_provisioned_devices() {
            println!("║    {:<12} port {:<5}                                ║", device.device_id, device.port);
        }
        println!("╚═══════════════════════════════════════════════════════════╝");
        println!();
    }

    // Start the listeners
    if let Err(e) = server::run(registry, sink).await {
        error!("Server error: {}", e);
        return Err(e);
    }

    Ok(())
}
