//! IPU daemon entry point.
//!
//! ```text
//! ipu-daemon                  Run in the foreground
//! ipu-daemon --config <path>  Load a custom config TOML
//! ipu-daemon --gen-config     Write default config to stdout
//! ipu-daemon --plan           Print the slot layout for the configured pipeline
//! ```

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ipu_core::LayoutPlanner;
use ipu_daemon::config::DaemonConfig;
use ipu_daemon::service::DaemonService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "ipu-daemon", about = "IPU frame slot manager daemon")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "ipu-daemon.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Print the region table for the configured pipeline and exit.
    #[arg(long)]
    plan: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&DaemonConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = DaemonConfig::load(&cli.config);

    // --plan: show where every surface lands inside a slot.
    if cli.plan {
        let table = LayoutPlanner::new(config.pool.slot_size).plan(&config.pipeline)?;
        println!("{}", serde_json::to_string_pretty(&table)?);
        return Ok(());
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.file)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    }

    info!("ipu-daemon v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "pool: {:#x} + {:#x}, slot size {:#x}",
        config.pool.base, config.pool.size, config.pool.slot_size
    );
    info!("control: {}:{}", config.control.listen_addr, config.control.port);
    if config.simulation.enabled {
        info!("simulated frames at {} fps", config.simulation.fps);
    }

    let service = DaemonService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    let stop_clone = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop_clone.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
