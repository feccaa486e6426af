//! # Telemon
//!
//! Live dashboard for comma-separated telemetry streamed over serial ports.
//!
//! ```bash
//! telemon --create-config > telemon.toml
//! telemon --config telemon.toml
//! telemon --list
//! ```

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use telemon::config::{Config, EXAMPLE_CONFIG};
use telemon::display::{JsonlSink, TextSink};
use telemon::monitor::Coordinator;
use telemon::serial;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "telemon", version, about = "Live dashboard for serial CSV telemetry")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// List available serial ports and exit
    #[arg(long)]
    list: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    create_config: bool,

    /// Emit JSON lines instead of the text dashboard
    #[arg(long)]
    jsonl: bool,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Main entry point for telemon
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Set up logging with tracing subscriber
///    - Handle `--list` and `--create-config`
///    - Load and validate the configuration (errors are fatal)
///
/// 2. **Monitoring**
///    - Open every configured port; unavailable ports are reported and skipped
///    - Publish observations to the text or JSON-lines sink
///
/// 3. **Graceful Shutdown**
///    - On Ctrl+C close all ports and flush the display
///    - Log per-port statistics
///
/// # Errors
///
/// Returns error if the configuration cannot be loaded or no configured
/// port could be opened.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args)?;

    if args.create_config {
        print!("{}", EXAMPLE_CONFIG);
        return Ok(());
    }

    if args.list {
        return list_ports();
    }

    let Some(path) = args.config.as_deref() else {
        Args::command().print_help()?;
        bail!("no configuration given; create one with --create-config");
    };

    info!("Telemon v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    if config.ports.is_empty() {
        warn!("No ports configured in {}", path.display());
    }

    let mut coordinator = Coordinator::from_config(&config)?;
    if args.jsonl {
        coordinator.on_update(JsonlSink::stdout());
    } else {
        coordinator.on_update(TextSink::stdout());
    }

    let report = coordinator.start();
    if !config.ports.is_empty() && report.opened.is_empty() {
        coordinator.stop().await;
        bail!("none of the {} configured ports could be opened", config.ports.len());
    }

    info!("Monitoring \"{}\" on {} port(s)", config.title, report.opened.len());
    info!("Press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    coordinator.stop().await;

    for (port, stats) in coordinator.stats() {
        info!(
            port = %port,
            lines = stats.lines_received,
            records = stats.records_parsed,
            discarded = stats.lines_discarded,
            framing_errors = stats.framing_errors,
            "Session statistics"
        );
    }

    Ok(())
}

/// Install the tracing subscriber.
///
/// Logs go to stderr, or to `--log-file` through a non-blocking writer so
/// they do not interleave with the dashboard on stdout. The returned guard
/// must be held until exit to flush the file.
fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    match &args.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("invalid log file path {}", path.display()))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

fn list_ports() -> Result<()> {
    let ports = serial::list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    println!("Available serial ports:");
    for port in ports {
        println!("  {:<20} {} [{}]", port.name, port.description, port.hardware_id);
    }
    Ok(())
}
