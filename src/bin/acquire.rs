//! Voltage Acquisition Service
//!
//! Loads a YAML channel configuration, polls every valid channel and keeps
//! running until Ctrl-C. On Unix, SIGHUP reloads the configuration file.
//!
//! Usage: voltage-acquire --config channels.yaml [--log-dir DIR] [--validate]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use voltage_acquisition::{
    Engine, EngineConfig, EngineSettings, FourRemote, MemoryTelemetryStore, TelemetryStore,
};

#[derive(Debug, Parser)]
#[command(name = "voltage-acquire", version, about = "Multi-channel Modbus acquisition service")]
struct Args {
    /// Channel configuration file (YAML)
    #[arg(short, long, default_value = "config/channels.yaml")]
    config: PathBuf,

    /// Override the message log directory from the configuration
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,

    /// Seconds between channel summaries in the service log (0 disables)
    #[arg(long, default_value_t = 60)]
    summary_secs: u64,
}

fn load(args: &Args) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = EngineConfig::from_file(&args.config)?;
    if let Some(dir) = &args.log_dir {
        config.log_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    info!("{}", voltage_acquisition::info());

    let config = load(&args)?;
    let loaded = config.load_channels();
    if args.validate {
        let points: usize = loaded.channels.iter().map(|c| c.points().len()).sum();
        println!(
            "{}: {} channels valid ({} points), {} rejected",
            args.config.display(),
            loaded.channels.len(),
            points,
            loaded.rejected.len()
        );
        for err in &loaded.rejected {
            println!("  rejected: {}", err);
        }
        return Ok(());
    }

    let store = Arc::new(MemoryTelemetryStore::new());
    let mut engine = Engine::start(EngineSettings::from(&config), Arc::clone(&store));
    engine.reload(loaded.channels).await;

    #[cfg(unix)]
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    let mut summary = tokio::time::interval(Duration::from_secs(args.summary_secs.max(1)));
    summary.tick().await;

    loop {
        #[cfg(unix)]
        let reload = hangup.recv();
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            _ = reload => {
                info!("SIGHUP received, reloading {}", args.config.display());
                match load(&args) {
                    Ok(config) => {
                        let loaded = config.load_channels();
                        engine.reload(loaded.channels).await;
                    }
                    Err(e) => warn!("Reload skipped, configuration unreadable: {}", e),
                }
            }
            _ = summary.tick(), if args.summary_secs > 0 => {
                for id in engine.channel_ids() {
                    let Some(status) = engine.channel_status(id).await else {
                        continue;
                    };
                    let fresh: usize = FourRemote::ALL
                        .iter()
                        .map(|c| store.snapshot(id, *c).len())
                        .sum();
                    match &status.last_report {
                        Some(report) => info!(
                            "Channel {} ({}) {}: cycle {}, {}/{} batches ok, {} values held, {} requests, {} timeouts",
                            id,
                            status.name,
                            status.state,
                            report.cycle,
                            report.batches_ok,
                            status.batches,
                            fresh,
                            status.transport.requests_sent,
                            status.transport.timeouts
                        ),
                        None => info!("Channel {} ({}) {}: no cycle yet", id, status.name, status.state),
                    }
                }
                let dropped = engine.dropped_log_records();
                if dropped > 0 {
                    warn!("{} message log records dropped so far", dropped);
                }
            }
        }
    }

    engine.shutdown().await?;
    Ok(())
}
