//! CLI Entry Point for typhos
//!
//! Loads devices from the configuration catalog, attaches them to an alarm
//! service and logs every change of the aggregate alarm summary until
//! interrupted.
//!
//! # Usage
//!
//! ```bash
//! typhos                         # every catalog device
//! typhos motor1 slits --kind-level config
//! typhos --config lab.toml -v --format json
//! ```
//!
//! Channel state comes from the mock transport, seeded with the simulated
//! `connected`/`severity` values of each catalog signal.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use typhos::alarm::{service, AlarmAggregator, AlarmIndicator, KindLevel};
use typhos::config::{TyphosConfig, DEFAULT_CONFIG_PATH};
use typhos::logging::{self, OutputFormat, TracingConfig};
use typhos::mock::MockTransport;

#[derive(Parser)]
#[command(name = "typhos", version)]
#[command(about = "Aggregate alarm summary for instrument devices", long_about = None)]
struct Cli {
    /// Device names to load from the catalog (all devices when omitted)
    devices: Vec<String>,

    /// Configuration file with the device catalog
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Which signals take part in the summary (hinted, normal, config, omitted)
    #[arg(long)]
    kind_level: Option<KindLevel>,

    /// Show the debug logging stream
    #[arg(short, long)]
    verbose: bool,

    /// Log output format (pretty, compact, json)
    #[arg(long, default_value = "pretty")]
    format: OutputFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = TyphosConfig::load_from(&cli.config)?;
    if cli.verbose {
        config.application.log_level = "debug".to_string();
    }
    if let Some(kind_level) = cli.kind_level {
        config.alarm.kind_level = kind_level;
    }
    config.validate()?;

    let level = logging::parse_log_level(&config.application.log_level)?;
    logging::init(
        TracingConfig::new(level)
            .with_format(cli.format)
            .with_file_and_line(cli.verbose),
    )?;
    info!(config = %cli.config.display(), name = %config.application.name, "configuration loaded");

    let (devices, missing) = config.select_devices(&cli.devices);
    for name in &missing {
        error!(device = %name, "device not in catalog, unable to load entry");
    }
    if devices.is_empty() {
        warn!("no devices to watch");
        return Ok(());
    }

    let transport = Arc::new(MockTransport::from_devices(&devices));
    let aggregator = AlarmAggregator::with_kind_level(transport, config.alarm.kind_level);
    let (handle, task) = service::spawn(aggregator);
    let mut indicator = AlarmIndicator::new(config.alarm.shape, handle.watch());
    let mut changes = handle.subscribe_changes().await?;

    for device in devices {
        let name = device.name.clone();
        info!(device = %name, "loading device");
        match handle.attach(Arc::new(device)).await {
            Ok(()) => {
                let channels = handle.device_channels(name.as_str()).await?.unwrap_or_default();
                debug!(device = %name, ?channels, "device in alarm summary");
            }
            Err(e) if e.is_isolated() => {
                error!(device = %name, error = %e, "unable to add device to alarm summary");
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(
        channels = handle.channels().await?.len(),
        kind_level = %config.alarm.kind_level,
        shape = indicator.shape_name(),
        "watching alarm summary, Ctrl-C to quit"
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) => {
                    indicator.update();
                    info!(
                        previous = %change.previous,
                        current = %change.current,
                        color = ?indicator.color(),
                        "alarm summary changed"
                    );
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "summary log lagging behind"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    handle.shutdown().await?;
    task.await?;
    info!("execution complete");
    Ok(())
}
