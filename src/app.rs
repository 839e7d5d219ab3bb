//! Core application runner for `parasite-listener`.
//!
//! Decoupled from process setup (logging, signals, exit codes) so it can be
//! driven in tests by a fake scanner and an in-memory output stream.

use crate::advertisement::Advertisement;
use crate::config::{Config, ConfigError, DeviceEntry};
use crate::dispatch::{Dispatcher, Sink};
use crate::history::SharedHistory;
use crate::mac_address::MacPrefix;
use crate::pipeline::{Pipeline, PipelineStats};
use crate::registry::{Alias, parse_alias};
use crate::scanner::{Backend, ScanError};
use crate::sink::metrics::MetricsError;
use crate::sink::{HistorySink, LineProtocolFormatter, LineProtocolSink, MetricsSink};
use clap::Parser;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

/// Command-line options. Flags override values from the config file.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Specify human-readable alias for a device key.
    /// Format: --alias F0:CA:F0:CA:0A:1E=Monstera
    #[arg(long = "alias", value_parser = parse_alias, value_name = "ALIAS")]
    pub aliases: Vec<Alias>,

    /// Only accept advertisements whose address starts with this prefix
    #[arg(long)]
    pub vendor_prefix: Option<String>,

    /// Only accept advertisements whose local name starts with this prefix
    #[arg(long)]
    pub local_name: Option<String>,

    /// Rebuild device keys from the address embedded in the payload when the
    /// platform reports opaque identifiers
    #[arg(long)]
    pub infer_mac_address: bool,

    /// Leading four octets used when inferring device keys
    #[arg(long, value_name = "PREFIX")]
    pub mac_address_prefix: Option<MacPrefix>,

    /// Readings kept in memory per device
    #[arg(long, value_name = "N")]
    pub history_capacity: Option<usize>,

    /// The name of the measurement in InfluxDB line protocol.
    #[arg(long)]
    pub influxdb_measurement: Option<String>,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    /// Load the config file, if any, and apply command-line overrides.
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        self.apply_to(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply_to(&self, config: &mut Config) {
        if let Some(prefix) = &self.vendor_prefix {
            config.ble.vendor_prefix = prefix.clone();
        }
        if let Some(name) = &self.local_name {
            config.ble.local_name = name.clone();
        }
        if self.infer_mac_address {
            config.ble.macos.infer_mac_address = true;
        }
        if let Some(prefix) = self.mac_address_prefix {
            config.ble.macos.mac_address_prefix = prefix.to_string();
        }
        if let Some(capacity) = self.history_capacity {
            config.history.capacity = capacity;
        }
        if let Some(measurement) = &self.influxdb_measurement {
            config.influxdb.measurement = measurement.clone();
        }
        for alias in &self.aliases {
            config.device.registry.insert(
                alias.key.clone(),
                DeviceEntry {
                    name: alias.name.clone(),
                },
            );
        }
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan(
        &self,
        backend: Backend,
    ) -> Pin<Box<dyn Future<Output = Result<mpsc::Receiver<Advertisement>, ScanError>> + Send + '_>>;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn start_scan(
        &self,
        backend: Backend,
    ) -> Pin<Box<dyn Future<Output = Result<mpsc::Receiver<Advertisement>, ScanError>> + Send + '_>>
    {
        Box::pin(crate::scanner::start_scan(backend))
    }
}

/// What a finished run leaves behind.
#[derive(Debug)]
pub struct RunSummary {
    pub stats: PipelineStats,
    pub history: SharedHistory,
}

fn build_sinks(
    config: &Config,
    history: &SharedHistory,
    out: Box<dyn Write + Send>,
) -> Result<Vec<Box<dyn Sink>>, RunError> {
    let devices = config.device_registry();
    let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(HistorySink::new(history.clone()))];

    if config.influxdb.enabled {
        sinks.push(Box::new(LineProtocolSink::new(
            LineProtocolFormatter::new(config.influxdb.measurement.clone()),
            devices.clone(),
            out,
        )));
    }
    if config.metrics.enabled {
        sinks.push(Box::new(MetricsSink::new(devices, config.metrics.options())?));
    }
    Ok(sinks)
}

/// Run the scanner loop until the advertisement stream ends or `shutdown` resolves.
///
/// Line protocol goes to `out`. On return every sink has drained its queue
/// and the latest reading of each device has been logged.
pub async fn run(
    config: &Config,
    backend: Backend,
    scanner: &dyn Scanner,
    out: Box<dyn Write + Send>,
    shutdown: impl Future<Output = ()>,
) -> Result<RunSummary, RunError> {
    let history = SharedHistory::new(config.history.capacity);
    let sinks = build_sinks(config, &history, out)?;
    let filter = config.advertisement_filter();
    let resolver = config.key_resolver()?;

    let advertisements = scanner.start_scan(backend).await?;
    info!(%backend, sinks = sinks.len(), "scanner started");

    let mut dispatcher = Dispatcher::new(config.dispatch.queue_policy());
    for sink in sinks {
        dispatcher.register(sink);
    }

    let stats = Pipeline::new(filter, resolver, dispatcher)
        .run(advertisements, shutdown)
        .await;

    for reading in history.latest_per_device() {
        info!("latest: {reading}");
    }

    Ok(RunSummary { stats, history })
}
