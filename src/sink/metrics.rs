//! Prometheus gauges for the latest reading of every device.
//!
//! The gauges live in a sink-owned [`Registry`]. When a textfile path is
//! configured the text exposition is rewritten every refresh interval, in the
//! format read by the node-exporter textfile collector. Devices that stop
//! broadcasting have their label sets removed after the expiry period.

use crate::dispatch::{Sink, SinkFuture, SinkQueue};
use crate::reading::{Metric, Reading};
use crate::registry::DeviceRegistry;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const NAMESPACE: &str = "parasite";
const LABELS: &[&str] = &["key", "name"];
const MIN_REFRESH: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("failed to write metrics textfile: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsOptions {
    /// Where to write the text exposition, if anywhere
    pub textfile: Option<PathBuf>,
    /// Drop a device's gauges after this long without a reading
    pub expiry: Duration,
    /// How often expiry runs and the textfile is rewritten
    pub refresh: Duration,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            textfile: None,
            expiry: Duration::from_secs(1500),
            refresh: Duration::from_secs(10),
        }
    }
}

/// The gauge set and the registry it is registered in.
#[derive(Debug, Clone)]
pub struct ExporterMetrics {
    registry: Registry,
    measurements: BTreeMap<Metric, GaugeVec>,
    rssi: GaugeVec,
    frame: GaugeVec,
}

fn gauge_name(metric: Metric) -> (&'static str, &'static str) {
    match metric {
        Metric::Temperature => ("temperature_celsius", "Temperature in Celsius."),
        Metric::Humidity => ("humidity_percent", "Relative air humidity in percent."),
        Metric::BatteryVoltage => ("battery_volts", "Battery in Volt."),
        Metric::BatteryPercentage => ("battery_percent", "Battery in percent."),
        Metric::SoilMoisture => ("soil_moisture_percent", "Soil moisture in percent."),
    }
}

impl ExporterMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let gauge = |name: &str, help: &str| -> Result<GaugeVec, MetricsError> {
            let vec = GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), LABELS)?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        let mut measurements = BTreeMap::new();
        for metric in Metric::ALL {
            let (name, help) = gauge_name(metric);
            measurements.insert(metric, gauge(name, help)?);
        }
        let rssi = gauge("rssi_dbm", "Received Signal Strength Indication.")?;
        let frame = gauge("frame_current", "Current frame number.")?;

        Ok(Self {
            registry,
            measurements,
            rssi,
            frame,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn all_gauges(&self) -> impl Iterator<Item = &GaugeVec> {
        self.measurements.values().chain([&self.rssi, &self.frame])
    }

    /// Set every gauge the reading carries.
    pub fn observe(&self, reading: &Reading, name: &str) {
        let labels = [reading.device_key.as_str(), name];
        for (metric, value) in &reading.measurements {
            if let Some(gauge) = self.measurements.get(metric) {
                gauge.with_label_values(&labels).set(*value);
            }
        }
        self.rssi
            .with_label_values(&labels)
            .set(f64::from(reading.signal_strength));
        self.frame
            .with_label_values(&labels)
            .set(f64::from(reading.sequence_counter));
    }

    /// Remove a device's label set from every gauge.
    pub fn remove(&self, key: &str, name: &str) {
        for gauge in self.all_gauges() {
            // Absent when the device's schema never carried this metric.
            let _ = gauge.remove_label_values(&[key, name]);
        }
    }

    /// Text exposition of the whole registry.
    pub fn render(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Replace `path` with the current exposition via a temporary file and rename.
    pub fn write_textfile(&self, path: &Path) -> Result<(), MetricsError> {
        write_atomic(path, &self.render()?)?;
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

struct SeenDevice {
    name: String,
    last_seen: Instant,
}

pub struct MetricsSink {
    metrics: ExporterMetrics,
    devices: DeviceRegistry,
    options: MetricsOptions,
    seen: HashMap<String, SeenDevice>,
}

impl MetricsSink {
    pub fn new(devices: DeviceRegistry, options: MetricsOptions) -> Result<Self, MetricsError> {
        Ok(Self {
            metrics: ExporterMetrics::new()?,
            devices,
            options,
            seen: HashMap::new(),
        })
    }

    /// Handle on the gauges, usable after the sink has been started.
    pub fn metrics(&self) -> ExporterMetrics {
        self.metrics.clone()
    }

    fn record(&mut self, reading: &Reading) {
        let name = self.devices.resolve_name(&reading.device_key).to_string();
        self.metrics.observe(reading, &name);
        self.seen.insert(
            reading.device_key.clone(),
            SeenDevice {
                name,
                last_seen: Instant::now(),
            },
        );
    }

    fn expire(&mut self, now: Instant) {
        let expiry = self.options.expiry;
        let metrics = &self.metrics;
        self.seen.retain(|key, device| {
            let alive = now.duration_since(device.last_seen) < expiry;
            if !alive {
                info!(device = %key, name = %device.name, "device expiring");
                metrics.remove(key, &device.name);
            }
            alive
        });
    }

    /// Rewrite the textfile on the blocking pool so a stalled disk only
    /// delays this sink.
    async fn flush(&self) {
        let Some(path) = self.options.textfile.clone() else {
            return;
        };
        let text = match self.metrics.render() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to render metrics");
                return;
            }
        };
        let target = path.clone();
        match tokio::task::spawn_blocking(move || write_atomic(&target, &text)).await {
            Ok(Ok(())) => debug!(path = %path.display(), devices = self.seen.len(), "metrics textfile written"),
            Ok(Err(e)) => warn!(path = %path.display(), error = %e, "failed to write metrics textfile"),
            Err(e) => warn!(path = %path.display(), error = %e, "metrics textfile writer failed"),
        }
    }
}

impl Sink for MetricsSink {
    fn name(&self) -> &str {
        "metrics"
    }

    fn start(mut self: Box<Self>, mut queue: SinkQueue) -> SinkFuture {
        Box::pin(async move {
            let mut refresh = tokio::time::interval(self.options.refresh.max(MIN_REFRESH));
            refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    next = queue.recv() => match next {
                        Some(reading) => self.record(&reading),
                        None => break,
                    },
                    _ = refresh.tick() => {
                        self.expire(Instant::now());
                        self.flush().await;
                    }
                }
            }

            self.flush().await;
            info!(devices = self.seen.len(), "metrics sink finished");
        })
    }
}
