//! Sensor reading data structure.

use crate::decoder::PayloadSchema;
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// A physical quantity carried by a sensor broadcast.
///
/// Which metrics are present depends on the [`PayloadSchema`] the broadcast
/// was decoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    /// Temperature in Celsius
    Temperature,
    /// Relative air humidity in percent (0-100)
    Humidity,
    /// Battery voltage in Volts
    BatteryVoltage,
    /// Battery charge in percent (0-100)
    BatteryPercentage,
    /// Soil moisture in percent (0-100)
    SoilMoisture,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Temperature,
        Metric::Humidity,
        Metric::BatteryVoltage,
        Metric::BatteryPercentage,
        Metric::SoilMoisture,
    ];

    /// Stable metric name used by sinks.
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Temperature => "temperature_c",
            Metric::Humidity => "humidity_pct",
            Metric::BatteryVoltage => "battery_voltage_v",
            Metric::BatteryPercentage => "battery_pct",
            Metric::SoilMoisture => "soil_moisture_pct",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric values of one reading, ordered by metric.
pub type Measurements = BTreeMap<Metric, f64>;

/// One accepted broadcast from a sensor.
///
/// Produced once per non-duplicate broadcast and shared read-only between
/// sinks afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Stable identity of the physical sensor
    pub device_key: String,
    /// Wrap-around broadcast counter (0-15), the only duplicate signal
    pub sequence_counter: u8,
    /// Layout the payload was decoded with
    pub schema: PayloadSchema,
    /// Physical measurements keyed by metric
    pub measurements: Measurements,
    /// Received signal strength in dBm
    pub signal_strength: i16,
    /// Local reception time (the sensor has no clock)
    pub observed_at: SystemTime,
}

impl Reading {
    /// Value of a single metric, if the schema carries it.
    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.measurements.get(&metric).copied()
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.device_key)?;
        for (metric, value) in &self.measurements {
            write!(f, " | {metric}: {value:.2}")?;
        }
        write!(
            f,
            " | rssi: {}dBm | counter: {}",
            self.signal_strength, self.sequence_counter
        )
    }
}
