//! InfluxDB line protocol output.

use crate::dispatch::{Sink, SinkFuture, SinkQueue};
use crate::reading::Reading;
use crate::registry::DeviceRegistry;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::time::SystemTime;
use tracing::{error, info};

/// Default measurement name.
pub const DEFAULT_MEASUREMENT: &str = "parasite_measurement";

/// Field values for InfluxDB line protocol
#[derive(Debug, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Float(num) => write!(f, "{num}"),
            FieldValue::Integer(num) => write!(f, "{num}i"),
        }
    }
}

/// Data point in InfluxDB line protocol
#[derive(Debug)]
pub struct DataPoint {
    pub measurement: String,
    pub tag_set: BTreeMap<String, String>,
    pub field_set: BTreeMap<String, FieldValue>,
    pub timestamp: Option<SystemTime>,
}

/// Escape commas, equals signs and spaces in a tag key or value.
fn write_escaped(fmt: &mut fmt::Formatter, s: &str) -> fmt::Result {
    for c in s.chars() {
        if matches!(c, ',' | '=' | ' ') {
            fmt.write_str("\\")?;
        }
        write!(fmt, "{c}")?;
    }
    Ok(())
}

impl fmt::Display for DataPoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.measurement)?;
        for (key, value) in &self.tag_set {
            fmt.write_str(",")?;
            write_escaped(fmt, key)?;
            fmt.write_str("=")?;
            write_escaped(fmt, value)?;
        }

        let mut separator = " ";
        for (key, value) in &self.field_set {
            write!(fmt, "{separator}{key}={value}")?;
            separator = ",";
        }

        // Times before the epoch are left for the server to stamp.
        if let Some(nanos) = self
            .timestamp
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
        {
            write!(fmt, " {nanos}")?;
        }
        Ok(())
    }
}

/// Turns readings into line-protocol data points.
#[derive(Debug, Clone)]
pub struct LineProtocolFormatter {
    measurement_name: String,
}

impl Default for LineProtocolFormatter {
    fn default() -> Self {
        Self::new(DEFAULT_MEASUREMENT)
    }
}

impl LineProtocolFormatter {
    pub fn new(measurement_name: impl Into<String>) -> Self {
        Self {
            measurement_name: measurement_name.into(),
        }
    }

    /// Tags are the device key and its display name.
    fn tag_set(reading: &Reading, name: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("key".to_string(), reading.device_key.clone()),
            ("name".to_string(), name.to_string()),
        ])
    }

    /// One float per metric carried by the reading, plus signal strength and counter.
    fn field_set(reading: &Reading) -> BTreeMap<String, FieldValue> {
        let mut fields: BTreeMap<String, FieldValue> = reading
            .measurements
            .iter()
            .map(|(metric, value)| (metric.as_str().to_string(), FieldValue::Float(*value)))
            .collect();
        fields.insert(
            "rssi".into(),
            FieldValue::Integer(reading.signal_strength.into()),
        );
        fields.insert(
            "sequence_counter".into(),
            FieldValue::Integer(reading.sequence_counter.into()),
        );
        fields
    }

    pub fn to_data_point(&self, reading: &Reading, name: &str) -> DataPoint {
        DataPoint {
            measurement: self.measurement_name.clone(),
            tag_set: Self::tag_set(reading, name),
            field_set: Self::field_set(reading),
            timestamp: Some(reading.observed_at),
        }
    }

    pub fn format(&self, reading: &Reading, name: &str) -> String {
        self.to_data_point(reading, name).to_string()
    }
}

/// Writes one line per reading to an output stream (stdout in the binary).
pub struct LineProtocolSink {
    formatter: LineProtocolFormatter,
    devices: DeviceRegistry,
    out: Box<dyn Write + Send>,
}

impl LineProtocolSink {
    pub fn new(
        formatter: LineProtocolFormatter,
        devices: DeviceRegistry,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            formatter,
            devices,
            out,
        }
    }

    /// Write every queued reading, returning how many lines were written.
    fn consume(mut self, mut queue: SinkQueue) -> u64 {
        let mut written = 0;
        while let Some(reading) = queue.blocking_recv() {
            // A broken output stream will not recover; stop consuming.
            if let Err(e) = self.write_reading(&reading) {
                error!(error = %e, "failed to write line protocol output");
                break;
            }
            written += 1;
        }
        written
    }

    fn write_reading(&mut self, reading: &Reading) -> std::io::Result<()> {
        let name = self.devices.resolve_name(&reading.device_key);
        let line = self.formatter.format(reading, name);
        writeln!(self.out, "{line}")?;
        self.out.flush()
    }
}

impl Sink for LineProtocolSink {
    fn name(&self) -> &str {
        "line-protocol"
    }

    fn start(self: Box<Self>, queue: SinkQueue) -> SinkFuture {
        Box::pin(async move {
            // Writes to stdout block when the reader stalls; keep them off the
            // runtime thread that drives the scanner loop.
            match tokio::task::spawn_blocking(move || self.consume(queue)).await {
                Ok(written) => info!(written, "line protocol sink finished"),
                Err(e) => error!(error = %e, "line protocol writer failed"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::reading::Metric;
    use crate::registry::parse_alias;
    use crate::test_utils::{SharedBuffer, soil_reading};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_field_value_display() {
        assert_eq!(format!("{}", FieldValue::Float(3.14)), "3.14");
        assert_eq!(format!("{}", FieldValue::Integer(-70)), "-70i");
    }

    #[test]
    fn test_data_point_format() {
        let tags = BTreeMap::from([
            ("name".to_string(), "test".to_string()),
            ("test".to_string(), "true".to_string()),
        ]);
        let fields = BTreeMap::from([
            ("temperature_c".to_string(), FieldValue::Float(32.0)),
            ("humidity_pct".to_string(), FieldValue::Float(20.5)),
        ]);
        let data_point = DataPoint {
            measurement: "test".to_string(),
            tag_set: tags,
            field_set: fields,
            timestamp: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000)),
        };

        assert_eq!(
            data_point.to_string(),
            "test,name=test,test=true humidity_pct=20.5,temperature_c=32 1000000000000000000"
        );
    }

    #[test]
    fn test_tag_values_are_escaped() {
        let data_point = DataPoint {
            measurement: "m".to_string(),
            tag_set: BTreeMap::from([("name".to_string(), "Living Room, a=b".to_string())]),
            field_set: BTreeMap::from([("v".to_string(), FieldValue::Float(1.0))]),
            timestamp: None,
        };
        assert_eq!(data_point.to_string(), r"m,name=Living\ Room\,\ a\=b v=1");
    }

    #[test]
    fn test_formatter_reading() {
        let reading = soil_reading("f0:ca:f0:ca:0a:1e", 3);
        let line = LineProtocolFormatter::default().format(&reading, "Monstera");

        assert!(line.starts_with("parasite_measurement,key=f0:ca:f0:ca:0a:1e,name=Monstera "));
        assert!(line.contains("temperature_c=21.5"));
        assert!(line.contains("soil_moisture_pct=25"));
        assert!(line.contains("rssi=-70i"));
        assert!(line.contains("sequence_counter=3i"));
        assert!(!line.contains("battery_pct="));
        assert!(line.ends_with(" 1700000000000000000"));
    }

    #[test]
    fn test_formatter_battery_percentage_field() {
        let mut reading = soil_reading("aa", 1);
        reading.measurements.remove(&Metric::SoilMoisture);
        reading.measurements.insert(Metric::BatteryPercentage, 87.0);
        let line = LineProtocolFormatter::new("plants").format(&reading, "aa");

        assert!(line.starts_with("plants,"));
        assert!(line.contains("battery_pct=87"));
        assert!(!line.contains("soil_moisture_pct="));
    }

    #[tokio::test]
    async fn test_sink_uses_registry_name() {
        let buffer = SharedBuffer::default();
        let mut devices = DeviceRegistry::new();
        devices.extend(&[parse_alias("AA:BB:CC:DD:EE:FF=Basil").unwrap()]);

        let mut dispatcher = Dispatcher::default();
        dispatcher.register(Box::new(LineProtocolSink::new(
            LineProtocolFormatter::default(),
            devices,
            Box::new(buffer.clone()),
        )));
        dispatcher
            .dispatch(Arc::new(soil_reading("aa:bb:cc:dd:ee:ff", 1)))
            .await;
        dispatcher
            .dispatch(Arc::new(soil_reading("11:22:33:44:55:66", 1)))
            .await;
        dispatcher.shutdown().await;

        let out = buffer.contents();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("key=aa:bb:cc:dd:ee:ff,name=Basil "));
        assert!(lines[1].contains("key=11:22:33:44:55:66,name=11:22:33:44:55:66 "));
        assert!(out.ends_with('\n'));
    }
}
