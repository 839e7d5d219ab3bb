use crate::decoder::PayloadSchema;
use crate::reading::{Measurements, Metric, Reading};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, SystemTime};

/// A stable hardware address for unit tests.
pub const TEST_ADDRESS: &str = "f0:ca:f0:ca:00:01";

/// Soil-moisture payload: counter 5, 4000 mV, 300 m°C, humidity 0x8000, soil 0x4000.
pub fn soil_payload() -> Vec<u8> {
    soil_payload_with_counter(5)
}

pub fn soil_payload_with_counter(counter: u8) -> Vec<u8> {
    vec![0x00, counter & 0x0f, 0x0F, 0xA0, 0x01, 0x2C, 0x80, 0x00, 0x40, 0x00]
}

/// Battery-percentage payload: counter 9, 2950 mV, humidity 0x4000, 87 %.
///
/// The temperature bytes are left to the caller.
pub fn battery_payload(temp_hi: u8, temp_lo: u8) -> Vec<u8> {
    vec![
        0x00, 0x09, 0x0B, 0x86, temp_hi, temp_lo, 0x40, 0x00, 0x00, 87, 0x1A,
    ]
}

/// A soil-moisture reading with fixed values and a deterministic timestamp.
pub fn soil_reading(device_key: &str, sequence_counter: u8) -> Reading {
    let measurements = Measurements::from([
        (Metric::Temperature, 21.5),
        (Metric::Humidity, 48.0),
        (Metric::BatteryVoltage, 2.9),
        (Metric::SoilMoisture, 25.0),
    ]);
    Reading {
        device_key: device_key.to_string(),
        sequence_counter,
        schema: PayloadSchema::SoilMoisture,
        measurements,
        signal_strength: -70,
        observed_at: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
    }
}

/// In-memory writer whose contents stay readable after being moved into a sink.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writer that blocks every write until `release` is dropped, like a stdout
/// pipe nobody reads. Gives up waiting after a few seconds.
#[derive(Debug)]
pub struct StalledWriter {
    release: mpsc::Receiver<()>,
    out: SharedBuffer,
}

impl StalledWriter {
    pub fn new(release: mpsc::Receiver<()>, out: SharedBuffer) -> Self {
        Self { release, out }
    }
}

impl Write for StalledWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.release.recv_timeout(Duration::from_secs(5));
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
