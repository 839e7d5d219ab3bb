//! Sensor payload decoding.
//!
//! The sensor broadcasts a compact big-endian payload as service data under
//! the environmental sensing service. Firmware revisions have shipped more
//! than one layout; the layout is recognised structurally from the payload
//! length (and a marker byte where one exists), never from configuration.
//!
//! | Offset | Soil moisture layout             | Battery percentage layout          |
//! |--------|----------------------------------|------------------------------------|
//! | 0      | flags                            | flags                              |
//! | 1      | low nibble: counter              | low nibble: counter                |
//! | 2-3    | battery mV                       | battery mV                         |
//! | 4-5    | temperature, unsigned m°C        | temperature, signed 0.1 °C         |
//! | 6-7    | humidity, fraction of 65536      | humidity, fraction of 65536        |
//! | 8-9    | soil moisture, fraction of 65536 | 8 reserved, 9 battery percent      |
//! | 10     | (optional) embedded address 10-15| marker `0x1A`                      |

use crate::advertisement::{Advertisement, ENVIRONMENTAL_SENSING_UUID};
use crate::reading::{Measurements, Metric};
use thiserror::Error;

/// Minimum payload length of every known layout.
pub const MIN_PAYLOAD_LEN: usize = 10;

/// Exact payload length of the battery percentage layout.
pub const BATTERY_PERCENTAGE_PAYLOAD_LEN: usize = 11;

/// Marker closing the battery percentage layout (low byte of the service id).
pub const BATTERY_PERCENTAGE_MARKER: u8 = 0x1A;

/// Errors produced while decoding an advertisement.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The record did not carry exactly one service-data block
    #[error("unexpected number of service data blocks: {0}")]
    ServiceDataCount(usize),
    /// The single service-data block belongs to another service
    #[error("invalid service data uuid: {0:#06x}")]
    UnexpectedServiceUuid(u16),
    /// The payload is shorter than the smallest known layout
    #[error("payload too short: {len} bytes (minimum {min})")]
    TooShort { len: usize, min: usize },
    /// A layout marker byte did not have its expected value
    #[error("marker byte mismatch: expected {expected:#04x}, found {found:#04x}")]
    MarkerMismatch { expected: u8, found: u8 },
}

/// Known payload layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadSchema {
    /// Current firmware: soil moisture at bytes 8-9, unsigned milli-degree temperature.
    SoilMoisture,
    /// Sensors without a soil probe: battery percent at byte 9, signed tenth-degree temperature.
    BatteryPercentage,
}

impl PayloadSchema {
    /// Select the layout matching a payload.
    pub fn detect(data: &[u8]) -> Result<Self, DecodeError> {
        match data.len() {
            len if len < MIN_PAYLOAD_LEN => Err(DecodeError::TooShort {
                len,
                min: MIN_PAYLOAD_LEN,
            }),
            BATTERY_PERCENTAGE_PAYLOAD_LEN => Ok(PayloadSchema::BatteryPercentage),
            _ => Ok(PayloadSchema::SoilMoisture),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PayloadSchema::SoilMoisture => "soil_moisture",
            PayloadSchema::BatteryPercentage => "battery_percentage",
        }
    }
}

/// A decoded payload that has not yet been tied to a device identity.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub schema: PayloadSchema,
    pub sequence_counter: u8,
    pub measurements: Measurements,
}

/// Return the sensor payload of an advertisement.
///
/// The advertisement must carry exactly one service-data block, tagged with
/// the environmental sensing service id.
pub fn sensor_payload(advertisement: &Advertisement) -> Result<&[u8], DecodeError> {
    match advertisement.service_data.as_slice() {
        [block] if block.uuid == ENVIRONMENTAL_SENSING_UUID => Ok(block.data.as_slice()),
        [block] => Err(DecodeError::UnexpectedServiceUuid(block.uuid)),
        blocks => Err(DecodeError::ServiceDataCount(blocks.len())),
    }
}

/// Decode the sensor payload of an advertisement.
pub fn decode_advertisement(advertisement: &Advertisement) -> Result<DecodedPayload, DecodeError> {
    decode_payload(sensor_payload(advertisement)?)
}

/// Decode raw service-data bytes into measurements.
///
/// # Unit Conversions
/// - Battery voltage: millivolts → Volts (divide by 1000)
/// - Temperature: milli-degrees → °C (divide by 1000), or signed tenths → °C (divide by 10)
/// - Humidity and soil moisture: fraction of 65536 → percent
pub fn decode_payload(data: &[u8]) -> Result<DecodedPayload, DecodeError> {
    match PayloadSchema::detect(data)? {
        PayloadSchema::SoilMoisture => Ok(decode_soil_moisture(data)),
        PayloadSchema::BatteryPercentage => decode_battery_percentage(data),
    }
}

fn be_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn counter(data: &[u8]) -> u8 {
    data[1] & 0x0f
}

fn millivolts_to_volts(raw: u16) -> f64 {
    f64::from(raw) / 1000.0
}

fn fraction_to_percent(raw: u16) -> f64 {
    f64::from(raw) / 65536.0 * 100.0
}

/// Sign-correct a 16-bit field by the 65536-wrap rule.
fn sign_corrected(raw: u16) -> i32 {
    if raw < 32768 {
        i32::from(raw)
    } else {
        i32::from(raw) - 65536
    }
}

// Callers guarantee `data.len() >= MIN_PAYLOAD_LEN`.
fn decode_soil_moisture(data: &[u8]) -> DecodedPayload {
    let measurements = Measurements::from([
        (Metric::BatteryVoltage, millivolts_to_volts(be_u16(data, 2))),
        (Metric::Temperature, f64::from(be_u16(data, 4)) / 1000.0),
        (Metric::Humidity, fraction_to_percent(be_u16(data, 6))),
        (Metric::SoilMoisture, fraction_to_percent(be_u16(data, 8))),
    ]);

    DecodedPayload {
        schema: PayloadSchema::SoilMoisture,
        sequence_counter: counter(data),
        measurements,
    }
}

fn decode_battery_percentage(data: &[u8]) -> Result<DecodedPayload, DecodeError> {
    let marker = data[BATTERY_PERCENTAGE_PAYLOAD_LEN - 1];
    if marker != BATTERY_PERCENTAGE_MARKER {
        return Err(DecodeError::MarkerMismatch {
            expected: BATTERY_PERCENTAGE_MARKER,
            found: marker,
        });
    }

    let measurements = Measurements::from([
        (Metric::BatteryVoltage, millivolts_to_volts(be_u16(data, 2))),
        (
            Metric::Temperature,
            f64::from(sign_corrected(be_u16(data, 4))) / 10.0,
        ),
        (Metric::Humidity, fraction_to_percent(be_u16(data, 6))),
        (Metric::BatteryPercentage, f64::from(data[9])),
    ]);

    Ok(DecodedPayload {
        schema: PayloadSchema::BatteryPercentage,
        sequence_counter: counter(data),
        measurements,
    })
}
