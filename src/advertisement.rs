//! Platform-neutral advertisement events.
//!
//! Scanner backends translate whatever their wireless stack reports into an
//! [`Advertisement`] and push it onto a channel; everything downstream works
//! on this type only.

use std::time::SystemTime;

/// Bluetooth SIG "Environmental Sensing" 16-bit service identifier.
///
/// The sensor firmware advertises its payload as service data under this id.
pub const ENVIRONMENTAL_SENSING_UUID: u16 = 0x181A;

/// A service-data block: a 16-bit service identifier and its payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceData {
    pub uuid: u16,
    pub data: Vec<u8>,
}

impl ServiceData {
    pub fn new(uuid: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid,
            data: data.into(),
        }
    }
}

/// One received advertisement as delivered by the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Address string as reported by the platform.
    ///
    /// A hardware address on Linux; may be an opaque per-session UUID on
    /// platforms that hide hardware addresses.
    pub address: String,
    /// Advertised local name, when the platform reports one
    pub local_name: Option<String>,
    /// All 16-bit service-data blocks in the advertisement
    pub service_data: Vec<ServiceData>,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Local reception time
    pub received_at: SystemTime,
}

impl Advertisement {
    /// Build an advertisement carrying a single sensor service-data block.
    pub fn sensor(address: impl Into<String>, payload: impl Into<Vec<u8>>, rssi: i16) -> Self {
        Self {
            address: address.into(),
            local_name: None,
            service_data: vec![ServiceData::new(ENVIRONMENTAL_SENSING_UUID, payload)],
            rssi,
            received_at: SystemTime::now(),
        }
    }
}
