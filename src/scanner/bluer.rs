//! BlueZ D-Bus backend.
//!
//! Registers an advertisement monitor matching Environmental Sensing service
//! data, then follows every matched device's property changes so each new
//! broadcast is forwarded, not only the first one. Requires `bluetoothd`.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, ScanError};
use crate::advertisement::{Advertisement, ENVIRONMENTAL_SENSING_UUID, ServiceData};
use crate::mac_address::MacAddress;
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Address, Device, DeviceEvent, DeviceProperty, Session, Uuid};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// AD type "Service Data - 16-bit UUID".
const SERVICE_DATA_16_TYPE: u8 = 0x16;

/// `0000xxxx-0000-1000-8000-00805f9b34fb` with the short identifier zeroed.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// The 16-bit form of a UUID allocated from the Bluetooth base UUID.
fn short_uuid(uuid: Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let low_bits = value & ((1u128 << 96) - 1);
    let short = value >> 96;
    (low_bits == BLUETOOTH_BASE_UUID && short <= u128::from(u16::MAX)).then_some(short as u16)
}

/// Per-device follow tasks.
///
/// BlueZ drops the device object of a sensor that goes quiet, which ends its
/// follow task. The next `DeviceFound` for that address starts a new one.
#[derive(Debug, Default)]
struct FollowTasks {
    tasks: HashMap<Address, JoinHandle<()>>,
}

impl FollowTasks {
    /// Whether `address` has no live follow task.
    fn needs_follow(&self, address: &Address) -> bool {
        self.tasks
            .get(address)
            .is_none_or(|task| task.is_finished())
    }

    fn insert(&mut self, address: Address, task: JoinHandle<()>) {
        self.tasks.insert(address, task);
    }
}

/// Start the BlueZ advertisement monitor.
pub async fn start_scan() -> Result<mpsc::Receiver<Advertisement>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    info!(adapter = %adapter.name(), "listening via BlueZ");

    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    // The identifier appears little-endian right after the AD type.
    let pattern = Pattern {
        data_type: SERVICE_DATA_16_TYPE,
        start_position: 0,
        content: ENVIRONMENTAL_SENSING_UUID.to_le_bytes().to_vec(),
    };

    let monitor_manager = adapter.monitor().await?;
    let mut monitor_handle = monitor_manager
        .register(Monitor {
            patterns: Some(vec![pattern]),
            ..Default::default()
        })
        .await?;

    tokio::spawn(async move {
        // Bluetooth state must outlive the event loop.
        let _session = session;
        let _monitor_manager = monitor_manager;
        let mut follow_tasks = FollowTasks::default();

        while let Some(event) = monitor_handle.next().await {
            let MonitorEvent::DeviceFound(device_id) = event else {
                continue;
            };
            let address = device_id.device;
            if !follow_tasks.needs_follow(&address) {
                continue;
            }
            match adapter.device(address) {
                Ok(device) => {
                    debug!(%address, "following device");
                    follow_tasks.insert(address, tokio::spawn(follow_device(device, tx.clone())));
                }
                Err(e) => debug!(%address, error = %e, "device lookup failed"),
            }
        }
    });

    Ok(rx)
}

/// Forward the device's current advertisement and every service-data update after it.
async fn follow_device(device: Device, tx: mpsc::Sender<Advertisement>) {
    let address = device.address();
    if let Err(e) = forward_updates(&device, &tx).await {
        debug!(%address, error = %e, "stopped following device");
    }
}

async fn forward_updates(
    device: &Device,
    tx: &mpsc::Sender<Advertisement>,
) -> Result<(), ScanError> {
    let mut events = Box::pin(device.events().await?);
    if let Some(advertisement) = snapshot(device).await?
        && tx.send(advertisement).await.is_err()
    {
        return Ok(());
    }

    while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
        if !matches!(property, DeviceProperty::ServiceData(_)) {
            continue;
        }
        if let Some(advertisement) = snapshot(device).await?
            && tx.send(advertisement).await.is_err()
        {
            break;
        }
    }
    Ok(())
}

/// Read the device's cached advertisement properties.
async fn snapshot(device: &Device) -> Result<Option<Advertisement>, ScanError> {
    let Some(service_data) = device.service_data().await? else {
        return Ok(None);
    };
    let service_data: Vec<ServiceData> = service_data
        .into_iter()
        .filter_map(|(uuid, data)| short_uuid(uuid).map(|short| ServiceData::new(short, data)))
        .collect();
    if service_data.is_empty() {
        return Ok(None);
    }

    Ok(Some(Advertisement {
        address: MacAddress::from(device.address()).to_string(),
        local_name: device.name().await?,
        service_data,
        rssi: device.rssi().await?.unwrap_or_default(),
        received_at: SystemTime::now(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_to_key() {
        let addr = Address([0xF0, 0xCA, 0xF0, 0xCA, 0x0A, 0x1E]);
        assert_eq!(MacAddress::from(addr).to_string(), "f0:ca:f0:ca:0a:1e");
    }

    #[test]
    fn test_short_uuid() {
        let environmental = Uuid::from_u128(0x0000_181a_0000_1000_8000_0080_5f9b_34fb);
        assert_eq!(short_uuid(environmental), Some(0x181A));

        let custom = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);
        assert_eq!(short_uuid(custom), None);
    }

    #[tokio::test]
    async fn test_ended_follow_task_is_followed_again() {
        let quiet = Address([0xF0, 0xCA, 0xF0, 0xCA, 0x0A, 0x1E]);
        let active = Address([0xF0, 0xCA, 0xF0, 0xCA, 0x0A, 0x1F]);
        let mut tasks = FollowTasks::default();
        assert!(tasks.needs_follow(&quiet));

        tasks.insert(active, tokio::spawn(std::future::pending()));
        tasks.insert(quiet, tokio::spawn(async {}));
        assert!(!tasks.needs_follow(&active));

        let refollow = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !tasks.needs_follow(&quiet) {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(refollow.is_ok());
        assert!(!tasks.needs_follow(&active));
    }

    #[test]
    fn test_monitor_pattern_bytes() {
        assert_eq!(ENVIRONMENTAL_SENSING_UUID.to_le_bytes(), [0x1A, 0x18]);
    }
}
