//! Raw HCI socket backend.
//!
//! Enables passive LE scanning directly on `hci0` and parses advertising
//! reports from the kernel without the BlueZ daemon. Needs CAP_NET_RAW and
//! CAP_NET_ADMIN, or root.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, ScanError};
use crate::advertisement::{Advertisement, ENVIRONMENTAL_SENSING_UUID, ServiceData};
use crate::mac_address::MacAddress;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::SystemTime;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;
const HCI_DEV: u16 = 0;

const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;
const EVT_LE_META_EVENT: u8 = 0x3E;
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

/// Largest HCI event: 2-byte header, 255 bytes of parameters, packet type.
const MAX_EVENT_LEN: usize = 258;

// AD types
const AD_COMPLETE_LOCAL_NAME: u8 = 0x09;
const AD_SHORTENED_LOCAL_NAME: u8 = 0x08;
const AD_SERVICE_DATA_16: u8 = 0x16;

#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// Kernel-side packet filter for raw HCI sockets.
#[repr(C)]
#[derive(Debug, Default)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    /// Pass only LE meta events.
    fn le_meta_events() -> Self {
        let mut filter = Self::default();
        filter.type_mask |= 1 << u32::from(HCI_EVENT_PKT);
        let bit = usize::from(EVT_LE_META_EVENT);
        filter.event_mask[bit / 32] |= 1 << (bit % 32);
        filter
    }
}

/// LE Set Scan Parameters; interval and window in 0.625 ms units.
#[derive(Debug, Clone, Copy)]
struct ScanParameters {
    active: bool,
    interval: u16,
    window: u16,
}

impl ScanParameters {
    fn passive() -> Self {
        Self {
            active: false,
            interval: 0x0010,
            window: 0x0010,
        }
    }

    fn to_bytes(self) -> [u8; 7] {
        let [i0, i1] = self.interval.to_le_bytes();
        let [w0, w1] = self.window.to_le_bytes();
        // Public own address, accept all advertisers.
        [u8::from(self.active), i0, i1, w0, w1, 0x00, 0x00]
    }
}

fn command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

fn os_error(context: &str) -> ScanError {
    ScanError::Bluetooth(format!("{context}: {}", io::Error::last_os_error()))
}

/// A non-blocking raw HCI socket bound to one controller.
struct HciSocket(OwnedFd);

impl HciSocket {
    fn open(dev_id: u16) -> Result<Self, ScanError> {
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                SOCK_RAW | SOCK_CLOEXEC | SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(os_error("failed to create HCI socket"));
        }
        let socket = Self(unsafe { OwnedFd::from_raw_fd(fd) });

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as u16,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };
        let ret = unsafe {
            libc::bind(
                socket.0.as_raw_fd(),
                &addr as *const SockaddrHci as *const sockaddr,
                mem::size_of::<SockaddrHci>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error("failed to bind HCI socket"));
        }
        Ok(socket)
    }

    fn set_filter(&self, filter: &HciFilter) -> Result<(), ScanError> {
        let ret = unsafe {
            libc::setsockopt(
                self.0.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                filter as *const HciFilter as *const c_void,
                mem::size_of::<HciFilter>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error("failed to set HCI filter"));
        }
        Ok(())
    }

    fn send_command(&self, ocf: u16, params: &[u8]) -> Result<(), ScanError> {
        let packet = command_packet(OGF_LE_CTL, ocf, params);
        let ret = unsafe {
            libc::write(
                self.0.as_raw_fd(),
                packet.as_ptr() as *const c_void,
                packet.len(),
            )
        };
        if ret < 0 {
            return Err(os_error("failed to send HCI command"));
        }
        Ok(())
    }

    fn enable_le_scan(&self, parameters: ScanParameters) -> Result<(), ScanError> {
        self.send_command(OCF_LE_SET_SCAN_PARAMETERS, &parameters.to_bytes())?;
        // Enable, and keep duplicates: every re-broadcast carries fresh RSSI.
        self.send_command(OCF_LE_SET_SCAN_ENABLE, &[0x01, 0x00])
    }
}

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

fn read_packet(fd: &HciSocket, buf: &mut [u8]) -> io::Result<usize> {
    let ret = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Local name and 16-bit service data found in an AD structure list.
fn parse_ad_structures(mut ad: &[u8]) -> (Option<String>, Vec<ServiceData>) {
    let mut local_name = None;
    let mut service_data = Vec::new();

    while let Some((&len, rest)) = ad.split_first() {
        let len = usize::from(len);
        if len == 0 || rest.len() < len {
            break;
        }
        let (structure, tail) = rest.split_at(len);
        ad = tail;

        match structure {
            [AD_SERVICE_DATA_16, lo, hi, data @ ..] => {
                service_data.push(ServiceData::new(u16::from_le_bytes([*lo, *hi]), data));
            }
            [AD_COMPLETE_LOCAL_NAME | AD_SHORTENED_LOCAL_NAME, name @ ..] => {
                local_name = Some(String::from_utf8_lossy(name).into_owned());
            }
            _ => {}
        }
    }
    (local_name, service_data)
}

/// Turn an LE advertising report event into an advertisement.
///
/// Only the first report of the event is read. Returns `None` for anything
/// that does not carry Environmental Sensing service data.
fn parse_advertising_report(packet: &[u8]) -> Option<Advertisement> {
    match packet {
        [HCI_EVENT_PKT, EVT_LE_META_EVENT, _, EVT_LE_ADVERTISING_REPORT, ..] => {}
        _ => return None,
    }
    // num_reports, event_type, addr_type, addr[6], data_len
    let report = &packet[4..];
    if report.len() < 10 || report[0] == 0 {
        return None;
    }

    let mut addr = [0u8; 6];
    addr.copy_from_slice(&report[3..9]);
    addr.reverse();

    let data_len = usize::from(report[9]);
    let ad = report.get(10..10 + data_len)?;
    let rssi = report.get(10 + data_len).map_or(0, |&b| i16::from(b as i8));

    let (local_name, service_data) = parse_ad_structures(ad);
    if !service_data
        .iter()
        .any(|block| block.uuid == ENVIRONMENTAL_SENSING_UUID)
    {
        return None;
    }

    Some(Advertisement {
        address: MacAddress(addr).to_string(),
        local_name,
        service_data,
        rssi,
        received_at: SystemTime::now(),
    })
}

/// Start passive LE scanning on `hci0`.
pub async fn start_scan() -> Result<mpsc::Receiver<Advertisement>, ScanError> {
    let events = HciSocket::open(HCI_DEV)?;
    events.set_filter(&HciFilter::le_meta_events())?;

    let commands = HciSocket::open(HCI_DEV)?;
    commands.enable_le_scan(ScanParameters::passive())?;
    info!(device = HCI_DEV, "listening via raw HCI socket");

    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);
    let events = AsyncFd::new(events)
        .map_err(|e| ScanError::Bluetooth(format!("failed to register HCI socket: {e}")))?;

    tokio::spawn(async move {
        let _commands = commands;
        let mut buf = [0u8; MAX_EVENT_LEN];

        'outer: loop {
            let mut guard = match events.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(error = %e, "HCI socket failed");
                    break;
                }
            };

            // Drain every queued packet before waiting again.
            loop {
                let n = match guard.try_io(|inner| read_packet(inner.get_ref(), &mut buf)) {
                    Ok(Ok(n)) if n > 0 => n,
                    Ok(Ok(_)) => break,
                    Ok(Err(e)) => {
                        warn!(error = %e, "HCI read failed");
                        break 'outer;
                    }
                    Err(_would_block) => break,
                };

                let Some(advertisement) = parse_advertising_report(&buf[..n]) else {
                    continue;
                };
                trace!(address = %advertisement.address, "advertising report");
                if tx.send(advertisement).await.is_err() {
                    break 'outer;
                }
            }
        }
    });

    Ok(rx)
}
