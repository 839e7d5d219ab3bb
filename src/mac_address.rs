//! Hardware address types for Bluetooth sensors.
//!
//! Device keys are plain strings (see [`crate::reading::Reading`]), but the
//! scanner needs to tell a real hardware address apart from an opaque
//! per-session identifier, and the key resolver needs to assemble an address
//! from a configured prefix plus payload bytes. Both live here.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A Bluetooth hardware address stored as a compact 6-byte array.
///
/// Displays as lowercase colon-separated octets, which is the canonical form
/// of a device key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_octets(f, &self.0)
    }
}

/// The leading four octets of a hardware address.
///
/// Sensors that embed their own address in the broadcast share a fixed
/// vendor prefix; only the trailing two octets vary per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacPrefix(pub [u8; 4]);

impl MacPrefix {
    /// Complete the prefix with the two trailing octets.
    pub fn with_suffix(self, suffix: [u8; 2]) -> MacAddress {
        let [a, b, c, d] = self.0;
        MacAddress([a, b, c, d, suffix[0], suffix[1]])
    }
}

impl Default for MacPrefix {
    fn default() -> Self {
        MacPrefix([0xf0, 0xca, 0xf0, 0xca])
    }
}

impl fmt::Display for MacPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_octets(f, &self.0)
    }
}

fn write_octets(f: &mut fmt::Formatter<'_>, octets: &[u8]) -> fmt::Result {
    for (i, octet) in octets.iter().enumerate() {
        if i > 0 {
            f.write_str(":")?;
        }
        write!(f, "{octet:02x}")?;
    }
    Ok(())
}

/// Errors returned when parsing a MAC address or prefix string.
#[derive(Error, Debug, PartialEq)]
pub enum ParseMacError {
    #[error("invalid MAC address: expected {expected} parts, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("invalid MAC address: part {0} has wrong length")]
    InvalidPartLength(usize),
    #[error("invalid MAC address: '{0}' is not valid hex")]
    InvalidHex(String),
}

fn parse_octets<const N: usize>(s: &str) -> Result<[u8; N], ParseMacError> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != N {
        return Err(ParseMacError::InvalidLength {
            expected: N,
            got: parts.len(),
        });
    }

    let mut bytes = [0u8; N];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return Err(ParseMacError::InvalidPartLength(i));
        }
        bytes[i] =
            u8::from_str_radix(part, 16).map_err(|_| ParseMacError::InvalidHex(part.to_string()))?;
    }
    Ok(bytes)
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_octets::<6>(s).map(MacAddress)
    }
}

impl FromStr for MacPrefix {
    type Err = ParseMacError;

    /// Accepts `f0:ca:f0:ca` as well as the trailing-colon form `f0:ca:f0:ca:`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_octets::<4>(s.trim().trim_end_matches(':')).map(MacPrefix)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_lowercase() {
        let addr = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(addr.to_string(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_display_with_zeros() {
        let addr = MacAddress([0x00, 0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(addr.to_string(), "00:01:02:03:04:05");
    }

    #[test]
    fn test_from_str_accepts_both_cases() {
        let upper: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let lower: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.0, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    }

    #[test]
    fn test_from_str_invalid() {
        assert_eq!(
            "invalid".parse::<MacAddress>(),
            Err(ParseMacError::InvalidLength {
                expected: 6,
                got: 1
            })
        );
        assert!(matches!(
            "AA:BB:CC:DD:EE:GG".parse::<MacAddress>(),
            Err(ParseMacError::InvalidHex(_))
        ));
        assert_eq!(
            "AA:BB:CC:DD:EE:FFF".parse::<MacAddress>(),
            Err(ParseMacError::InvalidPartLength(5))
        );
        // A UUID-shaped identifier is never a hardware address.
        assert!(
            "3f2504e0-4f89-11d3-9a0c-0305e82c3301"
                .parse::<MacAddress>()
                .is_err()
        );
    }

    #[test]
    fn test_prefix_parse_and_complete() {
        let prefix: MacPrefix = "F0:CA:F0:CA:".parse().unwrap();
        assert_eq!(prefix, MacPrefix::default());
        assert_eq!(prefix.to_string(), "f0:ca:f0:ca");
        assert_eq!(
            prefix.with_suffix([0x0A, 0x1E]).to_string(),
            "f0:ca:f0:ca:0a:1e"
        );
    }

    #[test]
    fn test_prefix_rejects_full_address() {
        assert_eq!(
            "f0:ca:f0:ca:00:01".parse::<MacPrefix>(),
            Err(ParseMacError::InvalidLength {
                expected: 4,
                got: 6
            })
        );
    }
}
