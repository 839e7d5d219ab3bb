//! Device identity resolution.
//!
//! On Linux the platform reports the sensor's hardware address and that is
//! the device key. Some platforms hide hardware addresses and report an
//! opaque per-session UUID instead. The sensor firmware works around this by
//! embedding its own address in the broadcast; when inference is enabled the
//! key is rebuilt from a configured vendor prefix plus the trailing address
//! octets found in the payload.

use crate::mac_address::{MacAddress, MacPrefix};
use tracing::warn;

/// Length of a textual UUID such as `3f2504e0-4f89-11d3-9a0c-0305e82c3301`.
const UUID_STRING_LEN: usize = 36;

/// Payload offset of the trailing two octets of the embedded address.
pub const EMBEDDED_ADDRESS_SUFFIX_OFFSET: usize = 14;

/// Where a resolved key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// The platform reported a real hardware address
    Hardware,
    /// Rebuilt from the address embedded in the payload
    Inferred,
    /// Opaque platform identifier, used as-is
    Opaque,
    /// Inference was attempted but the payload was too short
    Fallback,
}

/// A device key together with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key: String,
    pub source: KeySource,
}

/// Derives stable device keys from platform addresses.
#[derive(Debug, Clone, Default)]
pub struct KeyResolver {
    infer_mac_address: bool,
    mac_address_prefix: MacPrefix,
}

impl KeyResolver {
    pub fn new(infer_mac_address: bool, mac_address_prefix: MacPrefix) -> Self {
        Self {
            infer_mac_address,
            mac_address_prefix,
        }
    }

    /// Resolve the device key for an advertisement.
    ///
    /// `payload` is the sensor's raw service data; it is only consulted when
    /// the platform address is opaque and inference is enabled. Never fails:
    /// a payload too short to carry the embedded address falls back to the
    /// opaque identifier.
    pub fn resolve(&self, address: &str, payload: &[u8]) -> ResolvedKey {
        if let Ok(mac) = address.parse::<MacAddress>() {
            return ResolvedKey {
                key: mac.to_string(),
                source: KeySource::Hardware,
            };
        }

        let opaque = address.to_lowercase();
        if !self.infer_mac_address || address.len() != UUID_STRING_LEN {
            return ResolvedKey {
                key: opaque,
                source: KeySource::Opaque,
            };
        }

        match payload.get(EMBEDDED_ADDRESS_SUFFIX_OFFSET..EMBEDDED_ADDRESS_SUFFIX_OFFSET + 2) {
            Some(&[a, b]) => ResolvedKey {
                key: self.mac_address_prefix.with_suffix([a, b]).to_string(),
                source: KeySource::Inferred,
            },
            _ => {
                warn!(
                    address = %opaque,
                    payload_len = payload.len(),
                    "unable to infer MAC address, falling back to platform identifier"
                );
                ResolvedKey {
                    key: opaque,
                    source: KeySource::Fallback,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::soil_payload;

    const OPAQUE_ID: &str = "3F2504E0-4F89-11D3-9A0C-0305E82C3301";

    fn payload_with_address() -> Vec<u8> {
        let mut data = soil_payload();
        data.extend_from_slice(&[0xf0, 0xca, 0xf0, 0xca, 0x0A, 0x1E]);
        data
    }

    #[test]
    fn test_hardware_address_is_lowercased() {
        let resolver = KeyResolver::new(true, MacPrefix::default());
        let resolved = resolver.resolve("F0:CA:F0:CA:01:02", &soil_payload());
        assert_eq!(resolved.key, "f0:ca:f0:ca:01:02");
        assert_eq!(resolved.source, KeySource::Hardware);
    }

    #[test]
    fn test_infers_key_from_embedded_address() {
        let prefix: MacPrefix = "f0:ca:f0:ca".parse().unwrap();
        let resolver = KeyResolver::new(true, prefix);
        let resolved = resolver.resolve(OPAQUE_ID, &payload_with_address());
        assert_eq!(resolved.key, "f0:ca:f0:ca:0a:1e");
        assert_eq!(resolved.source, KeySource::Inferred);
    }

    #[test]
    fn test_inference_uses_configured_prefix() {
        let prefix: MacPrefix = "de:ad:be:ef".parse().unwrap();
        let resolver = KeyResolver::new(true, prefix);
        let resolved = resolver.resolve(OPAQUE_ID, &payload_with_address());
        assert_eq!(resolved.key, "de:ad:be:ef:0a:1e");
    }

    #[test]
    fn test_short_payload_falls_back_to_opaque_id() {
        let resolver = KeyResolver::new(true, MacPrefix::default());
        let resolved = resolver.resolve(OPAQUE_ID, &soil_payload());
        assert_eq!(resolved.key, OPAQUE_ID.to_lowercase());
        assert_eq!(resolved.source, KeySource::Fallback);
    }

    #[test]
    fn test_inference_disabled_keeps_opaque_id() {
        let resolver = KeyResolver::new(false, MacPrefix::default());
        let resolved = resolver.resolve(OPAQUE_ID, &payload_with_address());
        assert_eq!(resolved.key, OPAQUE_ID.to_lowercase());
        assert_eq!(resolved.source, KeySource::Opaque);
    }

    #[test]
    fn test_unrecognised_shape_is_opaque() {
        let resolver = KeyResolver::new(true, MacPrefix::default());
        let resolved = resolver.resolve("Sensor-7", &payload_with_address());
        assert_eq!(resolved.key, "sensor-7");
        assert_eq!(resolved.source, KeySource::Opaque);
    }
}
