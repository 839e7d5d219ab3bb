//! Human-readable names for device keys.
//!
//! Names come from the `[device.registry]` config table and from `--alias`
//! flags. Sinks use them to label output; a device without an entry is
//! labelled with its key.

use std::collections::BTreeMap;

/// A parsed `KEY=NAME` alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    /// Device key, lowercased (e.g. "f0:ca:f0:ca:0a:1e")
    pub key: String,
    /// Display name (e.g. "Monstera")
    pub name: String,
}

/// Parse an alias from a string in the format "KEY=NAME".
///
/// # Example
/// ```
/// use parasite_listener::registry::parse_alias;
///
/// let alias = parse_alias("F0:CA:F0:CA:0A:1E=Monstera").unwrap();
/// assert_eq!(alias.key, "f0:ca:f0:ca:0a:1e");
/// assert_eq!(alias.name, "Monstera");
/// ```
pub fn parse_alias(src: &str) -> Result<Alias, String> {
    let (key, name) = src
        .split_once('=')
        .ok_or_else(|| "invalid alias: expected format KEY=NAME".to_string())?;
    if name.trim().is_empty() {
        return Err(format!("invalid alias for {key}: name is empty"));
    }
    Ok(Alias {
        key: key.trim().to_lowercase(),
        name: name.into(),
    })
}

/// Mapping from device key to display name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRegistry {
    names: BTreeMap<String, String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the name of a device. Keys are stored lowercased.
    pub fn insert(&mut self, key: &str, name: impl Into<String>) {
        self.names.insert(key.to_lowercase(), name.into());
    }

    pub fn name(&self, key: &str) -> Option<&str> {
        self.names.get(key).map(String::as_str)
    }

    /// Registered name, or the key itself for unknown devices.
    pub fn resolve_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.name(key).unwrap_or(key)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.names.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<'a> Extend<&'a Alias> for DeviceRegistry {
    fn extend<I: IntoIterator<Item = &'a Alias>>(&mut self, iter: I) {
        for alias in iter {
            self.insert(&alias.key, alias.name.clone());
        }
    }
}
