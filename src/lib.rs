//! `parasite-listener` library.
//!
//! Listens for soil-sensor BLE broadcasts, turns them into deduplicated
//! [`Reading`]s and fans those out to sinks (line protocol on stdout,
//! Prometheus gauges, in-memory history).
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup
//! and process exit codes. The wiring lives in [`crate::app`] where it can be
//! tested with an injected scanner and output stream.

pub mod advertisement;
pub mod app;
pub mod config;
pub mod decoder;
pub mod dedup;
pub mod dispatch;
pub mod history;
pub mod key;
pub mod mac_address;
pub mod pipeline;
pub mod reading;
pub mod registry;
pub mod scanner;
pub mod sink;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertisement::{Advertisement, ServiceData};
pub use config::{Config, ConfigError};
pub use decoder::{DecodeError, PayloadSchema, decode_advertisement, decode_payload};
pub use dedup::Deduplicator;
pub use dispatch::{Delivery, Dispatcher, QueuePolicy, Sink, SinkQueue};
pub use history::{HistoryStore, SharedHistory};
pub use key::{KeyResolver, ResolvedKey};
pub use mac_address::{MacAddress, MacPrefix};
pub use pipeline::{AdvertisementFilter, Outcome, Pipeline, PipelineStats};
pub use reading::{Metric, Reading};
pub use registry::{Alias, DeviceRegistry, parse_alias};
pub use scanner::{Backend, ScanError};
