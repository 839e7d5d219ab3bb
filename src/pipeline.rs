//! The scanner loop: advertisement in, deduplicated readings out.
//!
//! A single task owns the [`Pipeline`]. For each advertisement it runs the
//! filter, decoder, key resolver and deduplicator synchronously, then hands
//! accepted readings to the [`Dispatcher`]. The only place it waits is the
//! advertisement channel (and, with a bounded dispatch policy, a full sink).

use crate::advertisement::Advertisement;
use crate::decoder::{DecodeError, decode_payload, sensor_payload};
use crate::dedup::Deduplicator;
use crate::dispatch::Dispatcher;
use crate::key::KeyResolver;
use crate::reading::Reading;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Decides which advertisements are worth decoding.
///
/// An advertisement passes when no filter is configured, or when its address
/// starts with the vendor prefix, or its local name starts with the
/// configured name. Address comparison ignores case.
#[derive(Debug, Clone, Default)]
pub struct AdvertisementFilter {
    vendor_prefix: Option<String>,
    local_name: Option<String>,
}

impl AdvertisementFilter {
    /// Empty strings disable the corresponding check.
    pub fn new(vendor_prefix: &str, local_name: &str) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            vendor_prefix: non_empty(&vendor_prefix.to_lowercase()),
            local_name: non_empty(local_name),
        }
    }

    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        if self.vendor_prefix.is_none() && self.local_name.is_none() {
            return true;
        }

        let address_matches = self.vendor_prefix.as_deref().is_some_and(|prefix| {
            advertisement.address.to_lowercase().starts_with(prefix)
        });
        let name_matches = self.local_name.as_deref().is_some_and(|wanted| {
            advertisement
                .local_name
                .as_deref()
                .is_some_and(|name| name.starts_with(wanted))
        });
        address_matches || name_matches
    }
}

/// What happened to one advertisement.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Not from a sensor we listen to
    Filtered,
    /// Malformed or unexpected service data
    Rejected(DecodeError),
    /// Re-broadcast of the previous sample
    Duplicate,
    /// New reading, ready for dispatch
    Accepted(Arc<Reading>),
}

/// Counters kept by the scanner loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
    pub received: u64,
    pub filtered: u64,
    pub decode_errors: u64,
    pub duplicates: u64,
    pub accepted: u64,
    /// Per-sink deliveries that were dropped
    pub dropped_deliveries: u64,
}

/// Owns all per-process ingestion state.
#[derive(Debug)]
pub struct Pipeline {
    filter: AdvertisementFilter,
    resolver: KeyResolver,
    dedup: Deduplicator,
    dispatcher: Dispatcher,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(filter: AdvertisementFilter, resolver: KeyResolver, dispatcher: Dispatcher) -> Self {
        Self {
            filter,
            resolver,
            dedup: Deduplicator::new(),
            dispatcher,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Filter, decode, identify and deduplicate one advertisement.
    ///
    /// Never fails: every per-advertisement problem is reported through the
    /// returned [`Outcome`] and does not affect the next advertisement.
    pub fn process(&mut self, advertisement: Advertisement) -> Outcome {
        self.stats.received += 1;

        if !self.filter.matches(&advertisement) {
            self.stats.filtered += 1;
            return Outcome::Filtered;
        }

        let (data, frame) = match sensor_payload(&advertisement)
            .and_then(|data| Ok((data, decode_payload(data)?)))
        {
            Ok(decoded) => decoded,
            Err(error) => {
                self.stats.decode_errors += 1;
                debug!(address = %advertisement.address, %error, "dropping advertisement");
                return Outcome::Rejected(error);
            }
        };
        let resolved = self.resolver.resolve(&advertisement.address, data);

        if !self.dedup.accept(&resolved.key, frame.sequence_counter) {
            self.stats.duplicates += 1;
            trace!(
                device = %resolved.key,
                counter = frame.sequence_counter,
                "skipping already processed broadcast"
            );
            return Outcome::Duplicate;
        }

        let reading = Reading {
            device_key: resolved.key,
            sequence_counter: frame.sequence_counter,
            schema: frame.schema,
            measurements: frame.measurements,
            signal_strength: advertisement.rssi,
            observed_at: advertisement.received_at,
        };
        self.stats.accepted += 1;
        debug!(source = ?resolved.source, "got reading: {reading}");
        Outcome::Accepted(Arc::new(reading))
    }

    /// Process advertisements until the channel closes or `shutdown` resolves,
    /// then shut the sinks down and return the final counters.
    pub async fn run(
        mut self,
        mut advertisements: mpsc::Receiver<Advertisement>,
        shutdown: impl Future<Output = ()>,
    ) -> PipelineStats {
        tokio::pin!(shutdown);

        loop {
            let advertisement = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                next = advertisements.recv() => match next {
                    Some(advertisement) => advertisement,
                    None => {
                        info!("advertisement stream ended");
                        break;
                    }
                },
            };

            if let Outcome::Accepted(reading) = self.process(advertisement) {
                let delivery = self.dispatcher.dispatch(reading).await;
                self.stats.dropped_deliveries += delivery.dropped as u64;
            }
        }

        self.dispatcher.shutdown().await;
        let stats = self.stats;
        info!(
            received = stats.received,
            filtered = stats.filtered,
            decode_errors = stats.decode_errors,
            duplicates = stats.duplicates,
            accepted = stats.accepted,
            dropped_deliveries = stats.dropped_deliveries,
            "scanner loop stopped"
        );
        stats
    }
}
