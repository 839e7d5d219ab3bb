//! Built-in reading sinks.
//!
//! Every sink implements [`crate::dispatch::Sink`] and runs on its own task.

pub mod history;
pub mod line_protocol;
pub mod metrics;

pub use history::HistorySink;
pub use line_protocol::{LineProtocolFormatter, LineProtocolSink};
pub use metrics::{MetricsOptions, MetricsSink};
