//! Sink that records readings into the in-memory history.

use crate::dispatch::{Sink, SinkFuture, SinkQueue};
use crate::history::SharedHistory;
use tracing::info;

pub struct HistorySink {
    history: SharedHistory,
}

impl HistorySink {
    pub fn new(history: SharedHistory) -> Self {
        Self { history }
    }
}

impl Sink for HistorySink {
    fn name(&self) -> &str {
        "history"
    }

    fn start(self: Box<Self>, mut queue: SinkQueue) -> SinkFuture {
        Box::pin(async move {
            let mut appended = 0u64;
            while let Some(reading) = queue.recv().await {
                let key = reading.device_key.clone();
                self.history.append(&key, reading);
                appended += 1;
            }
            info!(appended, "history sink finished");
        })
    }
}
