//! Fan-out of accepted readings to subscriber sinks.
//!
//! Each registered sink runs as its own task and consumes a private queue.
//! The scanner loop only ever enqueues, so a slow sink (a stalled network
//! write, a full disk) cannot hold up advertisement reception.
//!
//! Queues are unbounded by default: no reading is lost, but memory grows
//! without limit if a sink stops consuming for good. [`QueuePolicy::Bounded`]
//! trades that for a fixed queue size and drops readings for a sink that
//! stays full past a timeout.

use crate::reading::Reading;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Future returned by [`Sink::start`].
pub type SinkFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A consumer of accepted readings.
pub trait Sink: Send + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Consume readings from `queue` until it is closed.
    ///
    /// Runs on its own task. Downstream failures are handled here and must
    /// not propagate. Returning early marks the sink as finished.
    fn start(self: Box<Self>, queue: SinkQueue) -> SinkFuture;
}

/// Backpressure policy for sink queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Never drop; memory is unbounded if a sink stalls
    #[default]
    Unbounded,
    /// Hold at most `capacity` readings; wait up to `timeout` for room, then drop
    Bounded { capacity: usize, timeout: Duration },
}

/// Receiving end of a sink's queue.
#[derive(Debug)]
pub enum SinkQueue {
    Unbounded(mpsc::UnboundedReceiver<Arc<Reading>>),
    Bounded(mpsc::Receiver<Arc<Reading>>),
}

impl SinkQueue {
    /// Next queued reading, or `None` once the dispatcher has shut down and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<Reading>> {
        match self {
            SinkQueue::Unbounded(rx) => rx.recv().await,
            SinkQueue::Bounded(rx) => rx.recv().await,
        }
    }

    /// Blocking variant of [`SinkQueue::recv`] for sinks that consume on a
    /// blocking thread. Panics if called from within an async context.
    pub fn blocking_recv(&mut self) -> Option<Arc<Reading>> {
        match self {
            SinkQueue::Unbounded(rx) => rx.blocking_recv(),
            SinkQueue::Bounded(rx) => rx.blocking_recv(),
        }
    }
}

#[derive(Debug)]
enum SinkSender {
    Unbounded(mpsc::UnboundedSender<Arc<Reading>>),
    Bounded {
        tx: mpsc::Sender<Arc<Reading>>,
        timeout: Duration,
    },
}

/// Why a reading did not reach a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IngestError {
    /// The sink stayed full for the whole timeout
    Full,
    /// The sink task has finished
    Closed,
}

/// Dispatcher-side handle to one running sink.
#[derive(Debug)]
struct SinkHandle {
    name: String,
    sender: SinkSender,
    task: JoinHandle<()>,
    closed_reported: bool,
}

impl SinkHandle {
    async fn ingest(&self, reading: Arc<Reading>) -> Result<(), IngestError> {
        match &self.sender {
            SinkSender::Unbounded(tx) => tx.send(reading).map_err(|_| IngestError::Closed),
            SinkSender::Bounded { tx, timeout } => {
                tx.send_timeout(reading, *timeout)
                    .await
                    .map_err(|e| match e {
                        SendTimeoutError::Timeout(_) => IngestError::Full,
                        SendTimeoutError::Closed(_) => IngestError::Closed,
                    })
            }
        }
    }
}

/// Outcome of dispatching one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delivery {
    /// Sinks the reading was enqueued for
    pub delivered: usize,
    /// Sinks that were full past the timeout or no longer running
    pub dropped: usize,
}

/// Ordered collection of running sinks.
#[derive(Debug, Default)]
pub struct Dispatcher {
    policy: QueuePolicy,
    sinks: Vec<SinkHandle>,
}

impl Dispatcher {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            sinks: Vec::new(),
        }
    }

    /// Start a sink on its own task and add it to the fan-out.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(&mut self, sink: Box<dyn Sink>) {
        let name = sink.name().to_string();
        let (sender, queue) = match self.policy {
            QueuePolicy::Unbounded => {
                let (tx, rx) = mpsc::unbounded_channel();
                (SinkSender::Unbounded(tx), SinkQueue::Unbounded(rx))
            }
            QueuePolicy::Bounded { capacity, timeout } => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (SinkSender::Bounded { tx, timeout }, SinkQueue::Bounded(rx))
            }
        };

        info!(sink = %name, policy = ?self.policy, "starting sink");
        let task = tokio::spawn(sink.start(queue));
        self.sinks.push(SinkHandle {
            name,
            sender,
            task,
            closed_reported: false,
        });
    }

    /// Number of registered sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Hand a reading to every sink.
    ///
    /// With the unbounded policy this never waits. With the bounded policy it
    /// waits at most `timeout` per full sink.
    pub async fn dispatch(&mut self, reading: Arc<Reading>) -> Delivery {
        let mut delivery = Delivery::default();
        for sink in &mut self.sinks {
            match sink.ingest(Arc::clone(&reading)).await {
                Ok(()) => delivery.delivered += 1,
                Err(IngestError::Full) => {
                    delivery.dropped += 1;
                    warn!(
                        sink = %sink.name,
                        device = %reading.device_key,
                        "sink queue full, dropping reading"
                    );
                }
                Err(IngestError::Closed) => {
                    delivery.dropped += 1;
                    if !sink.closed_reported {
                        sink.closed_reported = true;
                        warn!(sink = %sink.name, "sink has stopped, readings are no longer delivered to it");
                    }
                }
            }
        }
        delivery
    }

    /// Close every queue and wait for the sinks to drain and return.
    pub async fn shutdown(self) {
        for SinkHandle {
            name, sender, task, ..
        } in self.sinks
        {
            drop(sender);
            match task.await {
                Ok(()) => debug!(sink = %name, "sink stopped"),
                Err(e) => warn!(sink = %name, error = %e, "sink task failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::soil_reading;
    use tokio::sync::{Semaphore, mpsc::UnboundedSender};
    use tokio_test::{assert_ready, task};

    /// Forwards every reading it consumes to a test channel.
    struct RecordingSink {
        name: String,
        seen: UnboundedSender<(String, u8)>,
        gate: Option<Arc<Semaphore>>,
    }

    impl RecordingSink {
        fn boxed(name: &str, seen: &UnboundedSender<(String, u8)>) -> Box<dyn Sink> {
            Box::new(Self {
                name: name.to_string(),
                seen: seen.clone(),
                gate: None,
            })
        }

        /// A sink that waits for a permit before consuming each reading.
        fn gated(
            name: &str,
            seen: &UnboundedSender<(String, u8)>,
            gate: &Arc<Semaphore>,
        ) -> Box<dyn Sink> {
            Box::new(Self {
                name: name.to_string(),
                seen: seen.clone(),
                gate: Some(Arc::clone(gate)),
            })
        }
    }

    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            &self.name
        }

        fn start(self: Box<Self>, mut queue: SinkQueue) -> SinkFuture {
            Box::pin(async move {
                loop {
                    if let Some(gate) = &self.gate {
                        gate.acquire().await.unwrap().forget();
                    }
                    let Some(reading) = queue.recv().await else {
                        break;
                    };
                    let _ = self.seen.send((self.name.clone(), reading.sequence_counter));
                }
            })
        }
    }

    /// Exits immediately, leaving its queue closed.
    struct ExitingSink;

    impl Sink for ExitingSink {
        fn name(&self) -> &str {
            "exiting"
        }

        fn start(self: Box<Self>, _queue: SinkQueue) -> SinkFuture {
            Box::pin(async {})
        }
    }

    fn reading(counter: u8) -> Arc<Reading> {
        Arc::new(soil_reading("aa:bb:cc:dd:ee:ff", counter))
    }

    #[tokio::test]
    async fn test_fan_out_one_ingest_per_sink() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));

        let mut dispatcher = Dispatcher::new(QueuePolicy::Unbounded);
        dispatcher.register(RecordingSink::boxed("fast", &seen_tx));
        dispatcher.register(RecordingSink::gated("slow", &seen_tx, &gate));
        dispatcher.register(RecordingSink::boxed("other", &seen_tx));
        drop(seen_tx);
        assert_eq!(dispatcher.len(), 3);

        let delivery = dispatcher.dispatch(reading(4)).await;
        assert_eq!(
            delivery,
            Delivery {
                delivered: 3,
                dropped: 0
            }
        );

        gate.add_permits(10);
        dispatcher.shutdown().await;

        let mut seen = Vec::new();
        while let Some(entry) = seen_rx.recv().await {
            seen.push(entry);
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("fast".to_string(), 4),
                ("other".to_string(), 4),
                ("slow".to_string(), 4),
            ]
        );
    }

    #[tokio::test]
    async fn test_unbounded_dispatch_never_waits_on_stalled_sink() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));

        let mut dispatcher = Dispatcher::new(QueuePolicy::Unbounded);
        dispatcher.register(RecordingSink::gated("stalled", &seen_tx, &gate));
        drop(seen_tx);

        for counter in 0..100u8 {
            let mut dispatch = task::spawn(dispatcher.dispatch(reading(counter % 16)));
            let delivery = assert_ready!(dispatch.poll());
            assert_eq!(delivery.delivered, 1);
        }

        // Nothing is lost once the sink catches up.
        gate.add_permits(1000);
        dispatcher.shutdown().await;
        let mut count = 0;
        while seen_rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 100);
    }

    #[tokio::test]
    async fn test_bounded_policy_drops_after_timeout() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));

        let mut dispatcher = Dispatcher::new(QueuePolicy::Bounded {
            capacity: 1,
            timeout: Duration::from_millis(10),
        });
        dispatcher.register(RecordingSink::gated("stalled", &seen_tx, &gate));
        drop(seen_tx);

        // First reading fills the single slot, the second times out.
        assert_eq!(dispatcher.dispatch(reading(1)).await.delivered, 1);
        assert_eq!(
            dispatcher.dispatch(reading(2)).await,
            Delivery {
                delivered: 0,
                dropped: 1
            }
        );

        gate.add_permits(10);
        dispatcher.shutdown().await;
        let mut seen = Vec::new();
        while let Some((_, counter)) = seen_rx.recv().await {
            seen.push(counter);
        }
        assert_eq!(seen, vec![1]);
    }

    #[tokio::test]
    async fn test_finished_sink_does_not_block_others() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let mut dispatcher = Dispatcher::new(QueuePolicy::Unbounded);
        dispatcher.register(Box::new(ExitingSink));
        dispatcher.register(RecordingSink::boxed("live", &seen_tx));
        drop(seen_tx);

        // The exiting sink dropped its queue without consuming it.
        let delivery = dispatcher.dispatch(reading(3)).await;
        assert_eq!(delivery.delivered, 1);
        assert_eq!(delivery.dropped, 1);

        dispatcher.shutdown().await;
        assert_eq!(seen_rx.recv().await, Some(("live".to_string(), 3)));
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_readings() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::default();
        dispatcher.register(RecordingSink::boxed("history", &seen_tx));
        drop(seen_tx);

        for counter in 0..5 {
            dispatcher.dispatch(reading(counter)).await;
        }
        dispatcher.shutdown().await;

        let mut seen = Vec::new();
        while let Some((_, counter)) = seen_rx.recv().await {
            seen.push(counter);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
