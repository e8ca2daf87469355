use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatcher::Dispatcher;
use crate::error::{IngestError, IngestResult};
use crate::feed::FeedSubscriber;
use crate::registry::ConnectionRegistry;
use crate::types::Reading;

/// Feed subscriber, dispatch queue and dispatch worker wired together
///
/// The receive task forwards readings into a bounded queue drained by a single
/// worker, so readings are dispatched in receive order.
pub struct IngestPipeline {
    feed: FeedSubscriber,
    dispatcher: Arc<Dispatcher>,
    registry: ConnectionRegistry,
    queue_capacity: usize,
    worker: Option<JoinHandle<u64>>,
}

impl IngestPipeline {
    pub fn new(feed: FeedSubscriber, dispatcher: Dispatcher, queue_capacity: usize) -> Self {
        let registry = dispatcher.registry().clone();
        Self {
            feed,
            dispatcher: Arc::new(dispatcher),
            registry,
            queue_capacity: queue_capacity.max(1),
            worker: None,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Connect to the feed and start dispatching
    pub async fn start(&mut self) -> IngestResult<()> {
        if self.worker.is_some() {
            return Err(IngestError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.feed.start(tx).await?;
        self.worker = Some(tokio::spawn(dispatch_worker(rx, self.dispatcher.clone())));

        tracing::info!("Ingest pipeline started");
        Ok(())
    }

    /// Stop receiving, drain queued readings, and close every viewer
    pub async fn stop(&mut self) {
        self.feed.stop().await;

        // The queue sender went away with the receive task; the worker
        // finishes what is left and exits.
        if let Some(worker) = self.worker.take() {
            match worker.await {
                Ok(handled) => tracing::info!("Dispatch worker drained ({} readings handled)", handled),
                Err(e) => tracing::error!("Dispatch worker failed: {}", e),
            }
        }

        self.registry.close_all();
        tracing::info!("Ingest pipeline stopped");
    }
}

async fn dispatch_worker(mut rx: mpsc::Receiver<Reading>, dispatcher: Arc<Dispatcher>) -> u64 {
    let mut handled = 0u64;
    while let Some(reading) = rx.recv().await {
        let outcome = dispatcher.handle(&reading).await;
        handled += 1;
        tracing::trace!(
            subject_id = reading.subject_id,
            delivered = outcome.delivery.delivered,
            anomaly = outcome.anomaly,
            "Reading dispatched"
        );
    }
    handled
}
