use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use super::{FeedMessage, FeedTransport, TransportError, TransportResult};

const BROKER_CAPACITY: usize = 1024;

struct BrokerState {
    tx: broadcast::Sender<FeedMessage>,
    available: bool,
    connects: u64,
}

/// In-process pub/sub broker
///
/// Stands in for a real publisher in tests and local runs. `restart` drops
/// every live subscription, which subscribers observe as a lost connection.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROKER_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                tx,
                available: true,
                connects: 0,
            })),
        }
    }

    /// Publish a payload; returns the number of subscriptions it reached
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let state = self.state.lock();
        state
            .tx
            .send(FeedMessage::new(topic, payload))
            .unwrap_or(0)
    }

    /// Refuse (or accept again) new connections
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Drop all current subscriptions
    pub fn restart(&self) {
        let (tx, _) = broadcast::channel(BROKER_CAPACITY);
        self.state.lock().tx = tx;
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().tx.receiver_count()
    }

    /// Successful connects since creation
    pub fn connect_count(&self) -> u64 {
        self.state.lock().connects
    }

    /// Wait until at least `count` subscriptions are live
    pub async fn wait_for_subscribers(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.subscriber_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.subscriber_count() >= count
    }

    /// Create a transport subscribed to `topic`
    pub fn transport(&self, topic: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            topic: topic.into(),
            rx: None,
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription to a [`MemoryBroker`]
pub struct MemoryTransport {
    broker: MemoryBroker,
    topic: String,
    rx: Option<broadcast::Receiver<FeedMessage>>,
}

#[async_trait]
impl FeedTransport for MemoryTransport {
    async fn connect(&mut self) -> TransportResult<()> {
        let mut state = self.broker.state.lock();
        if !state.available {
            return Err(TransportError::Connect("memory broker unavailable".to_string()));
        }
        state.connects += 1;
        self.rx = Some(state.tx.subscribe());
        Ok(())
    }

    async fn recv(&mut self) -> TransportResult<Option<FeedMessage>> {
        let rx = self.rx.as_mut().ok_or(TransportError::NotConnected)?;
        loop {
            match rx.recv().await {
                // Prefix match, like a SUB socket filter
                Ok(message) => {
                    let matches = message
                        .topic
                        .as_deref()
                        .map_or(true, |topic| topic.starts_with(&self.topic));
                    if matches {
                        return Ok(Some(message));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Memory transport lagged, {} messages skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return Ok(None);
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        self.rx = None;
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.topic)
    }
}
