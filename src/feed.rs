// Feed subscriber
//
// Owns the transport connection to the publisher. A dedicated receive task
// decodes each message and forwards readings to the dispatch queue; it never
// waits on viewers. Lost connections are re-established with exponential
// backoff until the subscriber is stopped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{DecodeError, ReadingDecoder};
use crate::config::IngestConfig;
use crate::error::{IngestError, IngestResult};
use crate::stats::PipelineStats;
use crate::transport::{FeedMessage, FeedTransport, TransportError, TransportResult};
use crate::types::Reading;

/// Connection and decoding parameters of the subscriber
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub topic: String,
    pub channel_count: Option<usize>,
    pub connect_attempts: u32,
    /// Bound on a single connect attempt
    pub connect_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub idle_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            topic: "eeg/data".to_string(),
            channel_count: Some(8),
            connect_attempts: 5,
            connect_timeout: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(10)),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl From<&IngestConfig> for FeedSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            channel_count: config.channel_count,
            connect_attempts: config.connect_attempts,
            connect_timeout: config.connect_timeout,
            reconnect_base_delay: config.reconnect_base_delay,
            reconnect_max_delay: config.reconnect_max_delay,
            idle_timeout: config.feed_idle_timeout,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

enum FeedEvent {
    Message(FeedMessage),
    Lost(String),
    Idle,
}

/// Subscription to the reading feed
pub struct FeedSubscriber {
    settings: FeedSettings,
    stats: Arc<PipelineStats>,
    transport: Option<Box<dyn FeedTransport>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Box<dyn FeedTransport>>>,
}

impl FeedSubscriber {
    pub fn new(
        transport: impl FeedTransport + 'static,
        settings: FeedSettings,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            settings,
            stats,
            transport: Some(Box::new(transport)),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Connect, subscribe, and spawn the receive task
    ///
    /// Returns once the initial connection is established. Fails with
    /// [`IngestError::BrokerUnavailable`] when every attempt is refused.
    pub async fn start(&mut self, sink: mpsc::Sender<Reading>) -> IngestResult<()> {
        if self.task.is_some() {
            return Err(IngestError::AlreadyRunning);
        }
        let mut transport = self.transport.take().ok_or(IngestError::TransportLost)?;
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }

        if let Err(e) = connect_with_retry(transport.as_mut(), &self.settings).await {
            self.transport = Some(transport);
            return Err(e);
        }

        tracing::info!(
            endpoint = %transport.describe(),
            topic = %self.settings.topic,
            "Subscribed to feed"
        );

        let receiver = ReceiveLoop {
            transport,
            sink,
            cancel: self.cancel.clone(),
            decoder: ReadingDecoder::new(self.settings.channel_count),
            settings: self.settings.clone(),
            stats: self.stats.clone(),
        };
        self.task = Some(tokio::spawn(receiver.run()));
        Ok(())
    }

    /// Stop the receive task and release the transport
    ///
    /// No reading is forwarded after this returns. The transport is handed
    /// back so the subscriber can be started again.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        let Some(mut task) = self.task.take() else {
            return;
        };

        match tokio::time::timeout(self.settings.shutdown_grace, &mut task).await {
            Ok(Ok(transport)) => self.transport = Some(transport),
            Ok(Err(e)) => tracing::error!("Feed receive task failed: {}", e),
            Err(_) => {
                tracing::warn!(
                    "Feed receive task did not stop within {:?}, aborting",
                    self.settings.shutdown_grace
                );
                task.abort();
                let _ = task.await;
            }
        }
        tracing::info!("Feed subscriber stopped");
    }
}

impl Drop for FeedSubscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn connect_with_retry(
    transport: &mut dyn FeedTransport,
    settings: &FeedSettings,
) -> IngestResult<()> {
    let attempts = settings.connect_attempts.max(1);
    let mut delay = settings.reconnect_base_delay;
    let mut last_error = TransportError::NotConnected;

    for attempt in 1..=attempts {
        match connect_once(transport, settings.connect_timeout).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    endpoint = %transport.describe(),
                    attempt,
                    attempts,
                    "Feed connect failed: {}",
                    e
                );
                last_error = e;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay = next_delay(delay, settings.reconnect_max_delay);
        }
    }

    Err(IngestError::BrokerUnavailable {
        endpoint: transport.describe(),
        attempts,
        source: last_error,
    })
}

/// One connect attempt; a publisher that never answers counts as a failure
async fn connect_once(transport: &mut dyn FeedTransport, timeout: Duration) -> TransportResult<()> {
    let attempt = tokio::time::timeout(timeout, transport.connect()).await;
    match attempt {
        Ok(result) => result,
        Err(_) => Err(TransportError::Connect(format!(
            "no answer from {} within {:?}",
            transport.describe(),
            timeout
        ))),
    }
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

struct ReceiveLoop {
    transport: Box<dyn FeedTransport>,
    sink: mpsc::Sender<Reading>,
    cancel: CancellationToken,
    decoder: ReadingDecoder,
    settings: FeedSettings,
    stats: Arc<PipelineStats>,
}

impl ReceiveLoop {
    async fn run(mut self) -> Box<dyn FeedTransport> {
        let cancel = self.cancel.clone();
        let mut connected = true;

        loop {
            if !connected {
                if !self.reconnect().await {
                    break;
                }
                connected = true;
            }

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = self.next_event() => event,
            };

            let message = match event {
                FeedEvent::Message(message) => message,
                FeedEvent::Lost(reason) => {
                    tracing::warn!(endpoint = %self.transport.describe(), "Feed connection lost: {}", reason);
                    self.transport.disconnect().await;
                    connected = false;
                    continue;
                }
                FeedEvent::Idle => {
                    tracing::warn!(
                        endpoint = %self.transport.describe(),
                        "No feed message for {:?}, reconnecting",
                        self.settings.idle_timeout.unwrap_or_default()
                    );
                    self.transport.disconnect().await;
                    connected = false;
                    continue;
                }
            };

            self.stats.record_received();
            let reading = match self.decode(&message) {
                Ok(reading) => reading,
                Err(e) => {
                    self.stats.record_decode_failure();
                    tracing::warn!("Dropping feed message: {}", e);
                    continue;
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.sink.send(reading) => {
                    if result.is_err() {
                        tracing::info!("Dispatch queue closed, stopping feed");
                        break;
                    }
                }
            }
        }

        self.transport.disconnect().await;
        tracing::debug!("Feed receive loop exited");
        self.transport
    }

    async fn next_event(&mut self) -> FeedEvent {
        let recv = self.transport.recv();
        let result = match self.settings.idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, recv).await {
                Ok(result) => result,
                Err(_) => return FeedEvent::Idle,
            },
            None => recv.await,
        };

        match result {
            Ok(Some(message)) => FeedEvent::Message(message),
            Ok(None) => FeedEvent::Lost("closed by broker".to_string()),
            Err(e) => FeedEvent::Lost(e.to_string()),
        }
    }

    fn decode(&self, message: &FeedMessage) -> Result<Reading, DecodeError> {
        if let Some(topic) = &message.topic {
            if *topic != self.settings.topic {
                return Err(DecodeError::UnexpectedTopic(topic.clone()));
            }
        }
        self.decoder.decode(&message.payload)
    }

    /// Returns false when cancelled before a connection was made
    async fn reconnect(&mut self) -> bool {
        let mut delay = self.settings.reconnect_base_delay;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                result = connect_once(self.transport.as_mut(), self.settings.connect_timeout) => result,
            };

            match result {
                Ok(()) => {
                    self.stats.record_reconnect();
                    tracing::info!(endpoint = %self.transport.describe(), "Reconnected to feed");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        endpoint = %self.transport.describe(),
                        "Feed reconnect failed, retrying in {:?}: {}",
                        next_delay(delay, self.settings.reconnect_max_delay),
                        e
                    );
                    delay = next_delay(delay, self.settings.reconnect_max_delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBroker, ZmqTransport};
    use zeromq::{PubSocket, Socket, SocketSend, ZmqMessage};

    const GOOD: &str = r#"{"patient_id":1,"timestamp":"2024-01-01T00:00:00","channel_data":[1,2,3,4,5,6,7,8]}"#;

    fn fast_settings() -> FeedSettings {
        FeedSettings {
            connect_attempts: 3,
            reconnect_base_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(40),
            shutdown_grace: Duration::from_secs(1),
            ..FeedSettings::default()
        }
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let max = Duration::from_millis(300);
        let mut delay = Duration::from_millis(100);
        delay = next_delay(delay, max);
        assert_eq!(delay, Duration::from_millis(200));
        delay = next_delay(delay, max);
        assert_eq!(delay, max);
        assert_eq!(next_delay(delay, max), max);
    }

    #[tokio::test]
    async fn test_start_fails_when_broker_unavailable() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let mut feed = FeedSubscriber::new(
            broker.transport("eeg/data"),
            fast_settings(),
            Arc::new(PipelineStats::new()),
        );
        let (tx, _rx) = mpsc::channel(8);

        let err = feed.start(tx).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::BrokerUnavailable { attempts: 3, .. }
        ));
        assert!(!feed.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let broker = MemoryBroker::new();
        let mut feed = FeedSubscriber::new(
            broker.transport("eeg/data"),
            fast_settings(),
            Arc::new(PipelineStats::new()),
        );
        let (tx, _rx) = mpsc::channel(8);

        feed.start(tx.clone()).await.unwrap();
        assert!(matches!(
            feed.start(tx).await,
            Err(IngestError::AlreadyRunning)
        ));
        feed.stop().await;
    }

    #[tokio::test]
    async fn test_bad_messages_are_counted_and_skipped() {
        let broker = MemoryBroker::new();
        let stats = Arc::new(PipelineStats::new());
        let mut feed =
            FeedSubscriber::new(broker.transport("eeg/data"), fast_settings(), stats.clone());
        let (tx, mut rx) = mpsc::channel(8);
        feed.start(tx).await.unwrap();

        broker.publish("eeg/data", "not json");
        broker.publish("eeg/data/other", GOOD);
        broker.publish("eeg/data", GOOD);

        let reading = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reading.subject_id, 1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_received, 3);
        assert_eq!(snapshot.decode_failures, 2);

        feed.stop().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_broker_restart() {
        let broker = MemoryBroker::new();
        let stats = Arc::new(PipelineStats::new());
        let mut feed =
            FeedSubscriber::new(broker.transport("eeg/data"), fast_settings(), stats.clone());
        let (tx, mut rx) = mpsc::channel(8);
        feed.start(tx).await.unwrap();

        broker.restart();
        assert!(broker.wait_for_subscribers(1, Duration::from_secs(1)).await);
        assert_eq!(broker.connect_count(), 2);

        broker.publish("eeg/data", GOOD);
        let reading = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(reading.is_some());
        assert_eq!(stats.snapshot().reconnects, 1);

        feed.stop().await;
    }

    #[tokio::test]
    async fn test_idle_timeout_triggers_reconnect() {
        let broker = MemoryBroker::new();
        let stats = Arc::new(PipelineStats::new());
        let settings = FeedSettings {
            idle_timeout: Some(Duration::from_millis(30)),
            ..fast_settings()
        };
        let mut feed = FeedSubscriber::new(broker.transport("eeg/data"), settings, stats.clone());
        let (tx, _rx) = mpsc::channel(8);
        feed.start(tx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(stats.snapshot().reconnects >= 1);

        feed.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_transport() {
        let broker = MemoryBroker::new();
        let mut feed = FeedSubscriber::new(
            broker.transport("eeg/data"),
            fast_settings(),
            Arc::new(PipelineStats::new()),
        );
        let (tx, mut rx) = mpsc::channel(8);
        feed.start(tx).await.unwrap();
        assert_eq!(broker.subscriber_count(), 1);

        feed.stop().await;
        assert!(!feed.is_running());
        assert_eq!(broker.subscriber_count(), 0);

        broker.publish("eeg/data", GOOD);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let broker = MemoryBroker::new();
        let mut feed = FeedSubscriber::new(
            broker.transport("eeg/data"),
            fast_settings(),
            Arc::new(PipelineStats::new()),
        );

        let (tx, _rx) = mpsc::channel(8);
        feed.start(tx).await.unwrap();
        feed.stop().await;

        let (tx, mut rx) = mpsc::channel(8);
        feed.start(tx).await.unwrap();
        assert!(feed.is_running());
        assert_eq!(broker.connect_count(), 2);

        broker.publish("eeg/data", GOOD);
        let reading = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(reading.is_some());

        feed.stop().await;
    }

    #[tokio::test]
    async fn test_start_fails_when_zmq_publisher_is_absent() {
        let settings = FeedSettings {
            connect_attempts: 2,
            connect_timeout: Duration::from_millis(100),
            ..fast_settings()
        };
        let mut feed = FeedSubscriber::new(
            ZmqTransport::new("tcp://127.0.0.1:1", "eeg/data"),
            settings,
            Arc::new(PipelineStats::new()),
        );
        let (tx, _rx) = mpsc::channel(8);

        let result = tokio::time::timeout(Duration::from_secs(5), feed.start(tx))
            .await
            .expect("start should give up on an absent publisher");
        assert!(matches!(
            result,
            Err(IngestError::BrokerUnavailable {
                attempts: 2,
                source: TransportError::Connect(_),
                ..
            })
        ));
        assert!(!feed.is_running());
    }

    fn zmq_reading() -> ZmqMessage {
        let mut message = ZmqMessage::from(GOOD);
        message.prepend(&ZmqMessage::from("eeg/data"));
        message
    }

    /// Publish until one reading comes through; late subscribers miss early messages
    async fn publish_until_received(
        publisher: &mut PubSocket,
        rx: &mut mpsc::Receiver<Reading>,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            publisher.send(zmq_reading()).await.unwrap();
            if let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(20), rx.recv()).await {
                return true;
            }
        }
        false
    }

    #[tokio::test]
    async fn test_resubscribes_after_zmq_publisher_restart() {
        let mut publisher = PubSocket::new();
        let endpoint = publisher.bind("tcp://127.0.0.1:0").await.unwrap().to_string();

        let stats = Arc::new(PipelineStats::new());
        let settings = FeedSettings {
            connect_timeout: Duration::from_millis(200),
            idle_timeout: Some(Duration::from_millis(200)),
            ..fast_settings()
        };
        let mut feed = FeedSubscriber::new(
            ZmqTransport::new(endpoint.clone(), "eeg/data"),
            settings,
            stats.clone(),
        );
        let (tx, mut rx) = mpsc::channel(64);
        feed.start(tx).await.unwrap();
        assert!(publish_until_received(&mut publisher, &mut rx).await);

        let _ = publisher.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        while rx.try_recv().is_ok() {}

        let mut publisher = PubSocket::new();
        publisher.bind(&endpoint).await.unwrap();
        assert!(publish_until_received(&mut publisher, &mut rx).await);
        assert!(stats.snapshot().reconnects >= 1);

        feed.stop().await;
        let _ = publisher.close().await;
    }
}
