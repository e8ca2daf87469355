use futures_util::future::join_all;
use std::sync::Arc;

use crate::classifier::SeizureClassifier;
use crate::codec::encode_reading;
use crate::registry::{ConnectionRegistry, FanoutReport};
use crate::stats::PipelineStats;
use crate::storage::ReadingStore;
use crate::types::{alert_text, Reading};

/// What happened to one reading
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOutcome {
    pub persisted: usize,
    pub persist_failures: usize,
    pub anomaly: bool,
    pub delivery: FanoutReport,
    /// Present when an alert was fanned out
    pub alert: Option<FanoutReport>,
}

/// Per-reading orchestration: persist, classify, fan out, alert
pub struct Dispatcher {
    store: Arc<dyn ReadingStore>,
    classifier: Arc<dyn SeizureClassifier>,
    registry: ConnectionRegistry,
    alerts_enabled: bool,
    stats: Arc<PipelineStats>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        classifier: Arc<dyn SeizureClassifier>,
        registry: ConnectionRegistry,
        alerts_enabled: bool,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            store,
            classifier,
            registry,
            alerts_enabled,
            stats,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Handle one decoded reading
    ///
    /// Persistence runs alongside classification and fan-out; a storage
    /// failure never holds back delivery.
    pub async fn handle(&self, reading: &Reading) -> DispatchOutcome {
        let (persist, (anomaly, delivery, alert)) =
            tokio::join!(self.persist(reading), async { self.deliver(reading) });

        self.stats.record_dispatched();

        DispatchOutcome {
            persisted: persist.0,
            persist_failures: persist.1,
            anomaly,
            delivery,
            alert,
        }
    }

    async fn persist(&self, reading: &Reading) -> (usize, usize) {
        let writes = reading
            .channels
            .iter()
            .enumerate()
            .map(|(channel_index, value)| {
                self.store
                    .store_reading(reading.subject_id, reading.timestamp, channel_index, *value)
            });

        let mut persisted = 0;
        let mut failures = 0;
        for (channel_index, result) in join_all(writes).await.into_iter().enumerate() {
            match result {
                Ok(()) => persisted += 1,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        subject_id = reading.subject_id,
                        channel_index,
                        "Failed to persist sample: {}",
                        e
                    );
                }
            }
        }

        self.stats.record_persisted(persisted as u64);
        self.stats.record_persist_failures(failures as u64);
        (persisted, failures)
    }

    fn deliver(&self, reading: &Reading) -> (bool, FanoutReport, Option<FanoutReport>) {
        let anomaly = match self.classifier.classify(&reading.channels) {
            Ok(anomaly) => anomaly,
            Err(e) => {
                tracing::warn!(
                    subject_id = reading.subject_id,
                    classifier = self.classifier.name(),
                    "Classification failed, treating as negative: {}",
                    e
                );
                false
            }
        };

        let delivery = match encode_reading(reading) {
            Ok(payload) => self.registry.fanout_subject(reading.subject_id, &payload),
            Err(e) => {
                tracing::error!(subject_id = reading.subject_id, "Failed to encode reading: {}", e);
                FanoutReport::default()
            }
        };
        self.stats
            .record_deliveries(delivery.delivered as u64, delivery.dropped as u64);

        let alert = if anomaly && self.alerts_enabled {
            tracing::info!(subject_id = reading.subject_id, "Seizure detected");
            let report = self.registry.fanout_alert(&alert_text(reading.subject_id));
            self.stats.record_alert();
            self.stats
                .record_deliveries(report.delivered as u64, report.dropped as u64);
            Some(report)
        } else {
            None
        };

        (anomaly, delivery, alert)
    }
}
