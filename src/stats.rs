use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline counters, shared between the feed, dispatcher and HTTP handlers
#[derive(Debug, Default)]
pub struct PipelineStats {
    messages_received: AtomicU64,
    decode_failures: AtomicU64,
    readings_dispatched: AtomicU64,
    samples_persisted: AtomicU64,
    persist_failures: AtomicU64,
    deliveries: AtomicU64,
    dropped_deliveries: AtomicU64,
    alerts_sent: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub decode_failures: u64,
    pub readings_dispatched: u64,
    pub samples_persisted: u64,
    pub persist_failures: u64,
    pub deliveries: u64,
    pub dropped_deliveries: u64,
    pub alerts_sent: u64,
    pub reconnects: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self) {
        self.readings_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, samples: u64) {
        self.samples_persisted.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn record_persist_failures(&self, samples: u64) {
        self.persist_failures.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn record_deliveries(&self, delivered: u64, dropped: u64) {
        self.deliveries.fetch_add(delivered, Ordering::Relaxed);
        self.dropped_deliveries.fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn record_alert(&self) {
        self.alerts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            readings_dispatched: self.readings_dispatched.load(Ordering::Relaxed),
            samples_persisted: self.samples_persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            dropped_deliveries: self.dropped_deliveries.load(Ordering::Relaxed),
            alerts_sent: self.alerts_sent.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = PipelineStats::new();
        stats.record_received();
        stats.record_received();
        stats.record_decode_failure();
        stats.record_persisted(8);
        stats.record_deliveries(3, 1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.decode_failures, 1);
        assert_eq!(snapshot.samples_persisted, 8);
        assert_eq!(snapshot.deliveries, 3);
        assert_eq!(snapshot.dropped_deliveries, 1);
        assert_eq!(snapshot.alerts_sent, 0);
    }
}
