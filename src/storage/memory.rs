use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::traits::{ReadingStore, StoreResult};
use crate::types::SubjectId;

/// One persisted channel value
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSample {
    pub timestamp: DateTime<Utc>,
    pub subject_id: SubjectId,
    pub channel_index: usize,
    pub value: f64,
}

type SampleKey = (DateTime<Utc>, SubjectId, usize);

/// Samples retained by [`MemoryReadingStore::new`]
pub const DEFAULT_MEMORY_CAPACITY: usize = 100_000;

/// In-process store used when no database is configured, and in tests
///
/// Holds at most `capacity` samples; once full, the samples with the oldest
/// timestamps are evicted first.
pub struct MemoryReadingStore {
    samples: RwLock<BTreeMap<SampleKey, f64>>,
    capacity: usize,
}

impl Default for MemoryReadingStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

impl MemoryReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: RwLock::new(BTreeMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All samples ordered by (timestamp, subject, channel)
    pub fn samples(&self) -> Vec<StoredSample> {
        self.samples
            .read()
            .iter()
            .map(|(&(timestamp, subject_id, channel_index), &value)| StoredSample {
                timestamp,
                subject_id,
                channel_index,
                value,
            })
            .collect()
    }

    pub fn samples_for(&self, subject_id: SubjectId) -> Vec<StoredSample> {
        self.samples()
            .into_iter()
            .filter(|s| s.subject_id == subject_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }
}

#[async_trait]
impl ReadingStore for MemoryReadingStore {
    async fn store_reading(
        &self,
        subject_id: SubjectId,
        timestamp: DateTime<Utc>,
        channel_index: usize,
        value: f64,
    ) -> StoreResult<()> {
        let mut samples = self.samples.write();
        samples.insert((timestamp, subject_id, channel_index), value);
        while samples.len() > self.capacity {
            samples.pop_first();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_upsert_replaces_value() {
        let store = MemoryReadingStore::new();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        store.store_reading(2, ts, 0, 1.0).await.unwrap();
        store.store_reading(2, ts, 0, 9.0).await.unwrap();
        store.store_reading(2, ts, 1, 2.0).await.unwrap();

        let samples = store.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].value, 9.0);
        assert_eq!(samples[1].channel_index, 1);
    }

    #[tokio::test]
    async fn test_samples_for_subject() {
        let store = MemoryReadingStore::new();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        store.store_reading(1, ts, 0, 1.0).await.unwrap();
        store.store_reading(2, ts, 0, 2.0).await.unwrap();

        assert_eq!(store.samples_for(2).len(), 1);
        assert_eq!(store.samples_for(3).len(), 0);
        assert!(!store.is_empty());
    }

    #[tokio::test]
    async fn test_oldest_samples_evicted_at_capacity() {
        let store = MemoryReadingStore::with_capacity(3);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        for second in 0..5 {
            let ts = start + chrono::Duration::seconds(second);
            store.store_reading(1, ts, 0, second as f64).await.unwrap();
        }

        let values: Vec<f64> = store.samples().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
        assert_eq!(store.len(), store.capacity());
    }
}
