use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::SubjectId;

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a reading store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Durable sink for channel samples
///
/// One call per channel of each reading. Writes for the same
/// `(timestamp, subject, channel)` key replace the previous value.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn store_reading(
        &self,
        subject_id: SubjectId,
        timestamp: DateTime<Utc>,
        channel_index: usize,
        value: f64,
    ) -> StoreResult<()>;
}
