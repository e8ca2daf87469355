use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::traits::{ReadingStore, StoreError, StoreResult};
use crate::types::SubjectId;

/// PostgreSQL implementation of ReadingStore
pub struct PostgresReadingStore {
    pool: PgPool,
}

impl PostgresReadingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize database schema
    pub async fn initialize(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS eeg_data (
                time TIMESTAMPTZ NOT NULL,
                patient_id BIGINT NOT NULL,
                channel_id INTEGER NOT NULL,
                voltage_mv DOUBLE PRECISION NOT NULL,
                PRIMARY KEY (time, patient_id, channel_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_eeg_data_patient_time
                ON eeg_data(patient_id, time DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ReadingStore for PostgresReadingStore {
    async fn store_reading(
        &self,
        subject_id: SubjectId,
        timestamp: DateTime<Utc>,
        channel_index: usize,
        value: f64,
    ) -> StoreResult<()> {
        let channel_id = i32::try_from(channel_index)
            .map_err(|_| StoreError::Internal(format!("channel index {} out of range", channel_index)))?;

        sqlx::query(
            r#"
            INSERT INTO eeg_data (time, patient_id, channel_id, voltage_mv)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (time, patient_id, channel_id) DO UPDATE SET
                voltage_mv = EXCLUDED.voltage_mv
            "#,
        )
        .bind(timestamp)
        .bind(subject_id)
        .bind(channel_id)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
