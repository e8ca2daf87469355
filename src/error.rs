use crate::config::ConfigError;
use crate::storage::StoreError;
use crate::transport::TransportError;

/// Result type for pipeline lifecycle operations
pub type IngestResult<T> = Result<T, IngestError>;

/// Errors that stop the ingestion service from starting or running
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker unavailable at {endpoint} after {attempts} attempts: {source}")]
    BrokerUnavailable {
        endpoint: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Pipeline already running")]
    AlreadyRunning,

    #[error("Feed transport was lost when the subscriber was aborted")]
    TransportLost,

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Classifier model error: {0}")]
    Model(String),
}
