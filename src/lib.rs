pub mod classifier;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod pipeline;
pub mod registry;
pub mod simulator;
pub mod stats;
pub mod storage;
pub mod transport;
pub mod types;
pub mod websocket;

pub use classifier::{
    build_classifier, ClassifierError, LogisticModelClassifier, SeizureClassifier,
    ThresholdClassifier,
};
pub use codec::{DecodeError, ReadingDecoder};
pub use config::{ClassifierKind, ConfigError, IngestConfig};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::{IngestError, IngestResult};
pub use feed::{FeedSettings, FeedSubscriber};
pub use pipeline::IngestPipeline;
pub use registry::{ConnectionId, ConnectionRegistry, FanoutReport, Outbound, ViewerHandle};
pub use stats::{PipelineStats, StatsSnapshot};
pub use storage::{MemoryReadingStore, PostgresReadingStore, ReadingStore, StoreError};
pub use transport::{
    FeedMessage, FeedTransport, MemoryBroker, MemoryTransport, TransportError, ZmqTransport,
};
pub use types::*;
pub use websocket::{router, AppState, ViewerSettings};
