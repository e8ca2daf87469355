pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::{MemoryReadingStore, StoredSample};
pub use postgres::PostgresReadingStore;
pub use traits::{ReadingStore, StoreError, StoreResult};
