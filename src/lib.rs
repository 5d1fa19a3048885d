// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod logging;
}

pub mod codec; // Oversized-value chunking
pub mod store; // Synchronized ordered and keyed result stores
pub mod board; // Abort signalling
pub mod queue; // Task channel and end-of-work protocol
pub mod pool; // Workers and the helping coordinator
pub mod cache; // Ordered document emission
pub mod pipeline; // Line preprocessing driver

// Re-exports for convenience
pub use crate::core::config::{PoolConfig, PoolConfigBuilder, DEFAULT_MAX_PART_SIZE, MAX_WAIT_TIMEOUT};
pub use crate::core::errors::{PoolError, Result};
pub use crate::core::logging::{init_tracing, LoggingConfig};
pub use board::{ErrorBoard, ErrorSignal, WakerId};
pub use cache::{Document, OrderedDocumentCache, SharedOutput};
pub use codec::{ChunkCodec, ChunkedValue, Compression, Fragment};
pub use pipeline::{LinePart, LineParts, LinePipeline, PipelineSummary};
pub use pool::{part_ranges, Coordinator, Operation, RunReport, Worker, WorkerExit, WorkerState};
pub use queue::{FetchMode, Fetched, Task, TaskQueue};
pub use store::{KeyedStore, OrderedStore, ResultSink, WaitOutcome};
