use std::fmt;
use thiserror::Error;

/// Unified error type for the parpipe library
#[derive(Debug, Error)]
pub enum PoolError {
    /// A caller-supplied operation failed while executing a task
    #[error("Worker {worker} failed on task {task}: {source}")]
    WorkerExecution {
        worker: String,
        task: String,
        #[source]
        source: anyhow::Error,
    },

    /// A caller-supplied operation panicked
    #[error("Worker {worker} panicked on task {task}: {message}")]
    WorkerPanicked {
        worker: String,
        task: String,
        message: String,
    },

    /// Malformed or truncated chunked payload
    #[error("Corrupt chunked value: {reason}")]
    CorruptChunk { reason: String },

    /// A position or key was written twice
    #[error("Duplicate entry for {key}")]
    DuplicateEntry { key: String },

    /// A document was cached without being registered through `wait_for`
    #[error("Index {index} was never registered with wait_for")]
    UnregisteredIndex { index: u64 },

    /// A document index at or below the last emitted index was offered again
    #[error("Index {index} was already emitted")]
    AlreadyEmitted { index: u64 },

    /// The task queue no longer accepts tasks
    #[error("Task queue is closed")]
    QueueClosed,

    /// The run was abandoned because the error board was raised
    #[error("Run aborted: {reason}")]
    Aborted { reason: String },

    /// Serialization errors
    #[error("Serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    /// Compression errors
    #[error("Compression failed during {operation}")]
    Compression {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl PoolError {
    /// Create a worker execution error
    pub fn worker_execution<W: Into<String>, T: fmt::Display>(
        worker: W,
        task: T,
        source: anyhow::Error,
    ) -> Self {
        Self::WorkerExecution {
            worker: worker.into(),
            task: task.to_string(),
            source,
        }
    }

    /// Create a corrupt chunk error
    pub fn corrupt_chunk<S: Into<String>>(reason: S) -> Self {
        Self::CorruptChunk {
            reason: reason.into(),
        }
    }

    /// Create a duplicate entry error
    pub fn duplicate<K: fmt::Display>(key: K) -> Self {
        Self::DuplicateEntry {
            key: key.to_string(),
        }
    }

    /// Create an abort error
    pub fn aborted<S: Into<String>>(reason: S) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a compression error
    pub fn compression<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Compression {
            operation: operation.into(),
            source,
        }
    }

    /// Whether this error abandons the whole batch.
    ///
    /// Only usage errors (a bad key, a closed queue, bad configuration) leave
    /// the run intact; everything raised from inside a worker is fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::WorkerExecution { .. }
            | Self::WorkerPanicked { .. }
            | Self::CorruptChunk { .. }
            | Self::Aborted { .. }
            | Self::Serialization(_)
            | Self::Compression { .. }
            | Self::Io { .. } => true,
            Self::DuplicateEntry { .. }
            | Self::UnregisteredIndex { .. }
            | Self::AlreadyEmitted { .. }
            | Self::QueueClosed
            | Self::Configuration { .. } => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::WorkerExecution { .. } => "worker_execution",
            Self::WorkerPanicked { .. } => "worker_panicked",
            Self::CorruptChunk { .. } => "corrupt_chunk",
            Self::DuplicateEntry { .. } => "duplicate_entry",
            Self::UnregisteredIndex { .. } => "unregistered_index",
            Self::AlreadyEmitted { .. } => "already_emitted",
            Self::QueueClosed => "queue_closed",
            Self::Aborted { .. } => "aborted",
            Self::Serialization(_) => "serialization",
            Self::Compression { .. } => "compression",
            Self::Configuration { .. } => "configuration",
            Self::Io { .. } => "io",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, PoolError>;

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("invalid json: {}", err))
    }
}

impl From<serde_yaml::Error> for PoolError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("invalid yaml: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PoolError::corrupt_chunk("missing end marker");
        assert!(matches!(err, PoolError::CorruptChunk { .. }));
        assert_eq!(err.category(), "corrupt_chunk");
        assert!(err.to_string().contains("missing end marker"));
    }

    #[test]
    fn test_worker_execution_keeps_source() {
        let err = PoolError::worker_execution("worker-1", 7u64, anyhow::anyhow!("bad input"));
        assert_eq!(err.to_string(), "Worker worker-1 failed on task 7: bad input");
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "bad input");
    }

    #[test]
    fn test_fatality() {
        assert!(PoolError::aborted("board raised").is_fatal());
        assert!(PoolError::corrupt_chunk("x").is_fatal());
        assert!(!PoolError::duplicate(3).is_fatal());
        assert!(!PoolError::QueueClosed.is_fatal());
        assert!(!PoolError::configuration("x").is_fatal());
    }

    #[test]
    fn test_configuration_field() {
        let err = PoolError::configuration_field("must be positive", "max_part_size");
        if let PoolError::Configuration { field, .. } = err {
            assert_eq!(field.as_deref(), Some("max_part_size"));
        } else {
            panic!("Expected configuration error");
        }
    }
}
