// Error Types
use thiserror::Error;

/// Result type for walk operations
pub type Result<T> = std::result::Result<T, WalkError>;

/// Errors raised around the kernel: partitioning, the worker pool, storage and config.
/// The kernel itself never fails.
#[derive(Error, Debug)]
pub enum WalkError {
    #[error("Invalid chunk size: {0} rows")]
    InvalidChunkSize(usize),

    #[error("Invalid cluster configuration: {0}")]
    InvalidCluster(String),

    #[error("Chunk {chunk} needs {required} bytes, worker memory limit is {limit}")]
    MemoryLimit {
        chunk: usize,
        required: usize,
        limit: usize,
    },

    #[error("Task failed: {0}")]
    Task(String),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Mode {mode} disagrees: std {got} vs reference {expected}")]
    Mismatch {
        mode: String,
        got: f64,
        expected: f64,
    },
}
