use thiserror::Error;

/// Errors returned by [`crate::cache::Cache`] operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache capacity must be non-zero")]
    ZeroCapacity,
    #[error("thread-mode cache requires an input callback")]
    MissingCallback,
    #[error("input callback reported a terminal failure")]
    ProducerFailed,
    #[error("new capacity ({requested}) is smaller than current fill ({fill})")]
    ShrinkBelowFill { requested: usize, fill: usize },
}

/// Errors returned by [`crate::stream::Stream`] operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("stream has been aborted")]
    Aborted,
}

/// Errors returned by [`crate::engine::Engine`] operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to prepare playback sink: {0}")]
    SinkUnavailable(String),
    #[error("stream table is full ({max} streams already active)")]
    StreamTableFull { max: usize },
    #[error(transparent)]
    Stream(#[from] StreamError),
}

pub type CacheResult<T> = Result<T, CacheError>;
pub type StreamResult<T> = Result<T, StreamError>;
pub type EngineResult<T> = Result<T, EngineError>;
