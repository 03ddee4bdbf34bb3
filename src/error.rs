//! Error types for workq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("concurrency limit must be at least 1, got {0}")]
    InvalidLimit(usize),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue invariant violated: {0}")]
    InvariantViolation(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
