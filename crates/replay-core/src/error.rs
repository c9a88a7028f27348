use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    /// Malformed or non-finite feature data; nothing was written.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The record store or lookup index could not be reached.
    /// Never interchangeable with a miss.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Surrogate unavailable: {0}")]
    SurrogateUnavailable(String),

    #[error("Resolution exceeded deadline of {0:?}")]
    Timeout(Duration),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplayError {
    /// Infrastructure failures that must abort a backtest run rather than
    /// drive the fallback chain.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            ReplayError::StorageUnavailable(_) | ReplayError::Timeout(_)
        )
    }
}

pub type ReplayResult<T> = Result<T, ReplayError>;
