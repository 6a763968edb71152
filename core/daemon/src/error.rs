//! Failure classes for one reconciliation tick.
//!
//! None of these stop the monitor. A failed sample skips the whole tick; a
//! store failure only affects one pid and the rest of the tick still runs.

#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("process sample failed: {0}")]
    Sample(String),

    #[error("store operation failed: {0}")]
    Store(String),
}

impl TickError {
    pub fn kind(&self) -> &'static str {
        match self {
            TickError::Sample(_) => "sample",
            TickError::Store(_) => "store",
        }
    }
}
