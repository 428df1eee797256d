//! Hand-off queue between publishers and dispatch workers.

mod transfer;
mod waiter;

use std::fmt;
use thiserror::Error;

pub use transfer::{TransferQueue, MAX_CAPACITY};

/// Failure of a blocking insert. The rejected item is handed back.
#[derive(Error)]
pub enum PutError<T> {
    #[error("queue is closed")]
    Closed(T),

    #[error("timed out waiting for the queue")]
    Timeout(T),
}

impl<T> PutError<T> {
    /// Recover the item that was not delivered.
    pub fn into_inner(self) -> T {
        match self {
            PutError::Closed(item) | PutError::Timeout(item) => item,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, PutError::Closed(_))
    }
}

impl<T> fmt::Debug for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PutError::Closed(_) => f.write_str("Closed(..)"),
            PutError::Timeout(_) => f.write_str("Timeout(..)"),
        }
    }
}

/// Failure of a blocking removal.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TakeError {
    #[error("queue is closed and drained")]
    Closed,

    #[error("timed out waiting for an item")]
    Timeout,
}
