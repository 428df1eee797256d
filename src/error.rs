//! Error types for the message bus.

use thiserror::Error;

/// Main error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Message bus is shut down")]
    ShutDown,

    #[error("Publication queue is closed")]
    Closed,

    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
