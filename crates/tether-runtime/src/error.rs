//! Runtime error types.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The event queue is full.
    #[error("Event queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The event pump has stopped and no longer accepts events.
    #[error("Event queue is closed")]
    QueueClosed,

    /// The runtime was stopped and cannot be started again.
    #[error("Runtime has already been stopped")]
    Stopped,
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
