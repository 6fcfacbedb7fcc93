//! Error types for the Tether correlation core.
//!
//! Only three things can go wrong inside the core: a wait runs out of time,
//! a wait is cancelled, or a listener callback fails. Unmatched events are
//! not errors, and neither are repeated removals or resolution attempts that
//! lose a race; those are absorbed silently.

use std::time::Duration;

use thiserror::Error;

use crate::foundation::event::EventKind;

/// Boxed error type returned by listener callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// =============================================================================
// Correlation Errors
// =============================================================================

/// Errors surfaced by the correlation core.
#[derive(Debug, Clone, Error)]
pub enum CorrelationError {
    /// A wait exceeded its deadline without a matching event.
    #[error("timed out after {timeout:?} waiting for {kind} event")]
    Timeout {
        /// The event kind that was awaited.
        kind: EventKind,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A wait was cancelled before a match or a timeout.
    #[error("wait for {kind} event was cancelled")]
    Cancelled {
        /// The event kind that was awaited.
        kind: EventKind,
    },

    /// A persistent listener's callback returned an error or panicked.
    #[error("listener '{listener}' failed: {reason}")]
    CallbackFailure {
        /// Name of the failing listener (or its handle when unnamed).
        listener: String,
        /// Rendered error or panic message.
        reason: String,
    },
}

impl CorrelationError {
    /// Creates a callback failure error.
    pub fn callback_failure(listener: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CallbackFailure {
            listener: listener.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if this is a [`CorrelationError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if this is a [`CorrelationError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for correlation operations.
pub type CorrelationResult<T> = Result<T, CorrelationError>;
