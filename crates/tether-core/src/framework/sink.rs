//! Error sinks for listener failures.
//!
//! The dispatcher never propagates listener errors into its own control flow.
//! Failures are handed to an [`ErrorSink`] instead and dispatch carries on.

use std::sync::Arc;

use tracing::error;

use super::expectation::ExpectationHandle;
use crate::error::CorrelationError;

/// Receives failures of persistent listener callbacks.
///
/// Any `Fn(ExpectationHandle, CorrelationError)` closure is a sink:
///
/// ```rust,ignore
/// let correlator = Correlator::builder()
///     .error_sink(|handle, err| eprintln!("{handle:?}: {err}"))
///     .build();
/// ```
pub trait ErrorSink: Send + Sync {
    /// Reports a failure of the listener behind `handle`.
    fn report(&self, handle: ExpectationHandle, error: CorrelationError);
}

impl<F> ErrorSink for F
where
    F: Fn(ExpectationHandle, CorrelationError) + Send + Sync,
{
    fn report(&self, handle: ExpectationHandle, error: CorrelationError) {
        self(handle, error)
    }
}

/// Type-erased error sink.
pub type BoxedErrorSink = Arc<dyn ErrorSink>;

/// The default sink: logs every failure at `ERROR` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, handle: ExpectationHandle, error: CorrelationError) {
        error!(
            id = %handle.id(),
            kind = %handle.kind(),
            error = %error,
            "Listener callback failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::event::EventKind;
    use crate::framework::expectation::ExpectationId;
    use parking_lot::Mutex;

    #[test]
    fn test_closure_is_a_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: BoxedErrorSink = {
            let seen = Arc::clone(&seen);
            Arc::new(move |handle: ExpectationHandle, err: CorrelationError| {
                seen.lock().push((handle.id(), err.to_string()));
            })
        };

        let handle = ExpectationHandle {
            id: ExpectationId(4),
            kind: EventKind::Message,
            chat_id: None,
        };
        sink.report(handle, CorrelationError::callback_failure("#4", "boom"));
        TracingErrorSink.report(handle, CorrelationError::callback_failure("#4", "boom"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, ExpectationId(4));
        assert_eq!(seen[0].1, "listener '#4' failed: boom");
    }
}
