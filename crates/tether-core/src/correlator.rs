//! The public entry point of the correlation core.
//!
//! A [`Correlator`] bundles one [`Registry`] with the [`Dispatcher`] and
//! [`WaitGate`] that operate on it. Application code registers listeners and
//! waits through it; the transport layer feeds it decoded events.
//!
//! ```rust,ignore
//! use tether_core::prelude::*;
//!
//! let correlator = Correlator::builder()
//!     .default_timeout(Duration::from_secs(30))
//!     .build();
//!
//! correlator.register(Interest::message(Identifier::any()), |event| async move {
//!     tracing::info!(scope = %event.scope(), "Got a message");
//!     Ok::<_, BoxError>(())
//! });
//!
//! // In the transport loop:
//! correlator.dispatch(event).await;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::BoxError;
use crate::foundation::event::{BoxedEvent, EventKind};
use crate::foundation::identifier::Identifier;
use crate::framework::dispatcher::Dispatcher;
use crate::framework::expectation::{ExpectationHandle, into_callback};
use crate::framework::registry::Registry;
use crate::framework::sink::{BoxedErrorSink, ErrorSink, TracingErrorSink};
use crate::framework::wait::{Interest, PendingWait, WaitGate};

/// Listener registration, one-shot waits and event dispatch over a shared
/// registry.
///
/// Cloning is cheap and every clone operates on the same registry.
#[derive(Debug, Clone)]
pub struct Correlator {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    gate: WaitGate,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Creates a correlator with no default wait timeout that logs listener
    /// failures through tracing.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Returns a builder.
    pub fn builder() -> CorrelatorBuilder {
        CorrelatorBuilder::default()
    }

    /// Registers a persistent listener.
    ///
    /// `callback` runs for every event this listener wins until it is
    /// removed. Its errors are reported to the error sink.
    pub fn register<F, Fut, E>(&self, interest: Interest, callback: F) -> ExpectationHandle
    where
        F: Fn(BoxedEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.registry
            .register(interest.into_listener(into_callback(callback)))
    }

    /// Removes a listener, or cancels a pending wait.
    ///
    /// Returns `false` if nothing was registered under `handle`; removing
    /// twice is harmless.
    pub fn remove(&self, handle: ExpectationHandle) -> bool {
        match self.registry.take(handle) {
            Some(expectation) => {
                expectation.cancel_wait();
                true
            }
            None => false,
        }
    }

    /// Registers a one-shot wait. Await the result for the matched event.
    pub fn wait(&self, interest: Interest) -> PendingWait {
        self.gate.wait(interest)
    }

    /// Feeds one decoded event in under its own kind.
    ///
    /// Returns `true` if an expectation was resolved.
    pub async fn dispatch(&self, event: BoxedEvent) -> bool {
        self.dispatcher.dispatch(event).await
    }

    /// Feeds one decoded event in under an explicit kind.
    pub async fn dispatch_as(&self, kind: EventKind, event: BoxedEvent) -> bool {
        self.dispatcher.dispatch_as(kind, event).await
    }

    /// Removes every expectation of `kind` whose identifier is matched by
    /// `pattern`. Pending waits among them return `Cancelled`.
    ///
    /// Returns the number of expectations removed.
    pub fn stop_matching(&self, kind: EventKind, pattern: &Identifier) -> usize {
        let stopped = self
            .registry
            .matching(kind, pattern)
            .into_iter()
            .filter_map(|expectation| self.registry.take(expectation.handle()))
            .inspect(|expectation| {
                expectation.cancel_wait();
            })
            .count();

        debug!(kind = %kind, pattern = %pattern, stopped, "Stopped matching expectations");
        stopped
    }

    /// Removes everything and stops accepting new expectations. Pending
    /// waits, including ones created afterwards, return `Cancelled`.
    ///
    /// Listener callbacks already running are not interrupted; see
    /// [`wait_for_callbacks`](Self::wait_for_callbacks).
    ///
    /// Returns the number of expectations removed.
    pub fn shutdown(&self) -> usize {
        self.registry.close();
        let drained = self.registry.drain();
        let cancelled = drained
            .iter()
            .filter(|expectation| expectation.cancel_wait())
            .count();

        info!(
            removed = drained.len(),
            cancelled_waits = cancelled,
            "Correlator shut down"
        );
        drained.len()
    }

    /// Waits until every listener callback started so far has finished.
    pub async fn wait_for_callbacks(&self) {
        self.dispatcher.wait_for_callbacks().await;
    }

    /// Returns the shared registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Returns the dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Returns the default wait timeout.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.gate.default_timeout()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Correlator`].
#[derive(Default)]
pub struct CorrelatorBuilder {
    registry: Option<Arc<Registry>>,
    error_sink: Option<BoxedErrorSink>,
    default_timeout: Option<Duration>,
}

impl CorrelatorBuilder {
    /// Uses an existing registry instead of a fresh one.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the sink for listener failures.
    pub fn error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.error_sink = Some(Arc::new(sink));
        self
    }

    /// Sets an already type-erased sink for listener failures.
    pub fn boxed_error_sink(mut self, sink: BoxedErrorSink) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Sets the timeout for waits that do not specify one.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Sets or clears the default wait timeout.
    pub fn maybe_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Builds the correlator.
    pub fn build(self) -> Correlator {
        let registry = self.registry.unwrap_or_default();
        let error_sink = self
            .error_sink
            .unwrap_or_else(|| Arc::new(TracingErrorSink) as BoxedErrorSink);

        Correlator {
            dispatcher: Dispatcher::new(Arc::clone(&registry)).with_boxed_error_sink(error_sink),
            gate: WaitGate::new(Arc::clone(&registry)).with_default_timeout(self.default_timeout),
            registry,
        }
    }
}

impl std::fmt::Debug for CorrelatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelatorBuilder")
            .field("has_registry", &self.registry.is_some())
            .field("has_error_sink", &self.error_sink.is_some())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
