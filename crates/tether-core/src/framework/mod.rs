//! Framework layer - Correlation and dispatch.
//!
//! This module contains the moving parts of the correlation core:
//! - Expectations and their one-shot completion slots
//! - The concurrent registry that stores them
//! - The dispatcher that resolves one expectation per event
//! - The wait gate for "wait for the next event matching X"
//! - Error sinks for listener failures

pub mod dispatcher;
pub mod expectation;
pub mod registry;
pub mod sink;
pub(crate) mod slot;
pub mod wait;

pub use dispatcher::Dispatcher;
pub use expectation::{
    Callback, Expectation, ExpectationHandle, ExpectationId, Mode, Predicate, into_callback,
};
pub use registry::Registry;
pub use sink::{BoxedErrorSink, ErrorSink, TracingErrorSink};
pub use slot::WaitState;
pub use wait::{Interest, PendingWait, WaitGate};
