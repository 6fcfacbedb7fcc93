//! # Tether Core
//!
//! The event-correlation core of the Tether framework.
//!
//! This crate matches asynchronously arriving events (messages, callback
//! queries) against outstanding expectations registered by application code,
//! and resolves exactly one expectation per event.
//!
//! ## Architecture Layers
//!
//! ### Foundation Layer
//!
//! Value types:
//! - **Event System**: Type-erased events with runtime downcasting ([`Event`], [`BoxedEvent`])
//! - **Identifiers**: Partially populated correlation keys ([`Identifier`])
//!
//! ### Framework Layer
//!
//! Correlation and routing:
//! - **Expectations**: Persistent listeners and one-shot waits ([`Expectation`])
//! - **Registry**: Concurrent, bucketed storage ([`Registry`])
//! - **Dispatcher**: Specificity-based winner selection ([`Dispatcher`])
//! - **Wait Gate**: Timeout-bounded, cancellable waits ([`WaitGate`], [`PendingWait`])
//!
//! ## Flow
//!
//! ```text
//! ┌───────────┐ dispatch ┌────────────┐ lookup ┌──────────┐
//! │ Transport │─────────▶│ Dispatcher │───────▶│ Registry │
//! └───────────┘          └─────┬──────┘        └──────────┘
//!                              │ resolve            ▲
//!                              ▼                    │ register / remove
//!                   listener callback or      ┌─────┴──────┐
//!                   waiting caller ◀──────────│ Application│
//!                                             └────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tether_core::prelude::*;
//!
//! let correlator = Correlator::new();
//!
//! // Ask a question, then wait for the answer from the same user.
//! let answer = correlator.wait(
//!     Interest::message(Identifier::chat(chat_id).with_user(user_id))
//!         .timeout(Duration::from_secs(30)),
//! );
//! bot.send_message(chat_id, "What's your name?").await?;
//!
//! match answer.await {
//!     Ok(event) => println!("Got {:?}", event),
//!     Err(err) if err.is_timeout() => println!("No answer"),
//!     Err(err) => return Err(err.into()),
//! }
//! ```

pub mod correlator;
pub mod error;
pub mod foundation;
pub mod framework;

pub use correlator::{Correlator, CorrelatorBuilder};
pub use error::{BoxError, CorrelationError, CorrelationResult};
pub use foundation::{BoxedEvent, Event, EventKind, Identifier, RawEvent};
pub use framework::{
    BoxedErrorSink, Callback, Dispatcher, ErrorSink, Expectation, ExpectationHandle,
    ExpectationId, Interest, Mode, PendingWait, Predicate, Registry, TracingErrorSink, WaitGate,
    WaitState, into_callback,
};

/// Prelude for common imports.
pub mod prelude {
    pub use super::correlator::Correlator;
    pub use super::error::{BoxError, CorrelationError, CorrelationResult};
    pub use super::foundation::*;
    pub use super::framework::{ExpectationHandle, Interest, PendingWait, WaitState};
}
