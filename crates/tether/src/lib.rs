//! # Tether
//!
//! Event correlation for chat-bot conversations.
//!
//! ## Overview
//!
//! A bot that asks a question has to recognise the answer when it arrives.
//! Tether keeps a registry of *expectations*: persistent listeners that run a
//! callback for every matching event, and one-shot waits that suspend a task
//! until the next matching event, a timeout, or a cancellation. Each incoming
//! event is routed to the single most specific expectation interested in it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌────────────┐     ┌───────────────────────┐
//! │  Transport  │────▶│   Runtime   │────▶│ Dispatcher │────▶│ Listener callback     │
//! │  (decoder)  │     │ (event pump)│     │            │────▶│ or waiting task       │
//! └─────────────┘     └─────────────┘     └────────────┘     └───────────────────────┘
//!                                               │
//!                                         ┌──────────┐
//!                                         │ Registry │
//!                                         └──────────┘
//! ```
//!
//! - **Runtime**: Owns the event queue, configuration and logging
//! - **Dispatcher**: Picks the winning expectation for each event
//! - **Registry**: Stores expectations bucketed by kind and chat
//! - **WaitGate**: Turns a one-shot expectation into an awaitable future
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tether::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = TetherRuntime::new();
//!     let correlator = runtime.correlator().clone();
//!
//!     runtime.correlator().register(Interest::message(Identifier::any()), move |event| {
//!         let correlator = correlator.clone();
//!         async move {
//!             let chat = event.scope().chat_id().unwrap_or_default();
//!             let interest = Interest::message(Identifier::chat(chat));
//!             let answer = correlator
//!                 .wait(interest.timeout(Duration::from_secs(30)))
//!                 .await?;
//!             handle(answer).await
//!         }
//!     });
//!
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: Load `tether.toml` configuration files (default)
//! - `yaml-config`: Load `tether.yaml` configuration files
//! - `json-log`: Enable the JSON log format

pub use tether_core as core;
pub use tether_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use tether::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use tether_runtime::{EventSender, TetherRuntime};

    // Correlation
    pub use tether_core::{
        Correlator, CorrelationError, CorrelationResult, ExpectationHandle, Interest, PendingWait,
        WaitState,
    };

    // Events and keys
    pub use tether_core::{BoxError, BoxedEvent, Event, EventKind, Identifier, RawEvent};

    pub use std::time::Duration;
}
