//! Tether Runtime - Orchestration layer for the Tether correlation core.
//!
//! This crate provides:
//! - Runtime orchestration (`TetherRuntime`) with a bounded event queue
//! - Configuration loading (`ConfigLoader`)
//! - Logging configuration
//!
//! # Feeding Events
//!
//! The runtime does not speak any chat protocol itself. A transport decodes
//! updates into [`BoxedEvent`](tether_core::BoxedEvent)s and feeds them
//! through an [`EventSender`]:
//!
//! ```ignore
//! use tether_runtime::TetherRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = TetherRuntime::new();
//!
//!     let events = runtime.event_sender();
//!     tokio::spawn(async move {
//!         while let Some(update) = transport.next().await {
//!             events.feed(update.into()).await?;
//!         }
//!         anyhow::Ok(())
//!     });
//!
//!     // Run until Ctrl+C
//!     runtime.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Shutdown
//!
//! Stopping the runtime closes the queue and drops events that were never
//! dispatched. It then removes every expectation and closes the correlator,
//! so pending waits (and waits made later by running listeners) resolve to
//! `Cancelled`. Finally it waits for in-flight dispatches and listener
//! callbacks.

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

// Re-exports
pub use config::{
    ConfigError, ConfigLoader, ConfigResult, CorrelationConfig, LoggingConfig, Profile,
    TetherConfig,
};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{EventSender, RuntimeBuilder, RuntimeStats, TetherRuntime};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
///
/// This provides all the commonly used logging macros:
/// - `trace!`, `debug!`, `info!`, `warn!`, `error!`
/// - `span`, `event`
/// - `instrument` attribute
/// - `Level` for span creation
pub mod prelude {
    pub use tracing::{Level, debug, error, event, info, instrument, span, trace, warn};
}
