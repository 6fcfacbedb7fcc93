//! Main runtime orchestration: the event pump.
//!
//! The runtime owns a [`Correlator`] and a bounded queue between the
//! transport layer and the correlation core. Transports push decoded events
//! through an [`EventSender`]; the pump pulls them off the queue in FIFO order
//! and dispatches each one in its own task, so a slow listener in one chat
//! never holds up events for another. A dispatch permit covers winner
//! selection only; listener callbacks run on the dispatcher's own tasks.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tether_runtime::TetherRuntime;
//!
//! // Simplest way - auto-loads config from current directory
//! let runtime = TetherRuntime::new();
//!
//! // Custom configuration path
//! let runtime = TetherRuntime::builder()
//!     .config_file("config/tether.toml")
//!     .build()?;
//!
//! // Hand the sender to the transport, register listeners, then run
//! let events = runtime.event_sender();
//! runtime.correlator().register(interest, handler);
//! runtime.run().await?;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::signal;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigLoader, TetherConfig, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;
use tether_core::{BoxedErrorSink, BoxedEvent, Correlator, ErrorSink};

// =============================================================================
// Event Sender
// =============================================================================

/// Transport-facing handle for feeding decoded events into the runtime.
///
/// Cheap to clone. Events are dispatched in the order they are fed.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<BoxedEvent>,
    capacity: usize,
}

impl EventSender {
    /// Queues an event, waiting for room if the queue is full.
    pub async fn feed(&self, event: BoxedEvent) -> RuntimeResult<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| RuntimeError::QueueClosed)
    }

    /// Queues an event without waiting.
    pub fn try_feed(&self, event: BoxedEvent) -> RuntimeResult<()> {
        self.sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RuntimeError::QueueFull {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => RuntimeError::QueueClosed,
        })
    }

    /// Returns `true` once the runtime has stopped accepting events.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// A snapshot of runtime counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Events taken off the queue.
    pub events_received: u64,
    /// Events that resolved an expectation.
    pub events_resolved: u64,
    /// Events no expectation was interested in.
    pub events_unmatched: u64,
    /// Expectations currently registered.
    pub registered: usize,
    /// Whether the pump is running.
    pub running: bool,
}

#[derive(Debug, Default)]
struct PumpCounters {
    received: AtomicU64,
    resolved: AtomicU64,
    unmatched: AtomicU64,
}

// =============================================================================
// Event Pump
// =============================================================================

enum PumpState {
    Idle(mpsc::Receiver<BoxedEvent>),
    Running(JoinHandle<()>),
    Stopped,
}

struct EventPump {
    correlator: Correlator,
    limit: Arc<Semaphore>,
    shutdown: CancellationToken,
    counters: Arc<PumpCounters>,
}

impl EventPump {
    async fn run(self, mut receiver: mpsc::Receiver<BoxedEvent>) {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                    Self::reap(finished);
                }
                next = receiver.recv() => {
                    let Some(event) = next else {
                        debug!("Event queue closed");
                        break;
                    };
                    let permit = tokio::select! {
                        permit = Arc::clone(&self.limit).acquire_owned() => permit,
                        _ = self.shutdown.cancelled() => break,
                    };
                    let Ok(permit) = permit else { break };

                    self.counters.received.fetch_add(1, Ordering::Relaxed);
                    let correlator = self.correlator.clone();
                    let counters = Arc::clone(&self.counters);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        let counter = if correlator.dispatch(event).await {
                            &counters.resolved
                        } else {
                            &counters.unmatched
                        };
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
            }
        }

        receiver.close();
        let mut dropped = 0usize;
        while receiver.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "Dropping queued events on shutdown");
        }

        debug!(in_flight = in_flight.len(), "Waiting for in-flight dispatches");
        while let Some(finished) = in_flight.join_next().await {
            Self::reap(finished);
        }
    }

    fn reap(finished: Result<(), JoinError>) {
        if let Err(e) = finished
            && e.is_panic()
        {
            error!(error = %e, "Dispatch task panicked");
        }
    }
}

// =============================================================================
// TetherRuntime
// =============================================================================

/// The Tether runtime: a correlator plus the event pump feeding it.
///
/// # Simple Usage
///
/// ```rust,ignore
/// use tether_runtime::TetherRuntime;
///
/// let runtime = TetherRuntime::new();
/// spawn_transport(runtime.event_sender());
///
/// runtime.correlator().register(
///     Interest::message(Identifier::any()),
///     |event| async move { handle(event).await },
/// );
/// runtime.run().await?;
/// ```
pub struct TetherRuntime {
    /// The configuration.
    config: TetherConfig,
    /// The correlation core.
    correlator: Correlator,
    /// Sender side of the event queue, cloned into every `EventSender`.
    sender: mpsc::Sender<BoxedEvent>,
    /// Pump lifecycle.
    state: Mutex<PumpState>,
    /// Cancelled when the runtime stops.
    shutdown: CancellationToken,
    counters: Arc<PumpCounters>,
}

impl TetherRuntime {
    /// Creates a new runtime with automatic configuration loading.
    ///
    /// This will:
    /// 1. Search for `tether.toml` in the current directory
    /// 2. Apply `TETHER_*` environment overrides
    /// 3. Initialize logging based on the configuration
    ///
    /// If no configuration file is found, or it is invalid, default settings
    /// are used.
    pub fn new() -> Self {
        let config = ConfigLoader::new()
            .with_current_dir()
            .load()
            .and_then(|config| validate_config(&config).map(|()| config))
            .unwrap_or_else(|e| {
                eprintln!("Warning: Failed to load config ({e}), using defaults");
                TetherConfig::default()
            });

        Self::from_config(&config)
    }

    /// Creates a runtime builder for custom configuration.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a new runtime from configuration.
    ///
    /// Initializes logging from `config.logging` unless a subscriber is
    /// already installed. Listener failures are logged.
    pub fn from_config(config: &TetherConfig) -> Self {
        Self::with_error_sink(config, None)
    }

    fn with_error_sink(config: &TetherConfig, error_sink: Option<BoxedErrorSink>) -> Self {
        logging::init_from_config(&config.logging);

        let mut correlator = Correlator::builder()
            .maybe_default_timeout(config.correlation.default_timeout());
        if let Some(sink) = error_sink {
            correlator = correlator.boxed_error_sink(sink);
        }

        let capacity = config.correlation.event_queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);

        info!(
            log_level = %config.logging.level,
            default_timeout_ms = ?config.correlation.default_timeout_ms,
            queue_capacity = capacity,
            dispatch_concurrency = config.correlation.dispatch_concurrency,
            "Runtime initialized from configuration"
        );

        Self {
            config: config.clone(),
            correlator: correlator.build(),
            sender,
            state: Mutex::new(PumpState::Idle(receiver)),
            shutdown: CancellationToken::new(),
            counters: Arc::new(PumpCounters::default()),
        }
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    /// Returns the correlator for registering listeners and waits.
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Returns a handle for feeding events in.
    ///
    /// Events fed before [`start`](Self::start) are queued and dispatched
    /// once the pump runs.
    pub fn event_sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
            capacity: self.sender.max_capacity(),
        }
    }

    /// Returns whether the pump is currently running.
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), PumpState::Running(_))
    }

    /// Returns a snapshot of the runtime counters.
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            events_received: self.counters.received.load(Ordering::Relaxed),
            events_resolved: self.counters.resolved.load(Ordering::Relaxed),
            events_unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            registered: self.correlator.registry().len(),
            running: self.is_running(),
        }
    }

    /// Starts the event pump.
    ///
    /// Starting a running runtime is a no-op; a stopped runtime cannot be
    /// restarted.
    pub async fn start(&self) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        let receiver = match std::mem::replace(&mut *state, PumpState::Stopped) {
            PumpState::Idle(receiver) => receiver,
            running @ PumpState::Running(_) => {
                *state = running;
                warn!("Runtime is already running");
                return Ok(());
            }
            PumpState::Stopped => return Err(RuntimeError::Stopped),
        };

        info!("Starting Tether runtime");

        let pump = EventPump {
            correlator: self.correlator.clone(),
            limit: Arc::new(Semaphore::new(
                self.config.correlation.dispatch_concurrency.max(1),
            )),
            shutdown: self.shutdown.clone(),
            counters: Arc::clone(&self.counters),
        };
        *state = PumpState::Running(tokio::spawn(pump.run(receiver)));

        info!("Runtime started");
        Ok(())
    }

    /// Stops the runtime.
    ///
    /// Intake stops and queued events that were not yet dispatched are
    /// dropped. Every expectation is then removed and the correlator stops
    /// accepting new ones, so pending waits return `Cancelled`, including
    /// waits listener callbacks are blocked on. Finally in-flight dispatches
    /// and running callbacks are awaited.
    pub async fn stop(&self) -> RuntimeResult<()> {
        let pump = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, PumpState::Stopped) {
                PumpState::Running(handle) => Some(handle),
                PumpState::Idle(_) => None,
                PumpState::Stopped => {
                    warn!("Runtime is not running");
                    return Ok(());
                }
            }
        };

        info!("Stopping Tether runtime");
        self.shutdown.cancel();
        let removed = self.correlator.shutdown();

        if let Some(pump) = pump
            && let Err(e) = pump.await
        {
            error!(error = %e, "Event pump terminated abnormally");
        }

        let running = self.correlator.dispatcher().running_callbacks();
        if running > 0 {
            debug!(running, "Waiting for listener callbacks");
        }
        self.correlator.wait_for_callbacks().await;

        info!(removed, "Runtime stopped");
        Ok(())
    }

    /// Runs the runtime until a shutdown signal is received.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;

        info!("Tether runtime is now running. Press Ctrl+C to stop.");

        Self::wait_for_shutdown().await;

        self.stop().await
    }

    /// Runs the runtime until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.start().await?;

        shutdown.await;

        self.stop().await
    }

    /// Waits for shutdown signals (Ctrl+C or SIGTERM).
    async fn wait_for_shutdown() {
        #[cfg(unix)]
        {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = signal::ctrl_c() => {
                            info!("Received Ctrl+C, shutting down");
                        }
                        _ = sigterm.recv() => {
                            info!("Received SIGTERM, shutting down");
                        }
                    }
                    return;
                }
                Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
            }
        }

        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
        }
    }
}

impl Default for TetherRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TetherRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherRuntime")
            .field("correlator", &self.correlator)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for creating a `TetherRuntime` with custom configuration.
///
/// ```rust,ignore
/// let runtime = TetherRuntime::builder()
///     .config_file("config/production.toml")
///     .profile("production")
///     .error_sink(|handle, err| metrics::listener_failed(handle, err))
///     .build()?;
/// ```
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    error_sink: Option<BoxedErrorSink>,
}

impl RuntimeBuilder {
    /// Creates a new runtime builder.
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
            error_sink: None,
        }
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g., "development", "production").
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    /// Enables loading environment variables (enabled by default).
    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    /// Disables loading environment variables.
    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges additional configuration programmatically.
    pub fn merge(mut self, config: TetherConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Sets the sink for listener failures. Failures are logged otherwise.
    pub fn error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.error_sink = Some(Arc::new(sink));
        self
    }

    /// Loads and validates the configuration, then builds the runtime.
    pub fn build(self) -> RuntimeResult<TetherRuntime> {
        let config = self.config_loader.load()?;
        validate_config(&config)?;
        Ok(TetherRuntime::with_error_sink(&config, self.error_sink))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::{BoxError, Identifier, Interest, RawEvent};
    use tokio::sync::Notify;

    fn runtime(capacity: usize) -> TetherRuntime {
        let mut config = TetherConfig::default();
        config.correlation.event_queue_capacity = capacity;
        TetherRuntime::from_config(&config)
    }

    fn message(chat: i64) -> BoxedEvent {
        BoxedEvent::new(RawEvent::message(Identifier::chat(chat)))
    }

    #[tokio::test]
    async fn test_fed_events_resolve_waits() {
        let runtime = runtime(16);
        runtime.start().await.unwrap();
        assert!(runtime.is_running());

        let pending = runtime
            .correlator()
            .wait(Interest::message(Identifier::chat(3)).timeout(Duration::from_secs(5)));
        let events = runtime.event_sender();
        events.feed(message(9)).await.unwrap();
        events.feed(message(3)).await.unwrap();

        let event = pending.await.unwrap();
        assert_eq!(event.scope().chat_id(), Some(3));

        runtime.stop().await.unwrap();
        let stats = runtime.stats();
        assert_eq!(stats.events_received, 2);
        assert_eq!(stats.events_resolved, 1);
        assert_eq!(stats.events_unmatched, 1);
        assert!(!stats.running);
    }

    #[tokio::test]
    async fn test_events_fed_before_start_are_kept() {
        let runtime = runtime(16);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        runtime
            .correlator()
            .register(Interest::message(Identifier::any()), move |event| {
                let seen_tx = seen_tx.clone();
                async move {
                    seen_tx.send(event.scope().chat_id())?;
                    Ok::<(), BoxError>(())
                }
            });

        let events = runtime.event_sender();
        for chat in 1..=3 {
            events.feed(message(chat)).await.unwrap();
        }
        runtime.start().await.unwrap();

        let mut chats = Vec::new();
        for _ in 0..3 {
            chats.push(seen_rx.recv().await.unwrap());
        }
        chats.sort();
        assert_eq!(chats, vec![Some(1), Some(2), Some(3)]);
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_listener_does_not_block_other_chats() {
        let runtime = runtime(16);
        let release = Arc::new(Notify::new());
        runtime.correlator().register(Interest::message(Identifier::chat(1)), {
            let release = Arc::clone(&release);
            move |_| {
                let release = Arc::clone(&release);
                async move {
                    release.notified().await;
                    Ok::<(), BoxError>(())
                }
            }
        });
        runtime.start().await.unwrap();

        let pending = runtime
            .correlator()
            .wait(Interest::message(Identifier::chat(2)).timeout(Duration::from_secs(5)));
        let events = runtime.event_sender();
        events.feed(message(1)).await.unwrap();
        events.feed(message(2)).await.unwrap();
        assert!(pending.await.is_ok());

        release.notify_one();
        runtime.stop().await.unwrap();
    }

    /// A listener that asks a question and waits for `chat`/`user` to answer.
    ///
    /// `asked` is notified once the wait is registered; the outcome is sent
    /// on the returned channel.
    fn conversation(
        runtime: &TetherRuntime,
        user: i64,
        answer: Interest,
        asked: Arc<Notify>,
    ) -> mpsc::UnboundedReceiver<bool> {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let correlator = runtime.correlator().clone();
        runtime
            .correlator()
            .register(Interest::message(Identifier::user(user)), move |_| {
                let pending = correlator.wait(answer.clone());
                let asked = Arc::clone(&asked);
                let outcome_tx = outcome_tx.clone();
                async move {
                    asked.notify_one();
                    let outcome = pending.await;
                    outcome_tx.send(outcome.is_ok())?;
                    Ok::<(), BoxError>(())
                }
            });
        outcome_rx
    }

    fn from(chat: i64, user: i64) -> BoxedEvent {
        BoxedEvent::new(RawEvent::message(Identifier::chat(chat).with_user(user)))
    }

    #[tokio::test]
    async fn test_waiting_listener_does_not_hold_dispatch_slot() {
        let mut config = TetherConfig::default();
        config.correlation.dispatch_concurrency = 1;
        let runtime = TetherRuntime::from_config(&config);

        let asked = Arc::new(Notify::new());
        let answer = Interest::message(Identifier::chat(1).with_user(7))
            .timeout(Duration::from_millis(500));
        let mut outcomes = conversation(&runtime, 7, answer, Arc::clone(&asked));
        runtime.start().await.unwrap();

        let events = runtime.event_sender();
        events.feed(from(1, 7)).await.unwrap();
        asked.notified().await;
        events.feed(from(1, 7)).await.unwrap();

        assert_eq!(outcomes.recv().await, Some(true));
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_releases_listener_blocked_on_wait() {
        let runtime = runtime(16);
        let asked = Arc::new(Notify::new());
        let mut outcomes = conversation(
            &runtime,
            7,
            Interest::message(Identifier::chat(99)),
            Arc::clone(&asked),
        );
        runtime.start().await.unwrap();

        runtime.event_sender().feed(from(1, 7)).await.unwrap();
        asked.notified().await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), runtime.stop()).await;
        assert!(matches!(stopped, Ok(Ok(()))));
        assert_eq!(outcomes.recv().await, Some(false));
        assert_eq!(runtime.correlator().dispatcher().running_callbacks(), 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_waits_and_closes_queue() {
        let runtime = runtime(16);
        runtime.start().await.unwrap();

        let pending = runtime
            .correlator()
            .wait(Interest::callback_query(Identifier::chat(1)));
        let events = runtime.event_sender();

        runtime.stop().await.unwrap();
        assert!(pending.await.unwrap_err().is_cancelled());
        assert!(runtime.correlator().registry().is_empty());

        assert!(events.is_closed());
        assert!(matches!(
            events.feed(message(1)).await,
            Err(RuntimeError::QueueClosed)
        ));
        assert!(matches!(runtime.start().await, Err(RuntimeError::Stopped)));
        assert!(runtime.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_try_feed_reports_full_queue() {
        let runtime = runtime(1);
        let events = runtime.event_sender();

        events.try_feed(message(1)).unwrap();
        assert!(matches!(
            events.try_feed(message(2)),
            Err(RuntimeError::QueueFull { capacity: 1 })
        ));
    }

    #[tokio::test]
    async fn test_run_until() {
        let runtime = runtime(16);
        let pending = runtime
            .correlator()
            .wait(Interest::message(Identifier::chat(4)).timeout(Duration::from_secs(5)));
        let events = runtime.event_sender();

        runtime
            .run_until(async move {
                events.feed(message(4)).await.unwrap();
                assert!(pending.await.is_ok());
            })
            .await
            .unwrap();
        assert!(!runtime.is_running());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut invalid = TetherConfig::default();
        invalid.correlation.dispatch_concurrency = 0;

        let result = TetherRuntime::builder()
            .search_path(std::env::temp_dir().join("tether-no-config-here"))
            .without_env()
            .merge(invalid)
            .build();
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }
}
