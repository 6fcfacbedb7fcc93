//! One-shot waits.
//!
//! [`WaitGate::wait`] registers a one-shot expectation immediately and hands
//! back a [`PendingWait`]. Awaiting it suspends until exactly one of three
//! things happens:
//!
//! - the dispatcher resolves the expectation with a matching event;
//! - the timeout, measured from registration, elapses;
//! - the wait is cancelled through its [`CancellationToken`].
//!
//! Because registration happens before the first poll, a caller can register
//! its interest, trigger whatever produces the reply, and only then await:
//!
//! ```rust,ignore
//! let reply = gate.wait(
//!     Interest::message(Identifier::chat(chat_id).with_user(user_id))
//!         .timeout(Duration::from_secs(30)),
//! );
//! send_question(chat_id).await?;
//! let answer = reply.await?;
//! ```
//!
//! Dropping a `PendingWait` that has not settled cancels it and removes the
//! expectation from the registry.
//!
//! Timeout and cancellation do not depend on the caller awaiting: a watcher
//! task started at registration settles the wait and removes it, and the
//! dispatcher refuses to resolve a wait whose deadline has passed or whose
//! token was cancelled.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::runtime::Handle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::expectation::{Callback, Expectation, ExpectationHandle, Predicate};
use super::registry::Registry;
use super::slot::{CompletionSlot, WaitState};
use crate::error::{CorrelationError, CorrelationResult};
use crate::foundation::event::{BoxedEvent, Event, EventKind};
use crate::foundation::identifier::Identifier;

// ============================================================================
// Interest
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
enum TimeoutSetting {
    #[default]
    Default,
    After(Duration),
    Never,
}

/// Describes which events an expectation is interested in.
///
/// The same description is used for persistent listeners and one-shot waits.
/// Timeout and cancellation settings only apply to waits.
///
/// ```rust,ignore
/// let interest = Interest::callback_query(Identifier::chat(42).with_message(100))
///     .filter_as(|query: &RawEvent| query.payload()["data"] == "confirm")
///     .name("confirm-button")
///     .timeout(Duration::from_secs(60));
/// ```
#[derive(Clone)]
pub struct Interest {
    kind: EventKind,
    identifier: Identifier,
    predicate: Option<Predicate>,
    name: Option<String>,
    timeout: TimeoutSetting,
    cancel: Option<CancellationToken>,
}

impl Interest {
    /// Creates an interest in events of `kind` matched by `identifier`.
    pub fn new(kind: EventKind, identifier: Identifier) -> Self {
        Self {
            kind,
            identifier,
            predicate: None,
            name: None,
            timeout: TimeoutSetting::Default,
            cancel: None,
        }
    }

    /// Creates an interest in messages.
    pub fn message(identifier: Identifier) -> Self {
        Self::new(EventKind::Message, identifier)
    }

    /// Creates an interest in callback queries.
    pub fn callback_query(identifier: Identifier) -> Self {
        Self::new(EventKind::CallbackQuery, identifier)
    }

    /// Adds a predicate. Several predicates must all accept the event.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BoxedEvent) -> bool + Send + Sync + 'static,
    {
        let next: Predicate = Arc::new(predicate);
        let combined: Predicate = match self.predicate.take() {
            Some(previous) => {
                Arc::new(move |event: &BoxedEvent| previous(event) && next(event))
            }
            None => next,
        };
        self.predicate = Some(combined);
        self
    }

    /// Adds a predicate over a concrete event type.
    ///
    /// Events of any other type are rejected.
    pub fn filter_as<E, F>(self, predicate: F) -> Self
    where
        E: Event,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.filter(move |event: &BoxedEvent| {
            event.downcast_ref::<E>().is_some_and(&predicate)
        })
    }

    /// Sets a name shown in logs and error reports.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the wait timeout, overriding the gate's default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = TimeoutSetting::After(timeout);
        self
    }

    /// Waits without a deadline, even if the gate has a default timeout.
    pub fn no_timeout(mut self) -> Self {
        self.timeout = TimeoutSetting::Never;
        self
    }

    /// Cancels the wait when `token` is cancelled.
    ///
    /// The wait listens on a child of `token`, so cancelling one wait never
    /// cancels the others sharing the token.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Returns the event kind.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Returns the identifier pattern.
    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Builds a persistent expectation from this interest.
    pub(crate) fn into_listener(self, callback: Callback) -> Expectation {
        Expectation::persistent(self.kind, self.identifier, callback)
            .with_predicate(self.predicate)
            .with_name(self.name)
    }
}

impl std::fmt::Debug for Interest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interest")
            .field("kind", &self.kind)
            .field("identifier", &self.identifier)
            .field("has_predicate", &self.predicate.is_some())
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ============================================================================
// Wait Gate
// ============================================================================

/// Creates one-shot waits on a registry.
#[derive(Debug, Clone)]
pub struct WaitGate {
    registry: Arc<Registry>,
    default_timeout: Option<Duration>,
}

impl WaitGate {
    /// Creates a gate whose waits have no deadline unless they set one.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            default_timeout: None,
        }
    }

    /// Sets the timeout used by interests that do not specify one.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Returns the default timeout.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Registers a one-shot expectation and returns the pending wait.
    ///
    /// The expectation is in the registry when this returns; the deadline
    /// starts counting now, not on the first poll.
    pub fn wait(&self, interest: Interest) -> PendingWait {
        let timeout = match interest.timeout {
            TimeoutSetting::Default => self.default_timeout,
            TimeoutSetting::After(timeout) => Some(timeout),
            TimeoutSetting::Never => None,
        };
        let token = interest
            .cancel
            .map(|parent| parent.child_token())
            .unwrap_or_default();
        let kind = interest.kind;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let (slot, receiver) = CompletionSlot::new(deadline, token);
        let slot = Arc::new(slot);
        let expectation = Expectation::one_shot(kind, interest.identifier, Arc::clone(&slot))
            .with_predicate(interest.predicate)
            .with_name(interest.name);
        let handle = self.registry.register(expectation);

        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(watch_expiry(
                    Arc::clone(&self.registry),
                    handle,
                    Arc::clone(&slot),
                ));
            }
            Err(_) => debug!(id = %handle.id(), "No runtime, expiry is checked on dispatch"),
        }

        PendingWait {
            guard: WaitGuard {
                registry: Arc::clone(&self.registry),
                handle,
                slot,
            },
            receiver,
            kind,
            timeout,
        }
    }
}

/// Settles a wait when its deadline passes or its token is cancelled, whether
/// or not anyone is awaiting it. Exits as soon as the slot settles otherwise.
async fn watch_expiry(
    registry: Arc<Registry>,
    handle: ExpectationHandle,
    slot: Arc<CompletionSlot>,
) {
    let expired = async {
        match slot.deadline() {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };

    let settled = tokio::select! {
        _ = slot.settled() => false,
        _ = slot.cancel_token().cancelled() => slot.cancel(),
        _ = expired => slot.time_out(),
    };

    if settled {
        registry.remove(handle);
        debug!(id = %handle.id(), state = ?slot.state(), "Wait expired");
    }
}

// ============================================================================
// Pending Wait
// ============================================================================

/// A registered one-shot wait.
///
/// Await it (it implements [`IntoFuture`]) to get the matched event or a
/// [`CorrelationError::Timeout`] / [`CorrelationError::Cancelled`].
#[must_use = "a pending wait is cancelled when dropped"]
pub struct PendingWait {
    guard: WaitGuard,
    receiver: oneshot::Receiver<BoxedEvent>,
    kind: EventKind,
    timeout: Option<Duration>,
}

impl PendingWait {
    /// Returns the handle of the underlying expectation.
    pub fn handle(&self) -> ExpectationHandle {
        self.guard.handle
    }

    /// Returns the token that cancels this wait.
    pub fn cancel_token(&self) -> CancellationToken {
        self.guard.slot.cancel_token().clone()
    }

    /// Cancels the wait. It is removed at once; awaiting it gives `Cancelled`.
    pub fn cancel(&self) {
        self.guard.slot.cancel_token().cancel();
        if self.guard.slot.cancel() {
            self.guard.release();
        }
    }

    /// Returns the current state of the wait.
    pub fn state(&self) -> WaitState {
        self.guard.slot.state()
    }

    /// Returns the deadline, if the wait has one.
    pub fn deadline(&self) -> Option<Instant> {
        self.guard.slot.deadline()
    }

    async fn outcome(self) -> CorrelationResult<BoxedEvent> {
        let Self {
            guard,
            mut receiver,
            kind,
            timeout,
        } = self;

        let slot = Arc::clone(&guard.slot);
        let expired = async {
            match slot.deadline() {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            received = &mut receiver => return guard.settle(received, kind, timeout),
            _ = slot.cancel_token().cancelled() => {
                if guard.slot.cancel() {
                    guard.release();
                    debug!(id = %guard.handle.id(), kind = %kind, "Wait cancelled");
                    return Err(CorrelationError::Cancelled { kind });
                }
            }
            _ = expired => {
                if guard.slot.time_out() {
                    guard.release();
                    debug!(id = %guard.handle.id(), kind = %kind, "Wait timed out");
                    return Err(CorrelationError::Timeout {
                        kind,
                        timeout: timeout.unwrap_or_default(),
                    });
                }
            }
        }

        // Someone else settled the slot first; the receiver tells how.
        let received = receiver.await;
        guard.settle(received, kind, timeout)
    }
}

impl IntoFuture for PendingWait {
    type Output = CorrelationResult<BoxedEvent>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.outcome().boxed()
    }
}

impl std::fmt::Debug for PendingWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingWait")
            .field("handle", &self.guard.handle)
            .field("state", &self.state())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Owns the registry entry of a wait and cancels it on drop.
struct WaitGuard {
    registry: Arc<Registry>,
    handle: ExpectationHandle,
    slot: Arc<CompletionSlot>,
}

impl WaitGuard {
    fn release(&self) {
        self.registry.remove(self.handle);
    }

    fn settle(
        &self,
        received: Result<BoxedEvent, oneshot::error::RecvError>,
        kind: EventKind,
        timeout: Option<Duration>,
    ) -> CorrelationResult<BoxedEvent> {
        // Whoever settled the slot normally removes the entry too.
        self.release();
        match received {
            Ok(event) => Ok(event),
            Err(_) => match self.slot.state() {
                WaitState::TimedOut => Err(CorrelationError::Timeout {
                    kind,
                    timeout: timeout.unwrap_or_default(),
                }),
                _ => Err(CorrelationError::Cancelled { kind }),
            },
        }
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.slot.cancel() {
            self.release();
            debug!(id = %self.handle.id(), "Pending wait dropped");
        }
    }
}
