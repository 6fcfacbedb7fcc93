//! Expectations - registered interest in a future event.
//!
//! An [`Expectation`] couples an [`Identifier`] pattern and an optional
//! predicate with a resolution target:
//!
//! - **Persistent** expectations carry a callback that is invoked for every
//!   event they win, until they are removed.
//! - **One-shot** expectations carry a [`CompletionSlot`] that is completed
//!   at most once and then removed.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;

use super::slot::{CompletionSlot, WaitState};
use crate::error::BoxError;
use crate::foundation::event::{BoxedEvent, EventKind};
use crate::foundation::identifier::Identifier;

/// A type-erased event filter.
pub type Predicate = Arc<dyn Fn(&BoxedEvent) -> bool + Send + Sync>;

/// A type-erased persistent listener callback.
pub type Callback =
    Arc<dyn Fn(BoxedEvent) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Wraps an async closure into a [`Callback`].
///
/// Any error type convertible into [`BoxError`] is accepted, including
/// `anyhow::Error`, `String` and `std::convert::Infallible`.
pub fn into_callback<F, Fut, E>(f: F) -> Callback
where
    F: Fn(BoxedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    Arc::new(move |event| f(event).map(|result| result.map_err(Into::into)).boxed())
}

// ============================================================================
// Identity
// ============================================================================

/// Registry-assigned identifier of an expectation.
///
/// Ids increase monotonically across the whole registry, so they double as
/// the registration order used to break specificity ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExpectationId(pub(crate) u64);

impl ExpectationId {
    /// Returns the raw id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExpectationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle returned on registration, used for later removal.
///
/// The handle records which registry bucket holds the expectation so removal
/// never has to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExpectationHandle {
    pub(crate) id: ExpectationId,
    pub(crate) kind: EventKind,
    pub(crate) chat_id: Option<i64>,
}

impl ExpectationHandle {
    /// Returns the expectation id.
    pub fn id(&self) -> ExpectationId {
        self.id
    }

    /// Returns the event kind the expectation listens for.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Returns the chat bucket, or `None` for the wildcard bucket.
    pub fn chat_id(&self) -> Option<i64> {
        self.chat_id
    }
}

// ============================================================================
// Expectation
// ============================================================================

/// How an expectation behaves once it wins an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Invoked for every won event until removed.
    Persistent,
    /// Completed once, then removed.
    OneShot,
}

#[derive(Clone)]
pub(crate) enum Resolution {
    Callback(Callback),
    Slot(Arc<CompletionSlot>),
}

/// A registered interest in events of one kind.
pub struct Expectation {
    id: ExpectationId,
    kind: EventKind,
    identifier: Identifier,
    predicate: Option<Predicate>,
    resolution: Resolution,
    name: Option<String>,
    retired: AtomicBool,
}

impl Expectation {
    /// Creates a persistent expectation that invokes `callback` on every win.
    pub fn persistent(kind: EventKind, identifier: Identifier, callback: Callback) -> Self {
        Self::with_resolution(kind, identifier, Resolution::Callback(callback))
    }

    pub(crate) fn one_shot(
        kind: EventKind,
        identifier: Identifier,
        slot: Arc<CompletionSlot>,
    ) -> Self {
        Self::with_resolution(kind, identifier, Resolution::Slot(slot))
    }

    fn with_resolution(kind: EventKind, identifier: Identifier, resolution: Resolution) -> Self {
        Self {
            id: ExpectationId(0),
            kind,
            identifier,
            predicate: None,
            resolution,
            name: None,
            retired: AtomicBool::new(false),
        }
    }

    /// Sets the predicate filter.
    pub fn with_predicate(mut self, predicate: Option<Predicate>) -> Self {
        self.predicate = predicate;
        self
    }

    /// Sets a diagnostic name.
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub(crate) fn assign_id(&mut self, id: ExpectationId) {
        self.id = id;
    }

    /// Returns the registry-assigned id.
    pub fn id(&self) -> ExpectationId {
        self.id
    }

    /// Returns the handle for this expectation.
    pub fn handle(&self) -> ExpectationHandle {
        ExpectationHandle {
            id: self.id,
            kind: self.kind,
            chat_id: self.identifier.chat_id(),
        }
    }

    /// Returns the event kind.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Returns the identifier pattern.
    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Returns the specificity of the identifier pattern.
    pub fn specificity(&self) -> usize {
        self.identifier.specificity()
    }

    /// Returns the diagnostic name, if set.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the name, or the id when unnamed.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.id.to_string(),
        }
    }

    /// Returns the resolution mode.
    pub fn mode(&self) -> Mode {
        match self.resolution {
            Resolution::Callback(_) => Mode::Persistent,
            Resolution::Slot(_) => Mode::OneShot,
        }
    }

    /// Returns the state of a one-shot expectation, `None` for persistent ones.
    pub fn wait_state(&self) -> Option<WaitState> {
        match &self.resolution {
            Resolution::Slot(slot) => Some(slot.state()),
            Resolution::Callback(_) => None,
        }
    }

    pub(crate) fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    /// Returns `true` if the pattern matches `scope` and the predicate, if
    /// any, accepts `event`.
    pub fn accepts(&self, scope: &Identifier, event: &BoxedEvent) -> bool {
        self.identifier.matches(scope)
            && self
                .predicate
                .as_ref()
                .is_none_or(|check| check(event))
    }

    /// Returns `true` once the expectation has been removed from the registry.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Cancels a pending one-shot so its waiter wakes with `Cancelled`.
    ///
    /// Returns `false` for persistent expectations and settled one-shots.
    pub(crate) fn cancel_wait(&self) -> bool {
        match &self.resolution {
            Resolution::Slot(slot) => slot.cancel(),
            Resolution::Callback(_) => false,
        }
    }
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("identifier", &self.identifier)
            .field("mode", &self.mode())
            .field("has_predicate", &self.predicate.is_some())
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::event::RawEvent;

    fn noop() -> Callback {
        into_callback(|_| async { Ok::<(), BoxError>(()) })
    }

    #[test]
    fn test_accepts_checks_identifier_then_predicate() {
        let predicate: Predicate = Arc::new(|event: &BoxedEvent| {
            event
                .downcast_ref::<RawEvent>()
                .and_then(RawEvent::text)
                .is_some_and(|text| text.starts_with('/'))
        });
        let expectation =
            Expectation::persistent(EventKind::Message, Identifier::chat(1), noop())
                .with_predicate(Some(predicate));

        let text = |chat: i64, text: &str| {
            BoxedEvent::new(
                RawEvent::message(Identifier::chat(chat))
                    .with_payload(serde_json::json!({ "text": text })),
            )
        };
        let command = text(1, "/start");
        let chatter = text(1, "hi");
        let elsewhere = text(2, "/start");

        assert!(expectation.accepts(&command.scope(), &command));
        assert!(!expectation.accepts(&chatter.scope(), &chatter));
        assert!(!expectation.accepts(&elsewhere.scope(), &elsewhere));
    }

    #[test]
    fn test_mode_and_label() {
        let mut persistent =
            Expectation::persistent(EventKind::Message, Identifier::any(), noop());
        persistent.assign_id(ExpectationId(3));
        assert_eq!(persistent.mode(), Mode::Persistent);
        assert_eq!(persistent.label(), "#3");
        assert!(persistent.wait_state().is_none());
        assert!(!persistent.cancel_wait());

        let (slot, _rx) = CompletionSlot::unbounded();
        let one_shot =
            Expectation::one_shot(EventKind::CallbackQuery, Identifier::chat(9), Arc::new(slot))
                .with_name(Some("confirm".into()));
        assert_eq!(one_shot.mode(), Mode::OneShot);
        assert_eq!(one_shot.label(), "confirm");
        assert_eq!(one_shot.wait_state(), Some(WaitState::Pending));
        assert_eq!(one_shot.handle().chat_id(), Some(9));
        assert!(one_shot.cancel_wait());
        assert_eq!(one_shot.wait_state(), Some(WaitState::Cancelled));
    }
}
