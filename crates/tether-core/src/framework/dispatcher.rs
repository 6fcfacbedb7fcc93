//! Event dispatcher for the Tether correlation core.
//!
//! The [`Dispatcher`] takes one decoded event, picks the single best matching
//! expectation from the [`Registry`] and resolves it.
//!
//! # Winner Selection
//!
//! 1. Snapshot the candidates: the event chat's bucket plus the wildcard
//!    bucket of the event kind
//! 2. Keep the candidates whose identifier matches the event scope and whose
//!    predicate (if any) accepts the event
//! 3. The highest specificity wins; among equals the earliest registration
//!    wins
//! 4. A persistent winner has its callback started in its own task. A
//!    one-shot winner has its completion slot resolved and is removed from
//!    the registry
//! 5. If a one-shot slot was already settled, or its deadline passed or its
//!    token was cancelled while nobody was awaiting it, that candidate is
//!    dropped and selection repeats over the rest
//!
//! `dispatch` returns as soon as the winner is chosen. A listener that waits
//! for a follow-up event therefore never holds up the dispatch of that event.
//!
//! ```text
//! ┌───────────┐     ┌────────────┐     ┌──────────────────┐
//! │ Transport │────▶│ Dispatcher │────▶│ listener callback│
//! └───────────┘     └─────┬──────┘  or └──────────────────┘
//!                         │  lookup    ┌──────────────────┐
//!                         └──────────▶ │  waiting caller  │
//!                                      └──────────────────┘
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, debug_span, trace};

use super::expectation::{Callback, Expectation, Resolution};
use super::registry::Registry;
use super::sink::{BoxedErrorSink, ErrorSink, TracingErrorSink};
use crate::error::CorrelationError;
use crate::foundation::event::{BoxedEvent, EventKind};

/// Routes decoded events to registered expectations.
///
/// `Dispatcher` is cheap to clone; clones share the registry, the error sink
/// and the set of running callbacks, so one dispatcher can be handed to many
/// concurrent dispatch tasks.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    error_sink: BoxedErrorSink,
    callbacks: TaskTracker,
}

impl Dispatcher {
    /// Creates a dispatcher that reports listener failures through tracing.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            error_sink: Arc::new(TracingErrorSink),
            callbacks: TaskTracker::new(),
        }
    }

    /// Replaces the error sink.
    pub fn with_error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.error_sink = Arc::new(sink);
        self
    }

    pub(crate) fn with_boxed_error_sink(mut self, sink: BoxedErrorSink) -> Self {
        self.error_sink = sink;
        self
    }

    /// Returns the registry this dispatcher reads from.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Returns the number of listener callbacks still running.
    pub fn running_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// Waits until every listener callback started so far has finished.
    pub async fn wait_for_callbacks(&self) {
        self.callbacks.close();
        self.callbacks.wait().await;
        self.callbacks.reopen();
    }

    /// Dispatches an event under its own kind.
    ///
    /// Returns `true` if an expectation was resolved.
    pub async fn dispatch(&self, event: BoxedEvent) -> bool {
        self.dispatch_as(event.kind(), event).await
    }

    /// Dispatches an event against the expectations of `kind`.
    ///
    /// An unmatched event is not an error; it is dropped and `false` is
    /// returned. A listener win counts as a resolution once its callback is
    /// started; failures of the callback go to the error sink.
    pub async fn dispatch_as(&self, kind: EventKind, event: BoxedEvent) -> bool {
        let scope = event.scope();
        let span = debug_span!("dispatch", kind = %kind, scope = %scope);

        async move {
            let mut candidates: Vec<Arc<Expectation>> = self
                .registry
                .lookup(kind, scope.chat_id())
                .into_iter()
                .filter(|candidate| candidate.accepts(&scope, &event))
                .collect();
            trace!(candidates = candidates.len(), "Collected matching candidates");

            while let Some(index) = select_winner(&candidates) {
                let winner = candidates.swap_remove(index);

                match winner.resolution() {
                    Resolution::Callback(callback) => {
                        if winner.is_retired() {
                            trace!(id = %winner.id(), "Listener removed after snapshot, skipping");
                            continue;
                        }
                        debug!(
                            listener = %winner.label(),
                            specificity = winner.specificity(),
                            "Invoking listener"
                        );
                        self.spawn_callback(&winner, Arc::clone(callback), event.clone());
                        return true;
                    }
                    Resolution::Slot(slot) => {
                        if slot.expire(Instant::now()) {
                            self.registry.remove(winner.handle());
                            debug!(
                                wait = %winner.label(),
                                state = ?slot.state(),
                                "Wait expired before it was resolved"
                            );
                            continue;
                        }
                        if slot.resolve(event.clone()) {
                            self.registry.remove(winner.handle());
                            debug!(
                                wait = %winner.label(),
                                specificity = winner.specificity(),
                                "Resolved pending wait"
                            );
                            return true;
                        }
                        trace!(
                            id = %winner.id(),
                            state = ?slot.state(),
                            "Wait already settled, trying next candidate"
                        );
                    }
                }
            }

            trace!("No expectation matched");
            false
        }
        .instrument(span)
        .await
    }

    fn spawn_callback(&self, listener: &Expectation, callback: Callback, event: BoxedEvent) {
        let handle = listener.handle();
        let label = listener.label();
        let error_sink = Arc::clone(&self.error_sink);

        self.callbacks.spawn(
            async move {
                let outcome = AssertUnwindSafe(callback(event)).catch_unwind().await;

                let reason = match outcome {
                    Ok(Ok(())) => return,
                    Ok(Err(err)) => err.to_string(),
                    Err(panic) => panic_message(panic.as_ref()),
                };

                error_sink.report(handle, CorrelationError::callback_failure(label, reason));
            }
            .in_current_span(),
        );
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("running_callbacks", &self.running_callbacks())
            .finish_non_exhaustive()
    }
}

/// Picks the index of the best candidate.
///
/// Highest specificity first, then lowest id. Ids are unique, so the result
/// is fully determined by the snapshot.
fn select_winner(candidates: &[Arc<Expectation>]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.specificity()
                .cmp(&b.specificity())
                .then_with(|| b.id().cmp(&a.id()))
        })
        .map(|(index, _)| index)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::foundation::event::RawEvent;
    use crate::foundation::identifier::Identifier;
    use crate::framework::expectation::{ExpectationHandle, Predicate, into_callback};
    use crate::framework::slot::{CompletionSlot, WaitState};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(scope: Identifier) -> BoxedEvent {
        BoxedEvent::new(RawEvent::message(scope))
    }

    /// Dispatches and lets the winning callback, if any, run to completion.
    async fn settle(dispatcher: &Dispatcher, event: BoxedEvent) -> bool {
        let resolved = dispatcher.dispatch(event).await;
        dispatcher.wait_for_callbacks().await;
        resolved
    }

    async fn settle_as(dispatcher: &Dispatcher, event: BoxedEvent) -> bool {
        let resolved = dispatcher.dispatch_as(EventKind::Message, event).await;
        dispatcher.wait_for_callbacks().await;
        resolved
    }

    fn counter(hits: &Arc<AtomicUsize>) -> Callback {
        let hits = Arc::clone(hits);
        into_callback(move |_| {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        })
    }

    fn listen(
        registry: &Registry,
        identifier: Identifier,
        hits: &Arc<AtomicUsize>,
    ) -> ExpectationHandle {
        registry.register(Expectation::persistent(
            EventKind::Message,
            identifier,
            counter(hits),
        ))
    }

    #[tokio::test]
    async fn test_more_specific_listener_wins() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let broad = Arc::new(AtomicUsize::new(0));
        let narrow = Arc::new(AtomicUsize::new(0));
        let e1 = listen(&registry, Identifier::chat(42), &broad);
        let e2 = listen(&registry, Identifier::chat(42).with_message(7), &narrow);

        assert!(
            settle(&dispatcher, message(Identifier::chat(42).with_message(7)))
                .await
        );
        assert_eq!(narrow.load(Ordering::SeqCst), 1);
        assert_eq!(broad.load(Ordering::SeqCst), 0);
        assert!(registry.contains(e1));
        assert!(registry.contains(e2));

        // The narrow listener does not match other messages of the chat.
        assert!(settle(&dispatcher, message(Identifier::chat(42))).await);
        assert_eq!(broad.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wildcard_loses_regardless_of_order() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let specific = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));
        listen(&registry, Identifier::user(3), &specific);
        listen(&registry, Identifier::any(), &wildcard);

        settle(&dispatcher, message(Identifier::chat(9).with_user(3)))
            .await;
        assert_eq!(specific.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 0);

        settle(&dispatcher, message(Identifier::chat(9))).await;
        assert_eq!(wildcard.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_equal_specificity_earliest_registration_wins() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        // Different buckets, same specificity.
        listen(&registry, Identifier::user(1), &first);
        listen(&registry, Identifier::chat(5), &second);

        for _ in 0..3 {
            settle(&dispatcher, message(Identifier::chat(5).with_user(1)))
                .await;
        }
        assert_eq!(first.load(Ordering::SeqCst), 3);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_predicate_rejection_falls_through() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let commands = Arc::new(AtomicUsize::new(0));
        let fallback = Arc::new(AtomicUsize::new(0));
        let is_command: Predicate = Arc::new(|event: &BoxedEvent| {
            event
                .downcast_ref::<RawEvent>()
                .and_then(RawEvent::text)
                .is_some_and(|text| text.starts_with('/'))
        });
        registry.register(
            Expectation::persistent(
                EventKind::Message,
                Identifier::chat(1).with_user(2),
                counter(&commands),
            )
            .with_predicate(Some(is_command)),
        );
        listen(&registry, Identifier::chat(1), &fallback);

        let text = |text: &str| {
            BoxedEvent::new(
                RawEvent::message(Identifier::chat(1).with_user(2))
                    .with_payload(serde_json::json!({ "text": text })),
            )
        };
        settle(&dispatcher, text("/start")).await;
        settle(&dispatcher, text("hello")).await;

        assert_eq!(commands.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unmatched_event_and_kind_isolation() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let hits = Arc::new(AtomicUsize::new(0));
        listen(&registry, Identifier::any(), &hits);

        let query = BoxedEvent::new(RawEvent::callback_query(Identifier::chat(1)));
        assert!(!settle(&dispatcher, query.clone()).await);
        assert!(settle_as(&dispatcher, query).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let empty = Dispatcher::new(Arc::new(Registry::new()));
        assert!(!empty.dispatch(message(Identifier::chat(1))).await);
    }

    #[tokio::test]
    async fn test_one_shot_resolves_and_is_removed() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let (slot, rx) = CompletionSlot::unbounded();
        let slot = Arc::new(slot);
        let handle = registry.register(Expectation::one_shot(
            EventKind::Message,
            Identifier::chat(5),
            Arc::clone(&slot),
        ));

        let event = message(Identifier::chat(5).with_user(8));
        assert!(settle(&dispatcher, event.clone()).await);
        assert_eq!(slot.state(), WaitState::Resolved);
        assert!(!registry.contains(handle));
        assert!(rx.await.unwrap().ptr_eq(&event));

        // Consumed: a second event finds nothing.
        assert!(!settle(&dispatcher, message(Identifier::chat(5))).await);
    }

    #[tokio::test]
    async fn test_settled_wait_yields_to_next_candidate() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let fallback = Arc::new(AtomicUsize::new(0));
        listen(&registry, Identifier::chat(5), &fallback);

        let (slot, _rx) = CompletionSlot::unbounded();
        let slot = Arc::new(slot);
        registry.register(Expectation::one_shot(
            EventKind::Message,
            Identifier::chat(5).with_message(1),
            Arc::clone(&slot),
        ));

        // The timer fired but the waiter has not removed the entry yet.
        assert!(slot.time_out());
        assert!(
            settle(&dispatcher, message(Identifier::chat(5).with_message(1)))
                .await
        );
        assert_eq!(fallback.load(Ordering::SeqCst), 1);
        assert_eq!(slot.state(), WaitState::TimedOut);
    }

    #[tokio::test]
    async fn test_callback_failures_reach_the_sink() {
        let registry = Arc::new(Registry::new());
        let reports = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(Arc::clone(&registry)).with_error_sink({
            let reports = Arc::clone(&reports);
            move |handle: ExpectationHandle, err: CorrelationError| {
                reports.lock().push((handle, err));
            }
        });

        let failing = registry.register(
            Expectation::persistent(
                EventKind::Message,
                Identifier::chat(1),
                into_callback(|_| async { Err::<(), _>("database unavailable") }),
            )
            .with_name(Some("saver".into())),
        );
        let panicking = registry.register(Expectation::persistent(
            EventKind::Message,
            Identifier::chat(2),
            into_callback(|_| async {
                if true {
                    panic!("listener exploded");
                }
                Ok::<(), BoxError>(())
            }),
        ));

        assert!(settle(&dispatcher, message(Identifier::chat(1))).await);
        assert!(settle(&dispatcher, message(Identifier::chat(2))).await);

        let reports = reports.lock();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].0, failing);
        assert_eq!(
            reports[0].1.to_string(),
            "listener 'saver' failed: database unavailable"
        );
        assert_eq!(reports[1].0, panicking);
        assert!(reports[1].1.to_string().contains("panicked: listener exploded"));

        // Listeners stay registered after failing.
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_callback_may_touch_the_registry() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let follow_ups = Arc::new(AtomicUsize::new(0));
        let handle_cell = Arc::new(Mutex::new(None));
        let handle = registry.register(Expectation::persistent(
            EventKind::Message,
            Identifier::chat(1),
            into_callback({
                let registry = Arc::clone(&registry);
                let follow_ups = Arc::clone(&follow_ups);
                let handle_cell = Arc::clone(&handle_cell);
                move |_| {
                    let registry = Arc::clone(&registry);
                    let follow_ups = Arc::clone(&follow_ups);
                    let handle_cell = Arc::clone(&handle_cell);
                    async move {
                        let own = handle_cell.lock().take();
                        if let Some(own) = own {
                            registry.remove(own);
                        }
                        listen(&registry, Identifier::chat(1), &follow_ups);
                        Ok::<(), BoxError>(())
                    }
                }
            }),
        ));
        *handle_cell.lock() = Some(handle);

        assert!(settle(&dispatcher, message(Identifier::chat(1))).await);
        assert!(!registry.contains(handle));
        assert_eq!(registry.len(), 1);

        assert!(settle(&dispatcher, message(Identifier::chat(1))).await);
        assert_eq!(follow_ups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_wait_is_not_resolved() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let fallback = Arc::new(AtomicUsize::new(0));
        listen(&registry, Identifier::chat(5), &fallback);

        // Nobody awaits these slots, so only the dispatcher can notice.
        let deadline = Instant::now() + std::time::Duration::from_millis(100);
        let (late, mut late_rx) = CompletionSlot::new(Some(deadline), Default::default());
        let late = Arc::new(late);
        let late_handle = registry.register(Expectation::one_shot(
            EventKind::Message,
            Identifier::chat(5).with_user(1),
            Arc::clone(&late),
        ));

        let token = tokio_util::sync::CancellationToken::new();
        let (cancelled, _rx) = CompletionSlot::new(None, token.clone());
        let cancelled = Arc::new(cancelled);
        let cancelled_handle = registry.register(Expectation::one_shot(
            EventKind::Message,
            Identifier::chat(5).with_user(1).with_message(3),
            Arc::clone(&cancelled),
        ));
        token.cancel();

        tokio::time::advance(std::time::Duration::from_millis(500)).await;
        assert!(
            settle(
                &dispatcher,
                message(Identifier::chat(5).with_user(1).with_message(3))
            )
            .await
        );

        assert_eq!(fallback.load(Ordering::SeqCst), 1);
        assert_eq!(late.state(), WaitState::TimedOut);
        assert_eq!(cancelled.state(), WaitState::Cancelled);
        assert!(!registry.contains(late_handle));
        assert!(!registry.contains(cancelled_handle));
        assert!(late_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_does_not_wait_for_callbacks() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let release = tokio_util::sync::CancellationToken::new();
        registry.register(Expectation::persistent(
            EventKind::Message,
            Identifier::chat(1),
            into_callback({
                let release = release.clone();
                move |_| {
                    let release = release.clone();
                    async move {
                        release.cancelled().await;
                        Ok::<(), BoxError>(())
                    }
                }
            }),
        ));

        assert!(dispatcher.dispatch(message(Identifier::chat(1))).await);
        assert!(dispatcher.dispatch(message(Identifier::chat(1))).await);
        assert_eq!(dispatcher.running_callbacks(), 2);

        release.cancel();
        dispatcher.wait_for_callbacks().await;
        assert_eq!(dispatcher.running_callbacks(), 0);
    }
}
