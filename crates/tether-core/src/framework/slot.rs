//! One-shot completion slot.
//!
//! Every one-shot expectation owns a [`CompletionSlot`]. The slot is a tiny
//! state machine:
//!
//! ```text
//!            ┌──▶ Resolved   (dispatcher delivered an event)
//! Pending ───┼──▶ TimedOut   (the waiter's deadline elapsed)
//!            └──▶ Cancelled  (external cancel, drop, or shutdown)
//! ```
//!
//! The transition out of `Pending` is a single compare-and-swap, so exactly
//! one of the three competing parties wins. The losers observe `false` and
//! back off.
//!
//! The slot also carries the wait's deadline and cancellation token, so the
//! dispatcher can refuse to resolve a wait that expired while nobody was
//! awaiting it.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::foundation::event::BoxedEvent;

/// Observable state of a one-shot expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitState {
    /// Still registered and waiting for an event.
    Pending = 0,
    /// Completed with a matching event.
    Resolved = 1,
    /// The deadline elapsed first.
    TimedOut = 2,
    /// Cancelled before a match or timeout.
    Cancelled = 3,
}

impl WaitState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Resolved,
            2 => Self::TimedOut,
            _ => Self::Cancelled,
        }
    }

    /// Returns `true` for every state except [`WaitState::Pending`].
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// Attempt-once completion primitive shared by a waiter and the dispatcher.
pub(crate) struct CompletionSlot {
    state: AtomicU8,
    sender: Mutex<Option<oneshot::Sender<BoxedEvent>>>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    settled: CancellationToken,
}

impl CompletionSlot {
    /// Creates a pending slot and the receiver its waiter listens on.
    pub(crate) fn new(
        deadline: Option<Instant>,
        cancel: CancellationToken,
    ) -> (Self, oneshot::Receiver<BoxedEvent>) {
        let (tx, rx) = oneshot::channel();
        let slot = Self {
            state: AtomicU8::new(WaitState::Pending as u8),
            sender: Mutex::new(Some(tx)),
            deadline,
            cancel,
            settled: CancellationToken::new(),
        };
        (slot, rx)
    }

    /// Creates a slot with no deadline and its own token.
    #[cfg(test)]
    pub(crate) fn unbounded() -> (Self, oneshot::Receiver<BoxedEvent>) {
        Self::new(None, CancellationToken::new())
    }

    /// Returns the current state.
    pub(crate) fn state(&self) -> WaitState {
        WaitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the token that cancels the wait.
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Completes once the slot leaves `Pending`, whoever settled it.
    pub(crate) fn settled(&self) -> WaitForCancellationFuture<'_> {
        self.settled.cancelled()
    }

    /// Settles the slot if its token was cancelled or its deadline is not
    /// after `now`.
    ///
    /// Returns `true` if this call made the transition.
    pub(crate) fn expire(&self, now: Instant) -> bool {
        if self.cancel.is_cancelled() {
            self.cancel()
        } else if self.deadline.is_some_and(|deadline| deadline <= now) {
            self.time_out()
        } else {
            false
        }
    }

    /// Delivers `event` if the slot is still pending.
    ///
    /// Returns `false` if the slot already reached a terminal state.
    pub(crate) fn resolve(&self, event: BoxedEvent) -> bool {
        if !self.transition(WaitState::Resolved) {
            return false;
        }
        if let Some(tx) = self.sender.lock().take() {
            // The waiter may have been dropped in the meantime; the event is
            // consumed either way.
            let _ = tx.send(event);
        }
        true
    }

    /// Marks the slot as timed out if it is still pending.
    pub(crate) fn time_out(&self) -> bool {
        self.close(WaitState::TimedOut)
    }

    /// Marks the slot as cancelled if it is still pending.
    ///
    /// A waiter blocked on the receiver wakes up with a closed channel.
    pub(crate) fn cancel(&self) -> bool {
        self.close(WaitState::Cancelled)
    }

    fn close(&self, terminal: WaitState) -> bool {
        if !self.transition(terminal) {
            return false;
        }
        drop(self.sender.lock().take());
        true
    }

    fn transition(&self, terminal: WaitState) -> bool {
        let won = self
            .state
            .compare_exchange(
                WaitState::Pending as u8,
                terminal as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.settled.cancel();
        }
        won
    }
}

impl std::fmt::Debug for CompletionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSlot")
            .field("state", &self.state())
            .field("deadline", &self.deadline)
            .finish()
    }
}
