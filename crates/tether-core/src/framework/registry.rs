//! Expectation registry.
//!
//! The [`Registry`] is the only shared mutable structure of the correlation
//! core. Expectations are partitioned into buckets keyed by
//! `(EventKind, chat)`; expectations without a chat scope live in the kind's
//! wildcard bucket.
//!
//! # Locking
//!
//! ```text
//! RwLock<HashMap<(kind, chat), Arc<Mutex<Vec<Expectation>>>>>
//!   │                                  │
//!   │ read: find buckets               └─ per-bucket mutex: push / remove / snapshot
//!   └ write: create or prune buckets
//! ```
//!
//! Every bucket mutation happens while the map's read lock is held, so a
//! bucket can only be pruned when no one is touching it. Mutations on
//! different buckets never contend with each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::expectation::{Expectation, ExpectationHandle, ExpectationId};
use crate::foundation::event::EventKind;
use crate::foundation::identifier::Identifier;

type BucketKey = (EventKind, Option<i64>);
type Bucket = Mutex<Vec<Arc<Expectation>>>;

/// Concurrent storage of registered expectations.
pub struct Registry {
    buckets: RwLock<HashMap<BucketKey, Arc<Bucket>>>,
    next_id: AtomicU64,
    len: AtomicUsize,
    closed: AtomicBool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            len: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Inserts an expectation and returns its handle.
    ///
    /// The expectation goes into the bucket of its chat scope, or into the
    /// wildcard bucket of its kind when the chat is unpopulated.
    ///
    /// A closed registry stores nothing: the handle is returned already
    /// retired and a one-shot expectation is cancelled on the spot.
    pub fn register(&self, mut expectation: Expectation) -> ExpectationHandle {
        let id = ExpectationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        expectation.assign_id(id);

        let handle = expectation.handle();
        let key = (handle.kind, handle.chat_id);
        let expectation = Arc::new(expectation);

        debug!(
            id = %id,
            kind = %handle.kind,
            identifier = %expectation.identifier(),
            mode = ?expectation.mode(),
            "Registering expectation"
        );

        {
            let buckets = self.buckets.read();
            if self.is_closed() {
                Self::reject(&expectation);
                return handle;
            }
            if let Some(bucket) = buckets.get(&key) {
                bucket.lock().push(expectation);
                self.len.fetch_add(1, Ordering::AcqRel);
                return handle;
            }
        }

        let mut buckets = self.buckets.write();
        if self.is_closed() {
            Self::reject(&expectation);
            return handle;
        }
        buckets.entry(key).or_default().lock().push(expectation);
        self.len.fetch_add(1, Ordering::AcqRel);
        handle
    }

    fn reject(expectation: &Expectation) {
        expectation.retire();
        expectation.cancel_wait();
        warn!(id = %expectation.id(), "Registry is closed, expectation not stored");
    }

    /// Stops accepting new expectations. Existing ones stay until removed.
    ///
    /// Registrations racing with `close` either land before a following
    /// [`drain`](Self::drain) or are rejected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns `true` once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Removes an expectation.
    ///
    /// Returns `false` if the handle was already removed; repeated removal
    /// is a no-op.
    pub fn remove(&self, handle: ExpectationHandle) -> bool {
        self.take(handle).is_some()
    }

    /// Removes an expectation and returns it.
    pub fn take(&self, handle: ExpectationHandle) -> Option<Arc<Expectation>> {
        let key = (handle.kind, handle.chat_id);

        let (removed, now_empty) = {
            let buckets = self.buckets.read();
            let bucket = buckets.get(&key)?;
            let mut entries = bucket.lock();
            let position = entries.iter().position(|e| e.id() == handle.id)?;
            let removed = entries.remove(position);
            removed.retire();
            self.len.fetch_sub(1, Ordering::AcqRel);
            (removed, entries.is_empty())
        };

        if now_empty {
            self.prune(key);
        }

        debug!(id = %handle.id, kind = %handle.kind, "Removed expectation");
        Some(removed)
    }

    fn prune(&self, key: BucketKey) {
        let mut buckets = self.buckets.write();
        if buckets.get(&key).is_some_and(|bucket| bucket.lock().is_empty()) {
            buckets.remove(&key);
            trace!(kind = %key.0, chat = ?key.1, "Pruned empty bucket");
        }
    }

    /// Returns a point-in-time snapshot of the expectations an event of
    /// `kind` in `chat` could match.
    ///
    /// The snapshot is the chat's bucket unioned with the kind's wildcard
    /// bucket, ordered by registration.
    pub fn lookup(&self, kind: EventKind, chat: Option<i64>) -> Vec<Arc<Expectation>> {
        let buckets = self.buckets.read();
        let mut snapshot = Vec::new();

        if chat.is_some()
            && let Some(bucket) = buckets.get(&(kind, chat))
        {
            snapshot.extend(bucket.lock().iter().cloned());
        }
        if let Some(bucket) = buckets.get(&(kind, None)) {
            snapshot.extend(bucket.lock().iter().cloned());
        }

        snapshot.sort_unstable_by_key(|e| e.id());
        snapshot
    }

    /// Returns every expectation of `kind` whose identifier is matched by
    /// `pattern`, ordered by registration.
    ///
    /// A wildcard pattern returns everything registered for the kind.
    pub fn matching(&self, kind: EventKind, pattern: &Identifier) -> Vec<Arc<Expectation>> {
        let buckets = self.buckets.read();
        let mut found: Vec<Arc<Expectation>> = buckets
            .iter()
            .filter(|((bucket_kind, chat), _)| {
                *bucket_kind == kind && pattern.chat_id().is_none_or(|c| *chat == Some(c))
            })
            .flat_map(|(_, bucket)| {
                bucket
                    .lock()
                    .iter()
                    .filter(|e| pattern.matches(e.identifier()))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        found.sort_unstable_by_key(|e| e.id());
        found
    }

    /// Returns the expectation behind `handle`, if still registered.
    pub fn get(&self, handle: ExpectationHandle) -> Option<Arc<Expectation>> {
        let buckets = self.buckets.read();
        let bucket = buckets.get(&(handle.kind, handle.chat_id))?;
        bucket.lock().iter().find(|e| e.id() == handle.id).cloned()
    }

    /// Returns `true` if `handle` is still registered.
    pub fn contains(&self, handle: ExpectationHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Removes and returns every expectation.
    pub fn drain(&self) -> Vec<Arc<Expectation>> {
        let mut buckets = self.buckets.write();
        let mut drained: Vec<Arc<Expectation>> = buckets
            .drain()
            .flat_map(|(_, bucket)| std::mem::take(&mut *bucket.lock()))
            .collect();
        self.len.store(0, Ordering::Release);

        for expectation in &drained {
            expectation.retire();
        }
        drained.sort_unstable_by_key(|e| e.id());
        debug!(count = drained.len(), "Drained registry");
        drained
    }

    /// Returns the number of registered expectations.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of registered expectations of `kind`.
    pub fn len_of(&self, kind: EventKind) -> usize {
        self.buckets
            .read()
            .iter()
            .filter(|((bucket_kind, _), _)| *bucket_kind == kind)
            .map(|(_, bucket)| bucket.lock().len())
            .sum()
    }

    /// Returns the number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.len())
            .field("bucket_count", &self.bucket_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::framework::expectation::{Callback, into_callback};

    fn noop() -> Callback {
        into_callback(|_| async { Ok::<(), BoxError>(()) })
    }

    fn listener(kind: EventKind, identifier: Identifier) -> Expectation {
        Expectation::persistent(kind, identifier, noop())
    }

    #[test]
    fn test_lookup_unions_chat_and_wildcard_buckets() {
        let registry = Registry::new();
        let wildcard = registry.register(listener(EventKind::Message, Identifier::any()));
        let chat = registry.register(listener(EventKind::Message, Identifier::chat(42)));
        let other_chat = registry.register(listener(EventKind::Message, Identifier::chat(43)));
        let other_kind =
            registry.register(listener(EventKind::CallbackQuery, Identifier::chat(42)));

        let ids: Vec<_> = registry
            .lookup(EventKind::Message, Some(42))
            .iter()
            .map(|e| e.id())
            .collect();
        assert_eq!(ids, vec![wildcard.id(), chat.id()]);
        assert!(!ids.contains(&other_chat.id()));
        assert!(!ids.contains(&other_kind.id()));

        // Events without a chat only see the wildcard bucket.
        let ids: Vec<_> = registry
            .lookup(EventKind::Message, None)
            .iter()
            .map(|e| e.id())
            .collect();
        assert_eq!(ids, vec![wildcard.id()]);
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.len_of(EventKind::Message), 3);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = Registry::new();
        let handle = registry.register(listener(EventKind::Message, Identifier::chat(1)));
        let keep = registry.register(listener(EventKind::Message, Identifier::chat(1)));

        assert!(registry.remove(handle));
        assert!(!registry.remove(handle));
        assert!(!registry.contains(handle));
        assert!(registry.contains(keep));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_removed_expectation_is_retired() {
        let registry = Registry::new();
        let handle = registry.register(listener(EventKind::Message, Identifier::user(5)));
        let expectation = registry.get(handle).unwrap();
        assert!(!expectation.is_retired());

        let taken = registry.take(handle).unwrap();
        assert!(Arc::ptr_eq(&taken, &expectation));
        assert!(expectation.is_retired());
    }

    #[test]
    fn test_snapshot_is_not_affected_by_later_changes() {
        let registry = Registry::new();
        let first = registry.register(listener(EventKind::Message, Identifier::chat(7)));

        let snapshot = registry.lookup(EventKind::Message, Some(7));
        registry.register(listener(EventKind::Message, Identifier::chat(7)));
        registry.remove(first);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), first.id());
        assert_eq!(registry.lookup(EventKind::Message, Some(7)).len(), 1);
    }

    #[test]
    fn test_empty_buckets_are_pruned() {
        let registry = Registry::new();
        let a = registry.register(listener(EventKind::Message, Identifier::chat(1)));
        let b = registry.register(listener(EventKind::Message, Identifier::chat(2)));
        assert_eq!(registry.bucket_count(), 2);

        registry.remove(a);
        assert_eq!(registry.bucket_count(), 1);
        registry.remove(b);
        assert_eq!(registry.bucket_count(), 0);
        assert!(registry.is_empty());

        // A pruned bucket is recreated on demand.
        let c = registry.register(listener(EventKind::Message, Identifier::chat(1)));
        assert!(registry.contains(c));
    }

    #[test]
    fn test_matching_by_pattern() {
        let registry = Registry::new();
        let chat_only = registry.register(listener(EventKind::Message, Identifier::chat(1)));
        let chat_user =
            registry.register(listener(EventKind::Message, Identifier::chat(1).with_user(2)));
        let user_only = registry.register(listener(EventKind::Message, Identifier::user(2)));
        registry.register(listener(EventKind::CallbackQuery, Identifier::chat(1)));

        let ids = |pattern: Identifier| -> Vec<_> {
            registry
                .matching(EventKind::Message, &pattern)
                .iter()
                .map(|e| e.id())
                .collect()
        };

        assert_eq!(ids(Identifier::chat(1)), vec![chat_only.id(), chat_user.id()]);
        assert_eq!(ids(Identifier::user(2)), vec![chat_user.id(), user_only.id()]);
        assert_eq!(ids(Identifier::any()).len(), 3);
        assert!(ids(Identifier::chat(9)).is_empty());
    }

    #[test]
    fn test_drain_retires_everything() {
        let registry = Registry::new();
        let a = registry.register(listener(EventKind::Message, Identifier::chat(1)));
        registry.register(listener(EventKind::CallbackQuery, Identifier::any()));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|e| e.is_retired()));
        assert!(registry.is_empty());
        assert!(!registry.remove(a));
    }

    #[test]
    fn test_closed_registry_rejects_new_expectations() {
        let registry = Registry::new();
        let kept = registry.register(listener(EventKind::Message, Identifier::chat(1)));
        registry.close();
        assert!(registry.is_closed());

        let rejected = registry.register(listener(EventKind::Message, Identifier::chat(2)));
        assert!(!registry.contains(rejected));
        assert!(registry.contains(kept));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.drain().len(), 1);
    }

    #[test]
    fn test_concurrent_register_and_remove() {
        let registry = Arc::new(Registry::new());

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let chat = (t * 1000 + i) % 5;
                        let expectation = listener(EventKind::Message, Identifier::chat(chat));
                        let handle = registry.register(expectation);
                        if i % 2 == 0 {
                            assert!(registry.remove(handle));
                        }
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(registry.len(), 8 * 100);
        assert_eq!(registry.len_of(EventKind::Message), 8 * 100);
    }
}
