//! Listener and handler registry with strong or weak holding.
//!
//! A [`Registry`] stores callbacks in insertion order, either strongly
//! (`Arc`) or weakly (`Weak`). Notification passes snapshot the live
//! entries before iterating, so subscribing, unsubscribing, and weak-entry
//! collection are all safe while a pass is in flight. Dead weak entries are
//! pruned the moment they are observed.
//!
//! Weakness is modeled explicitly: the registry stores either a strong
//! holder or a `Weak` that the caller keeps alive through their own `Arc`.
//! There are no finalizers; pruning happens on the next snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::hash::FastIndexMap;
use crate::types::{EventHandler, EventTag};

/// Strong-or-weak reference to a callback.
pub(crate) enum Holder<T: ?Sized> {
    /// The registry keeps the callback alive.
    Strong(Arc<T>),
    /// The caller keeps the callback alive; the registry only observes it.
    Weak(Weak<T>),
}

impl<T: ?Sized> Clone for Holder<T> {
    fn clone(&self) -> Self {
        match self {
            Holder::Strong(arc) => Holder::Strong(Arc::clone(arc)),
            Holder::Weak(weak) => Holder::Weak(Weak::clone(weak)),
        }
    }
}

impl<T: ?Sized> Holder<T> {
    /// Upgrade to a callable reference; `None` when a weak target is gone.
    pub(crate) fn resolve(&self) -> Option<Arc<T>> {
        match self {
            Holder::Strong(arc) => Some(Arc::clone(arc)),
            Holder::Weak(weak) => weak.upgrade(),
        }
    }
}

/// Insertion-ordered callback registry.
///
/// Entries are keyed by a monotonic id so removal is unambiguous even after
/// other entries come and go; ids are never reused.
pub(crate) struct Registry<T: ?Sized> {
    slots: RwLock<FastIndexMap<u64, Holder<T>>>,
    next_id: AtomicU64,
}

impl<T: ?Sized> Registry<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(FastIndexMap::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Add an entry and return its id.
    pub(crate) fn insert(&self, holder: Holder<T>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.write().insert(id, holder);
        id
    }

    /// Remove an entry; returns whether it was still present.
    ///
    /// `shift_remove` keeps the remaining entries in insertion order.
    pub(crate) fn remove(&self, id: u64) -> bool {
        self.slots.write().shift_remove(&id).is_some()
    }

    /// Drop all entries.
    pub(crate) fn clear(&self) {
        self.slots.write().clear();
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Snapshot the live callbacks in insertion order.
    ///
    /// Dead weak entries are pruned silently. Callers that must stop at a
    /// dead entry instead of skipping it use [`entries`](Self::entries).
    pub(crate) fn snapshot(&self) -> SmallVec<[Arc<T>; 4]> {
        let mut live: SmallVec<[Arc<T>; 4]> = SmallVec::new();
        let mut dead: SmallVec<[u64; 2]> = SmallVec::new();
        {
            let slots = self.slots.read();
            for (id, holder) in slots.iter() {
                match holder.resolve() {
                    Some(callback) => live.push(callback),
                    None => dead.push(*id),
                }
            }
        }
        if !dead.is_empty() {
            let mut slots = self.slots.write();
            for id in dead {
                slots.shift_remove(&id);
            }
        }
        live
    }

    /// Snapshot the raw entries with their ids, in insertion order.
    ///
    /// Resolution is left to the caller: the listener-notification path
    /// aborts at the first dead entry it encounters, and the worker pool
    /// dereferences weak handlers at dequeue time.
    pub(crate) fn entries(&self) -> SmallVec<[(u64, Holder<T>); 4]> {
        self.slots
            .read()
            .iter()
            .map(|(id, holder)| (*id, holder.clone()))
            .collect()
    }
}

/// Handle returned by the subscribe operations.
///
/// Detaches the callback when [`unsubscribe`](Subscription::unsubscribe) is
/// called; calling it again is a no-op. Dropping the handle does *not*
/// unsubscribe — the subscription lives until explicitly cancelled or until
/// the store cleans up.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// Detach the callback. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel();
        }
    }

    /// Whether the subscription is still attached.
    pub fn is_active(&self) -> bool {
        self.cancel.lock().is_some()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Record returned by the event-subscribe operations.
///
/// Besides the [`Subscription`], it retains a strong reference to the
/// handler: holding the record pins a weakly registered handler alive.
pub struct EventSubscription<E: EventTag> {
    subscription: Subscription,
    handler: Arc<dyn EventHandler<E>>,
}

impl<E: EventTag> EventSubscription<E> {
    pub(crate) fn new(subscription: Subscription, handler: Arc<dyn EventHandler<E>>) -> Self {
        Self {
            subscription,
            handler,
        }
    }

    /// Detach the handler. Idempotent.
    pub fn unsubscribe(&self) {
        self.subscription.unsubscribe();
    }

    /// Whether the handler is still registered.
    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// The pinned handler.
    pub fn handler(&self) -> &Arc<dyn EventHandler<E>> {
        &self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Callback = dyn Fn() + Send + Sync;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> Arc<Callback> {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn snapshot_returns_entries_in_insertion_order() {
        let registry: Registry<dyn Fn() -> u32 + Send + Sync> = Registry::new();
        registry.insert(Holder::Strong(Arc::new(|| 1)));
        registry.insert(Holder::Strong(Arc::new(|| 2)));
        registry.insert(Holder::Strong(Arc::new(|| 3)));

        let live = registry.snapshot();
        let values: Vec<u32> = live.iter().map(|f| f()).collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn snapshot_prunes_dead_weak_entries_silently() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry: Registry<Callback> = Registry::new();

        let strong = counting_callback(&counter);
        let short_lived = counting_callback(&counter);
        registry.insert(Holder::Strong(Arc::clone(&strong)));
        registry.insert(Holder::Weak(Arc::downgrade(&short_lived)));
        drop(short_lived);

        let live = registry.snapshot();
        assert_eq!(live.len(), 1);

        // The dead entry was pruned: the next pass no longer sees it.
        let live = registry.snapshot();
        assert_eq!(live.len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn entries_expose_dead_holders_at_their_position() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry: Registry<Callback> = Registry::new();

        let first = counting_callback(&counter);
        let short_lived = counting_callback(&counter);
        let last = counting_callback(&counter);
        registry.insert(Holder::Strong(Arc::clone(&first)));
        registry.insert(Holder::Weak(Arc::downgrade(&short_lived)));
        registry.insert(Holder::Strong(Arc::clone(&last)));
        drop(short_lived);

        // `entries` does not prune: the dead holder is observable in the
        // middle of the pass, with its id available for targeted removal.
        let entries = registry.entries();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].1.resolve().is_some());
        assert!(entries[1].1.resolve().is_none());
        assert!(entries[2].1.resolve().is_some());

        assert!(registry.remove(entries[1].0));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn live_weak_entries_resolve() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry: Registry<Callback> = Registry::new();

        let callback = counting_callback(&counter);
        registry.insert(Holder::Weak(Arc::downgrade(&callback)));

        let live = registry.snapshot();
        assert_eq!(live.len(), 1);
        live[0]();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn removal_during_iteration_does_not_disturb_snapshot() {
        let registry: Arc<Registry<Callback>> = Arc::new(Registry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let victim_id = Arc::new(Mutex::new(None::<u64>));

        // First entry removes the second mid-pass. The pass iterates a
        // snapshot taken up front, so the second entry still runs once.
        let reg = Arc::clone(&registry);
        let victim = Arc::clone(&victim_id);
        registry.insert(Holder::Strong(Arc::new(move || {
            if let Some(id) = *victim.lock() {
                reg.remove(id);
            }
        })));
        let id = registry.insert(Holder::Strong(counting_callback(&hits)));
        *victim_id.lock() = Some(id);

        let live = registry.snapshot();
        for callback in live {
            callback();
        }
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(registry.len(), 1);

        // The next pass no longer sees the removed entry.
        let live = registry.snapshot();
        for callback in live {
            callback();
        }
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn subscription_unsubscribe_is_idempotent() {
        let registry: Arc<Registry<Callback>> = Arc::new(Registry::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let id = registry.insert(Holder::Strong(counting_callback(&counter)));

        let reg = Arc::clone(&registry);
        let subscription = Subscription::new(move || {
            reg.remove(id);
        });

        assert!(subscription.is_active());
        subscription.unsubscribe();
        assert!(!subscription.is_active());
        assert!(registry.is_empty());

        // Second call is a no-op, not an error.
        subscription.unsubscribe();
        assert!(registry.is_empty());
    }
}
