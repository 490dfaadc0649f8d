//! Ordered middleware chains for actions and events.
//!
//! A middleware maps a dispatched item to a replacement item, or drops it by
//! returning `None`. Chains are applied in registration order at dispatch
//! time; the list is re-read per item, so registering or unregistering takes
//! effect on the next dispatched item, never mid-item.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Identifies a registered middleware for unregistration.
///
/// Ids are unique per chain and never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MiddlewareId(u64);

type Stage<I> = Arc<dyn Fn(I) -> Option<I> + Send + Sync>;

/// An ordered sequence of map-or-drop stages over one item type.
pub(crate) struct MiddlewareChain<I> {
    stages: RwLock<Vec<(MiddlewareId, Stage<I>)>>,
    next_id: AtomicU64,
}

impl<I> MiddlewareChain<I> {
    pub(crate) fn new() -> Self {
        Self {
            stages: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Append a stage; it applies to items dispatched from now on.
    pub(crate) fn register(
        &self,
        stage: impl Fn(I) -> Option<I> + Send + Sync + 'static,
    ) -> MiddlewareId {
        let id = MiddlewareId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.stages.write().push((id, Arc::new(stage)));
        id
    }

    /// Remove a stage; returns whether it was still registered.
    pub(crate) fn unregister(&self, id: MiddlewareId) -> bool {
        let mut stages = self.stages.write();
        let before = stages.len();
        stages.retain(|(stage_id, _)| *stage_id != id);
        stages.len() != before
    }

    /// Walk the chain. `None` means some stage dropped the item.
    ///
    /// The stage list is cloned out before any stage runs, so a stage may
    /// itself register or unregister middlewares without deadlocking.
    pub(crate) fn apply(&self, item: I) -> Option<I> {
        let stages: Vec<Stage<I>> = self
            .stages
            .read()
            .iter()
            .map(|(_, stage)| Arc::clone(stage))
            .collect();
        let mut item = item;
        for stage in stages {
            item = stage(item)?;
        }
        Some(item)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.stages.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_apply_in_registration_order() {
        let chain: MiddlewareChain<String> = MiddlewareChain::new();
        chain.register(|item: String| Some(item + "a"));
        chain.register(|item: String| Some(item + "b"));

        assert_eq!(chain.apply(String::from("x")), Some(String::from("xab")));
    }

    #[test]
    fn drop_short_circuits_the_chain() {
        let chain: MiddlewareChain<u32> = MiddlewareChain::new();
        chain.register(|n: u32| if n == 2 { None } else { Some(n) });
        chain.register(|n: u32| Some(n * 10));

        assert_eq!(chain.apply(1), Some(10));
        assert_eq!(chain.apply(2), None);
    }

    #[test]
    fn unregistered_stage_no_longer_applies() {
        let chain: MiddlewareChain<u32> = MiddlewareChain::new();
        let id = chain.register(|n: u32| Some(n + 1));

        assert_eq!(chain.apply(1), Some(2));
        assert!(chain.unregister(id));
        assert_eq!(chain.apply(1), Some(1));

        // Unregistering twice reports the absence.
        assert!(!chain.unregister(id));
    }

    #[test]
    fn register_then_unregister_leaves_chain_unchanged() {
        let chain: MiddlewareChain<u32> = MiddlewareChain::new();
        chain.register(|n: u32| Some(n * 2));

        let id = chain.register(|n: u32| Some(n + 100));
        chain.unregister(id);

        assert_eq!(chain.apply(3), Some(6));
        assert_eq!(chain.len(), 1);
    }
}
