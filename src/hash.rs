//! Zero-sized hash builder for the store's registry collections.
//!
//! Provides `FastHashBuilder`, a zero-sized `BuildHasher` that uses foldhash
//! with a fixed seed, plus the `FastIndexMap` alias used by the listener and
//! event-handler registries. Registry keys are internally generated ids, so
//! HashDoS resistance is not needed and the deterministic seed keeps
//! iteration order reproducible across runs.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};
use indexmap::IndexMap;

/// Insertion-ordered map used by the registries and the handler table.
pub(crate) type FastIndexMap<K, V> = IndexMap<K, V, FastHashBuilder>;

/// A zero-sized BuildHasher that uses foldhash with a fixed seed.
///
/// All instances produce identical hash values, which is what the registries
/// want: entries are keyed by ids the store hands out itself, never by
/// attacker-controlled data.
///
/// # Properties
/// - Zero-sized (`size_of::<FastHashBuilder>()` == 0)
/// - Fast hashing via foldhash
/// - Deterministic (same input = same hash across all instances)
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x243f_6a88_85a3_08d3).build_hasher()
    }
}
