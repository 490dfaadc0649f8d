//! Convenience wrapper for functions that need the current state.
//!
//! A [`WithState`] applies a selector to the current state and forwards the
//! projection to a user function. Before the store is initialized,
//! [`call`](WithState::call) errors and [`call_opt`](WithState::call_opt)
//! returns `None`.

use std::sync::Arc;

use crate::dispatch::StateCell;
use crate::error::StoreError;

/// A function bound to the store's current state through a selector.
///
/// Created through [`Store::with_state`](crate::Store::with_state).
pub struct WithState<S, Sel, Ret> {
    state: Arc<StateCell<S>>,
    selector: Arc<dyn Fn(&S) -> Sel + Send + Sync>,
    func: Arc<dyn Fn(Sel) -> Ret + Send + Sync>,
}

impl<S, Sel, Ret> WithState<S, Sel, Ret>
where
    S: Send + Sync + 'static,
{
    pub(crate) fn new(
        state: Arc<StateCell<S>>,
        selector: Arc<dyn Fn(&S) -> Sel + Send + Sync>,
        func: Arc<dyn Fn(Sel) -> Ret + Send + Sync>,
    ) -> Self {
        Self {
            state,
            selector,
            func,
        }
    }

    /// Apply the function to the selected projection of the current state.
    ///
    /// Errors with [`StoreError::UninitializedStore`] before the first
    /// state exists.
    pub fn call(&self) -> Result<Ret, StoreError> {
        let state = self.state.get().ok_or(StoreError::UninitializedStore)?;
        let selected = (self.selector)(state.as_ref());
        Ok((self.func)(selected))
    }

    /// Like [`call`](Self::call), but an uninitialized store yields `None`
    /// instead of an error.
    pub fn call_opt(&self) -> Option<Ret> {
        self.call().ok()
    }
}
