//! Derived values over the store state: autoruns and views.
//!
//! An autorun wraps a user function (`body`) behind a selector and an
//! optional comparator. On every relevant check it evaluates the selector
//! and comparator against the current state; when the comparator output
//! differs from the remembered one, the autorun is due to run. The body
//! only executes on [`call`](Autorun::call) (or automatically for reactive
//! autoruns), and its latest result is memoized.
//!
//! # How a check works
//! 1. Absent state: defer, nothing is due.
//! 2. Selector returns `None` (partial selector on a not-yet-populated
//!    state): defer.
//! 3. Comparator output differs from the remembered output: mark due.
//! 4. Remember both outputs regardless.
//!
//! A *view* is an autorun created with `initial_call = false` and
//! `reactive = false`: purely lazy, change-detected memoization.
//!
//! # Asynchronous bodies
//! Bodies returning futures come in two flavors, built by the store:
//! await-once caching (the latest value is an `Arc<OnceTask<T>>`; an
//! unresolved predecessor is cancelled on replacement) and fire-and-forget
//! scheduling through the task creator.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::dispatch::StateCell;
use crate::registry::{Holder, Registry, Subscription};

/// Selector/comparator as stored by the autorun: `None` output defers.
pub(crate) type SelectFn<S, Out> = Arc<dyn Fn(&S) -> Option<Out> + Send + Sync>;

/// Autorun body.
pub(crate) type BodyFn<Sel, Ret> = Arc<dyn Fn(&Sel) -> Ret + Send + Sync>;

/// Subscriber callbacks as stored in the autorun's registry.
type SubscriberFn<Ret> = dyn Fn(&Ret) + Send + Sync;

/// Configuration for [`Store::autorun`](crate::Store::autorun) and friends.
///
/// Defaults: no default value, `initial_call`, `reactive`, `memoization`,
/// and `subscribers_initial_run` all enabled.
pub struct AutorunOptions<Ret> {
    pub(crate) default_value: Option<Ret>,
    pub(crate) initial_call: bool,
    pub(crate) reactive: bool,
    pub(crate) memoization: bool,
    pub(crate) subscribers_initial_run: bool,
}

impl<Ret> Default for AutorunOptions<Ret> {
    fn default() -> Self {
        Self {
            default_value: None,
            initial_call: true,
            reactive: true,
            memoization: true,
            subscribers_initial_run: true,
        }
    }
}

impl<Ret> AutorunOptions<Ret> {
    /// Equivalent to `Default::default()`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value reported before the first successful body run.
    pub fn default_value(mut self, value: Ret) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Run the body once at creation when the state is already populated.
    ///
    /// Default: `true`.
    pub fn initial_call(mut self, initial_call: bool) -> Self {
        self.initial_call = initial_call;
        self
    }

    /// Subscribe to the store and re-run the body on relevant changes.
    ///
    /// Default: `true`.
    pub fn reactive(mut self, reactive: bool) -> Self {
        self.reactive = reactive;
        self
    }

    /// When disabled, every [`call`](Autorun::call) re-runs the body.
    ///
    /// Default: `true`.
    pub fn memoization(mut self, memoization: bool) -> Self {
        self.memoization = memoization;
        self
    }

    /// Default for `subscribe`: invoke a new subscriber once immediately
    /// with the current value.
    ///
    /// Default: `true`.
    pub fn subscribers_initial_run(mut self, initial_run: bool) -> Self {
        self.subscribers_initial_run = initial_run;
        self
    }
}

/// Configuration for [`Store::view`](crate::Store::view): the lazy subset
/// of the autorun options.
pub struct ViewOptions<Ret> {
    pub(crate) default_value: Option<Ret>,
    pub(crate) memoization: bool,
    pub(crate) subscribers_initial_run: bool,
}

impl<Ret> Default for ViewOptions<Ret> {
    fn default() -> Self {
        Self {
            default_value: None,
            memoization: true,
            subscribers_initial_run: true,
        }
    }
}

impl<Ret> ViewOptions<Ret> {
    /// Equivalent to `Default::default()`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value reported before the first body run.
    pub fn default_value(mut self, value: Ret) -> Self {
        self.default_value = Some(value);
        self
    }

    /// When disabled, every call re-runs the body.
    pub fn memoization(mut self, memoization: bool) -> Self {
        self.memoization = memoization;
        self
    }

    /// Default for `subscribe`: invoke a new subscriber once immediately.
    pub fn subscribers_initial_run(mut self, initial_run: bool) -> Self {
        self.subscribers_initial_run = initial_run;
        self
    }

    pub(crate) fn into_autorun_options(self) -> AutorunOptions<Ret> {
        AutorunOptions {
            default_value: self.default_value,
            initial_call: false,
            reactive: false,
            memoization: self.memoization,
            subscribers_initial_run: self.subscribers_initial_run,
        }
    }
}

struct Memo<Sel, Cmp, Ret> {
    last_selector: Option<Sel>,
    last_comparator: Option<Cmp>,
    should_run: bool,
    latest: Option<Ret>,
}

/// A memoized derivation over the store state.
///
/// Created through [`Store::autorun`](crate::Store::autorun),
/// [`Store::view`](crate::Store::view), and their variants.
pub struct Autorun<S, Sel, Cmp, Ret> {
    state: Arc<StateCell<S>>,
    selector: SelectFn<S, Sel>,
    comparator: SelectFn<S, Cmp>,
    body: BodyFn<Sel, Ret>,
    memoization: bool,
    subscribers_initial_run: bool,
    memo: Mutex<Memo<Sel, Cmp, Ret>>,
    subscribers: Arc<Registry<SubscriberFn<Ret>>>,
    /// The reactive store subscription, if any; detached on drop.
    store_subscription: Mutex<Option<Subscription>>,
}

/// A purely lazy autorun: no initial call, no reactivity.
pub type View<S, Sel, Ret> = Autorun<S, Sel, Sel, Ret>;

impl<S, Sel, Cmp, Ret> Autorun<S, Sel, Cmp, Ret>
where
    S: Send + Sync + 'static,
    Sel: Clone + Send + 'static,
    Cmp: Clone + PartialEq + Send + 'static,
    Ret: Clone + PartialEq + Send + 'static,
{
    /// Build the autorun, prime its memo against the current state, and run
    /// the body once if due and `initial_call` is set. Reactive wiring is
    /// the store's job; see [`attach_store_subscription`].
    ///
    /// [`attach_store_subscription`]: Autorun::attach_store_subscription
    pub(crate) fn create(
        state: Arc<StateCell<S>>,
        selector: SelectFn<S, Sel>,
        comparator: SelectFn<S, Cmp>,
        body: BodyFn<Sel, Ret>,
        options: AutorunOptions<Ret>,
    ) -> Arc<Self> {
        let autorun = Arc::new(Self {
            state,
            selector,
            comparator,
            body,
            memoization: options.memoization,
            subscribers_initial_run: options.subscribers_initial_run,
            memo: Mutex::new(Memo {
                last_selector: None,
                last_comparator: None,
                should_run: false,
                latest: options.default_value,
            }),
            subscribers: Arc::new(Registry::new()),
            store_subscription: Mutex::new(None),
        });

        if autorun.check_current() && options.initial_call {
            autorun.clear_should_run();
            autorun.run_body();
        }
        autorun
    }

    /// Evaluate selector and comparator against `state`, updating the memo.
    /// Returns whether the autorun is due to run.
    fn check(&self, state: Option<&S>) -> bool {
        let Some(state) = state else {
            return false;
        };
        let Some(selected) = (self.selector)(state) else {
            return false;
        };
        let Some(compared) = (self.comparator)(state) else {
            return false;
        };

        let mut memo = self.memo.lock();
        if memo.last_comparator.as_ref() != Some(&compared) {
            memo.should_run = true;
        }
        memo.last_selector = Some(selected);
        memo.last_comparator = Some(compared);
        memo.should_run
    }

    fn check_current(&self) -> bool {
        let state = self.state.get();
        self.check(state.as_deref())
    }

    fn clear_should_run(&self) {
        self.memo.lock().should_run = false;
    }

    /// Run the body against the remembered selector output and memoize the
    /// result, notifying subscribers if it changed.
    fn run_body(&self) {
        let selected = self.memo.lock().last_selector.clone();
        let Some(selected) = selected else { return };
        let value = (self.body)(&selected);

        let changed = {
            let mut memo = self.memo.lock();
            let changed = memo.latest.as_ref() != Some(&value);
            memo.latest = Some(value.clone());
            changed
        };
        if changed {
            for subscriber in self.subscribers.snapshot() {
                subscriber(&value);
            }
        }
    }

    /// React to a published state: run the body iff the projection changed.
    /// Wired as the store listener of reactive autoruns.
    pub(crate) fn react(&self, state: &S) {
        if self.check(Some(state)) {
            self.clear_should_run();
            self.run_body();
        }
    }

    /// Check against the current state and run the body if it is due (or
    /// if memoization is disabled); returns the latest value.
    pub fn call(&self) -> Option<Ret> {
        let due = self.check_current();
        if due || !self.memoization {
            self.clear_should_run();
            self.run_body();
        }
        self.value()
    }

    /// Run the body regardless of memoization. The memo is still refreshed
    /// first so the body sees the current selector output.
    pub fn force(&self) -> Option<Ret> {
        self.check_current();
        self.clear_should_run();
        self.run_body();
        self.value()
    }

    /// The memoized latest value (or the configured default before the
    /// first body run).
    pub fn value(&self) -> Option<Ret> {
        self.memo.lock().latest.clone()
    }

    /// Subscribe to changes of the memoized value, with the autorun's
    /// default `initial_run` behavior.
    pub fn subscribe(&self, callback: impl Fn(&Ret) + Send + Sync + 'static) -> Subscription {
        let initial_run = self.subscribers_initial_run;
        self.subscribe_with(callback, initial_run)
    }

    /// Subscribe with an explicit `initial_run`: when set and a value is
    /// already memoized, the callback fires once immediately.
    pub fn subscribe_with(
        &self,
        callback: impl Fn(&Ret) + Send + Sync + 'static,
        initial_run: bool,
    ) -> Subscription {
        let callback: Arc<SubscriberFn<Ret>> = Arc::new(callback);
        let subscription = self.insert_subscriber(Holder::Strong(Arc::clone(&callback)));
        if initial_run {
            if let Some(value) = self.value() {
                callback(&value);
            }
        }
        subscription
    }

    /// Subscribe weakly: the registry does not keep `callback` alive, and
    /// the entry is pruned once the caller drops their `Arc`.
    pub fn subscribe_weak<F>(&self, callback: &Arc<F>) -> Subscription
    where
        F: Fn(&Ret) + Send + Sync + 'static,
    {
        let callback_concrete: Arc<F> = Arc::clone(callback);
        let callback: Arc<SubscriberFn<Ret>> = callback_concrete;
        let weak: Weak<SubscriberFn<Ret>> = Arc::downgrade(&callback);
        let subscription = self.insert_subscriber(Holder::Weak(weak));
        if self.subscribers_initial_run {
            if let Some(value) = self.value() {
                callback(&value);
            }
        }
        subscription
    }

    fn insert_subscriber(&self, holder: Holder<SubscriberFn<Ret>>) -> Subscription {
        let id = self.subscribers.insert(holder);
        let registry = Arc::clone(&self.subscribers);
        Subscription::new(move || {
            registry.remove(id);
        })
    }

    /// Detach from the store: a reactive autorun stops re-running. Called
    /// automatically on drop; idempotent.
    pub fn unsubscribe(&self) {
        if let Some(subscription) = self.store_subscription.lock().take() {
            subscription.unsubscribe();
        }
    }

    pub(crate) fn attach_store_subscription(&self, subscription: Subscription) {
        *self.store_subscription.lock() = Some(subscription);
    }
}

impl<S, Sel, Cmp, Ret> Drop for Autorun<S, Sel, Cmp, Ret> {
    fn drop(&mut self) {
        if let Some(subscription) = self.store_subscription.lock().take() {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug, PartialEq)]
    struct State {
        count: i64,
        label: &'static str,
    }

    fn cell(initial: Option<State>) -> Arc<StateCell<State>> {
        let cell = Arc::new(StateCell::new());
        if let Some(state) = initial {
            cell.replace(state);
        }
        cell
    }

    fn counting_autorun(
        cell: &Arc<StateCell<State>>,
        options: AutorunOptions<i64>,
        runs: &Arc<AtomicUsize>,
    ) -> Arc<Autorun<State, i64, i64, i64>> {
        let selector: SelectFn<State, i64> = Arc::new(|state: &State| Some(state.count));
        let runs = Arc::clone(runs);
        let body: BodyFn<i64, i64> = Arc::new(move |count: &i64| {
            runs.fetch_add(1, Ordering::Relaxed);
            *count * 2
        });
        Autorun::create(
            Arc::clone(cell),
            Arc::clone(&selector),
            selector,
            body,
            options,
        )
    }

    #[test]
    fn uninitialized_state_defers() {
        let cell = cell(None);
        let runs = Arc::new(AtomicUsize::new(0));
        let autorun = counting_autorun(&cell, AutorunOptions::new(), &runs);

        assert_eq!(autorun.value(), None);
        assert_eq!(autorun.call(), None);
        assert_eq!(runs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn initial_call_runs_once_when_state_is_populated() {
        let cell = cell(Some(State {
            count: 3,
            label: "a",
        }));
        let runs = Arc::new(AtomicUsize::new(0));
        let autorun = counting_autorun(&cell, AutorunOptions::new(), &runs);

        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(autorun.value(), Some(6));
    }

    #[test]
    fn memoized_call_skips_unchanged_projection() {
        let cell = cell(Some(State {
            count: 1,
            label: "a",
        }));
        let runs = Arc::new(AtomicUsize::new(0));
        let autorun = counting_autorun(&cell, AutorunOptions::new(), &runs);
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        // A change outside the projection does not re-run the body.
        cell.replace(State {
            count: 1,
            label: "b",
        });
        assert_eq!(autorun.call(), Some(2));
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        // A projected change does.
        cell.replace(State {
            count: 2,
            label: "b",
        });
        assert_eq!(autorun.call(), Some(4));
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn disabled_memoization_reruns_every_call() {
        let cell = cell(Some(State {
            count: 1,
            label: "a",
        }));
        let runs = Arc::new(AtomicUsize::new(0));
        let autorun = counting_autorun(
            &cell,
            AutorunOptions::new().memoization(false).initial_call(false),
            &runs,
        );

        autorun.call();
        autorun.call();
        autorun.call();
        assert_eq!(runs.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn force_bypasses_memoization_once() {
        let cell = cell(Some(State {
            count: 5,
            label: "a",
        }));
        let runs = Arc::new(AtomicUsize::new(0));
        let autorun = counting_autorun(&cell, AutorunOptions::new(), &runs);
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        assert_eq!(autorun.call(), Some(10));
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(autorun.force(), Some(10));
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn default_value_reported_before_first_run() {
        let cell = cell(None);
        let runs = Arc::new(AtomicUsize::new(0));
        let autorun = counting_autorun(
            &cell,
            AutorunOptions::new().default_value(-1),
            &runs,
        );

        assert_eq!(autorun.value(), Some(-1));
        cell.replace(State {
            count: 4,
            label: "a",
        });
        assert_eq!(autorun.call(), Some(8));
    }

    #[test]
    fn partial_selector_defers_until_projection_exists() {
        let cell = cell(Some(State {
            count: -10,
            label: "a",
        }));
        let runs = Arc::new(AtomicUsize::new(0));

        // Selector only produces a value for non-negative counts.
        let selector: SelectFn<State, i64> =
            Arc::new(|state: &State| (state.count >= 0).then_some(state.count));
        let runs_in_body = Arc::clone(&runs);
        let body: BodyFn<i64, i64> = Arc::new(move |count: &i64| {
            runs_in_body.fetch_add(1, Ordering::Relaxed);
            *count
        });
        let autorun = Autorun::create(
            Arc::clone(&cell),
            Arc::clone(&selector),
            selector,
            body,
            AutorunOptions::new(),
        );

        assert_eq!(autorun.call(), None);
        assert_eq!(runs.load(Ordering::Relaxed), 0);

        cell.replace(State {
            count: 7,
            label: "a",
        });
        assert_eq!(autorun.call(), Some(7));
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn subscribers_fire_on_change_only() {
        let cell = cell(Some(State {
            count: 1,
            label: "a",
        }));
        let runs = Arc::new(AtomicUsize::new(0));
        let autorun = counting_autorun(&cell, AutorunOptions::new(), &runs);

        let notifications = Arc::new(AtomicUsize::new(0));
        let notifications_in_callback = Arc::clone(&notifications);
        let subscription = autorun.subscribe_with(
            move |_value: &i64| {
                notifications_in_callback.fetch_add(1, Ordering::Relaxed);
            },
            false,
        );

        // Same projected value: body re-runs via force, but the result is
        // unchanged so subscribers stay quiet.
        autorun.force();
        assert_eq!(notifications.load(Ordering::Relaxed), 0);

        cell.replace(State {
            count: 2,
            label: "a",
        });
        autorun.call();
        assert_eq!(notifications.load(Ordering::Relaxed), 1);

        subscription.unsubscribe();
        cell.replace(State {
            count: 3,
            label: "a",
        });
        autorun.call();
        assert_eq!(notifications.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn subscriber_initial_run_sees_current_value() {
        let cell = cell(Some(State {
            count: 2,
            label: "a",
        }));
        let runs = Arc::new(AtomicUsize::new(0));
        let autorun = counting_autorun(&cell, AutorunOptions::new(), &runs);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_callback = Arc::clone(&seen);
        let _subscription = autorun.subscribe(move |value: &i64| {
            seen_in_callback.lock().push(*value);
        });

        assert_eq!(*seen.lock(), vec![4]);
    }

    #[test]
    fn dropped_weak_subscriber_is_pruned_silently() {
        let cell = cell(Some(State {
            count: 1,
            label: "a",
        }));
        let runs = Arc::new(AtomicUsize::new(0));
        let autorun = counting_autorun(&cell, AutorunOptions::new(), &runs);

        let notifications = Arc::new(AtomicUsize::new(0));
        let notifications_in_callback = Arc::clone(&notifications);
        let callback = Arc::new(move |_value: &i64| {
            notifications_in_callback.fetch_add(1, Ordering::Relaxed);
        });
        let _subscription = autorun.subscribe_weak(&callback);
        assert_eq!(notifications.load(Ordering::Relaxed), 1);

        drop(callback);
        cell.replace(State {
            count: 2,
            label: "a",
        });
        autorun.call();
        // The collected subscriber was dropped from the pass, no error.
        assert_eq!(notifications.load(Ordering::Relaxed), 1);
    }
}
