//! The store façade: construction, dispatch, subscriptions, derived
//! values, middlewares, and snapshots.
//!
//! A [`Store`] is a cheap handle over the shared core; clones observe and
//! drive the same state. The dispatch thread is whichever thread calls
//! `dispatch` (or the scheduler thread); side effects run on the worker
//! pool.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::autorun::{Autorun, AutorunOptions, BodyFn, SelectFn, View, ViewOptions};
use crate::dispatch::{ListenerFn, StoreCore};
use crate::error::StoreError;
use crate::middleware::MiddlewareId;
use crate::registry::{EventSubscription, Holder, Subscription};
use crate::task::OnceTask;
use crate::types::{
    Action, BoxFuture, BoxFutureOf, Event, EventHandler, EventTag, IntoItems, Item, ReducerResult,
    Scheduler, SyncHandler, TaskCreator, TaskHandler,
};
use crate::with_state::WithState;
use crate::worker::{SideEffectPool, SpawnFn, WorkQueue};

/// Default quiescence interval between `Finish` and cleanup.
pub const DEFAULT_GRACE_TIME: Duration = Duration::from_secs(1);

/// Default number of side-effect workers.
pub const DEFAULT_SIDE_EFFECT_WORKERS: usize = 1;

type ActionMiddlewareBox<A> = Box<dyn Fn(Action<A>) -> Option<Action<A>> + Send + Sync>;
type EventMiddlewareBox<E> = Box<dyn Fn(Event<E>) -> Option<Event<E>> + Send + Sync>;

/// Configuration for [`Store::new`], built in the usual chained style.
///
/// ```ignore
/// let store = Store::new(
///     reducer,
///     StoreOptions::new()
///         .auto_init(true)
///         .side_effect_workers(2)
///         .grace_time(Duration::from_millis(100))
///         .on_finish(|| println!("store done")),
/// );
/// ```
pub struct StoreOptions<A, E> {
    auto_init: bool,
    side_effect_workers: usize,
    grace_time: Duration,
    scheduler: Option<Arc<dyn Scheduler>>,
    task_creator: Option<Arc<dyn TaskCreator>>,
    on_finish: Option<Box<dyn FnOnce() + Send>>,
    action_middlewares: Vec<ActionMiddlewareBox<A>>,
    event_middlewares: Vec<EventMiddlewareBox<E>>,
    worker_spawn_fn: Option<SpawnFn>,
}

impl<A, E> Default for StoreOptions<A, E> {
    fn default() -> Self {
        Self {
            auto_init: false,
            side_effect_workers: DEFAULT_SIDE_EFFECT_WORKERS,
            grace_time: DEFAULT_GRACE_TIME,
            scheduler: None,
            task_creator: None,
            on_finish: None,
            action_middlewares: Vec::new(),
            event_middlewares: Vec::new(),
            worker_spawn_fn: None,
        }
    }
}

impl<A, E> StoreOptions<A, E> {
    /// Equivalent to `Default::default()`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch [`Action::Init`] at construction.
    ///
    /// Default: `false`.
    pub fn auto_init(mut self, auto_init: bool) -> Self {
        self.auto_init = auto_init;
        self
    }

    /// Number of side-effect workers (at least one).
    ///
    /// Default: 1.
    pub fn side_effect_workers(mut self, workers: usize) -> Self {
        self.side_effect_workers = workers.max(1);
        self
    }

    /// Quiescence interval between `Finish` and cleanup.
    ///
    /// Default: 1s.
    pub fn grace_time(mut self, grace_time: Duration) -> Self {
        self.grace_time = grace_time;
        self
    }

    /// Replace inline draining with an external driver: `dispatch` only
    /// enqueues, and the scheduler is handed the store's `run` as a
    /// repeating callback (plus the init dispatch as a one-shot when
    /// `auto_init` is set).
    pub fn scheduler(mut self, scheduler: impl Scheduler) -> Self {
        self.scheduler = Some(Arc::new(scheduler));
        self
    }

    /// Schedule asynchronous handler results onto an external event loop
    /// instead of the workers' own runtimes.
    pub fn task_creator(mut self, task_creator: impl TaskCreator) -> Self {
        self.task_creator = Some(Arc::new(task_creator));
        self
    }

    /// Callback invoked once after cleanup completes.
    pub fn on_finish(mut self, on_finish: impl FnOnce() + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(on_finish));
        self
    }

    /// Append an action middleware to the initial chain.
    pub fn action_middleware(
        mut self,
        middleware: impl Fn(Action<A>) -> Option<Action<A>> + Send + Sync + 'static,
    ) -> Self {
        self.action_middlewares.push(Box::new(middleware));
        self
    }

    /// Append an event middleware to the initial chain.
    pub fn event_middleware(
        mut self,
        middleware: impl Fn(Event<E>) -> Option<Event<E>> + Send + Sync + 'static,
    ) -> Self {
        self.event_middlewares.push(Box::new(middleware));
        self
    }

    /// Custom thread spawning for the workers (names, stack sizes, ...).
    ///
    /// ```ignore
    /// StoreOptions::new().worker_spawn_fn(|f| {
    ///     std::thread::Builder::new()
    ///         .name("side-effects".into())
    ///         .spawn(f)
    ///         .unwrap()
    /// })
    /// ```
    pub fn worker_spawn_fn(
        mut self,
        spawn_fn: impl Fn(Box<dyn FnOnce() + Send>) -> std::thread::JoinHandle<()>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.worker_spawn_fn = Some(Box::new(spawn_fn));
        self
    }
}

/// The reactive, event-aware state store.
///
/// Holds a single immutable state value, reduces dispatched actions into
/// new states, notifies listeners synchronously in reducer-completion
/// order, and routes events to handlers on the side-effect worker pool.
/// Cloning is cheap and shares the same store.
pub struct Store<S, A, E: EventTag> {
    core: Arc<StoreCore<S, A, E>>,
}

impl<S, A, E: EventTag> Clone for Store<S, A, E> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<S, A, E> Store<S, A, E>
where
    S: Send + Sync + 'static,
    A: fmt::Debug + Send + 'static,
    E: EventTag,
{
    /// Create a store from a reducer and options.
    ///
    /// With `auto_init`, [`Action::Init`] is dispatched before `new`
    /// returns (or scheduled as a one-shot when a scheduler is configured).
    pub fn new<R>(reducer: R, options: StoreOptions<A, E>) -> Self
    where
        R: Fn(Option<&S>, &Action<A>) -> ReducerResult<S, A, E> + Send + Sync + 'static,
    {
        let StoreOptions {
            auto_init,
            side_effect_workers,
            grace_time,
            scheduler,
            task_creator,
            on_finish,
            action_middlewares,
            event_middlewares,
            worker_spawn_fn,
        } = options;

        let work_queue = Arc::new(WorkQueue::new());
        let pool = SideEffectPool::start(
            Arc::clone(&work_queue),
            side_effect_workers,
            task_creator.clone(),
            worker_spawn_fn.as_ref(),
        );
        let core = Arc::new(StoreCore::new(
            Box::new(reducer),
            work_queue,
            pool,
            scheduler.clone(),
            task_creator,
            grace_time,
            on_finish,
        ));

        for middleware in action_middlewares {
            core.action_middlewares.register(move |action| middleware(action));
        }
        for middleware in event_middlewares {
            core.event_middlewares.register(move |event| middleware(event));
        }

        if let Some(scheduler) = &scheduler {
            if auto_init {
                let weak = Arc::downgrade(&core);
                scheduler.schedule(
                    Box::new(move || {
                        if let Some(core) = weak.upgrade() {
                            if let Err(err) =
                                core.dispatch_items(vec![Item::Action(Action::Init)])
                            {
                                warn!(%err, "scheduled init dispatch failed");
                            }
                        }
                    }),
                    false,
                );
            }
            let weak = Arc::downgrade(&core);
            scheduler.schedule(
                Box::new(move || {
                    if let Some(core) = weak.upgrade() {
                        if let Err(err) = core.run() {
                            warn!(%err, "scheduled drain failed");
                        }
                    }
                }),
                true,
            );
        } else if auto_init {
            if let Err(err) = core.dispatch_items(vec![Item::Action(Action::Init)]) {
                warn!(%err, "init dispatch failed");
            }
        }

        Self { core }
    }

    /// Dispatch actions and/or events.
    ///
    /// Items pass through the middleware chains and are enqueued; unless a
    /// scheduler is configured or a drain is already running, the queues
    /// are drained inline before this returns.
    pub fn dispatch(&self, items: impl IntoItems<A, E>) -> Result<(), StoreError> {
        self.core.dispatch_items(items.into_items())
    }

    /// Dispatch items produced from the current state.
    ///
    /// The closure receives the current state (or `None` before
    /// initialization) and returns the items to dispatch; they then go
    /// through the normal pipeline as an independent dispatch.
    pub fn dispatch_with<I>(
        &self,
        with_state: impl FnOnce(Option<&S>) -> I,
    ) -> Result<(), StoreError>
    where
        I: IntoItems<A, E>,
    {
        let items = {
            let state = self.core.state.get();
            with_state(state.as_deref()).into_items()
        };
        self.core.dispatch_items(items)
    }

    /// Drain the queues until both are empty. Normally driven by
    /// `dispatch` or the scheduler; safe to call directly.
    pub fn run(&self) -> Result<(), StoreError> {
        self.core.run()
    }

    /// Subscribe to state changes. The listener is invoked synchronously
    /// on the dispatch thread with every new state.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        let listener: Arc<ListenerFn<S>> = Arc::new(listener);
        self.core.subscribe_holder(Holder::Strong(listener))
    }

    /// Subscribe weakly: the store does not keep `listener` alive. If the
    /// caller drops their `Arc`, the next notification pass prunes the
    /// entry and surfaces [`StoreError::CollectedWeakReference`].
    pub fn subscribe_weak<F>(&self, listener: &Arc<F>) -> Subscription
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        let listener_concrete: Arc<F> = Arc::clone(listener);
        let listener: Arc<ListenerFn<S>> = listener_concrete;
        let weak: Weak<ListenerFn<S>> = Arc::downgrade(&listener);
        self.core.subscribe_holder(Holder::Weak(weak))
    }

    /// Register a synchronous handler for one event variant.
    pub fn subscribe_event<F>(&self, tag: E::Tag, handler: F) -> EventSubscription<E>
    where
        F: Fn(E) + Send + Sync + 'static,
    {
        self.subscribe_event_handler(tag, Arc::new(SyncHandler(handler)))
    }

    /// Register a handler whose work is a future, run on the worker's
    /// event loop (or handed to the task creator when configured).
    pub fn subscribe_event_task<F>(&self, tag: E::Tag, handler: F) -> EventSubscription<E>
    where
        F: Fn(E) -> BoxFuture + Send + Sync + 'static,
    {
        self.subscribe_event_handler(tag, Arc::new(TaskHandler(handler)))
    }

    /// Register an [`EventHandler`] trait object for one event variant.
    pub fn subscribe_event_handler(
        &self,
        tag: E::Tag,
        handler: Arc<dyn EventHandler<E>>,
    ) -> EventSubscription<E> {
        let subscription = self
            .core
            .subscribe_event_holder(tag, Holder::Strong(Arc::clone(&handler)));
        EventSubscription::new(subscription, handler)
    }

    /// Register a handler weakly: the store does not keep it alive. A
    /// collected handler dequeued on a worker is dropped silently. The
    /// returned record pins the handler, so keep it (or a clone of the
    /// `Arc`) around for as long as the handler should fire.
    pub fn subscribe_event_weak<H>(&self, tag: E::Tag, handler: &Arc<H>) -> EventSubscription<E>
    where
        H: EventHandler<E>,
    {
        let handler_concrete: Arc<H> = Arc::clone(handler);
        let handler_dyn: Arc<dyn EventHandler<E>> = handler_concrete;
        let weak: Weak<dyn EventHandler<E>> = Arc::downgrade(&handler_dyn);
        let subscription = self.core.subscribe_event_holder(tag, Holder::Weak(weak));
        EventSubscription::new(subscription, handler_dyn)
    }

    /// Create an autorun deriving `body(selector(state))`, memoized on the
    /// selector output.
    pub fn autorun<Sel, Ret, SelF, Body>(
        &self,
        selector: SelF,
        options: AutorunOptions<Ret>,
        body: Body,
    ) -> Arc<Autorun<S, Sel, Sel, Ret>>
    where
        Sel: Clone + PartialEq + Send + 'static,
        Ret: Clone + PartialEq + Send + 'static,
        SelF: Fn(&S) -> Sel + Send + Sync + 'static,
        Body: Fn(&Sel) -> Ret + Send + Sync + 'static,
    {
        let selector: SelectFn<S, Sel> = Arc::new(move |state: &S| Some(selector(state)));
        self.autorun_inner(Arc::clone(&selector), selector, Arc::new(body), options)
    }

    /// Like [`autorun`](Self::autorun) with a distinct comparator deciding
    /// when the body re-runs.
    pub fn autorun_with<Sel, Cmp, Ret, SelF, CmpF, Body>(
        &self,
        selector: SelF,
        comparator: CmpF,
        options: AutorunOptions<Ret>,
        body: Body,
    ) -> Arc<Autorun<S, Sel, Cmp, Ret>>
    where
        Sel: Clone + Send + 'static,
        Cmp: Clone + PartialEq + Send + 'static,
        Ret: Clone + PartialEq + Send + 'static,
        SelF: Fn(&S) -> Sel + Send + Sync + 'static,
        CmpF: Fn(&S) -> Cmp + Send + Sync + 'static,
        Body: Fn(&Sel) -> Ret + Send + Sync + 'static,
    {
        let selector: SelectFn<S, Sel> = Arc::new(move |state: &S| Some(selector(state)));
        let comparator: SelectFn<S, Cmp> = Arc::new(move |state: &S| Some(comparator(state)));
        self.autorun_inner(selector, comparator, Arc::new(body), options)
    }

    /// Autorun over a partial selector: a `None` projection defers the run
    /// (useful while parts of the state are not populated yet).
    pub fn try_autorun<Sel, Ret, SelF, Body>(
        &self,
        selector: SelF,
        options: AutorunOptions<Ret>,
        body: Body,
    ) -> Arc<Autorun<S, Sel, Sel, Ret>>
    where
        Sel: Clone + PartialEq + Send + 'static,
        Ret: Clone + PartialEq + Send + 'static,
        SelF: Fn(&S) -> Option<Sel> + Send + Sync + 'static,
        Body: Fn(&Sel) -> Ret + Send + Sync + 'static,
    {
        let selector: SelectFn<S, Sel> = Arc::new(selector);
        self.autorun_inner(Arc::clone(&selector), selector, Arc::new(body), options)
    }

    /// Autorun with an asynchronous body and await-once caching: the
    /// latest value is an [`OnceTask`] resolving to the body's output, and
    /// a predecessor that never resolved is cancelled on replacement.
    pub fn autorun_task<Sel, T, SelF, Body>(
        &self,
        selector: SelF,
        options: AutorunOptions<Arc<OnceTask<T>>>,
        body: Body,
    ) -> Arc<Autorun<S, Sel, Sel, Arc<OnceTask<T>>>>
    where
        Sel: Clone + PartialEq + Send + 'static,
        T: Clone + Send + 'static,
        SelF: Fn(&S) -> Sel + Send + Sync + 'static,
        Body: Fn(&Sel) -> BoxFutureOf<T> + Send + Sync + 'static,
    {
        let previous: Mutex<Option<Arc<OnceTask<T>>>> = Mutex::new(None);
        let adapted = move |selected: &Sel| -> Arc<OnceTask<T>> {
            let task = Arc::new(OnceTask::new(body(selected)));
            if let Some(replaced) = previous.lock().replace(Arc::clone(&task)) {
                if !replaced.is_resolved() {
                    replaced.cancel();
                }
            }
            task
        };
        let selector: SelectFn<S, Sel> = Arc::new(move |state: &S| Some(selector(state)));
        self.autorun_inner(Arc::clone(&selector), selector, Arc::new(adapted), options)
    }

    /// Autorun with an asynchronous body scheduled through the task
    /// creator on every run; nothing is cached beyond the run itself.
    pub fn autorun_spawn<Sel, SelF, Body>(
        &self,
        selector: SelF,
        options: AutorunOptions<()>,
        body: Body,
    ) -> Arc<Autorun<S, Sel, Sel, ()>>
    where
        Sel: Clone + PartialEq + Send + 'static,
        SelF: Fn(&S) -> Sel + Send + Sync + 'static,
        Body: Fn(&Sel) -> BoxFuture + Send + Sync + 'static,
    {
        let task_creator = self.core.task_creator.clone();
        let mut options = options;
        if options.default_value.is_none() {
            options.default_value = Some(());
        }
        let adapted = move |selected: &Sel| {
            let task = body(selected);
            match &task_creator {
                Some(creator) => creator.create_task(task),
                None => warn!("autorun produced a task but no task creator is configured"),
            }
        };
        let selector: SelectFn<S, Sel> = Arc::new(move |state: &S| Some(selector(state)));
        self.autorun_inner(Arc::clone(&selector), selector, Arc::new(adapted), options)
    }

    /// Create a view: purely lazy, change-detected memoization with no
    /// initial call and no reactivity.
    pub fn view<Sel, Ret, SelF, Body>(
        &self,
        selector: SelF,
        options: ViewOptions<Ret>,
        body: Body,
    ) -> Arc<View<S, Sel, Ret>>
    where
        Sel: Clone + PartialEq + Send + 'static,
        Ret: Clone + PartialEq + Send + 'static,
        SelF: Fn(&S) -> Sel + Send + Sync + 'static,
        Body: Fn(&Sel) -> Ret + Send + Sync + 'static,
    {
        self.autorun(selector, options.into_autorun_options(), body)
    }

    /// A view over a partial selector; see [`try_autorun`](Self::try_autorun).
    pub fn try_view<Sel, Ret, SelF, Body>(
        &self,
        selector: SelF,
        options: ViewOptions<Ret>,
        body: Body,
    ) -> Arc<View<S, Sel, Ret>>
    where
        Sel: Clone + PartialEq + Send + 'static,
        Ret: Clone + PartialEq + Send + 'static,
        SelF: Fn(&S) -> Option<Sel> + Send + Sync + 'static,
        Body: Fn(&Sel) -> Ret + Send + Sync + 'static,
    {
        self.try_autorun(selector, options.into_autorun_options(), body)
    }

    fn autorun_inner<Sel, Cmp, Ret>(
        &self,
        selector: SelectFn<S, Sel>,
        comparator: SelectFn<S, Cmp>,
        body: BodyFn<Sel, Ret>,
        options: AutorunOptions<Ret>,
    ) -> Arc<Autorun<S, Sel, Cmp, Ret>>
    where
        Sel: Clone + Send + 'static,
        Cmp: Clone + PartialEq + Send + 'static,
        Ret: Clone + PartialEq + Send + 'static,
    {
        let reactive = options.reactive;
        let autorun = Autorun::create(
            Arc::clone(&self.core.state),
            selector,
            comparator,
            body,
            options,
        );
        if reactive {
            // The listener holds the autorun weakly so a dropped autorun
            // does not linger in the store; the autorun detaches the
            // subscription itself on drop.
            let weak = Arc::downgrade(&autorun);
            let listener: Arc<ListenerFn<S>> = Arc::new(move |state: &S| {
                if let Some(autorun) = weak.upgrade() {
                    autorun.react(state);
                }
            });
            let subscription = self.core.subscribe_holder(Holder::Strong(listener));
            autorun.attach_store_subscription(subscription);
        }
        autorun
    }

    /// Bind a function to the store state through a selector.
    pub fn with_state<Sel, Ret, SelF, F>(&self, selector: SelF, func: F) -> WithState<S, Sel, Ret>
    where
        SelF: Fn(&S) -> Sel + Send + Sync + 'static,
        F: Fn(Sel) -> Ret + Send + Sync + 'static,
    {
        WithState::new(
            Arc::clone(&self.core.state),
            Arc::new(selector),
            Arc::new(func),
        )
    }

    /// Append an action middleware; applies to actions dispatched from now
    /// on.
    pub fn register_action_middleware(
        &self,
        middleware: impl Fn(Action<A>) -> Option<Action<A>> + Send + Sync + 'static,
    ) -> MiddlewareId {
        self.core.action_middlewares.register(middleware)
    }

    /// Remove a registered action middleware.
    pub fn unregister_action_middleware(&self, id: MiddlewareId) -> bool {
        self.core.action_middlewares.unregister(id)
    }

    /// Append an event middleware; applies to events dispatched from now
    /// on.
    pub fn register_event_middleware(
        &self,
        middleware: impl Fn(Event<E>) -> Option<Event<E>> + Send + Sync + 'static,
    ) -> MiddlewareId {
        self.core.event_middlewares.register(middleware)
    }

    /// Remove a registered event middleware.
    pub fn unregister_event_middleware(&self, id: MiddlewareId) -> bool {
        self.core.event_middlewares.unregister(id)
    }

    /// Block until every queued `(handler, event)` pair has been handled.
    pub fn wait_for_event_handlers(&self) {
        self.core.wait_for_event_handlers();
    }

    /// Tear the store down now: join queued side-effect work, stop and
    /// join the workers, clear the registries, and invoke `on_finish`.
    ///
    /// Runs at most once; the `Finish` flow calls this after the grace
    /// period.
    pub fn clean_up(&self) {
        self.core.clean_up();
    }

    /// Whether `Finish` has flowed through the store.
    pub fn is_finished(&self) -> bool {
        self.core.is_finished()
    }

    /// Whether cleanup has completed.
    pub fn is_cleaned_up(&self) -> bool {
        self.core.is_cleaned_up()
    }
}

impl<S, A, E> Store<S, A, E>
where
    S: Serialize + Send + Sync + 'static,
    A: fmt::Debug + Send + 'static,
    E: EventTag,
{
    /// Serialize the current state. A pure read: the store is not
    /// mutated. Before initialization the snapshot is `null`.
    pub fn snapshot(&self) -> Result<serde_json::Value, StoreError> {
        match self.core.state.get() {
            Some(state) => Ok(serde_json::to_value(&*state)?),
            None => Ok(serde_json::Value::Null),
        }
    }
}
