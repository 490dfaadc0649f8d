//! The dispatch engine: the single-writer loop that owns the state, the
//! action queue, and the event queue.
//!
//! # How dispatch works
//! 1. `dispatch` flattens its items, runs each through the matching
//!    middleware chain, and enqueues the survivors.
//! 2. If no external scheduler is configured and no drain is running,
//!    `dispatch` drives the drain inline before returning.
//! 3. The drain applies the reducer to every queued action (publishing each
//!    new state to listeners synchronously, in reducer-completion order),
//!    then routes every queued event to the worker pool, and repeats until
//!    both queues are empty.
//!
//! Draining is guarded by a non-reentrant mutex: a dispatch issued from
//! inside a listener only enqueues and is picked up by the drain already in
//! flight.
//!
//! # Shutdown
//! `Action::Finish` is reduced like any other action and then enqueues
//! `Event::Finish`. Routing `Event::Finish` spawns a waiter thread that
//! polls for quiescence (both queues and the worker queue empty), sleeps
//! the grace period, and then runs [`StoreCore::clean_up`]: join queued
//! work, stop and join the workers, clear the registries, and invoke
//! `on_finish` exactly once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::hash::FastIndexMap;
use crate::middleware::MiddlewareChain;
use crate::registry::{Holder, Registry, Subscription};
use crate::types::{
    Action, Event, EventHandler, EventTag, Item, Reducer, ReducerResult, Scheduler, TaskCreator,
};
use crate::worker::{SideEffectPool, WorkQueue};

/// How often the shutdown waiter re-checks for quiescence.
const QUIESCENCE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// State listeners as stored in the registry.
pub(crate) type ListenerFn<S> = dyn Fn(&S) + Send + Sync;

/// Holds the current state behind an `Arc` so replacement is atomic from
/// the observers' perspective: a notification pass clones the `Arc` out and
/// never holds the lock while user code runs.
pub(crate) struct StateCell<S> {
    inner: RwLock<Option<Arc<S>>>,
}

impl<S> StateCell<S> {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// The current state, if the store has been initialized.
    pub(crate) fn get(&self) -> Option<Arc<S>> {
        self.inner.read().clone()
    }

    /// Replace the state, returning the stored `Arc` for notification.
    pub(crate) fn replace(&self, state: S) -> Arc<S> {
        let state = Arc::new(state);
        *self.inner.write() = Some(Arc::clone(&state));
        state
    }
}

struct Queues<A, E> {
    actions: VecDeque<Action<A>>,
    events: VecDeque<Event<E>>,
}

/// The store internals shared by the façade, autoruns, and worker plumbing.
pub(crate) struct StoreCore<S, A, E: EventTag> {
    pub(crate) reducer: Box<Reducer<S, A, E>>,
    pub(crate) state: Arc<StateCell<S>>,
    queues: Mutex<Queues<A, E>>,
    /// Non-reentrant drain guard; `dispatch` observes it to decide whether
    /// to drive the drain itself.
    drain: Mutex<()>,
    pub(crate) listeners: Arc<Registry<ListenerFn<S>>>,
    handlers: RwLock<FastIndexMap<E::Tag, Arc<Registry<dyn EventHandler<E>>>>>,
    pub(crate) action_middlewares: MiddlewareChain<Action<A>>,
    pub(crate) event_middlewares: MiddlewareChain<Event<E>>,
    pub(crate) work_queue: Arc<WorkQueue<E>>,
    pub(crate) pool: SideEffectPool<E>,
    pub(crate) scheduler: Option<Arc<dyn Scheduler>>,
    pub(crate) task_creator: Option<Arc<dyn TaskCreator>>,
    pub(crate) grace_time: Duration,
    on_finish: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// Set when `Event::Finish` has been routed.
    finished: AtomicBool,
    /// Set when `clean_up` has run.
    cleaned: AtomicBool,
}

impl<S, A, E> StoreCore<S, A, E>
where
    S: Send + Sync + 'static,
    A: std::fmt::Debug + Send + 'static,
    E: EventTag,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        reducer: Box<Reducer<S, A, E>>,
        work_queue: Arc<WorkQueue<E>>,
        pool: SideEffectPool<E>,
        scheduler: Option<Arc<dyn Scheduler>>,
        task_creator: Option<Arc<dyn TaskCreator>>,
        grace_time: Duration,
        on_finish: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            reducer,
            state: Arc::new(StateCell::new()),
            queues: Mutex::new(Queues {
                actions: VecDeque::new(),
                events: VecDeque::new(),
            }),
            drain: Mutex::new(()),
            listeners: Arc::new(Registry::new()),
            handlers: RwLock::new(FastIndexMap::default()),
            action_middlewares: MiddlewareChain::new(),
            event_middlewares: MiddlewareChain::new(),
            work_queue,
            pool,
            scheduler,
            task_creator,
            grace_time,
            on_finish: Mutex::new(on_finish),
            finished: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
        }
    }

    /// Run items through the middleware chains, enqueue the survivors, and
    /// drain inline unless a scheduler owns draining or a drain is already
    /// in flight.
    pub(crate) fn dispatch_items(
        self: &Arc<Self>,
        items: Vec<Item<A, E>>,
    ) -> Result<(), StoreError> {
        for item in items {
            match item {
                Item::Action(action) => match self.action_middlewares.apply(action) {
                    Some(action) => self.queues.lock().actions.push_back(action),
                    None => debug!("action dropped by middleware"),
                },
                Item::Event(event) => match self.event_middlewares.apply(event) {
                    Some(event) => self.queues.lock().events.push_back(event),
                    None => debug!("event dropped by middleware"),
                },
            }
        }

        if self.scheduler.is_none() && !self.drain.is_locked() {
            self.run()?;
        }
        Ok(())
    }

    /// Drain the queues until both are empty.
    ///
    /// Actions are drained fully before events on each pass; the outer loop
    /// alternates so that events enqueued by reducer composites (and
    /// actions enqueued by listeners) are honored in the same drain.
    pub(crate) fn run(self: &Arc<Self>) -> Result<(), StoreError> {
        let _guard = self.drain.lock();
        loop {
            loop {
                let action = self.queues.lock().actions.pop_front();
                let Some(action) = action else { break };
                self.apply_action(action)?;
            }
            loop {
                let event = self.queues.lock().events.pop_front();
                let Some(event) = event else { break };
                self.route_event(event);
            }
            let queues = self.queues.lock();
            if queues.actions.is_empty() && queues.events.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Reduce one action, publish the new state, and enqueue any follow-ups
    /// the reducer produced (bypassing middleware: they originate from the
    /// reducer, not from a dispatch call).
    ///
    /// Follow-up actions/events and the `Finish` action's `Event::Finish`
    /// are consequences of the reducer's own output: they are enqueued even
    /// when the listener pass fails, and only then does the error surface.
    /// The aborted drain leaves them queued for the next one.
    fn apply_action(self: &Arc<Self>, action: Action<A>) -> Result<(), StoreError> {
        let is_finish = matches!(action, Action::Finish);
        debug!(?action, "reducing action");

        let previous = self.state.get();
        let notified = match (self.reducer)(previous.as_deref(), &action) {
            ReducerResult::State(state) => {
                let state = self.state.replace(state);
                self.notify_listeners(&state)
            }
            ReducerResult::Complete {
                state,
                actions,
                events,
            } => {
                let state = self.state.replace(state);
                let notified = self.notify_listeners(&state);
                let mut queues = self.queues.lock();
                queues.actions.extend(actions);
                queues.events.extend(events);
                notified
            }
        };

        if is_finish {
            self.queues.lock().events.push_back(Event::Finish);
        }
        notified
    }

    /// Notify listeners with the new state, in subscription order.
    ///
    /// A collected weak listener aborts the pass at its position: the dead
    /// entry is pruned, listeners after it are not notified, and the error
    /// propagates to the dispatcher.
    fn notify_listeners(&self, state: &Arc<S>) -> Result<(), StoreError> {
        for (id, holder) in self.listeners.entries() {
            let Some(listener) = holder.resolve() else {
                self.listeners.remove(id);
                return Err(StoreError::CollectedWeakReference);
            };
            listener(state.as_ref());
        }
        Ok(())
    }

    /// Route one event: `Finish` starts the shutdown path, everything else
    /// fans out to the handlers registered for the event's variant tag.
    fn route_event(self: &Arc<Self>, event: Event<E>) {
        match event {
            Event::Finish => self.begin_shutdown(),
            Event::App(event) => {
                if self.cleaned.load(Ordering::SeqCst) {
                    warn!(tag = ?event.tag(), "event dropped after store cleanup");
                    return;
                }
                let registry = self.handlers.read().get(&event.tag()).cloned();
                let Some(registry) = registry else { return };
                for (_, holder) in registry.entries() {
                    self.work_queue.push(Some((holder, event.clone())));
                }
            }
        }
    }

    /// Spawn the quiescence waiter. Idempotent: only the first
    /// `Event::Finish` starts it.
    fn begin_shutdown(self: &Arc<Self>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("finish requested; waiting for quiescence");
        let core = Arc::clone(self);
        thread::spawn(move || {
            while !core.is_quiescent() {
                thread::sleep(QUIESCENCE_POLL_INTERVAL);
            }
            thread::sleep(core.grace_time);
            core.clean_up();
        });
    }

    /// Both store queues and the worker queue are empty. In-flight handler
    /// work does not count; the grace period covers it.
    fn is_quiescent(&self) -> bool {
        let queues = self.queues.lock();
        queues.actions.is_empty() && queues.events.is_empty() && self.work_queue.is_empty()
    }

    /// Tear the store down: join queued side-effect work, stop and join the
    /// workers, clear the registries, and invoke `on_finish`.
    ///
    /// Runs at most once; later calls are no-ops.
    pub(crate) fn clean_up(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.work_queue.join();
        self.pool.request_stop();
        self.pool.join();
        self.listeners.clear();
        self.handlers.write().clear();
        if let Some(on_finish) = self.on_finish.lock().take() {
            on_finish();
        }
        debug!("store cleaned up");
    }

    /// Block until every queued `(handler, event)` pair has been handled.
    pub(crate) fn wait_for_event_handlers(&self) {
        self.work_queue.join();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn is_cleaned_up(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }

    /// Register a state listener holder; the subscription removes it again.
    pub(crate) fn subscribe_holder(&self, holder: Holder<ListenerFn<S>>) -> Subscription {
        let id = self.listeners.insert(holder);
        let registry = Arc::clone(&self.listeners);
        Subscription::new(move || {
            registry.remove(id);
        })
    }

    /// Register an event-handler holder under a variant tag.
    pub(crate) fn subscribe_event_holder(
        &self,
        tag: E::Tag,
        holder: Holder<dyn EventHandler<E>>,
    ) -> Subscription {
        let registry = {
            let mut handlers = self.handlers.write();
            Arc::clone(
                handlers
                    .entry(tag)
                    .or_insert_with(|| Arc::new(Registry::new())),
            )
        };
        let id = registry.insert(holder);
        Subscription::new(move || {
            registry.remove(id);
        })
    }
}

impl<S, A, E: EventTag> Drop for StoreCore<S, A, E> {
    fn drop(&mut self) {
        // A store dropped without `Finish` still releases its workers; they
        // are parked on the queue and would otherwise outlive the store.
        if !self.cleaned.load(Ordering::SeqCst) {
            self.pool.request_stop();
        }
    }
}
