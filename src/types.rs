//! Core vocabulary of the store: actions, events, reducer results, dispatch
//! items, and the collaborator traits (task creator, scheduler, event
//! handler).
//!
//! The store is generic over three user types:
//!
//! - `S` — the state, treated as immutable and replaced wholesale.
//! - `A` — the user's action type, wrapped in [`Action`] together with the
//!   built-in `Init` and `Finish` variants.
//! - `E` — the user's event type, wrapped in [`Event`] together with the
//!   built-in `Finish` variant. Event types implement [`EventTag`] so
//!   handlers can be keyed by variant tag without constructing an event.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;

/// Boxed future run purely for its side effects.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Boxed future resolving to a value (asynchronous autorun bodies).
pub type BoxFutureOf<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// An action: a value describing an intended state transition.
///
/// `Init` is dispatched once when the store is created with `auto_init`;
/// `Finish` requests orderly shutdown. Everything else is the user's action
/// sum wrapped in `App`.
#[derive(Clone, Debug, PartialEq)]
pub enum Action<A> {
    /// Dispatched once at construction when the store auto-initializes.
    Init,
    /// Requests orderly shutdown; reduced like any other action, then
    /// followed by [`Event::Finish`].
    Finish,
    /// A user-defined action.
    App(A),
}

/// An event: a value describing an intended side effect.
///
/// Events carry data but no state-mutation authority; they are routed to
/// handlers running on the side-effect worker pool.
#[derive(Clone, Debug, PartialEq)]
pub enum Event<E> {
    /// Triggers the shutdown path: quiescence wait, grace period, cleanup.
    Finish,
    /// A user-defined event.
    App(E),
}

/// Implemented by user event types so handlers can be registered per
/// variant without constructing an event.
///
/// The tag is typically a field-less mirror of the event enum:
///
/// ```ignore
/// #[derive(Clone, Debug)]
/// enum ApiEvent {
///     CallApi { path: String },
///     Log(String),
/// }
///
/// #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
/// enum ApiEventTag {
///     CallApi,
///     Log,
/// }
///
/// impl EventTag for ApiEvent {
///     type Tag = ApiEventTag;
///
///     fn tag(&self) -> ApiEventTag {
///         match self {
///             ApiEvent::CallApi { .. } => ApiEventTag::CallApi,
///             ApiEvent::Log(_) => ApiEventTag::Log,
///         }
///     }
/// }
/// ```
pub trait EventTag: Clone + fmt::Debug + Send + 'static {
    /// The variant tag handlers are keyed by.
    type Tag: Copy + PartialEq + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// The tag of this event's variant.
    fn tag(&self) -> Self::Tag;
}

/// What a reducer returns: either a plain new state, or a new state plus
/// follow-up actions and events.
///
/// Follow-up items are enqueued after listeners have observed the new state,
/// and they bypass the middleware chains: they originate from the reducer,
/// not from a dispatch call.
pub enum ReducerResult<S, A, E> {
    /// A plain state transition.
    State(S),
    /// A state transition with follow-up actions and events.
    Complete {
        /// The new state.
        state: S,
        /// Actions enqueued after listeners fire.
        actions: Vec<Action<A>>,
        /// Events enqueued after listeners fire.
        events: Vec<Event<E>>,
    },
}

impl<S, A, E> ReducerResult<S, A, E> {
    /// A plain state transition.
    pub fn state(state: S) -> Self {
        ReducerResult::State(state)
    }

    /// A state transition plus follow-up events.
    pub fn with_events(state: S, events: Vec<Event<E>>) -> Self {
        ReducerResult::Complete {
            state,
            actions: Vec::new(),
            events,
        }
    }

    /// A state transition plus follow-up actions.
    pub fn with_actions(state: S, actions: Vec<Action<A>>) -> Self {
        ReducerResult::Complete {
            state,
            actions,
            events: Vec::new(),
        }
    }
}

/// Reducer signature: a pure mapping from the previous state (absent before
/// initialization) and an action to a [`ReducerResult`].
pub type Reducer<S, A, E> =
    dyn Fn(Option<&S>, &Action<A>) -> ReducerResult<S, A, E> + Send + Sync;

/// A single dispatchable item: an action or an event.
#[derive(Clone, Debug, PartialEq)]
pub enum Item<A, E> {
    /// An action, bound for the reducer.
    Action(Action<A>),
    /// An event, bound for the side-effect workers.
    Event(Event<E>),
}

impl<A, E> From<Action<A>> for Item<A, E> {
    fn from(action: Action<A>) -> Self {
        Item::Action(action)
    }
}

impl<A, E> From<Event<E>> for Item<A, E> {
    fn from(event: Event<E>) -> Self {
        Item::Event(event)
    }
}

/// Conversion into the flat list of items a dispatch call accepts: a single
/// action, a single event, an [`Item`], or a vector/array of any of those.
///
/// `()` dispatches nothing, which makes an empty dispatch an explicit no-op.
pub trait IntoItems<A, E> {
    /// Flatten into dispatchable items, preserving order.
    fn into_items(self) -> Vec<Item<A, E>>;
}

impl<A, E> IntoItems<A, E> for () {
    fn into_items(self) -> Vec<Item<A, E>> {
        Vec::new()
    }
}

impl<A, E> IntoItems<A, E> for Item<A, E> {
    fn into_items(self) -> Vec<Item<A, E>> {
        vec![self]
    }
}

impl<A, E> IntoItems<A, E> for Action<A> {
    fn into_items(self) -> Vec<Item<A, E>> {
        vec![Item::Action(self)]
    }
}

impl<A, E> IntoItems<A, E> for Event<E> {
    fn into_items(self) -> Vec<Item<A, E>> {
        vec![Item::Event(self)]
    }
}

impl<A, E> IntoItems<A, E> for Vec<Item<A, E>> {
    fn into_items(self) -> Vec<Item<A, E>> {
        self
    }
}

impl<A, E> IntoItems<A, E> for Vec<Action<A>> {
    fn into_items(self) -> Vec<Item<A, E>> {
        self.into_iter().map(Item::Action).collect()
    }
}

impl<A, E> IntoItems<A, E> for Vec<Event<E>> {
    fn into_items(self) -> Vec<Item<A, E>> {
        self.into_iter().map(Item::Event).collect()
    }
}

impl<A, E, const N: usize> IntoItems<A, E> for [Item<A, E>; N] {
    fn into_items(self) -> Vec<Item<A, E>> {
        self.into_iter().collect()
    }
}

impl<A, E, const N: usize> IntoItems<A, E> for [Action<A>; N] {
    fn into_items(self) -> Vec<Item<A, E>> {
        self.into_iter().map(Item::Action).collect()
    }
}

impl<A, E, const N: usize> IntoItems<A, E> for [Event<E>; N] {
    fn into_items(self) -> Vec<Item<A, E>> {
        self.into_iter().map(Item::Event).collect()
    }
}

/// What an event handler produced: nothing, or an asynchronous remainder.
///
/// Synchronous handlers return [`SideEffect::Done`]; handlers with
/// asynchronous work hand back a future via [`SideEffect::task`], which the
/// worker either forwards to the configured [`TaskCreator`] or drives to
/// completion on its own event loop.
pub enum SideEffect {
    /// The handler completed synchronously.
    Done,
    /// Asynchronous remainder of the handler.
    Task(BoxFuture),
}

impl SideEffect {
    /// Wrap a future as the asynchronous remainder of a handler.
    pub fn task(future: impl Future<Output = ()> + Send + 'static) -> Self {
        SideEffect::Task(Box::pin(future))
    }
}

impl fmt::Debug for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SideEffect::Done => f.write_str("SideEffect::Done"),
            SideEffect::Task(_) => f.write_str("SideEffect::Task(..)"),
        }
    }
}

/// A callback invoked per event variant on a worker thread.
///
/// Implement this directly when the handler is a method of a longer-lived
/// object (the usual reason to hold it weakly); plain closures go through
/// the store's `subscribe_event` / `subscribe_event_task` conveniences.
pub trait EventHandler<E>: Send + Sync + 'static {
    /// Handle one event.
    fn handle(&self, event: E) -> SideEffect;
}

/// Adapter turning a synchronous closure into an [`EventHandler`].
pub(crate) struct SyncHandler<F>(pub(crate) F);

impl<E, F> EventHandler<E> for SyncHandler<F>
where
    E: Send + 'static,
    F: Fn(E) + Send + Sync + 'static,
{
    fn handle(&self, event: E) -> SideEffect {
        (self.0)(event);
        SideEffect::Done
    }
}

/// Adapter turning a future-returning closure into an [`EventHandler`].
pub(crate) struct TaskHandler<F>(pub(crate) F);

impl<E, F> EventHandler<E> for TaskHandler<F>
where
    E: Send + 'static,
    F: Fn(E) -> BoxFuture + Send + Sync + 'static,
{
    fn handle(&self, event: E) -> SideEffect {
        SideEffect::Task((self.0)(event))
    }
}

/// Schedules futures onto an external event loop.
///
/// Workers hand asynchronous handler results here when configured; without
/// a task creator each worker drives them on its own event loop.
pub trait TaskCreator: Send + Sync + 'static {
    /// Schedule one future.
    fn create_task(&self, task: BoxFuture);
}

impl<F> TaskCreator for F
where
    F: Fn(BoxFuture) + Send + Sync + 'static,
{
    fn create_task(&self, task: BoxFuture) {
        self(task)
    }
}

/// Callback handed to a [`Scheduler`].
pub type ScheduledCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// External driver that replaces inline draining.
///
/// When a scheduler is configured, `dispatch` only enqueues; the scheduler
/// is expected to invoke the repeating callback (the store's `run`)
/// periodically. One-shot callbacks (`repeating = false`) are used for
/// auto-initialization.
pub trait Scheduler: Send + Sync + 'static {
    /// Register a callback; `repeating` distinguishes the periodic drain
    /// from one-shot work.
    fn schedule(&self, callback: ScheduledCallback, repeating: bool);
}

impl<F> Scheduler for F
where
    F: Fn(ScheduledCallback, bool) + Send + Sync + 'static,
{
    fn schedule(&self, callback: ScheduledCallback, repeating: bool) {
        self(callback, repeating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    enum TestEvent {
        Ping,
        Log(&'static str),
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    enum TestTag {
        Ping,
        Log,
    }

    impl EventTag for TestEvent {
        type Tag = TestTag;

        fn tag(&self) -> TestTag {
            match self {
                TestEvent::Ping => TestTag::Ping,
                TestEvent::Log(_) => TestTag::Log,
            }
        }
    }

    #[test]
    fn event_tags_ignore_payloads() {
        assert_eq!(TestEvent::Log("a").tag(), TestEvent::Log("b").tag());
        assert_ne!(TestEvent::Ping.tag(), TestEvent::Log("a").tag());
    }

    #[test]
    fn into_items_flattens_and_preserves_order() {
        let items: Vec<Item<u8, TestEvent>> =
            vec![Action::App(1u8), Action::App(2u8)].into_items();
        assert_eq!(
            items,
            vec![
                Item::Action(Action::App(1)),
                Item::Action(Action::App(2)),
            ]
        );

        let single: Vec<Item<u8, TestEvent>> = Event::App(TestEvent::Ping).into_items();
        assert_eq!(single, vec![Item::Event(Event::App(TestEvent::Ping))]);

        let none: Vec<Item<u8, TestEvent>> = ().into_items();
        assert!(none.is_empty());
    }

    #[test]
    fn sync_handler_adapter_reports_done() {
        let handler = SyncHandler(|_event: TestEvent| {});
        assert!(matches!(handler.handle(TestEvent::Ping), SideEffect::Done));
    }
}
