#![deny(missing_docs)]

//! Reactive, event-aware state store for in-process concurrency
//!
//! A [`Store`] holds a single immutable state value and drives it through a
//! pure reducer: dispatch *actions* to transition the state, *events* to
//! trigger side effects on a worker pool, and derive values with memoized
//! *autoruns* that only recompute when their projection of the state
//! changes.
//!
//! # Quick Start
//!
//! ```ignore
//! use reduktiv::{Action, ReducerResult, Store, StoreOptions};
//!
//! #[derive(Clone, Debug, PartialEq, serde::Serialize)]
//! struct CounterState { count: i64 }
//!
//! #[derive(Clone, Debug, PartialEq)]
//! enum CounterAction { Increment(i64) }
//!
//! let store = Store::new(
//!     |state: Option<&CounterState>, action: &Action<CounterAction>| {
//!         let count = state.map_or(0, |s| s.count);
//!         match action {
//!             Action::Init => ReducerResult::state(CounterState { count: 0 }),
//!             Action::App(CounterAction::Increment(n)) => {
//!                 ReducerResult::state(CounterState { count: count + n })
//!             }
//!             _ => ReducerResult::state(CounterState { count }),
//!         }
//!     },
//!     StoreOptions::new().auto_init(true),
//! );
//!
//! // Listeners see every new state, in reducer-completion order.
//! let subscription = store.subscribe(|state: &CounterState| {
//!     println!("count = {}", state.count);
//! });
//!
//! store.dispatch(Action::App(CounterAction::Increment(3)))?;
//! subscription.unsubscribe();
//! ```
//!
//! # Core Types
//!
//! - [`Store`] - The façade: dispatch, subscriptions, autoruns, snapshots.
//! - [`Action`] / [`Event`] - The built-in `Init`/`Finish` variants around
//!   your own action and event sums. Events implement [`EventTag`] so
//!   handlers key off a variant tag.
//! - [`ReducerResult`] - A plain new state, or a state plus follow-up
//!   actions and events.
//! - [`Autorun`] / [`View`] - Change-detected, memoized derivations over
//!   the state; autoruns can be reactive, views are purely lazy.
//! - [`Subscription`] / [`EventSubscription`] - Idempotent unsubscribe
//!   handles.
//!
//! # Events and side effects
//!
//! ```ignore
//! // Handlers run off the dispatch thread, on the worker pool.
//! let subscription = store.subscribe_event(ApiEventTag::CallApi, |event: ApiEvent| {
//!     println!("calling: {event:?}");
//! });
//!
//! store.dispatch(Event::App(ApiEvent::CallApi { path: "/ping".into() }))?;
//! store.wait_for_event_handlers();
//! ```
//!
//! # Derived values
//!
//! ```ignore
//! // Reactive autorun: re-runs whenever the projected state changes.
//! let doubled = store.autorun(
//!     |state: &CounterState| state.count,
//!     AutorunOptions::new(),
//!     |count: &i64| count * 2,
//! );
//! assert_eq!(doubled.value(), Some(0));
//!
//! // View: purely lazy memoization, recomputed on demand.
//! let label = store.view(
//!     |state: &CounterState| state.count,
//!     ViewOptions::new(),
//!     |count: &i64| format!("count={count}"),
//! );
//! let current = label.call();
//! ```
//!
//! # Shutdown
//!
//! Dispatching [`Action::Finish`] reduces like any other action, then flows
//! into [`Event::Finish`]: once the queues are quiescent for the configured
//! grace period, queued side effects are joined, workers exit, registries
//! are cleared, and `on_finish` fires exactly once.

// Internal modules
mod autorun;
mod dispatch;
mod error;
mod hash;
mod middleware;
mod registry;
mod store;
mod task;
mod types;
mod with_state;
mod worker;

// Core types
pub use store::{Store, StoreOptions, DEFAULT_GRACE_TIME, DEFAULT_SIDE_EFFECT_WORKERS};
pub use types::{
    Action, BoxFuture, BoxFutureOf, Event, EventHandler, EventTag, IntoItems, Item, Reducer,
    ReducerResult, ScheduledCallback, Scheduler, SideEffect, TaskCreator,
};

// Derived values
pub use autorun::{Autorun, AutorunOptions, View, ViewOptions};
pub use task::OnceTask;
pub use with_state::WithState;

// Subscriptions and middleware
pub use middleware::MiddlewareId;
pub use registry::{EventSubscription, Subscription};

// Errors and worker customization
pub use error::StoreError;
pub use worker::SpawnFn;
