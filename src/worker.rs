//! Side-effect worker pool.
//!
//! Event handlers never run on the dispatch thread. The drain loop pushes
//! `(handler, event)` pairs onto a shared [`WorkQueue`]; a pool of OS
//! threads drains it. Each worker owns a single current-thread tokio
//! runtime for its whole lifetime: synchronous handlers run inline,
//! asynchronous handler results are either forwarded to the configured
//! task creator or driven to completion on the worker's own runtime.
//!
//! A queued `None` is a sentinel: the worker that dequeues it exits. The
//! queue keeps an unfinished-work count so [`WorkQueue::join`] can wait for
//! in-flight handlers, not just for the queue to look empty.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::registry::Holder;
use crate::types::{EventHandler, EventTag, SideEffect, TaskCreator};

/// One unit of side-effect work: a handler reference and the event it
/// should receive. Weak handlers are dereferenced at dequeue time.
pub(crate) type WorkItem<E> = (Holder<dyn EventHandler<E>>, E);

struct QueueInner<E> {
    items: VecDeque<Option<WorkItem<E>>>,
    /// Queued plus in-flight entries, sentinels included.
    unfinished: usize,
}

/// Unbounded blocking FIFO shared between the dispatch thread and workers.
pub(crate) struct WorkQueue<E> {
    inner: Mutex<QueueInner<E>>,
    /// Signaled when an entry is pushed.
    ready: Condvar,
    /// Signaled when the unfinished count reaches zero.
    idle: Condvar,
}

impl<E> WorkQueue<E> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                unfinished: 0,
            }),
            ready: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    /// Enqueue a work item, or a `None` sentinel to stop one worker.
    pub(crate) fn push(&self, entry: Option<WorkItem<E>>) {
        let mut inner = self.inner.lock();
        inner.items.push_back(entry);
        inner.unfinished += 1;
        self.ready.notify_one();
    }

    /// Block until an entry is available and dequeue it.
    ///
    /// The entry counts as unfinished until the caller acknowledges it with
    /// [`task_done`](Self::task_done).
    fn pop(&self) -> Option<WorkItem<E>> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(entry) = inner.items.pop_front() {
                return entry;
            }
            self.ready.wait(&mut inner);
        }
    }

    /// Acknowledge completion of one dequeued entry.
    fn task_done(&self) {
        let mut inner = self.inner.lock();
        inner.unfinished = inner.unfinished.saturating_sub(1);
        if inner.unfinished == 0 {
            self.idle.notify_all();
        }
    }

    /// Block until every queued entry has been dequeued and acknowledged.
    pub(crate) fn join(&self) {
        let mut inner = self.inner.lock();
        while inner.unfinished > 0 {
            self.idle.wait(&mut inner);
        }
    }

    /// Whether the queue currently holds no entries. In-flight work does
    /// not count; the shutdown waiter pairs this with the grace period.
    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    #[cfg(test)]
    fn unfinished(&self) -> usize {
        self.inner.lock().unfinished
    }
}

/// Custom thread-spawning hook, mirroring the builder hooks used elsewhere
/// in the options surface. Lets callers set thread names, stack sizes, or
/// priorities for the workers.
pub type SpawnFn = Box<dyn Fn(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send + Sync>;

/// Pool of side-effect workers draining a shared [`WorkQueue`].
pub(crate) struct SideEffectPool<E: EventTag> {
    queue: Arc<WorkQueue<E>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl<E: EventTag> SideEffectPool<E> {
    /// Launch `worker_count` workers (at least one) draining `queue`.
    pub(crate) fn start(
        queue: Arc<WorkQueue<E>>,
        worker_count: usize,
        task_creator: Option<Arc<dyn TaskCreator>>,
        spawn_fn: Option<&SpawnFn>,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let queue = Arc::clone(&queue);
            let task_creator = task_creator.clone();
            let body: Box<dyn FnOnce() + Send> = Box::new(move || {
                worker_loop(worker_index, &queue, task_creator.as_deref());
            });
            let handle = match spawn_fn {
                Some(spawn) => spawn(body),
                None => thread::spawn(body),
            };
            handles.push(handle);
        }
        Self {
            queue,
            handles: Mutex::new(handles),
            worker_count,
        }
    }

    /// Inject one sentinel per worker, requesting each to exit once the
    /// work queued ahead of the sentinel is done.
    pub(crate) fn request_stop(&self) {
        for _ in 0..self.worker_count {
            self.queue.push(None);
        }
    }

    /// Wait for every worker thread to exit.
    pub(crate) fn join(&self) {
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }

    /// Whether any worker thread is still running.
    #[cfg(test)]
    fn has_live_workers(&self) -> bool {
        self.handles
            .lock()
            .iter()
            .any(|handle| !handle.is_finished())
    }
}

fn worker_loop<E: EventTag>(
    worker_index: usize,
    queue: &WorkQueue<E>,
    task_creator: Option<&dyn TaskCreator>,
) {
    // The worker's private event loop, alive for the whole worker lifetime.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => Some(runtime),
        Err(err) => {
            error!(worker_index, %err, "failed to build worker runtime");
            None
        }
    };

    loop {
        let Some((handler, event)) = queue.pop() else {
            // Sentinel: this worker is done.
            queue.task_done();
            break;
        };
        let Some(handler) = handler.resolve() else {
            // Weakly held handler whose target is gone: drop the item.
            queue.task_done();
            continue;
        };

        let tag = event.tag();
        match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
            Ok(SideEffect::Done) => {}
            Ok(SideEffect::Task(task)) => {
                if let Some(creator) = task_creator {
                    creator.create_task(task);
                } else if let Some(runtime) = &runtime {
                    if catch_unwind(AssertUnwindSafe(|| runtime.block_on(task))).is_err() {
                        error!(worker_index, ?tag, "event handler task panicked");
                    }
                } else {
                    error!(worker_index, ?tag, "no runtime to drive handler task");
                }
            }
            Err(_) => {
                // Contained: the handler failed, the worker lives on.
                error!(worker_index, ?tag, "event handler panicked");
            }
        }
        queue.task_done();
    }

    debug!(worker_index, "side-effect worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SyncHandler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq)]
    struct Ping(u32);

    impl EventTag for Ping {
        type Tag = &'static str;

        fn tag(&self) -> &'static str {
            "ping"
        }
    }

    fn strong_handler(counter: &Arc<AtomicUsize>) -> Holder<dyn EventHandler<Ping>> {
        let counter = Arc::clone(counter);
        Holder::Strong(Arc::new(SyncHandler(move |event: Ping| {
            counter.fetch_add(event.0 as usize, Ordering::Relaxed);
        })))
    }

    #[test]
    fn workers_run_handlers_and_join_waits_for_them() {
        let queue = Arc::new(WorkQueue::new());
        let pool = SideEffectPool::start(Arc::clone(&queue), 2, None, None);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            queue.push(Some((strong_handler(&counter), Ping(1))));
        }
        queue.join();
        assert_eq!(counter.load(Ordering::Relaxed), 10);

        pool.request_stop();
        pool.join();
        assert!(!pool.has_live_workers());
        assert_eq!(queue.unfinished(), 0);
    }

    #[test]
    fn sentinel_stops_exactly_one_worker() {
        let queue = Arc::new(WorkQueue::new());
        let pool = SideEffectPool::start(Arc::clone(&queue), 2, None, None);
        let counter = Arc::new(AtomicUsize::new(0));

        queue.push(None);
        // Give one worker time to consume the sentinel.
        thread::sleep(Duration::from_millis(50));

        // The surviving worker still processes work.
        queue.push(Some((strong_handler(&counter), Ping(5))));
        queue.join();
        assert_eq!(counter.load(Ordering::Relaxed), 5);

        pool.request_stop();
        pool.join();
    }

    #[test]
    fn collected_weak_handler_is_dropped_silently() {
        let queue = Arc::new(WorkQueue::new());
        let pool = SideEffectPool::start(Arc::clone(&queue), 1, None, None);
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_in_handler = Arc::clone(&counter);
        let handler: Arc<dyn EventHandler<Ping>> =
            Arc::new(SyncHandler(move |_event: Ping| {
                counter_in_handler.fetch_add(1, Ordering::Relaxed);
            }));
        let weak: Holder<dyn EventHandler<Ping>> = Holder::Weak(Arc::downgrade(&handler));
        drop(handler);

        queue.push(Some((weak, Ping(1))));
        queue.join();
        assert_eq!(counter.load(Ordering::Relaxed), 0);

        pool.request_stop();
        pool.join();
    }

    #[test]
    fn handler_panic_is_contained() {
        let queue = Arc::new(WorkQueue::new());
        let pool = SideEffectPool::start(Arc::clone(&queue), 1, None, None);
        let counter = Arc::new(AtomicUsize::new(0));

        let panicking: Holder<dyn EventHandler<Ping>> =
            Holder::Strong(Arc::new(SyncHandler(|_event: Ping| {
                panic!("handler failure");
            })));
        queue.push(Some((panicking, Ping(1))));
        // The worker survives and handles the next item.
        queue.push(Some((strong_handler(&counter), Ping(2))));
        queue.join();
        assert_eq!(counter.load(Ordering::Relaxed), 2);

        pool.request_stop();
        pool.join();
    }

    #[test]
    fn async_handler_runs_on_worker_event_loop() {
        let queue = Arc::new(WorkQueue::new());
        let pool = SideEffectPool::start(Arc::clone(&queue), 1, None, None);
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_in_handler = Arc::clone(&counter);
        let handler: Holder<dyn EventHandler<Ping>> =
            Holder::Strong(Arc::new(crate::types::TaskHandler(move |event: Ping| {
                let counter = Arc::clone(&counter_in_handler);
                let task: crate::types::BoxFuture = Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    counter.fetch_add(event.0 as usize, Ordering::Relaxed);
                });
                task
            })));
        queue.push(Some((handler, Ping(3))));
        queue.join();
        assert_eq!(counter.load(Ordering::Relaxed), 3);

        pool.request_stop();
        pool.join();
    }

    #[test]
    fn task_creator_receives_async_results() {
        let queue = Arc::new(WorkQueue::new());
        let scheduled = Arc::new(AtomicUsize::new(0));

        let scheduled_in_creator = Arc::clone(&scheduled);
        let creator: Arc<dyn TaskCreator> = Arc::new(move |_task: crate::types::BoxFuture| {
            scheduled_in_creator.fetch_add(1, Ordering::Relaxed);
        });
        let pool = SideEffectPool::start(Arc::clone(&queue), 1, Some(creator), None);

        let handler: Holder<dyn EventHandler<Ping>> =
            Holder::Strong(Arc::new(crate::types::TaskHandler(|_event: Ping| {
                let task: crate::types::BoxFuture = Box::pin(async {});
                task
            })));
        queue.push(Some((handler, Ping(1))));
        queue.join();
        assert_eq!(scheduled.load(Ordering::Relaxed), 1);

        pool.request_stop();
        pool.join();
    }
}
