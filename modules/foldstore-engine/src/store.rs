//! The store: current state, subscribers, and the dispatch loop.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::Result;
use arc_swap::ArcSwap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, trace};

use crate::action::{Action, Dispatched};
use crate::error::{panic_message, EngineError};
use crate::traits::{Middleware, Reducer};

/// The remainder of the pipeline, as handed to a middleware.
pub type Next<S, E, D> =
    dyn Fn(Action<S, E, D>, &Store<S, E, D>) -> Result<Dispatched> + Send + Sync;

type Subscriber<S> = Arc<dyn Fn(&Arc<S>) + Send + Sync>;
type Subscribers<S> = Mutex<Vec<(u64, Subscriber<S>)>>;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Owns the current state and the single entry point that changes it.
///
/// Cheap to clone; clones are the same store. Build one at startup and pass
/// it (or a `WeakStore`) to whatever needs to read or dispatch.
///
/// Dispatch → pipeline → reduce → swap state → notify, one action at a
/// time. A dispatch issued while another is being processed (from a
/// subscriber, a middleware, a deferred action, or another thread) is
/// queued and runs after the current one finishes, so every event ever
/// applied has a place in a single total order.
pub struct Store<S, E, D = ()> {
    inner: Arc<Inner<S, E, D>>,
}

impl<S, E, D> Clone for Store<S, E, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S, E, D> {
    state: ArcSwap<S>,
    reducer: Arc<dyn Reducer<E, S>>,
    pipeline: Arc<Next<S, E, D>>,
    subscribers: Arc<Subscribers<S>>,
    next_subscriber: AtomicU64,
    queue: Mutex<DispatchQueue<S, E, D>>,
    deps: Arc<D>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    runtime: Option<Handle>,
}

struct DispatchQueue<S, E, D> {
    actions: VecDeque<Action<S, E, D>>,
    draining: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S, E> Store<S, E, ()>
where
    S: Send + Sync + 'static,
    E: Send + 'static,
{
    /// Builder for a store with no environment.
    pub fn builder(
        reducer: impl Reducer<E, S> + 'static,
        state: impl Into<Arc<S>>,
    ) -> StoreBuilder<S, E, ()> {
        StoreBuilder::new(Arc::new(reducer), state, ())
    }
}

impl<S, E, D> Store<S, E, D>
where
    S: Send + Sync + 'static,
    E: Send + 'static,
    D: Send + Sync + 'static,
{
    /// Queue `action` and, unless a dispatch is already in progress, process
    /// the queue until it is empty.
    ///
    /// Never returns an error and never unwinds: failures go to the error
    /// middleware's reporter, or to the log when none is installed.
    pub fn dispatch(&self, action: Action<S, E, D>) {
        {
            let mut queue = lock(&self.inner.queue);
            queue.actions.push_back(action);
            if queue.draining {
                trace!(queued = queue.actions.len(), "Dispatch queued behind the current one");
                return;
            }
            queue.draining = true;
        }
        self.drain();
    }

    /// Shorthand for `dispatch(Action::Plain(event))`.
    pub fn dispatch_event(&self, event: E) {
        self.dispatch(Action::Plain(event));
    }

    /// The current state. Never blocks.
    pub fn get_state(&self) -> Arc<S> {
        self.inner.state.load_full()
    }

    /// Register a callback for every state change. Registering the same
    /// callback twice yields two independent subscriptions.
    pub fn subscribe<F>(&self, callback: F) -> Subscription<S>
    where
        F: Fn(&Arc<S>) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let callback: Subscriber<S> = Arc::new(callback);
        lock(&self.inner.subscribers).push((id, callback));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.inner.subscribers),
        }
    }

    /// Force-set the state without the reducer and notify subscribers.
    /// Meant for hydration before the store is handed out.
    ///
    /// Events dispatched by subscribers during the notification are queued
    /// until every subscriber has seen the replaced state.
    pub fn replace_state(&self, state: impl Into<Arc<S>>) {
        let state = state.into();
        let nested = {
            let mut queue = lock(&self.inner.queue);
            std::mem::replace(&mut queue.draining, true)
        };
        self.inner.state.store(Arc::clone(&state));
        self.notify(&state);
        if !nested {
            self.drain();
        }
    }

    pub fn deps(&self) -> &Arc<D> {
        &self.inner.deps
    }

    pub fn reducer(&self) -> &Arc<dyn Reducer<E, S>> {
        &self.inner.reducer
    }

    pub fn downgrade(&self) -> WeakStore<S, E, D> {
        WeakStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Run `task` in the background, tracked so `settle` can wait for it.
    /// Returns false (and drops the task) when no tokio runtime is reachable.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = self.inner.runtime.clone().or_else(|| Handle::try_current().ok());
        let Some(runtime) = runtime else {
            error!("No tokio runtime available, dropping background task");
            return false;
        };

        let handle = runtime.spawn(task);
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        true
    }

    /// Wait until every background task (deferred actions, persistence
    /// writes), including ones spawned while waiting, has finished.
    pub async fn settle(&self) {
        loop {
            let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    error!(error = %e, "Background task did not complete");
                }
            }
        }
    }

    fn drain(&self) {
        loop {
            let action = {
                let mut queue = lock(&self.inner.queue);
                match queue.actions.pop_front() {
                    Some(action) => action,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            self.process(action);
        }
    }

    fn process(&self, action: Action<S, E, D>) {
        let pipeline = Arc::clone(&self.inner.pipeline);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| pipeline(action, self)))
            .unwrap_or_else(|payload| {
                Err(EngineError::MiddlewarePanicked(panic_message(&*payload)).into())
            });

        match outcome {
            Ok(Dispatched::Pending(task)) => {
                self.spawn(async move {
                    if let Err(e) = task.await {
                        error!(error = %e, "Deferred action failed with no error middleware installed");
                    }
                });
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Dispatch failed with no error middleware installed"),
        }
    }

    /// Terminal stage of the pipeline.
    fn reduce(&self, action: Action<S, E, D>) -> Result<Dispatched> {
        let event = match action {
            Action::Plain(event) => event,
            Action::Deferred(_) => return Err(EngineError::UnhandledDeferred.into()),
        };

        let current = self.inner.state.load_full();
        let reducer = &self.inner.reducer;
        let next = panic::catch_unwind(AssertUnwindSafe(|| reducer.reduce(&current, &event)))
            .map_err(|payload| EngineError::ReducerPanicked(panic_message(&*payload)))?;

        if Arc::ptr_eq(&current, &next) {
            return Ok(Dispatched::Reduced { changed: false });
        }

        self.inner.state.store(Arc::clone(&next));
        self.notify(&next);
        Ok(Dispatched::Reduced { changed: true })
    }

    fn notify(&self, state: &Arc<S>) {
        // Snapshot the list so callbacks may subscribe or unsubscribe.
        let subscribers: Vec<Subscriber<S>> = lock(&self.inner.subscribers)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in subscribers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(state))) {
                error!(panic = %panic_message(&*payload), "Subscriber panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StoreBuilder
// ---------------------------------------------------------------------------

/// Assembles a store. The middleware list is fixed once `build` runs.
pub struct StoreBuilder<S, E, D = ()> {
    reducer: Arc<dyn Reducer<E, S>>,
    state: Arc<S>,
    deps: Arc<D>,
    middlewares: Vec<Arc<dyn Middleware<S, E, D>>>,
    runtime: Option<Handle>,
}

impl<S, E, D> StoreBuilder<S, E, D>
where
    S: Send + Sync + 'static,
    E: Send + 'static,
    D: Send + Sync + 'static,
{
    pub fn new(reducer: Arc<dyn Reducer<E, S>>, state: impl Into<Arc<S>>, deps: D) -> Self {
        Self {
            reducer,
            state: state.into(),
            deps: Arc::new(deps),
            middlewares: Vec::new(),
            runtime: None,
        }
    }

    /// Append a middleware. The first one added sees every action first.
    pub fn middleware(self, middleware: impl Middleware<S, E, D> + 'static) -> Self {
        self.shared_middleware(Arc::new(middleware))
    }

    /// Append a middleware the caller keeps a handle on.
    pub fn shared_middleware(mut self, middleware: Arc<dyn Middleware<S, E, D>>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Runtime for background tasks. Defaults to the runtime `build` is
    /// called on, if any.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Store<S, E, D> {
        let runtime = self.runtime.or_else(|| Handle::try_current().ok());
        Store {
            inner: Arc::new(Inner {
                state: ArcSwap::new(self.state),
                reducer: self.reducer,
                pipeline: compose(self.middlewares),
                subscribers: Arc::new(Mutex::new(Vec::new())),
                next_subscriber: AtomicU64::new(0),
                queue: Mutex::new(DispatchQueue {
                    actions: VecDeque::new(),
                    draining: false,
                }),
                deps: self.deps,
                tasks: Mutex::new(Vec::new()),
                runtime,
            }),
        }
    }
}

/// Fold the middlewares right-to-left around the reducer, so the first in
/// the list ends up outermost.
fn compose<S, E, D>(middlewares: Vec<Arc<dyn Middleware<S, E, D>>>) -> Arc<Next<S, E, D>>
where
    S: Send + Sync + 'static,
    E: Send + 'static,
    D: Send + Sync + 'static,
{
    let terminal: Arc<Next<S, E, D>> =
        Arc::new(|action: Action<S, E, D>, store: &Store<S, E, D>| store.reduce(action));

    middlewares
        .into_iter()
        .rev()
        .fold(terminal, |next, middleware| {
            let wrapped: Arc<Next<S, E, D>> =
                Arc::new(move |action: Action<S, E, D>, store: &Store<S, E, D>| {
                    middleware.handle(action, store, &*next)
                });
            wrapped
        })
}

// ---------------------------------------------------------------------------
// Subscription / WeakStore
// ---------------------------------------------------------------------------

/// Handle for one `subscribe` call. Dropping it does not unsubscribe.
pub struct Subscription<S> {
    id: u64,
    subscribers: Weak<Subscribers<S>>,
}

impl<S> Subscription<S> {
    /// Stop receiving notifications. Safe to call more than once, and after
    /// the store is gone.
    pub fn unsubscribe(&self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            lock(&subscribers).retain(|(id, _)| *id != self.id);
        }
    }
}

/// Non-owning store handle, for subscribers and long-lived tasks that must
/// not keep the store alive.
pub struct WeakStore<S, E, D = ()> {
    inner: Weak<Inner<S, E, D>>,
}

impl<S, E, D> Clone for WeakStore<S, E, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<S, E, D> WeakStore<S, E, D> {
    pub fn upgrade(&self) -> Option<Store<S, E, D>> {
        self.inner.upgrade().map(|inner| Store { inner })
    }
}
