//! What goes into `dispatch`, and what comes out of the pipeline.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::store::Store;

/// Asynchronous remainder of a dispatch. Spawned by the store; an `Err` is
/// reported, never returned to the caller of `dispatch`.
pub type PendingTask = BoxFuture<'static, anyhow::Result<()>>;

/// Input to `Store::dispatch`.
///
/// Plain events go to the reducer. Deferred actions are executed by
/// `ThunkMiddleware` instead; they never reach the reducer.
pub enum Action<S, E, D = ()> {
    Plain(E),
    Deferred(Deferred<S, E, D>),
}

impl<S, E, D> Action<S, E, D> {
    pub fn plain(event: E) -> Self {
        Self::Plain(event)
    }

    /// The event, if this is a plain action.
    pub fn event(&self) -> Option<&E> {
        match self {
            Self::Plain(event) => Some(event),
            Self::Deferred(_) => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}

impl<S, E: fmt::Debug, D> fmt::Debug for Action<S, E, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(event) => f.debug_tuple("Plain").field(event).finish(),
            Self::Deferred(deferred) => f.debug_tuple("Deferred").field(&deferred.label).finish(),
        }
    }
}

/// How a dispatch ended, as seen from one point in the pipeline.
pub enum Dispatched {
    /// The reducer ran. `changed` is false when it returned the same state.
    Reduced { changed: bool },
    /// A deferred action ran to completion synchronously.
    Completed,
    /// A middleware stopped the action, or a failure was reported and
    /// swallowed.
    Suppressed,
    /// Work continues in the background.
    Pending(PendingTask),
}

impl Dispatched {
    pub fn is_reduced(&self) -> bool {
        matches!(self, Self::Reduced { .. })
    }
}

impl fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reduced { changed } => f.debug_struct("Reduced").field("changed", changed).finish(),
            Self::Completed => f.write_str("Completed"),
            Self::Suppressed => f.write_str("Suppressed"),
            Self::Pending(_) => f.write_str("Pending"),
        }
    }
}

type DeferredFn<S, E, D> =
    Box<dyn FnOnce(ActionContext<S, E, D>) -> anyhow::Result<Dispatched> + Send>;

/// A computation standing in for an event.
pub struct Deferred<S, E, D = ()> {
    label: &'static str,
    run: DeferredFn<S, E, D>,
}

impl<S, E, D> Deferred<S, E, D> {
    /// Runs inline during dispatch.
    pub fn sync<F>(label: &'static str, f: F) -> Self
    where
        F: FnOnce(ActionContext<S, E, D>) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            label,
            run: Box::new(move |ctx| {
                f(ctx)?;
                Ok(Dispatched::Completed)
            }),
        }
    }

    /// Produces a future; dispatch returns before it resolves.
    ///
    /// There is no cancellation. A task that may finish after its result
    /// went stale should compare against state it captured up front before
    /// dispatching the follow-up.
    pub fn task<F, Fut>(label: &'static str, f: F) -> Self
    where
        F: FnOnce(ActionContext<S, E, D>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            label,
            run: Box::new(move |ctx| Ok(Dispatched::Pending(Box::pin(f(ctx))))),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn run(self, ctx: ActionContext<S, E, D>) -> anyhow::Result<Dispatched> {
        (self.run)(ctx)
    }
}

impl<S, E, D> From<Deferred<S, E, D>> for Action<S, E, D> {
    fn from(deferred: Deferred<S, E, D>) -> Self {
        Self::Deferred(deferred)
    }
}

/// What a deferred action gets to work with: dispatch, read, and the
/// application's environment (`D`: API clients, credentials, routing
/// handle, selectors).
pub struct ActionContext<S, E, D = ()> {
    store: Store<S, E, D>,
}

impl<S, E, D> ActionContext<S, E, D>
where
    S: Send + Sync + 'static,
    E: Send + 'static,
    D: Send + Sync + 'static,
{
    pub(crate) fn new(store: Store<S, E, D>) -> Self {
        Self { store }
    }

    pub fn dispatch(&self, action: impl Into<Action<S, E, D>>) {
        self.store.dispatch(action.into());
    }

    pub fn dispatch_event(&self, event: E) {
        self.store.dispatch(Action::Plain(event));
    }

    pub fn get_state(&self) -> Arc<S> {
        self.store.get_state()
    }

    pub fn deps(&self) -> &Arc<D> {
        self.store.deps()
    }

    pub fn store(&self) -> &Store<S, E, D> {
        &self.store
    }
}
