//! Core traits for the store.

use std::sync::Arc;

use anyhow::Result;

use crate::action::{Action, Dispatched};
use crate::store::{Next, Store};

/// Pure state transition. No I/O, no side effects.
///
/// Must be total and deterministic: replay feeds it the same events again at
/// the next startup and expects the same result. Return `state` itself
/// (the same `Arc`) when the event does not apply; subscribers are only
/// notified when the returned pointer differs.
pub trait Reducer<E, S>: Send + Sync {
    fn reduce(&self, state: &Arc<S>, event: &E) -> Arc<S>;
}

impl<E, S, F> Reducer<E, S> for F
where
    F: Fn(&Arc<S>, &E) -> Arc<S> + Send + Sync,
{
    fn reduce(&self, state: &Arc<S>, event: &E) -> Arc<S> {
        self(state, event)
    }
}

/// Interceptor around dispatch.
///
/// Call `next(action, store)` to continue down the chain, possibly with a
/// different action. Not calling it suppresses the action; return
/// `Dispatched::Suppressed` in that case.
pub trait Middleware<S, E, D>: Send + Sync {
    fn handle(
        &self,
        action: Action<S, E, D>,
        store: &Store<S, E, D>,
        next: &Next<S, E, D>,
    ) -> Result<Dispatched>;
}

impl<S, E, D, F> Middleware<S, E, D> for F
where
    F: Fn(Action<S, E, D>, &Store<S, E, D>, &Next<S, E, D>) -> Result<Dispatched> + Send + Sync,
{
    fn handle(
        &self,
        action: Action<S, E, D>,
        store: &Store<S, E, D>,
        next: &Next<S, E, D>,
    ) -> Result<Dispatched> {
        self(action, store, next)
    }
}

/// Sink for every failure that happens during or after a dispatch.
///
/// Gets the store so it can dispatch a follow-up event (e.g. a transient
/// error notification). Such dispatches are queued behind the current one.
pub trait ErrorReporter<S, E, D>: Send + Sync {
    fn report(&self, error: &anyhow::Error, store: &Store<S, E, D>);
}

impl<S, E, D, F> ErrorReporter<S, E, D> for F
where
    F: Fn(&anyhow::Error, &Store<S, E, D>) + Send + Sync,
{
    fn report(&self, error: &anyhow::Error, store: &Store<S, E, D>) {
        self(error, store)
    }
}
