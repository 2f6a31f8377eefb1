use anyhow::Result;
use tracing::trace;

use crate::action::{Action, ActionContext, Dispatched};
use crate::store::{Next, Store};
use crate::traits::Middleware;

/// Runs `Action::Deferred` instead of forwarding it; plain events pass
/// through untouched.
///
/// The deferred action's outcome is returned as-is: `Completed` for a sync
/// action, `Pending` for a task. Anything it dispatches is queued behind the
/// current dispatch, deferred actions included.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThunkMiddleware;

impl<S, E, D> Middleware<S, E, D> for ThunkMiddleware
where
    S: Send + Sync + 'static,
    E: Send + 'static,
    D: Send + Sync + 'static,
{
    fn handle(
        &self,
        action: Action<S, E, D>,
        store: &Store<S, E, D>,
        next: &Next<S, E, D>,
    ) -> Result<Dispatched> {
        match action {
            Action::Deferred(deferred) => {
                trace!(label = deferred.label(), "Running deferred action");
                deferred.run(ActionContext::new(store.clone()))
            }
            plain => next(plain, store),
        }
    }
}
