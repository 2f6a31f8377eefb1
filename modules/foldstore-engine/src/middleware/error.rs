use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use tracing::error;

use crate::action::{Action, Dispatched};
use crate::error::{panic_message, EngineError};
use crate::store::{Next, Store};
use crate::traits::{ErrorReporter, Middleware};

/// Catches whatever goes wrong further down the chain and hands it to the
/// reporter, exactly once per failing dispatch.
///
/// Covers `Err` returns, panics (middleware or reducer), and failures of a
/// pending task once it resolves. After reporting, the failure is handled:
/// the dispatch ends as `Suppressed` and later dispatches run normally.
///
/// Register it first so it wraps everything else.
pub struct ErrorMiddleware<S, E, D = ()> {
    reporter: Arc<dyn ErrorReporter<S, E, D>>,
}

impl<S, E, D> ErrorMiddleware<S, E, D> {
    pub fn new(reporter: impl ErrorReporter<S, E, D> + 'static) -> Self {
        Self {
            reporter: Arc::new(reporter),
        }
    }

    pub fn shared(reporter: Arc<dyn ErrorReporter<S, E, D>>) -> Self {
        Self { reporter }
    }
}

impl<S, E, D> Middleware<S, E, D> for ErrorMiddleware<S, E, D>
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
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| next(action, store)))
            .unwrap_or_else(|payload| {
                Err(EngineError::MiddlewarePanicked(panic_message(&*payload)).into())
            });

        match outcome {
            Ok(Dispatched::Pending(task)) => {
                let reporter = Arc::clone(&self.reporter);
                let store = store.clone();
                Ok(Dispatched::Pending(Box::pin(async move {
                    let result = AssertUnwindSafe(task)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| {
                            Err(EngineError::DeferredPanicked(panic_message(&*payload)).into())
                        });
                    if let Err(e) = result {
                        reporter.report(&e, &store);
                    }
                    Ok::<(), anyhow::Error>(())
                })))
            }
            Ok(done) => Ok(done),
            Err(e) => {
                self.reporter.report(&e, store);
                Ok(Dispatched::Suppressed)
            }
        }
    }
}

/// Default reporter: logs the error chain and carries on.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl<S, E, D> ErrorReporter<S, E, D> for TracingReporter {
    fn report(&self, error: &anyhow::Error, _store: &Store<S, E, D>) {
        let chain = format!("{error:#}");
        error!(error = %chain, "Dispatch failed");
    }
}
