//! Startup: migrate legacy data once, restore, then hand out a ready store.

use std::sync::Arc;

use foldstore_common::{EngineConfig, PersistenceMode};
use foldstore_events::{EventLogStore, KeyValueBackend};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::error::{StartupError, StartupPhase};
use crate::middleware::{ErrorMiddleware, ThunkMiddleware, TracingReporter};
use crate::migrate::{LegacyMigrator, MigrationOutcome};
use crate::persist::{DebouncedSave, EventLogPersistence, PersistOptions};
use crate::restore::restore;
use crate::store::{Store, StoreBuilder};
use crate::traits::{ErrorReporter, Middleware, Reducer};

/// A store that finished startup, with what it took to get there.
pub struct Booted<S, E, D = ()> {
    pub store: Store<S, E, D>,
    /// Log position the restored state corresponds to.
    pub version: u64,
    pub replayed: usize,
    /// `None` when legacy migration is switched off.
    pub migration: Option<MigrationOutcome>,
}

/// Builder for the startup sequence.
///
/// The pipeline it assembles is `ErrorMiddleware`, `ThunkMiddleware`, the
/// extra middlewares in the order given, then persistence (per
/// `EngineConfig::persistence`). Every failure reported at runtime, including
/// persistence failures, goes to the one reporter.
pub struct Startup<S, E, D = ()> {
    log: EventLogStore,
    reducer: Arc<dyn Reducer<E, S>>,
    initial: Arc<S>,
    deps: D,
    config: EngineConfig,
    reporter: Arc<dyn ErrorReporter<S, E, D>>,
    middlewares: Vec<Arc<dyn Middleware<S, E, D>>>,
}

impl<S, E> Startup<S, E, ()>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        backend: impl KeyValueBackend + 'static,
        reducer: impl Reducer<E, S> + 'static,
        initial: impl Into<Arc<S>>,
    ) -> Self {
        Self::with_deps(backend, reducer, initial, ())
    }
}

impl<S, E, D> Startup<S, E, D>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    /// Like `new`, with an environment handed to deferred actions.
    pub fn with_deps(
        backend: impl KeyValueBackend + 'static,
        reducer: impl Reducer<E, S> + 'static,
        initial: impl Into<Arc<S>>,
        deps: D,
    ) -> Self {
        Self {
            log: EventLogStore::new(backend),
            reducer: Arc::new(reducer),
            initial: initial.into(),
            deps,
            config: EngineConfig::default(),
            reporter: Arc::new(TracingReporter),
            middlewares: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn reporter(mut self, reporter: impl ErrorReporter<S, E, D> + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    /// Add a middleware between the deferred-action stage and persistence.
    pub fn middleware(mut self, middleware: impl Middleware<S, E, D> + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn shared_middleware(mut self, middleware: Arc<dyn Middleware<S, E, D>>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Run startup and return the ready store.
    pub async fn run(self) -> Result<Store<S, E, D>, StartupError> {
        Ok(self.boot().await?.store)
    }

    /// Same as `run`, also returning what restore and migration did.
    pub async fn boot(self) -> Result<Booted<S, E, D>, StartupError> {
        enter(StartupPhase::Unmigrated);
        let migration = if self.config.legacy_migration {
            let migrator =
                LegacyMigrator::new(self.log.clone()).with_prefix(self.config.legacy_prefix.clone());
            let migrated = migrator
                .is_migrated()
                .await
                .map_err(StartupError::at(StartupPhase::Unmigrated))?;
            if !migrated {
                enter(StartupPhase::Migrating);
            }
            let outcome = migrator
                .run(&*self.initial)
                .await
                .map_err(StartupError::at(StartupPhase::Migrating))?;
            Some(outcome)
        } else {
            None
        };
        enter(StartupPhase::Migrated);

        enter(StartupPhase::Restoring);
        let restored = restore::<S, E, _>(&self.log, &*self.reducer, Arc::clone(&self.initial))
            .await
            .map_err(StartupError::at(StartupPhase::Restoring))?;

        let options = PersistOptions::from(&self.config);
        let mut builder = StoreBuilder::new(self.reducer, restored.state, self.deps)
            .middleware(ErrorMiddleware::shared(Arc::clone(&self.reporter)))
            .middleware(ThunkMiddleware);
        for middleware in self.middlewares {
            builder = builder.shared_middleware(middleware);
        }

        builder = match self.config.persistence {
            PersistenceMode::EventLog => builder.middleware(
                EventLogPersistence::new(self.log, self.reporter, options)
                    .starting_after(restored.version),
            ),
            PersistenceMode::Snapshot => builder.middleware(
                DebouncedSave::new(self.log, self.reporter, options)
                    .starting_after(restored.version),
            ),
            PersistenceMode::Disabled => builder,
        };

        let store = builder.build();
        enter(StartupPhase::Ready);

        Ok(Booted {
            store,
            version: restored.version,
            replayed: restored.replayed,
            migration,
        })
    }
}

fn enter(phase: StartupPhase) {
    info!(%phase, "Startup phase");
}
