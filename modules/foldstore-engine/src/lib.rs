//! Reducer-driven state store.
//!
//! `Store` holds the current state and runs every action through a
//! middleware pipeline into a pure reducer. Deferred actions, error
//! reporting and persistence are middlewares. `Startup` wires the usual
//! pipeline on top of an `EventLogStore`: legacy migration once, restore
//! from snapshot plus log, then a ready store.

pub mod action;
pub mod error;
pub mod middleware;
pub mod migrate;
pub mod persist;
pub mod restore;
pub mod startup;
pub mod store;
pub mod traits;

pub use action::{Action, ActionContext, Deferred, Dispatched, PendingTask};
pub use error::{EngineError, StartupError, StartupPhase};
pub use middleware::{ErrorMiddleware, ThunkMiddleware, TracingReporter};
pub use migrate::{LegacyMigrator, MigrationOutcome};
pub use persist::{DebouncedSave, EventLogPersistence, PersistOptions};
pub use restore::{restore, Restored};
pub use startup::{Booted, Startup};
pub use store::{Next, Store, StoreBuilder, Subscription, WeakStore};
pub use traits::{ErrorReporter, Middleware, Reducer};
