//! Typed errors for dispatch, replay and startup.

use std::any::Any;
use std::fmt;

use foldstore_events::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The reducer panicked. State stays at its pre-dispatch value.
    #[error("reducer panicked: {0}")]
    ReducerPanicked(String),

    #[error("middleware panicked: {0}")]
    MiddlewarePanicked(String),

    #[error("deferred action panicked: {0}")]
    DeferredPanicked(String),

    /// A deferred action fell through the whole pipeline.
    #[error("deferred action reached the reducer; is ThunkMiddleware installed?")]
    UnhandledDeferred,

    #[error("replay panicked at sequence {sequence}: {message}")]
    ReplayPanicked { sequence: u64, message: String },

    #[error("state must serialize to a JSON object of slices")]
    StateShape,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Where startup was when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    Unmigrated,
    Migrating,
    Migrated,
    Restoring,
    Ready,
}

impl fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unmigrated => "unmigrated",
            Self::Migrating => "migrating",
            Self::Migrated => "migrated",
            Self::Restoring => "restoring",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Fatal startup failure. Callers render this as a blocking error rather
/// than carrying on with empty state.
#[derive(Debug, Error)]
#[error("startup failed while {phase}: {source}")]
pub struct StartupError {
    pub phase: StartupPhase,
    #[source]
    pub source: EngineError,
}

impl StartupError {
    pub(crate) fn at(phase: StartupPhase) -> impl FnOnce(EngineError) -> Self {
        move |source| Self { phase, source }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
