//! Rebuild state from the latest snapshot plus the log entries after it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use foldstore_events::EventLogStore;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{panic_message, EngineError};
use crate::traits::Reducer;

/// Result of a restore.
#[derive(Debug)]
pub struct Restored<S> {
    pub state: Arc<S>,
    /// Sequence number of the last event folded into `state`; new events
    /// continue after it.
    pub version: u64,
    /// Log entries applied on top of the snapshot.
    pub replayed: usize,
}

/// Load the snapshot (or start from `initial` at version 0) and fold every
/// later log entry through `reducer`, in sequence order.
///
/// Replay stops at the first missing entry. A snapshot or entry that exists
/// but cannot be decoded fails the restore.
pub async fn restore<S, E, R>(
    log: &EventLogStore,
    reducer: &R,
    initial: Arc<S>,
) -> Result<Restored<S>, EngineError>
where
    S: DeserializeOwned,
    E: DeserializeOwned,
    R: Reducer<E, S> + ?Sized,
{
    let (mut state, version) = match log.load_snapshot::<S>().await? {
        Some(snapshot) => {
            debug!(version = snapshot.version, "Loaded snapshot");
            (Arc::new(snapshot.state), snapshot.version)
        }
        None => {
            debug!("No snapshot stored, starting from initial state");
            (initial, 0)
        }
    };

    let entries = log.load_events_since::<E>(version).await?;
    let replayed = entries.len();
    let mut version = version;

    for entry in entries {
        let current = state;
        state = panic::catch_unwind(AssertUnwindSafe(|| reducer.reduce(&current, &entry.event)))
            .map_err(|payload| EngineError::ReplayPanicked {
                sequence: entry.sequence,
                message: panic_message(&*payload),
            })?;
        version = entry.sequence;
    }

    info!(version, replayed, "State restored");
    Ok(Restored {
        state,
        version,
        replayed,
    })
}
