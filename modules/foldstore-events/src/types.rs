//! Core types for the event log. Domain-agnostic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key holding the latest snapshot.
pub const SNAPSHOT_KEY: &str = "snapshot";

/// Key holding the legacy-migration sentinel (an RFC 3339 timestamp).
pub const MIGRATED_KEY: &str = "migrated";

/// Key holding the highest sequence number ever written in the current log.
/// Reads never look past it, so entries left over from an abandoned tail are
/// invisible.
pub const LOG_HEAD_KEY: &str = "event:head";

/// Key holding the highest sequence a compaction has cleared. Entries at or
/// below it are gone.
pub const LOG_TAIL_KEY: &str = "event:tail";

const EVENT_KEY_PREFIX: &str = "event:";

/// Backend key for the log entry with the given sequence number.
pub fn event_key(sequence: u64) -> String {
    format!("{EVENT_KEY_PREFIX}{sequence}")
}

/// A full state capture plus the log position it corresponds to.
///
/// `version` is the sequence number of the last event folded into `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<S> {
    pub state: S,
    pub version: u64,
}

impl<S> Snapshot<S> {
    pub fn new(state: S, version: u64) -> Self {
        Self { state, version }
    }

    /// The implicit snapshot of a log that has never been written.
    pub fn initial(state: S) -> Self {
        Self { state, version: 0 }
    }
}

/// One persisted event. The caller assigns `sequence`; the store checks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry<E> {
    pub sequence: u64,
    pub ts: DateTime<Utc>,
    pub event: E,
}

impl<E> LogEntry<E> {
    pub fn new(event: E, sequence: u64) -> Self {
        Self {
            sequence,
            ts: Utc::now(),
            event,
        }
    }
}
