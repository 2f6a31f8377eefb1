//! EventLogStore: append-only event log plus latest snapshot, over any
//! `KeyValueBackend`.
//!
//! Gap-free reads are guaranteed here. Consumers never see a log with holes:
//! a read stops at the first missing sequence and returns what precedes it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::backend::KeyValueBackend;
use crate::error::{Result, StoreError};
use crate::types::{
    event_key, LogEntry, Snapshot, LOG_HEAD_KEY, LOG_TAIL_KEY, MIGRATED_KEY, SNAPSHOT_KEY,
};

/// How many entries a replay or compaction pulls per backend round trip.
const READ_BATCH: u64 = 64;

// ---------------------------------------------------------------------------
// EventLogStore
// ---------------------------------------------------------------------------

/// Event log and snapshot store. Cheap to clone; clones share the backend.
///
/// Writes are never retried here. A failed write surfaces as `Err` and the
/// caller decides what to do about it.
#[derive(Clone)]
pub struct EventLogStore {
    backend: Arc<dyn KeyValueBackend>,
}

impl EventLogStore {
    pub fn new(backend: impl KeyValueBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn from_shared(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    /// The underlying backend, for callers that read keys outside the log
    /// layout (legacy migration).
    pub fn backend(&self) -> &Arc<dyn KeyValueBackend> {
        &self.backend
    }

    // -- snapshots -----------------------------------------------------------

    /// Replace the stored snapshot.
    ///
    /// Rejects a snapshot older than the one already stored, so snapshot
    /// versions never go backwards.
    pub async fn save_snapshot<S: Serialize>(&self, snapshot: &Snapshot<S>) -> Result<()> {
        if let Some(current) = self.snapshot_version().await? {
            if snapshot.version < current {
                return Err(StoreError::StaleSnapshot {
                    current,
                    attempted: snapshot.version,
                });
            }
        }

        let value = serde_json::to_value(snapshot)?;
        self.backend.set(SNAPSHOT_KEY, value).await?;
        debug!(version = snapshot.version, "Snapshot saved");
        Ok(())
    }

    /// The latest snapshot, or `None` if none was ever written.
    pub async fn load_snapshot<S: DeserializeOwned>(&self) -> Result<Option<Snapshot<S>>> {
        let Some(value) = self.backend.get(SNAPSHOT_KEY).await? else {
            return Ok(None);
        };
        let snapshot =
            serde_json::from_value(value).map_err(|e| StoreError::corrupt(SNAPSHOT_KEY, e))?;
        Ok(Some(snapshot))
    }

    /// Version of the stored snapshot without decoding its state.
    pub async fn snapshot_version(&self) -> Result<Option<u64>> {
        let Some(value) = self.backend.get(SNAPSHOT_KEY).await? else {
            return Ok(None);
        };
        value
            .get("version")
            .and_then(Value::as_u64)
            .map(Some)
            .ok_or_else(|| StoreError::corrupt(SNAPSHOT_KEY, "missing numeric version"))
    }

    // -- log entries ---------------------------------------------------------

    /// Append one entry.
    pub async fn append_event<E: Serialize>(&self, entry: &LogEntry<E>) -> Result<()> {
        self.append_events(std::slice::from_ref(entry)).await
    }

    /// Append a batch of consecutive entries and advance the head marker to
    /// the last of them, in one `set_all` call.
    pub async fn append_events<E: Serialize>(&self, entries: &[LogEntry<E>]) -> Result<()> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(());
        };

        let mut batch = Vec::with_capacity(entries.len() + 1);
        let mut expected = first.sequence;
        for entry in entries {
            if entry.sequence != expected {
                return Err(StoreError::OutOfOrder {
                    expected,
                    actual: entry.sequence,
                });
            }
            expected += 1;
            batch.push((event_key(entry.sequence), serde_json::to_value(entry)?));
        }
        batch.push((LOG_HEAD_KEY.to_string(), json!(last.sequence)));

        self.backend.set_all(batch).await?;
        debug!(first = first.sequence, last = last.sequence, "Appended log entries");
        Ok(())
    }

    /// Highest sequence number written to the current log, if any.
    pub async fn log_head(&self) -> Result<Option<u64>> {
        let Some(value) = self.backend.get(LOG_HEAD_KEY).await? else {
            return Ok(None);
        };
        value
            .as_u64()
            .map(Some)
            .ok_or_else(|| StoreError::corrupt(LOG_HEAD_KEY, "head is not a sequence number"))
    }

    /// Entries with `sequence > after`, ascending.
    ///
    /// **Gap-free guarantee:** if an entry below the head is missing (a batch
    /// that failed to write), this returns only the entries before the gap.
    /// An entry that exists but cannot be decoded is an error, never skipped.
    pub async fn load_events_since<E: DeserializeOwned>(
        &self,
        after: u64,
    ) -> Result<Vec<LogEntry<E>>> {
        let head = match self.log_head().await? {
            Some(head) if head > after => head,
            _ => return Ok(Vec::new()),
        };

        let mut entries = Vec::with_capacity((head - after) as usize);
        let mut next = after + 1;

        while next <= head {
            let end = (next + READ_BATCH - 1).min(head);
            let keys: Vec<String> = (next..=end).map(event_key).collect();
            let values = self.backend.get_all(&keys).await?;

            for (key, value) in keys.iter().zip(values) {
                let Some(value) = value else {
                    warn!(missing = next, head, "Gap in event log, stopping at the gap");
                    return Ok(entries);
                };
                let entry: LogEntry<E> =
                    serde_json::from_value(value).map_err(|e| StoreError::corrupt(key, e))?;
                if entry.sequence != next {
                    return Err(StoreError::corrupt(
                        key,
                        format!("holds sequence {}", entry.sequence),
                    ));
                }
                entries.push(entry);
                next += 1;
            }
        }

        Ok(entries)
    }

    /// Remove entries with `sequence <= through`. Only call this once a
    /// snapshot at or beyond `through` is durable.
    ///
    /// Clears everything between the tail marker left by the previous
    /// compaction and `through`, stepping over holes left by failed appends,
    /// then advances the marker. Returns the number removed.
    pub async fn compact_through(&self, through: u64) -> Result<usize> {
        let tail = self.log_tail().await?.unwrap_or(0);
        if through <= tail {
            return Ok(0);
        }

        let mut doomed = Vec::new();
        let mut lower = tail + 1;
        while lower <= through {
            let upper = (lower + READ_BATCH - 1).min(through);
            let keys: Vec<String> = (lower..=upper).map(event_key).collect();
            let values = self.backend.get_all(&keys).await?;
            doomed.extend(
                keys.into_iter()
                    .zip(values)
                    .filter_map(|(key, value)| value.map(|_| key)),
            );
            lower = upper + 1;
        }

        if !doomed.is_empty() {
            self.backend.remove_all(&doomed).await?;
        }
        self.backend.set(LOG_TAIL_KEY, json!(through)).await?;
        debug!(tail, through, removed = doomed.len(), "Compacted event log");
        Ok(doomed.len())
    }

    /// Highest sequence cleared by compaction, if the log was ever compacted.
    pub async fn log_tail(&self) -> Result<Option<u64>> {
        let Some(value) = self.backend.get(LOG_TAIL_KEY).await? else {
            return Ok(None);
        };
        value
            .as_u64()
            .map(Some)
            .ok_or_else(|| StoreError::corrupt(LOG_TAIL_KEY, "tail is not a sequence number"))
    }

    // -- migration sentinel --------------------------------------------------

    /// When the legacy migration completed, if it ever did.
    pub async fn migration_sentinel(&self) -> Result<Option<String>> {
        let Some(value) = self.backend.get(MIGRATED_KEY).await? else {
            return Ok(None);
        };
        match value {
            Value::String(at) => Ok(Some(at)),
            // Any other marker still counts as migrated.
            other => Ok(Some(other.to_string())),
        }
    }

    pub async fn mark_migrated(&self, at: DateTime<Utc>) -> Result<()> {
        self.backend
            .set(MIGRATED_KEY, Value::String(at.to_rfc3339()))
            .await
    }
}
