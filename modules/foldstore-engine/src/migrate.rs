//! One-shot conversion of legacy flat keys into the first snapshot.
//!
//! The legacy layout kept each state slice under its own key, usually as a
//! JSON-encoded string. Migration folds those into a single snapshot at
//! version 1 and then records the `migrated` sentinel, so it runs at most
//! once per backend. Legacy keys are left in place.

use chrono::Utc;
use foldstore_events::{EventLogStore, KeyValueBackend, Snapshot};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Version of the snapshot a migration writes.
pub const MIGRATED_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The sentinel was already set; nothing was read or written.
    AlreadyMigrated { at: String },
    /// A snapshot existed without a sentinel. It was kept as-is and the
    /// sentinel set.
    SnapshotPresent { version: u64 },
    /// Legacy slices were folded into a fresh snapshot.
    Migrated {
        /// Slices taken from legacy keys.
        slices: Vec<String>,
        /// Slices left at their initial value (absent or undecodable).
        defaulted: Vec<String>,
    },
}

pub struct LegacyMigrator {
    log: EventLogStore,
    prefix: String,
}

impl LegacyMigrator {
    pub fn new(log: EventLogStore) -> Self {
        Self {
            log,
            prefix: String::new(),
        }
    }

    /// Legacy keys are `<prefix><slice name>`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub async fn is_migrated(&self) -> Result<bool, EngineError> {
        Ok(self.log.migration_sentinel().await?.is_some())
    }

    /// Migrate unless the sentinel says it already happened.
    ///
    /// `initial` supplies the slice names and the default for every slice
    /// that has no usable legacy value. Any backend failure aborts before
    /// the sentinel is written, so the next startup tries again.
    pub async fn run<S>(&self, initial: &S) -> Result<MigrationOutcome, EngineError>
    where
        S: Serialize + DeserializeOwned,
    {
        if let Some(at) = self.log.migration_sentinel().await? {
            debug!(%at, "Legacy migration already done");
            return Ok(MigrationOutcome::AlreadyMigrated { at });
        }

        if let Some(version) = self.log.snapshot_version().await? {
            warn!(version, "Snapshot exists without migration sentinel, keeping it");
            self.log.mark_migrated(Utc::now()).await?;
            return Ok(MigrationOutcome::SnapshotPresent { version });
        }

        let Value::Object(defaults) = serde_json::to_value(initial)? else {
            return Err(EngineError::StateShape);
        };

        let names: Vec<String> = defaults.keys().cloned().collect();
        let keys: Vec<String> = names.iter().map(|name| format!("{}{name}", self.prefix)).collect();
        let legacy = self.log.backend().get_all(&keys).await?;

        let mut merged = defaults.clone();
        let mut slices = Vec::new();
        let mut defaulted = Vec::new();

        for ((name, key), raw) in names.into_iter().zip(&keys).zip(legacy) {
            let Some(raw) = raw else {
                debug!(slice = %name, "No legacy value, keeping default");
                defaulted.push(name);
                continue;
            };

            let value = match decode_legacy(raw) {
                Ok(value) => value,
                Err(e) => {
                    warn!(slice = %name, key = %key, error = %e, "Undecodable legacy value, keeping default");
                    defaulted.push(name);
                    continue;
                }
            };

            let previous = merged.insert(name.clone(), value);
            if let Err(e) = serde_json::from_value::<S>(Value::Object(merged.clone())) {
                warn!(slice = %name, key = %key, error = %e, "Legacy value does not fit the state, keeping default");
                revert_slice(&mut merged, &name, previous);
                defaulted.push(name);
                continue;
            }
            slices.push(name);
        }

        let state: S = serde_json::from_value(Value::Object(merged))?;
        self.log
            .save_snapshot(&Snapshot::new(&state, MIGRATED_VERSION))
            .await?;
        self.log.mark_migrated(Utc::now()).await?;

        info!(
            migrated = slices.len(),
            defaulted = defaulted.len(),
            "Legacy state migrated"
        );
        Ok(MigrationOutcome::Migrated { slices, defaulted })
    }
}

/// Legacy values are normally JSON text stored as a string; anything else
/// is taken as already decoded.
fn decode_legacy(raw: Value) -> Result<Value, serde_json::Error> {
    match raw {
        Value::String(text) => serde_json::from_str(&text),
        other => Ok(other),
    }
}

fn revert_slice(merged: &mut Map<String, Value>, name: &str, previous: Option<Value>) {
    match previous {
        Some(value) => {
            merged.insert(name.to_string(), value);
        }
        None => {
            merged.remove(name);
        }
    }
}
