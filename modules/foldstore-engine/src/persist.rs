//! Persistence middlewares.
//!
//! `EventLogPersistence` appends every applied event to the log and writes a
//! snapshot now and then. `DebouncedSave` skips the log and saves the whole
//! state once dispatches go quiet. Both sit innermost in the pipeline, see
//! the outcome of the reducer, and never block dispatch: writes happen on
//! background tasks and failures go to the shared error reporter.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use foldstore_common::EngineConfig;
use foldstore_events::{EventLogStore, LogEntry, Snapshot, StoreError};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::action::{Action, Dispatched};
use crate::store::{Next, Store};
use crate::traits::{ErrorReporter, Middleware};

/// Timing and retry knobs shared by both persistence strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistOptions {
    pub snapshot_interval: Duration,
    pub flush_debounce: Duration,
    pub save_debounce: Duration,
    /// Attempts per write, including the first. Zero behaves like one.
    pub write_attempts: u32,
    pub retry_backoff: Duration,
    pub compact_log: bool,
}

impl From<&EngineConfig> for PersistOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            snapshot_interval: config.snapshot_interval(),
            flush_debounce: config.flush_debounce(),
            save_debounce: config.save_debounce(),
            write_attempts: config.write_attempts,
            retry_backoff: config.retry_backoff(),
            compact_log: config.compact_log,
        }
    }
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Backend failures worth another attempt. Ordering violations are not.
fn is_transient(error: &StoreError) -> bool {
    matches!(
        error,
        StoreError::Backend(_) | StoreError::QuotaExceeded { .. } | StoreError::Io(_)
    )
}

/// Run `op` up to `write_attempts` times, sleeping `retry_backoff * n`
/// between attempts.
async fn with_retry<T, F, Fut>(
    options: &PersistOptions,
    what: &str,
    mut op: F,
) -> foldstore_events::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = foldstore_events::Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < options.write_attempts && is_transient(&e) => {
                warn!(attempt, error = %e, "Failed to {what}, retrying");
                tokio::time::sleep(options.retry_backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// EventLogPersistence
// ---------------------------------------------------------------------------

/// Appends each reduced event to the log under the next sequence number.
///
/// Sequence numbers are assigned in dispatch order, so the log order is the
/// order the reducer saw. One flusher task at a time drains the pending
/// batch, which keeps writes ordered even when the backend is slow.
///
/// After a failed write the log has a hole that replay will stop at; the
/// next flush therefore writes a snapshot regardless of the interval.
pub struct EventLogPersistence<S, E, D = ()> {
    shared: Arc<LogShared<S, E, D>>,
}

impl<S, E, D> Clone for EventLogPersistence<S, E, D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct LogShared<S, E, D> {
    log: EventLogStore,
    reporter: Arc<dyn ErrorReporter<S, E, D>>,
    options: PersistOptions,
    writer: Mutex<LogWriter<S, E>>,
}

struct LogWriter<S, E> {
    last_sequence: u64,
    pending: Vec<LogEntry<E>>,
    /// State after the newest recorded event, with its sequence number.
    latest: Option<(u64, Arc<S>)>,
    flushing: bool,
    last_snapshot: Instant,
    snapshot_due: bool,
}

impl<S, E, D> EventLogPersistence<S, E, D>
where
    S: Serialize + Send + Sync + 'static,
    E: Clone + Serialize + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    pub fn new(
        log: EventLogStore,
        reporter: Arc<dyn ErrorReporter<S, E, D>>,
        options: PersistOptions,
    ) -> Self {
        Self {
            shared: Arc::new(LogShared {
                log,
                reporter,
                options,
                writer: Mutex::new(LogWriter {
                    last_sequence: 0,
                    pending: Vec::new(),
                    latest: None,
                    flushing: false,
                    last_snapshot: Instant::now(),
                    snapshot_due: false,
                }),
            }),
        }
    }

    /// Continue numbering after `version`, the position restored state
    /// corresponds to.
    pub fn starting_after(self, version: u64) -> Self {
        lock(&self.shared.writer).last_sequence = version;
        self
    }

    /// Sequence number of the most recently recorded event, written or not.
    pub fn last_sequence(&self) -> u64 {
        lock(&self.shared.writer).last_sequence
    }

    fn record(&self, event: E, store: &Store<S, E, D>) {
        let state = store.get_state();
        let start_flusher = {
            let mut writer = lock(&self.shared.writer);
            writer.last_sequence += 1;
            let sequence = writer.last_sequence;
            writer.pending.push(LogEntry::new(event, sequence));
            writer.latest = Some((sequence, state));
            !std::mem::replace(&mut writer.flushing, true)
        };

        if start_flusher {
            let spawned = store.spawn(flush(Arc::clone(&self.shared), store.clone()));
            if !spawned {
                lock(&self.shared.writer).flushing = false;
            }
        }
    }
}

impl<S, E, D> Middleware<S, E, D> for EventLogPersistence<S, E, D>
where
    S: Serialize + Send + Sync + 'static,
    E: Clone + Serialize + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    fn handle(
        &self,
        action: Action<S, E, D>,
        store: &Store<S, E, D>,
        next: &Next<S, E, D>,
    ) -> Result<Dispatched> {
        let event = match action {
            Action::Plain(event) => event,
            deferred => return next(deferred, store),
        };

        let recorded = event.clone();
        let outcome = next(Action::Plain(event), store)?;
        if outcome.is_reduced() {
            self.record(recorded, store);
        }
        Ok(outcome)
    }
}

async fn flush<S, E, D>(shared: Arc<LogShared<S, E, D>>, store: Store<S, E, D>)
where
    S: Serialize + Send + Sync + 'static,
    E: Serialize + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    if !shared.options.flush_debounce.is_zero() {
        tokio::time::sleep(shared.options.flush_debounce).await;
    }

    loop {
        let batch = {
            let mut writer = lock(&shared.writer);
            if writer.pending.is_empty() {
                writer.flushing = false;
                return;
            }
            std::mem::take(&mut writer.pending)
        };

        shared.write_batch(&batch, &store).await;

        let snapshot = {
            let writer = lock(&shared.writer);
            let due = writer.snapshot_due
                || writer.last_snapshot.elapsed() >= shared.options.snapshot_interval;
            if due {
                writer.latest.clone()
            } else {
                None
            }
        };
        if let Some((version, state)) = snapshot {
            shared.write_snapshot(version, &state, &store).await;
        }
    }
}

impl<S, E, D> LogShared<S, E, D>
where
    S: Serialize + Send + Sync + 'static,
    E: Serialize + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    async fn write_batch(&self, batch: &[LogEntry<E>], store: &Store<S, E, D>) {
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return;
        };
        let (first, last) = (first.sequence, last.sequence);

        let log = &self.log;
        let appended = with_retry(&self.options, "append log entries", move || {
            log.append_events(batch)
        })
        .await;

        match appended {
            Ok(()) => trace!(first, last, "Log entries persisted"),
            Err(e) => {
                lock(&self.writer).snapshot_due = true;
                let error = anyhow::Error::new(e)
                    .context(format!("failed to persist log entries {first}..={last}"));
                self.reporter.report(&error, store);
            }
        }
    }

    async fn write_snapshot(&self, version: u64, state: &Arc<S>, store: &Store<S, E, D>) {
        let snapshot = Snapshot::new(&**state, version);
        let log = &self.log;
        let snapshot_ref = &snapshot;
        let saved = with_retry(&self.options, "save snapshot", move || {
            log.save_snapshot(snapshot_ref)
        })
        .await;

        match saved {
            Ok(()) => {
                {
                    let mut writer = lock(&self.writer);
                    writer.last_snapshot = Instant::now();
                    writer.snapshot_due = false;
                }
                debug!(version, "Snapshot persisted");

                if self.options.compact_log {
                    if let Err(e) = self.log.compact_through(version).await {
                        let error = anyhow::Error::new(e)
                            .context(format!("failed to compact log through {version}"));
                        self.reporter.report(&error, store);
                    }
                }
            }
            Err(e) => {
                lock(&self.writer).snapshot_due = true;
                let error =
                    anyhow::Error::new(e).context(format!("failed to save snapshot at {version}"));
                self.reporter.report(&error, store);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DebouncedSave
// ---------------------------------------------------------------------------

/// Saves the whole state as a snapshot once no event has been reduced for
/// `save_debounce`. Nothing is written to the log.
///
/// Every reduced event bumps the snapshot version, so restore and the
/// event-log mode agree on what a version means.
pub struct DebouncedSave<S, E, D = ()> {
    shared: Arc<SaveShared<S, E, D>>,
}

impl<S, E, D> Clone for DebouncedSave<S, E, D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct SaveShared<S, E, D> {
    log: EventLogStore,
    reporter: Arc<dyn ErrorReporter<S, E, D>>,
    options: PersistOptions,
    pending: Mutex<SaveState<S>>,
    /// Serializes writes so an older save never lands after a newer one.
    writing: tokio::sync::Mutex<()>,
}

struct SaveState<S> {
    version: u64,
    generation: u64,
    latest: Option<(u64, Arc<S>)>,
}

impl<S, E, D> DebouncedSave<S, E, D>
where
    S: Serialize + Send + Sync + 'static,
    E: Send + 'static,
    D: Send + Sync + 'static,
{
    pub fn new(
        log: EventLogStore,
        reporter: Arc<dyn ErrorReporter<S, E, D>>,
        options: PersistOptions,
    ) -> Self {
        Self {
            shared: Arc::new(SaveShared {
                log,
                reporter,
                options,
                pending: Mutex::new(SaveState {
                    version: 0,
                    generation: 0,
                    latest: None,
                }),
                writing: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn starting_after(self, version: u64) -> Self {
        lock(&self.shared.pending).version = version;
        self
    }

    /// Version the next save will carry (or the last one did).
    pub fn version(&self) -> u64 {
        lock(&self.shared.pending).version
    }
}

impl<S, E, D> Middleware<S, E, D> for DebouncedSave<S, E, D>
where
    S: Serialize + Send + Sync + 'static,
    E: Send + 'static,
    D: Send + Sync + 'static,
{
    fn handle(
        &self,
        action: Action<S, E, D>,
        store: &Store<S, E, D>,
        next: &Next<S, E, D>,
    ) -> Result<Dispatched> {
        let outcome = next(action, store)?;
        if !outcome.is_reduced() {
            return Ok(outcome);
        }

        let generation = {
            let mut pending = lock(&self.shared.pending);
            pending.version += 1;
            pending.generation += 1;
            pending.latest = Some((pending.version, store.get_state()));
            pending.generation
        };
        store.spawn(save_when_quiet(
            Arc::clone(&self.shared),
            store.clone(),
            generation,
        ));
        Ok(outcome)
    }
}

async fn save_when_quiet<S, E, D>(
    shared: Arc<SaveShared<S, E, D>>,
    store: Store<S, E, D>,
    generation: u64,
) where
    S: Serialize + Send + Sync + 'static,
    E: Send + 'static,
    D: Send + Sync + 'static,
{
    tokio::time::sleep(shared.options.save_debounce).await;

    let latest = {
        let mut pending = lock(&shared.pending);
        if pending.generation != generation {
            return;
        }
        pending.latest.take()
    };
    let Some((version, state)) = latest else {
        return;
    };

    let _writing = shared.writing.lock().await;
    let snapshot = Snapshot::new(&*state, version);
    let log = &shared.log;
    let snapshot_ref = &snapshot;
    let saved = with_retry(&shared.options, "save state", move || {
        log.save_snapshot(snapshot_ref)
    })
    .await;

    match saved {
        Ok(()) => debug!(version, "State saved"),
        Err(StoreError::StaleSnapshot { current, attempted }) => {
            debug!(current, attempted, "Skipped save, a newer snapshot is stored");
        }
        Err(e) => {
            let error = anyhow::Error::new(e).context(format!("failed to save state at {version}"));
            shared.reporter.report(&error, &store);
        }
    }
}
