//! Startup: legacy migration, restore from snapshot plus log, fatal errors.

mod common;

use std::sync::Arc;

use common::{add, reduce, AppEvent, AppState, Reports};
use foldstore_common::EngineConfig;
use foldstore_engine::{
    restore, Booted, EngineError, LegacyMigrator, MigrationOutcome, Startup, StartupPhase,
};
use foldstore_events::{EventLogStore, LogEntry, MemoryBackend, Snapshot};
use serde_json::json;

fn config() -> EngineConfig {
    EngineConfig {
        snapshot_interval_ms: 60_000,
        retry_backoff_ms: 1,
        ..EngineConfig::default()
    }
}

async fn boot_with(
    backend: &Arc<MemoryBackend>,
    config: EngineConfig,
) -> Booted<AppState, AppEvent> {
    let reports = Reports::default();
    Startup::new(Arc::clone(backend), reduce, AppState::default())
        .config(config)
        .reporter(reports.reporter())
        .boot()
        .await
        .unwrap()
}

fn legacy_backend() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::with_entries([
        ("counter", json!("{\"x\":4,\"version\":2}")),
        ("profile", json!("{\"name\":\"ada\",\"version\":1}")),
    ]))
}

fn log(backend: &Arc<MemoryBackend>) -> EventLogStore {
    EventLogStore::new(Arc::clone(backend))
}

// =========================================================================
// Legacy migration
// =========================================================================

#[tokio::test]
async fn legacy_keys_become_the_first_snapshot() {
    let backend = legacy_backend();

    let booted = boot_with(&backend, config()).await;

    let state = booted.store.get_state();
    assert_eq!(state.counter.x, 4);
    assert_eq!(state.counter.version, 2);
    assert_eq!(state.profile.name, "ada");
    assert_eq!(booted.version, 1);
    assert_eq!(
        booted.migration,
        Some(MigrationOutcome::Migrated {
            slices: vec!["counter".into(), "profile".into()],
            defaulted: vec![],
        })
    );

    let snapshot: Snapshot<AppState> = log(&backend).load_snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.version, 1);
    assert!(log(&backend).migration_sentinel().await.unwrap().is_some());
}

#[tokio::test]
async fn migration_runs_only_once() {
    let backend = legacy_backend();
    let first = boot_with(&backend, config()).await;
    drop(first);
    let writes = backend.write_count();

    let second = boot_with(&backend, config()).await;

    assert!(matches!(
        second.migration,
        Some(MigrationOutcome::AlreadyMigrated { .. })
    ));
    assert_eq!(backend.write_count(), writes);
    assert_eq!(second.store.get_state().counter.x, 4);
    // Legacy keys are left exactly as they were.
    assert_eq!(backend.peek("counter"), Some(json!("{\"x\":4,\"version\":2}")));
}

#[tokio::test]
async fn unusable_slices_keep_their_defaults() {
    let backend = Arc::new(MemoryBackend::with_entries([
        ("counter", json!("{\"x\":9,\"version\":1}")),
        ("profile", json!("{\"name\":5}")),
    ]));

    let booted = boot_with(&backend, config()).await;

    let state = booted.store.get_state();
    assert_eq!(state.counter.x, 9);
    assert_eq!(state.profile, Default::default());
    assert_eq!(
        booted.migration,
        Some(MigrationOutcome::Migrated {
            slices: vec!["counter".into()],
            defaulted: vec!["profile".into()],
        })
    );
}

#[tokio::test]
async fn undecodable_text_keeps_the_default() {
    let backend = Arc::new(MemoryBackend::with_entries([("counter", json!("{not json"))]));

    let booted = boot_with(&backend, config()).await;

    assert_eq!(*booted.store.get_state(), AppState::default());
    assert_eq!(
        booted.migration,
        Some(MigrationOutcome::Migrated {
            slices: vec![],
            defaulted: vec!["counter".into(), "profile".into()],
        })
    );
}

#[tokio::test]
async fn legacy_prefix_is_honored() {
    let backend = Arc::new(MemoryBackend::with_entries([
        ("app:counter", json!({ "x": 2, "version": 1 })),
        ("counter", json!({ "x": 100, "version": 1 })),
    ]));

    let booted = boot_with(
        &backend,
        EngineConfig {
            legacy_prefix: "app:".into(),
            ..config()
        },
    )
    .await;

    assert_eq!(booted.store.get_state().counter.x, 2);
}

#[tokio::test]
async fn existing_snapshot_is_kept_when_sentinel_is_missing() {
    let backend = Arc::new(MemoryBackend::new());
    log(&backend)
        .save_snapshot(&Snapshot::new(AppState::with_x(7), 5))
        .await
        .unwrap();

    let migrator = LegacyMigrator::new(log(&backend));
    let outcome = migrator.run(&AppState::default()).await.unwrap();

    assert_eq!(outcome, MigrationOutcome::SnapshotPresent { version: 5 });
    assert!(migrator.is_migrated().await.unwrap());
    let snapshot: Snapshot<AppState> = log(&backend).load_snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state.counter.x, 7);
}

#[tokio::test]
async fn events_after_migration_continue_from_version_one() {
    let backend = legacy_backend();
    let booted = boot_with(&backend, config()).await;

    booted.store.dispatch_event(add(1));
    booted.store.settle().await;

    let entries: Vec<LogEntry<AppEvent>> = log(&backend).load_events_since(0).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].sequence, 2);
}

#[tokio::test]
async fn fresh_backend_is_migrated_so_logging_starts_at_two() {
    let backend = Arc::new(MemoryBackend::new());
    let booted = boot_with(&backend, config()).await;

    assert_eq!(booted.version, 1);
    assert_eq!(
        booted.migration,
        Some(MigrationOutcome::Migrated {
            slices: vec![],
            defaulted: vec!["counter".into(), "profile".into()],
        })
    );
    assert_eq!(*booted.store.get_state(), AppState::default());

    for n in 1..=3 {
        booted.store.dispatch_event(add(n));
    }
    booted.store.settle().await;

    let entries: Vec<LogEntry<AppEvent>> = log(&backend).load_events_since(0).await.unwrap();
    let sequences: Vec<u64> = entries.iter().map(|entry| entry.sequence).collect();
    assert_eq!(sequences, vec![2, 3, 4]);
}

// =========================================================================
// Restore
// =========================================================================

#[tokio::test]
async fn snapshot_plus_later_entries_are_replayed() {
    let backend = Arc::new(MemoryBackend::new());
    let store = log(&backend);
    store
        .save_snapshot(&Snapshot::new(AppState::with_x(1), 10))
        .await
        .unwrap();
    store
        .append_events(&[LogEntry::new(add(1), 11), LogEntry::new(add(1), 12)])
        .await
        .unwrap();
    store.mark_migrated(chrono::Utc::now()).await.unwrap();

    let booted = boot_with(&backend, config()).await;

    assert_eq!(booted.store.get_state().counter.x, 3);
    assert_eq!(booted.version, 12);
    assert_eq!(booted.replayed, 2);

    booted.store.dispatch_event(add(1));
    booted.store.settle().await;
    assert!(backend.peek("event:13").is_some());
}

#[tokio::test]
async fn restored_state_matches_the_live_state() {
    let backend = Arc::new(MemoryBackend::new());
    let session = boot_with(&backend, config()).await;
    for event in [
        add(3),
        AppEvent::Rename {
            name: "grace".into(),
        },
        AppEvent::Noop,
        add(-1),
    ] {
        session.store.dispatch_event(event);
    }
    session.store.settle().await;
    let live = session.store.get_state();
    drop(session);

    let restored = boot_with(&backend, config()).await;

    assert_eq!(*restored.store.get_state(), *live);
}

#[tokio::test]
async fn replay_stops_at_a_gap() {
    let written = Arc::new(MemoryBackend::new());
    log(&written)
        .append_events(&[
            LogEntry::new(add(1), 1),
            LogEntry::new(add(1), 2),
            LogEntry::new(add(1), 3),
        ])
        .await
        .unwrap();

    // Lose the middle entry, as a failed batch would.
    let mut entries = written.entries();
    entries.remove("event:2");
    let backend = Arc::new(MemoryBackend::with_entries(entries));

    let restored =
        restore::<AppState, AppEvent, _>(&log(&backend), &reduce, Arc::new(AppState::default()))
            .await
            .unwrap();

    assert_eq!(restored.state.counter.x, 1);
    assert_eq!(restored.version, 1);
    assert_eq!(restored.replayed, 1);
}

#[tokio::test]
async fn replay_panic_names_the_sequence() {
    let backend = Arc::new(MemoryBackend::new());
    let store = log(&backend);
    store
        .append_events(&[LogEntry::new(add(1), 1), LogEntry::new(AppEvent::Explode, 2)])
        .await
        .unwrap();

    let err = restore::<AppState, AppEvent, _>(&store, &reduce, Arc::new(AppState::default()))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::ReplayPanicked { sequence: 2, .. }));
}

// =========================================================================
// Fatal startup errors
// =========================================================================

#[tokio::test]
async fn unreadable_backend_fails_before_migration() {
    let backend = legacy_backend();
    backend.fail_reads(true);

    let err = Startup::new(Arc::clone(&backend), reduce, AppState::default())
        .config(config())
        .run()
        .await
        .err()
        .unwrap();

    assert_eq!(err.phase, StartupPhase::Unmigrated);
    assert!(matches!(err.source, EngineError::Store(_)));
    assert_eq!(backend.write_count(), 0);
}

#[tokio::test]
async fn unreadable_backend_fails_restore_without_migration() {
    let backend = Arc::new(MemoryBackend::new());
    backend.fail_reads(true);

    let err = Startup::new(Arc::clone(&backend), reduce, AppState::default())
        .config(EngineConfig {
            legacy_migration: false,
            ..config()
        })
        .run()
        .await
        .err()
        .unwrap();

    assert_eq!(err.phase, StartupPhase::Restoring);
}

#[tokio::test]
async fn corrupt_snapshot_is_fatal() {
    let backend = Arc::new(MemoryBackend::with_entries([
        ("migrated", json!("2026-01-01T00:00:00Z")),
        ("snapshot", json!({ "state": "garbage", "version": 3 })),
    ]));

    let err = Startup::new(Arc::clone(&backend), reduce, AppState::default())
        .config(config())
        .run()
        .await
        .err()
        .unwrap();

    assert_eq!(err.phase, StartupPhase::Restoring);
    assert!(err.to_string().contains("restoring"));
}

#[tokio::test]
async fn failed_migration_write_leaves_no_sentinel() {
    let backend = legacy_backend();
    backend.fail_writes(true);

    let err = Startup::new(Arc::clone(&backend), reduce, AppState::default())
        .config(config())
        .run()
        .await
        .err()
        .unwrap();
    assert_eq!(err.phase, StartupPhase::Migrating);

    backend.fail_writes(false);
    assert!(log(&backend).migration_sentinel().await.unwrap().is_none());
    let booted = boot_with(&backend, config()).await;
    assert_eq!(booted.store.get_state().counter.x, 4);
}
