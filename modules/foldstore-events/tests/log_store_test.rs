//! EventLogStore behavior over the in-memory backend.

use std::sync::Arc;

use foldstore_events::{
    event_key, EventLogStore, KeyValueBackend, LogEntry, MemoryBackend, Snapshot, StoreError,
    LOG_HEAD_KEY, LOG_TAIL_KEY, MIGRATED_KEY, SNAPSHOT_KEY,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
enum TestEvent {
    Added { amount: i64 },
    Cleared,
}

fn store() -> (Arc<MemoryBackend>, EventLogStore) {
    let backend = Arc::new(MemoryBackend::new());
    let log = EventLogStore::new(backend.clone());
    (backend, log)
}

fn added(amount: i64, sequence: u64) -> LogEntry<TestEvent> {
    LogEntry::new(TestEvent::Added { amount }, sequence)
}

// =========================================================================
// Snapshots
// =========================================================================

#[tokio::test]
async fn load_snapshot_is_none_on_fresh_backend() {
    let (_, log) = store();
    let snapshot: Option<Snapshot<serde_json::Value>> = log.load_snapshot().await.unwrap();
    assert!(snapshot.is_none());
    assert_eq!(log.snapshot_version().await.unwrap(), None);
}

#[tokio::test]
async fn save_snapshot_replaces_previous() {
    let (_, log) = store();
    log.save_snapshot(&Snapshot::new(json!({"x": 1}), 3)).await.unwrap();
    log.save_snapshot(&Snapshot::new(json!({"x": 9}), 7)).await.unwrap();

    let snapshot: Snapshot<serde_json::Value> = log.load_snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state, json!({"x": 9}));
    assert_eq!(snapshot.version, 7);
}

#[tokio::test]
async fn equal_version_snapshot_is_accepted() {
    let (_, log) = store();
    log.save_snapshot(&Snapshot::new(json!({"x": 1}), 4)).await.unwrap();
    log.save_snapshot(&Snapshot::new(json!({"x": 2}), 4)).await.unwrap();
    assert_eq!(log.snapshot_version().await.unwrap(), Some(4));
}

#[tokio::test]
async fn older_snapshot_is_rejected() {
    let (_, log) = store();
    log.save_snapshot(&Snapshot::new(json!({"x": 1}), 10)).await.unwrap();

    let err = log
        .save_snapshot(&Snapshot::new(json!({"x": 0}), 9))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::StaleSnapshot { current: 10, attempted: 9 }
    ));

    let kept: Snapshot<serde_json::Value> = log.load_snapshot().await.unwrap().unwrap();
    assert_eq!(kept.version, 10);
}

#[tokio::test]
async fn undecodable_snapshot_is_corrupt_not_missing() {
    let backend = Arc::new(MemoryBackend::with_entries([(
        SNAPSHOT_KEY,
        json!({"state": "nope"}),
    )]));
    let log = EventLogStore::new(backend);

    let err = log.load_snapshot::<i64>().await.unwrap_err();
    assert!(matches!(err, StoreError::Corrupt { ref key, .. } if key == SNAPSHOT_KEY));
}

// =========================================================================
// Appending and reading
// =========================================================================

#[tokio::test]
async fn appended_entries_are_keyed_by_sequence() {
    let (backend, log) = store();
    log.append_event(&added(5, 1)).await.unwrap();

    assert!(backend.peek(&event_key(1)).is_some());
    assert_eq!(backend.peek(LOG_HEAD_KEY), Some(json!(1)));
}

#[tokio::test]
async fn load_events_since_returns_later_entries_ascending() {
    let (_, log) = store();
    log.append_events(&[added(1, 1), added(2, 2), added(3, 3)])
        .await
        .unwrap();
    log.append_event(&LogEntry::new(TestEvent::Cleared, 4))
        .await
        .unwrap();

    let entries = log.load_events_since::<TestEvent>(1).await.unwrap();
    let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![2, 3, 4]);
    assert_eq!(entries[2].event, TestEvent::Cleared);
}

#[tokio::test]
async fn load_events_since_head_is_empty() {
    let (_, log) = store();
    log.append_events(&[added(1, 1), added(2, 2)]).await.unwrap();

    assert!(log.load_events_since::<TestEvent>(2).await.unwrap().is_empty());
    assert!(log.load_events_since::<TestEvent>(50).await.unwrap().is_empty());
}

#[tokio::test]
async fn reads_span_multiple_batches() {
    let (_, log) = store();
    let entries: Vec<_> = (1..=150).map(|seq| added(seq as i64, seq)).collect();
    log.append_events(&entries).await.unwrap();

    let loaded = log.load_events_since::<TestEvent>(0).await.unwrap();
    assert_eq!(loaded.len(), 150);
    assert!(loaded.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
}

#[tokio::test]
async fn out_of_order_batch_is_rejected_before_writing() {
    let (backend, log) = store();
    let err = log
        .append_events(&[added(1, 1), added(2, 3)])
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::OutOfOrder { expected: 2, actual: 3 }));
    assert_eq!(backend.write_count(), 0);
}

// =========================================================================
// Gap-free reads
// =========================================================================

#[tokio::test]
async fn read_stops_at_first_gap() {
    let (backend, log) = store();
    log.append_events(&[added(1, 1), added(2, 2), added(3, 3), added(4, 4)])
        .await
        .unwrap();
    backend.remove(&event_key(3)).await.unwrap();

    let entries = log.load_events_since::<TestEvent>(0).await.unwrap();
    let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
}

#[tokio::test]
async fn entries_past_the_head_are_invisible() {
    let (_, log) = store();
    log.append_events(&[added(1, 1), added(2, 2), added(3, 3)])
        .await
        .unwrap();
    // A later session rewrites the tail from sequence 2 onward.
    log.append_event(&LogEntry::new(TestEvent::Cleared, 2))
        .await
        .unwrap();

    let entries = log.load_events_since::<TestEvent>(0).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].event, TestEvent::Cleared);
}

#[tokio::test]
async fn undecodable_entry_is_an_error() {
    let (backend, log) = store();
    log.append_events(&[added(1, 1), added(2, 2)]).await.unwrap();
    backend
        .set(&event_key(2), json!({"garbage": true}))
        .await
        .unwrap();

    let err = log.load_events_since::<TestEvent>(0).await.unwrap_err();
    assert!(matches!(err, StoreError::Corrupt { ref key, .. } if key == "event:2"));
}

// =========================================================================
// Compaction
// =========================================================================

#[tokio::test]
async fn compaction_removes_entries_through_version() {
    let (backend, log) = store();
    let entries: Vec<_> = (1..=5).map(|seq| added(1, seq)).collect();
    log.append_events(&entries).await.unwrap();

    let removed = log.compact_through(3).await.unwrap();
    assert_eq!(removed, 3);
    assert!(backend.peek(&event_key(3)).is_none());
    assert!(backend.peek(&event_key(4)).is_some());

    let remaining = log.load_events_since::<TestEvent>(3).await.unwrap();
    assert_eq!(remaining.len(), 2);
}

#[tokio::test]
async fn compaction_resumes_where_the_last_one_ended() {
    let (_, log) = store();
    let entries: Vec<_> = (1..=200).map(|seq| added(1, seq)).collect();
    log.append_events(&entries).await.unwrap();

    assert_eq!(log.compact_through(70).await.unwrap(), 70);
    assert_eq!(log.compact_through(190).await.unwrap(), 120);
    assert_eq!(log.compact_through(190).await.unwrap(), 0);
}

#[tokio::test]
async fn compaction_steps_over_holes_left_by_failed_appends() {
    let (backend, log) = store();
    let before: Vec<_> = (1..=3).map(|seq| added(1, seq)).collect();
    let after: Vec<_> = (6..=7).map(|seq| added(1, seq)).collect();
    log.append_events(&before).await.unwrap();
    log.append_events(&after).await.unwrap();

    assert_eq!(log.compact_through(7).await.unwrap(), 5);

    for seq in 1..=7 {
        assert!(backend.peek(&event_key(seq)).is_none(), "event {seq} survived");
    }
    assert_eq!(log.log_tail().await.unwrap(), Some(7));
    assert_eq!(backend.peek(LOG_TAIL_KEY), Some(json!(7)));
}

#[tokio::test]
async fn compaction_below_the_tail_is_a_no_op() {
    let (_, log) = store();
    let entries: Vec<_> = (1..=4).map(|seq| added(1, seq)).collect();
    log.append_events(&entries).await.unwrap();

    assert_eq!(log.compact_through(4).await.unwrap(), 4);
    assert_eq!(log.compact_through(2).await.unwrap(), 0);
    assert_eq!(log.log_tail().await.unwrap(), Some(4));
}

// =========================================================================
// Sentinel
// =========================================================================

#[tokio::test]
async fn sentinel_round_trips_a_timestamp() {
    let (backend, log) = store();
    assert_eq!(log.migration_sentinel().await.unwrap(), None);

    let at = chrono::Utc::now();
    log.mark_migrated(at).await.unwrap();

    assert_eq!(log.migration_sentinel().await.unwrap(), Some(at.to_rfc3339()));
    assert!(backend.peek(MIGRATED_KEY).unwrap().is_string());
}
