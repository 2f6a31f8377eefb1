//! Append-only event log and snapshot store over a pluggable key-value backend.
//!
//! Stores opaque JSON facts keyed by sequence number plus a single latest
//! snapshot. Zero knowledge of any particular state shape or event type.
//!
//! Consumers provide their own state and event types that serialize to
//! `serde_json::Value`.

pub mod backend;
pub mod error;
pub mod file;
pub mod memory;
pub mod store;
pub mod types;

pub use backend::KeyValueBackend;
pub use error::{Result, StoreError};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use store::EventLogStore;
pub use types::{
    event_key, LogEntry, Snapshot, LOG_HEAD_KEY, LOG_TAIL_KEY, MIGRATED_KEY, SNAPSHOT_KEY,
};
