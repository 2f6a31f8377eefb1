//! In-memory backend for tests and demos. Nothing is durable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::backend::KeyValueBackend;
use crate::error::{Result, StoreError};

/// Thread-safe map backend. Batched writes are applied under one lock, so
/// `set_all` is atomic.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Value>>,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the backend, e.g. with legacy flat keys.
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let backend = Self::new();
        backend
            .lock()
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v)));
        backend
    }

    /// Copy of every stored entry (for assertions and debugging).
    pub fn entries(&self) -> BTreeMap<String, Value> {
        self.lock().clone()
    }

    /// Raw read without going through the async contract.
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Number of write operations (`set`, `remove` and batched variants count
    /// once per call) that reached the map.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("memory backend unavailable".into()));
        }
        Ok(())
    }

    fn check_write(&self, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::QuotaExceeded { key: key.to_string() });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(feature = "test-utils")]
impl MemoryBackend {
    /// Make every subsequent read fail until switched off again.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail (as a full quota) until switched off.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.check_read()?;
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.check_write(key)?;
        self.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check_write(key)?;
        self.lock().remove(key);
        Ok(())
    }

    async fn get_all(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        self.check_read()?;
        let entries = self.lock();
        Ok(keys.iter().map(|key| entries.get(key).cloned()).collect())
    }

    async fn set_all(&self, batch: Vec<(String, Value)>) -> Result<()> {
        let Some((first, _)) = batch.first() else {
            return Ok(());
        };
        self.check_write(first)?;
        self.lock().extend(batch);
        Ok(())
    }

    async fn remove_all(&self, keys: &[String]) -> Result<()> {
        let Some(first) = keys.first() else {
            return Ok(());
        };
        self.check_write(first)?;
        let mut entries = self.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}
