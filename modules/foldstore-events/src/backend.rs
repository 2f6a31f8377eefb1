//! The key-value contract every storage medium satisfies.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Minimal async key-value store over string keys and JSON values.
///
/// The batched variants default to looping over the single-key calls.
/// Backends that can write a batch atomically should override `set_all`:
/// the event log relies on it to move entries and the head marker together.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Values are returned in the order of `keys`.
    async fn get_all(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    async fn set_all(&self, entries: Vec<(String, Value)>) -> Result<()> {
        for (key, value) in entries {
            self.set(&key, value).await?;
        }
        Ok(())
    }

    async fn remove_all(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Arc<B> blanket, so callers can keep a handle on the backend for assertions
// ---------------------------------------------------------------------------

#[async_trait]
impl<B: KeyValueBackend + ?Sized> KeyValueBackend for Arc<B> {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        (**self).set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key).await
    }

    async fn get_all(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        (**self).get_all(keys).await
    }

    async fn set_all(&self, entries: Vec<(String, Value)>) -> Result<()> {
        (**self).set_all(entries).await
    }

    async fn remove_all(&self, keys: &[String]) -> Result<()> {
        (**self).remove_all(keys).await
    }
}
