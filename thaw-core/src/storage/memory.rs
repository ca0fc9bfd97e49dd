/*!
In-memory object store.

Keeps objects in a map inside the process. Used by tests and dry runs; it can be
told to fail uploads so flush-failure handling can be exercised.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::ObjectStore;
use crate::{Result, ThawError};

/// Memory-based object store
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
    failed_puts: AtomicUsize,
    fail_puts: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `put` fail (or succeed again with `false`)
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `put` calls
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of `put` calls rejected through [`fail_puts`](Self::fail_puts)
    pub fn failed_put_count(&self) -> usize {
        self.failed_puts.load(Ordering::SeqCst)
    }

    /// Current object under `key`, if any
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    /// Seed an object without counting it as a put
    pub fn insert(&self, key: &str, data: Vec<u8>) {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), data);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.object(key).ok_or_else(|| ThawError::not_found(key))
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            self.failed_puts.fetch_add(1, Ordering::SeqCst);
            return Err(ThawError::storage(format!(
                "injected failure writing {key}"
            )));
        }
        self.insert(key, data);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryObjectStore::new();
        let err = store.get("nothing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemoryObjectStore::new();
        store.put("k", b"one".to_vec()).await.unwrap();
        store.put("k", b"two".to_vec()).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), b"two");
        assert_eq!(store.put_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_put_failure() {
        let store = MemoryObjectStore::new();
        store.fail_puts(true);

        assert!(store.put("k", b"v".to_vec()).await.is_err());
        assert_eq!(store.put_count(), 0);
        assert_eq!(store.failed_put_count(), 1);
        assert!(store.object("k").is_none());

        store.fail_puts(false);
        store.put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(store.put_count(), 1);
    }
}
