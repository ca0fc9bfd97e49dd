/*!
In-memory staging buffer.

Holds the latest known content of every changed file until the next flush drains it.
The map sits behind a single mutex; `put` and `drain_if_non_empty` are each one
critical section, so a racing put lands entirely before or entirely after a drain.
*/

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// Content drained from the buffer, keyed by absolute path
pub type StagedEntries = HashMap<PathBuf, Vec<u8>>;

/// Path → latest content map shared by the watcher and the flush task
#[derive(Debug, Default)]
pub struct StagingBuffer {
    entries: Mutex<StagedEntries>,
}

impl StagingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StagedEntries> {
        // A panic while holding the lock cannot leave the map half-written.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace the content staged for `path`
    pub fn put(&self, path: PathBuf, content: Vec<u8>) {
        self.lock().insert(path, content);
    }

    /// Take everything staged so far, leaving the buffer empty
    ///
    /// Returns `None` when there is nothing to flush.
    pub fn drain_if_non_empty(&self) -> Option<StagedEntries> {
        let mut entries = self.lock();
        if entries.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *entries))
        }
    }

    /// Merge entries from a failed flush back in
    ///
    /// Content staged after the drain is newer and wins over the requeued copy.
    /// Returns how many entries were actually restored.
    pub fn requeue(&self, drained: StagedEntries) -> usize {
        let mut entries = self.lock();
        let mut restored = 0;
        for (path, content) in drained {
            entries.entry(path).or_insert_with(|| {
                restored += 1;
                content
            });
        }
        restored
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the content currently staged for `path`
    pub fn get(&self, path: &std::path::Path) -> Option<Vec<u8>> {
        self.lock().get(path).cloned()
    }
}
