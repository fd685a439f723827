//! Fault-injecting object backend for tests.

use crate::backend::ObjectBackend;
use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// An object backend wrapper that counts requests and injects failures.
///
/// Used to observe how often blocks are actually fetched (cache behaviour,
/// skipped blocks) and to simulate outages in the middle of a commit.
///
/// # Example
///
/// ```rust
/// use tessera_storage::{FaultyBackend, InMemoryBackend, ObjectBackend};
///
/// let backend = FaultyBackend::new(InMemoryBackend::new());
/// backend.put("a", b"x").unwrap();
/// backend.get("a").unwrap();
/// assert_eq!(backend.get_count("a"), 1);
///
/// backend.set_unavailable(true);
/// assert!(backend.get("a").is_err());
/// ```
#[derive(Debug)]
pub struct FaultyBackend<B> {
    inner: B,
    unavailable: AtomicBool,
    fail_puts_containing: Mutex<Option<String>>,
    get_delay: Mutex<Option<Duration>>,
    gets: Mutex<HashMap<String, u64>>,
    total_gets: AtomicU64,
    total_puts: AtomicU64,
}

impl<B: ObjectBackend> FaultyBackend<B> {
    /// Wraps `inner` with no faults enabled.
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            unavailable: AtomicBool::new(false),
            fail_puts_containing: Mutex::new(None),
            get_delay: Mutex::new(None),
            gets: Mutex::new(HashMap::new()),
            total_gets: AtomicU64::new(0),
            total_puts: AtomicU64::new(0),
        }
    }

    /// Returns the wrapped backend.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Makes every subsequent request fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes puts to keys containing `needle` fail. `None` clears the rule.
    pub fn fail_puts_containing(&self, needle: Option<&str>) {
        *self.fail_puts_containing.lock() = needle.map(str::to_string);
    }

    /// Delays every successful get by `delay`.
    pub fn set_get_delay(&self, delay: Option<Duration>) {
        *self.get_delay.lock() = delay;
    }

    /// Number of gets issued for `key`.
    #[must_use]
    pub fn get_count(&self, key: &str) -> u64 {
        self.gets.lock().get(key).copied().unwrap_or(0)
    }

    /// Number of gets issued for keys containing `needle`.
    #[must_use]
    pub fn get_count_containing(&self, needle: &str) -> u64 {
        self.gets
            .lock()
            .iter()
            .filter(|(key, _)| key.contains(needle))
            .map(|(_, n)| n)
            .sum()
    }

    /// Total gets issued.
    #[must_use]
    pub fn total_gets(&self) -> u64 {
        self.total_gets.load(Ordering::SeqCst)
    }

    /// Total puts that reached the inner backend.
    #[must_use]
    pub fn total_puts(&self) -> u64 {
        self.total_puts.load(Ordering::SeqCst)
    }

    /// Resets all counters.
    pub fn reset_counts(&self) {
        self.gets.lock().clear();
        self.total_gets.store(0, Ordering::SeqCst);
        self.total_puts.store(0, Ordering::SeqCst);
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

impl<B: ObjectBackend> ObjectBackend for FaultyBackend<B> {
    fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        self.check_available()?;
        if let Some(needle) = self.fail_puts_containing.lock().as_deref() {
            if key.contains(needle) {
                tracing::debug!(key, "injecting put failure");
                return Err(StorageError::Unavailable(format!(
                    "injected put failure for {key}"
                )));
            }
        }
        self.total_puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, data)
    }

    fn get(&self, key: &str) -> StorageResult<Bytes> {
        *self.gets.lock().entry(key.to_string()).or_insert(0) += 1;
        self.total_gets.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let delay = *self.get_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.check_available()?;
        self.inner.delete(key)
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.check_available()?;
        self.inner.list(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBackend;

    #[test]
    fn counts_gets_per_key() {
        let backend = FaultyBackend::new(InMemoryBackend::new());
        backend.put("a/1", b"x").unwrap();
        backend.put("b/1", b"y").unwrap();
        backend.get("a/1").unwrap();
        backend.get("a/1").unwrap();
        let _ = backend.get("missing");

        assert_eq!(backend.get_count("a/1"), 2);
        assert_eq!(backend.get_count("b/1"), 0);
        assert_eq!(backend.get_count_containing("a/"), 2);
        assert_eq!(backend.total_gets(), 3);
        assert_eq!(backend.total_puts(), 2);

        backend.reset_counts();
        assert_eq!(backend.total_gets(), 0);
    }

    #[test]
    fn unavailable_fails_everything() {
        let backend = FaultyBackend::new(InMemoryBackend::new());
        backend.put("a", b"x").unwrap();
        backend.set_unavailable(true);

        assert!(matches!(backend.get("a"), Err(StorageError::Unavailable(_))));
        assert!(matches!(backend.put("b", b"x"), Err(StorageError::Unavailable(_))));
        assert!(backend.list("").is_err());

        backend.set_unavailable(false);
        assert!(backend.get("a").is_ok());
    }

    #[test]
    fn put_failure_matches_substring() {
        let backend = FaultyBackend::new(InMemoryBackend::new());
        backend.fail_puts_containing(Some("/manifests/"));

        backend.put("seg/blocks/1", b"x").unwrap();
        assert!(backend.put("seg/manifests/ids/1", b"x").is_err());
        assert!(!backend.inner().exists("seg/manifests/ids/1").unwrap());

        backend.fail_puts_containing(None);
        backend.put("seg/manifests/ids/1", b"x").unwrap();
    }
}
