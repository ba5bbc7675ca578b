//! Debounced writes over a storage backend.
//!
//! Stores serialize themselves on nearly every mutation. Writing each of
//! those through would hammer the backend, so writes are queued per key and
//! flushed together once no new write has arrived for the debounce delay.
//! Only the latest value for each key survives to the backend.
//!
//! Write failures are never returned to callers. They are logged and reported
//! to save listeners registered with [`DebouncedStorage::on_save`].

use super::storage::StorageBackend;
use crate::time::{now_millis, Timestamp};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default delay between the last write and the flush.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Key prefixes considered disposable when the backend runs out of space.
pub const DEFAULT_CLEANUP_PREFIXES: [&str; 3] = ["old-save-", "temp-", "cache-"];

/// Called after each flushed write with `(success, key)`.
pub type SaveListener = dyn Fn(bool, &str) + Send + Sync;

/// Tuning for [`DebouncedStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebounceOptions {
    pub delay: Duration,
    pub cleanup_prefixes: Vec<String>,
    /// Keys cleanup never removes, whatever their prefix.
    pub protected_keys: Vec<String>,
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self {
            delay: DEFAULT_DEBOUNCE,
            cleanup_prefixes: DEFAULT_CLEANUP_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            protected_keys: Vec::new(),
        }
    }
}

/// Snapshot of the write queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    pub pending_writes: usize,
    /// When the oldest still-pending write was queued.
    pub oldest_pending: Option<Timestamp>,
    pub debounce: Duration,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    value: String,
    queued_at: Timestamp,
}

struct Shared {
    backend: Arc<dyn StorageBackend>,
    options: DebounceOptions,
    pending: Mutex<BTreeMap<String, PendingWrite>>,
    listeners: Mutex<Vec<(u64, Arc<SaveListener>)>>,
    next_listener_id: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn cancel_timer(&self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.abort();
        }
    }

    fn flush_pending(&self) -> usize {
        let pending = std::mem::take(&mut *lock(&self.pending));
        if pending.is_empty() {
            return 0;
        }

        let count = pending.len();
        let batch: Vec<String> = pending.keys().cloned().collect();
        let mut failed = 0;
        for (key, write) in pending {
            let success = self.write_with_cleanup(&key, &write.value, &batch);
            if !success {
                failed += 1;
            }
            self.notify(success, &key);
        }
        debug!(count, failed, "Flushed pending writes");
        count
    }

    fn write_with_cleanup(&self, key: &str, value: &str, batch: &[String]) -> bool {
        match self.backend.set(key, value) {
            Ok(()) => true,
            Err(e) if e.is_quota_exceeded() => {
                warn!(key, "Storage quota exceeded, clearing temporary entries");
                let cleared = self.cleanup(batch);
                if cleared == 0 {
                    error!(key, "Nothing to clear, save dropped");
                    return false;
                }
                match self.backend.set(key, value) {
                    Ok(()) => {
                        info!(key, cleared, "Saved after clearing temporary entries");
                        true
                    }
                    Err(e) => {
                        error!(key, error = %e, "Save failed after cleanup");
                        false
                    }
                }
            }
            Err(e) => {
                error!(key, error = %e, "Save failed");
                false
            }
        }
    }

    /// Remove every key with a disposable prefix, sparing protected keys and
    /// keys with a write in flight. Returns how many went.
    fn cleanup(&self, batch: &[String]) -> usize {
        let keys = match self.backend.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Could not list keys for cleanup");
                return 0;
            }
        };

        let queued = lock(&self.pending);
        let disposable: Vec<&String> = keys
            .iter()
            .filter(|key| {
                self.options
                    .cleanup_prefixes
                    .iter()
                    .any(|prefix| key.starts_with(prefix.as_str()))
            })
            .filter(|key| {
                !batch.contains(*key)
                    && !self.options.protected_keys.contains(*key)
                    && !queued.contains_key(key.as_str())
            })
            .collect();
        drop(queued);

        let mut cleared = 0;
        for key in disposable {
            match self.backend.remove(key) {
                Ok(()) => cleared += 1,
                Err(e) => warn!(key = %key, error = %e, "Could not clear entry"),
            }
        }
        cleared
    }

    fn notify(&self, success: bool, key: &str) {
        let listeners: Vec<_> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(success, key))).is_err() {
                error!(key, "Save listener panicked");
            }
        }
    }
}

/// A handle to a registered save listener.
///
/// Dropping the handle leaves the listener registered; call
/// [`SaveSubscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct SaveSubscription {
    id: u64,
    shared: Weak<Shared>,
}

impl SaveSubscription {
    /// Remove the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut listeners = lock(&shared.listeners);
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != self.id);
        listeners.len() != before
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("options", &self.options)
            .field("pending", &lock(&self.pending).len())
            .finish_non_exhaustive()
    }
}

/// Storage adapter that coalesces writes behind a single timer.
///
/// The timer runs on the ambient tokio runtime. Without one, writes stay
/// queued until [`flush`](Self::flush) is called or the adapter is dropped.
#[derive(Debug)]
pub struct DebouncedStorage {
    shared: Arc<Shared>,
}

impl DebouncedStorage {
    pub fn new(backend: Arc<dyn StorageBackend>, options: DebounceOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                options,
                pending: Mutex::new(BTreeMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                timer: Mutex::new(None),
            }),
        }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.shared.backend
    }

    /// Read straight from the backend. Queued writes are not visible here.
    pub fn get(&self, key: &str) -> Option<String> {
        match self.shared.backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Storage read failed");
                None
            }
        }
    }

    /// Queue a write and restart the debounce timer.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.shared.pending).insert(
            key.into(),
            PendingWrite {
                value: value.into(),
                queued_at: now_millis(),
            },
        );
        self.schedule();
    }

    fn schedule(&self) {
        let mut timer = lock(&self.shared.timer);
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        let Ok(runtime) = Handle::try_current() else {
            debug!("No async runtime, write stays queued until flush");
            return;
        };
        let shared = Arc::downgrade(&self.shared);
        let delay = self.shared.options.delay;
        *timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                shared.flush_pending();
            }
        }));
    }

    /// Remove a key now, discarding any queued write for it.
    pub fn remove(&self, key: &str) {
        lock(&self.shared.pending).remove(key);
        if let Err(e) = self.shared.backend.remove(key) {
            warn!(key, error = %e, "Storage remove failed");
        }
    }

    /// Cancel the timer and write everything queued. Returns how many keys
    /// were written or attempted.
    pub fn flush(&self) -> usize {
        self.shared.cancel_timer();
        self.shared.flush_pending()
    }

    /// Register a listener for flushed writes.
    pub fn on_save<F>(&self, listener: F) -> SaveSubscription
    where
        F: Fn(bool, &str) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.listeners).push((id, Arc::new(listener)));
        SaveSubscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn stats(&self) -> StorageStats {
        let pending = lock(&self.shared.pending);
        StorageStats {
            pending_writes: pending.len(),
            oldest_pending: pending.values().map(|w| w.queued_at).min(),
            debounce: self.shared.options.delay,
        }
    }

    /// Whether a write is queued for `key`.
    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.shared.pending).contains_key(key)
    }
}

impl Drop for DebouncedStorage {
    fn drop(&mut self) {
        let flushed = self.flush();
        if flushed > 0 {
            debug!(flushed, "Flushed pending writes on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::storage::MemoryStorage;
    use crate::testing::RecordingStorage;
    use std::sync::atomic::AtomicUsize;

    fn recording() -> (Arc<RecordingStorage>, DebouncedStorage) {
        let backend = Arc::new(RecordingStorage::new());
        let storage = DebouncedStorage::new(backend.clone(), DebounceOptions::default());
        (backend, storage)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_sets_coalesce_to_one_write() {
        let (backend, storage) = recording();
        for i in 0..10 {
            storage.set("narrative-store", i.to_string());
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert_eq!(backend.write_count(), 0);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(backend.writes_for("narrative-store"), vec!["9".to_string()]);
        assert_eq!(storage.stats().pending_writes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_immediately() {
        let (backend, storage) = recording();
        storage.set("a", "1");
        storage.set("b", "2");

        assert_eq!(storage.flush(), 2);
        assert_eq!(backend.write_count(), 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(backend.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_drops_pending_write() {
        let (backend, storage) = recording();
        storage.set("a", "1");
        storage.remove("a");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(backend.write_count(), 0);
        assert!(storage.get("a").is_none());
    }

    #[test]
    fn test_without_runtime_writes_wait_for_flush() {
        let (backend, storage) = recording();
        storage.set("a", "1");
        assert!(storage.is_pending("a"));
        assert_eq!(backend.write_count(), 0);

        storage.flush();
        assert_eq!(storage.get("a").as_deref(), Some("1"));
    }

    #[test]
    fn test_drop_flushes() {
        let backend = Arc::new(RecordingStorage::new());
        {
            let storage = DebouncedStorage::new(backend.clone(), DebounceOptions::default());
            storage.set("a", "1");
        }
        assert_eq!(backend.writes_for("a"), vec!["1".to_string()]);
    }

    #[test]
    fn test_listeners_see_outcomes_and_can_unsubscribe() {
        let (_backend, storage) = recording();
        let successes = Arc::new(AtomicUsize::new(0));
        let counter = successes.clone();
        let subscription = storage.on_save(move |ok, _key| {
            if ok {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        storage.set("a", "1");
        storage.flush();
        assert_eq!(successes.load(Ordering::SeqCst), 1);

        assert!(subscription.unsubscribe());
        storage.set("a", "2");
        storage.flush();
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let (backend, storage) = recording();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        storage.on_save(|_, _| panic!("listener bug"));
        storage.on_save(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        storage.set("a", "1");
        storage.flush();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(backend.write_count(), 1);
    }

    #[test]
    fn test_quota_cleanup_then_retry() {
        let backend = Arc::new(MemoryStorage::with_quota(40));
        backend.set("temp-scratch", "xxxxxxxxxxxxxxxxxxxx").unwrap();
        backend.set("keep", "y").unwrap();
        let storage = DebouncedStorage::new(backend.clone(), DebounceOptions::default());
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let log = outcomes.clone();
        storage.on_save(move |ok, key| lock(&log).push((ok, key.to_string())));

        storage.set("save", "zzzzzzzzzzzzzzz");
        storage.flush();

        assert_eq!(*lock(&outcomes), vec![(true, "save".to_string())]);
        assert!(backend.get("temp-scratch").unwrap().is_none());
        assert_eq!(backend.get("keep").unwrap().as_deref(), Some("y"));
    }

    #[test]
    fn test_cleanup_spares_saves_with_disposable_prefix() {
        let backend = Arc::new(MemoryStorage::with_quota(100));
        backend.set("temp-save", "previous-save-data").unwrap();
        backend.set("temp-other", "earlier-draft-data").unwrap();
        backend.set("temp-scratch", "xxxxxxxxxxxxxxxxxx").unwrap();
        let options = DebounceOptions {
            protected_keys: vec!["temp-save".to_string(), "temp-other".to_string()],
            ..DebounceOptions::default()
        };
        let storage = DebouncedStorage::new(backend.clone(), options);

        storage.set("temp-new", "zzzzzzzzzzzzzzz");
        assert_eq!(storage.flush(), 1);

        assert!(backend.get("temp-scratch").unwrap().is_none());
        assert!(backend.get("temp-new").unwrap().is_some());
        assert_eq!(
            backend.get("temp-save").unwrap().as_deref(),
            Some("previous-save-data")
        );
        assert!(backend.get("temp-other").unwrap().is_some());
    }

    #[test]
    fn test_quota_with_nothing_to_clear_reports_failure() {
        let backend = Arc::new(MemoryStorage::with_quota(8));
        let storage = DebouncedStorage::new(backend.clone(), DebounceOptions::default());
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let log = outcomes.clone();
        storage.on_save(move |ok, key| lock(&log).push((ok, key.to_string())));

        storage.set("save", "far too large");
        storage.flush();

        assert_eq!(*lock(&outcomes), vec![(false, "save".to_string())]);
        assert!(backend.get("save").unwrap().is_none());
    }

    #[test]
    fn test_stats_report_oldest_pending() {
        let (_backend, storage) = recording();
        assert_eq!(storage.stats().oldest_pending, None);
        storage.set("a", "1");
        let stats = storage.stats();
        assert_eq!(stats.pending_writes, 1);
        assert!(stats.oldest_pending.is_some());
        assert_eq!(stats.debounce, DEFAULT_DEBOUNCE);
    }
}
