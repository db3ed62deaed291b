//! TTL-based mutual exclusion over objects in the backing store.
//!
//! The store lock expires on its own if the holder dies; nothing here renews
//! it, so a holder must finish within the TTL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::backend::RemoteBundleStore;
use crate::error::{ForemanError, Result};

/// Delay between attempts while another owner holds a lock.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Blocks until the store grants `key`. Only contention is retried.
pub fn acquire(
    store: &dyn RemoteBundleStore,
    key: &str,
    ttl: Duration,
    retry_delay: Duration,
) -> Result<()> {
    acquire_unless(store, key, ttl, retry_delay, || false)
}

/// Like `acquire`, but gives up with `Interrupted` once `aborted` returns true.
pub fn acquire_unless(
    store: &dyn RemoteBundleStore,
    key: &str,
    ttl: Duration,
    retry_delay: Duration,
    aborted: impl Fn() -> bool,
) -> Result<()> {
    loop {
        if aborted() {
            return Err(ForemanError::Interrupted {
                what: format!("waiting for lock {}", key),
            });
        }
        match store.lock(key, ttl) {
            Ok(()) => {
                tracing::debug!("locked {}", key);
                return Ok(());
            }
            Err(e) if e.is_retryable() => {
                tracing::debug!("failed to lock {}: {}", key, e);
                thread::sleep(retry_delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Releases `key`. Failures are logged, never raised.
pub fn release(store: &dyn RemoteBundleStore, key: &str) {
    match store.unlock(key) {
        Ok(()) => tracing::debug!("unlocked {}", key),
        Err(e) => tracing::warn!("failed to unlock {}: {}", key, e),
    }
}

struct LockState {
    key: String,
    ttl: Duration,
    retry_delay: Duration,
    store: Arc<dyn RemoteBundleStore>,
    depth: Mutex<usize>,
    /// Serializes 0 -> 1 transitions; never held by `finalize`.
    acquiring: Mutex<()>,
    finalized: AtomicBool,
}

/// Reentrant wrapper around a store lock.
///
/// The store lock is taken when the depth goes 0 -> 1 and released when it
/// goes 1 -> 0. Clones share the same depth. After `finalize` every pending
/// and future `lock` fails with `Interrupted`.
#[derive(Clone)]
pub struct ReentrantLock {
    inner: Arc<LockState>,
}

impl ReentrantLock {
    pub fn new(
        store: Arc<dyn RemoteBundleStore>,
        key: impl Into<String>,
        ttl: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(LockState {
                key: key.into(),
                ttl,
                retry_delay,
                store,
                depth: Mutex::new(0),
                acquiring: Mutex::new(()),
                finalized: AtomicBool::new(false),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn depth(&self) -> usize {
        *self.depth_guard()
    }

    pub fn is_held(&self) -> bool {
        self.depth() > 0
    }

    fn depth_guard(&self) -> MutexGuard<'_, usize> {
        self.inner.depth.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("lock depth for {} was poisoned, recovering", self.inner.key);
            poisoned.into_inner()
        })
    }

    fn interrupted(&self) -> ForemanError {
        ForemanError::Interrupted {
            what: format!("waiting for lock {}", self.inner.key),
        }
    }

    fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::SeqCst)
    }

    /// Increments the depth if the store lock is already held here.
    fn try_nest(&self) -> Result<bool> {
        let mut depth = self.depth_guard();
        if self.is_finalized() {
            return Err(self.interrupted());
        }
        if *depth > 0 {
            *depth += 1;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn lock(&self) -> Result<()> {
        if self.try_nest()? {
            return Ok(());
        }
        let _acquiring = self
            .inner
            .acquiring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.try_nest()? {
            return Ok(());
        }

        // The depth mutex stays free while waiting so `finalize` can run.
        acquire_unless(
            self.inner.store.as_ref(),
            &self.inner.key,
            self.inner.ttl,
            self.inner.retry_delay,
            || self.is_finalized(),
        )?;

        let mut depth = self.depth_guard();
        if self.is_finalized() {
            release(self.inner.store.as_ref(), &self.inner.key);
            return Err(self.interrupted());
        }
        *depth += 1;
        Ok(())
    }

    /// Fails with `LockUnderflow` when called more often than `lock`.
    pub fn unlock(&self) -> Result<()> {
        let mut depth = self.depth_guard();
        if *depth == 0 {
            return Err(ForemanError::LockUnderflow {
                key: self.inner.key.clone(),
            });
        }
        *depth -= 1;
        if *depth == 0 {
            release(self.inner.store.as_ref(), &self.inner.key);
        }
        Ok(())
    }

    /// Drops every level of nesting, releases the store lock if held and
    /// makes waiting `lock` calls give up.
    pub fn finalize(&self) {
        self.inner.finalized.store(true, Ordering::SeqCst);
        let mut depth = self.depth_guard();
        if *depth > 0 {
            *depth = 0;
            release(self.inner.store.as_ref(), &self.inner.key);
        }
    }

    /// Locks and returns a guard that unlocks on drop.
    pub fn guard(&self) -> Result<LockGuard> {
        self.lock()?;
        Ok(LockGuard { lock: self.clone() })
    }
}

impl std::fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReentrantLock")
            .field("key", &self.inner.key)
            .field("ttl", &self.inner.ttl)
            .field("depth", &self.depth())
            .finish()
    }
}

/// Holds one level of a `ReentrantLock` until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    lock: ReentrantLock,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            tracing::warn!("failed to release {}: {}", self.lock.key(), e);
        }
    }
}
