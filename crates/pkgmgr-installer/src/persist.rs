use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use pkgmgr_registry::{RegistryLock, RegistryStore};
use tracing::{debug, error, warn};

/// Deferred writes that keep failing are retried this many times, doubling
/// the delay each time. The registry stays dirty afterwards.
const MAX_DEFERRED_WRITE_ATTEMPTS: u32 = 5;

/// Coalesces registry writes. Routine changes are written after a short
/// debounce; security-relevant ones are written before the caller returns.
#[derive(Clone)]
pub struct PersistScheduler {
    store: RegistryStore,
    registry: RegistryLock,
    debounce: Duration,
    dirty: Arc<AtomicBool>,
    writer_scheduled: Arc<AtomicBool>,
    writing: Arc<Mutex<()>>,
}

impl PersistScheduler {
    pub fn new(store: RegistryStore, registry: RegistryLock, debounce: Duration) -> Self {
        Self {
            store,
            registry,
            debounce,
            dirty: Arc::new(AtomicBool::new(false)),
            writer_scheduled: Arc::new(AtomicBool::new(false)),
            writing: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Snapshots the registry and writes it out now. One write at a time:
    /// every write goes through the same temporary file.
    pub fn write_now(&self) -> Result<()> {
        let _writing = self.writing.lock().unwrap_or_else(PoisonError::into_inner);
        self.dirty.store(false, Ordering::SeqCst);
        let snapshot = self.registry.snapshot();
        if let Err(err) = self.store.save(&snapshot) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(err);
        }
        debug!(root = %self.store.root().display(), "registry written");
        Ok(())
    }

    /// Marks the registry dirty and makes sure a delayed write is pending.
    /// Outside a runtime the write happens immediately.
    pub fn schedule(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.spawn_writer(self.debounce, 1);
    }

    fn spawn_writer(&self, delay: Duration, attempt: u32) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            if let Err(err) = self.write_now() {
                error!(error = %format!("{err:#}"), "failed to write registry");
            }
            return;
        };
        if self.writer_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.writer_scheduled.store(false, Ordering::SeqCst);
            if !scheduler.is_dirty() {
                return;
            }
            let Err(err) = scheduler.write_now() else {
                return;
            };
            if attempt >= MAX_DEFERRED_WRITE_ATTEMPTS {
                error!(attempt, error = %format!("{err:#}"), "deferred registry write failed; left pending until the next change or flush");
                return;
            }
            warn!(attempt, error = %format!("{err:#}"), "deferred registry write failed; retrying");
            scheduler.spawn_writer(delay * 2, attempt + 1);
        });
    }

    pub fn flush(&self) -> Result<()> {
        if self.is_dirty() {
            self.write_now()?;
        }
        Ok(())
    }
}
