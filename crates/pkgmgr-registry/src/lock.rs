use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::settings::Settings;

/// Guards the in-memory registry. Critical sections are short and never
/// suspend: the guard is `!Send`, so a future holding it across an `.await`
/// cannot be spawned onto the runtime.
#[derive(Debug, Clone, Default)]
pub struct RegistryLock {
    inner: Arc<Mutex<Settings>>,
}

pub struct RegistryGuard<'a> {
    guard: MutexGuard<'a, Settings>,
}

impl RegistryLock {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(settings)),
        }
    }

    pub fn lock(&self) -> RegistryGuard<'_> {
        // A panic inside a critical section leaves plain data behind; keep going.
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        RegistryGuard { guard }
    }

    /// Runs `f` inside one critical section. Mutating registry operations
    /// take the guard itself, so they cannot run without the lock held.
    pub fn with<R>(&self, f: impl FnOnce(&mut RegistryGuard<'_>) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    pub fn snapshot(&self) -> Settings {
        self.lock().clone()
    }
}

impl Deref for RegistryGuard<'_> {
    type Target = Settings;

    fn deref(&self) -> &Settings {
        &self.guard
    }
}

impl DerefMut for RegistryGuard<'_> {
    fn deref_mut(&mut self) -> &mut Settings {
        &mut self.guard
    }
}
