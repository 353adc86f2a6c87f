use std::collections::BTreeMap;
use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError};

use pkgmgr_core::{PackageDescriptor, PackageManagerError};
use pkgmgr_registry::{AppId, RegistryEntry};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::collaborators::ProcessController;

/// A package together with its sub-packages; frozen as one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezeUnit {
    pub name: String,
    pub children: Vec<String>,
    pub app_id: Option<AppId>,
}

impl FreezeUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            app_id: None,
        }
    }

    pub fn from_entry(entry: &RegistryEntry) -> Self {
        Self {
            name: entry.name.clone(),
            children: entry.children.clone(),
            app_id: Some(entry.app_id),
        }
    }

    pub fn from_descriptor(descriptor: &PackageDescriptor, app_id: Option<AppId>) -> Self {
        Self {
            name: descriptor.name.clone(),
            children: descriptor
                .child_packages
                .iter()
                .map(|child| child.name.clone())
                .collect(),
            app_id,
        }
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = String>) -> Self {
        for child in children {
            if !self.children.contains(&child) {
                self.children.push(child);
            }
        }
        self
    }

    pub fn names(&self) -> Vec<String> {
        std::iter::once(self.name.clone())
            .chain(self.children.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeWait {
    /// Wait until every conflicting freeze is released.
    Block,
    /// Give up immediately with [`PackageFrozen`].
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("package {0} is frozen by another operation")]
pub struct PackageFrozen(pub String);

struct FreezerInner {
    /// Name -> nesting count.
    frozen: Mutex<BTreeMap<String, usize>>,
    released: Notify,
    processes: Arc<dyn ProcessController>,
}

#[derive(Clone)]
pub struct PackageFreezer {
    inner: Arc<FreezerInner>,
}

/// Membership of one or more names in the freeze set. Dropping it releases
/// the names and wakes anyone waiting for them.
#[must_use = "the freeze is released as soon as the guard is dropped"]
pub struct FreezeGuard {
    inner: Arc<FreezerInner>,
    names: Vec<String>,
    exclusive: bool,
}

impl PackageFreezer {
    pub fn new(processes: Arc<dyn ProcessController>) -> Self {
        Self {
            inner: Arc::new(FreezerInner {
                frozen: Mutex::new(BTreeMap::new()),
                released: Notify::new(),
                processes,
            }),
        }
    }

    /// Claims the unit and asks for its processes to be killed. Never fails;
    /// nested freezes of the same name stack.
    pub fn freeze(&self, unit: &FreezeUnit, reason: &str) -> FreezeGuard {
        let guard = self.claim_shared(unit);
        self.kill(unit, reason);
        guard
    }

    pub fn freeze_without_kill(&self, unit: &FreezeUnit) -> FreezeGuard {
        self.claim_shared(unit)
    }

    /// Exclusive claim used by installs and removals: a second operation on
    /// any name of the unit waits or fails instead of proceeding.
    pub async fn acquire(
        &self,
        unit: &FreezeUnit,
        reason: &str,
        wait: FreezeWait,
        kill: bool,
    ) -> Result<FreezeGuard, PackageFrozen> {
        loop {
            let mut released = pin!(self.inner.released.notified());
            released.as_mut().enable();
            match self.try_claim_exclusive(unit) {
                Ok(guard) => {
                    if kill {
                        self.kill(unit, reason);
                    }
                    return Ok(guard);
                }
                Err(frozen) if wait == FreezeWait::Fail => return Err(frozen),
                Err(frozen) => {
                    debug!(package = %frozen.0, reason, "waiting for freeze to be released");
                    released.await;
                }
            }
        }
    }

    pub fn is_frozen(&self, name: &str) -> bool {
        self.inner
            .frozen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn frozen_names(&self) -> Vec<String> {
        self.inner
            .frozen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Fails when `name` is frozen by someone other than `holder`.
    pub fn check_not_frozen(
        &self,
        name: &str,
        holder: Option<&FreezeGuard>,
    ) -> Result<(), PackageManagerError> {
        if holder.is_some_and(|guard| guard.covers(name)) || !self.is_frozen(name) {
            return Ok(());
        }
        error!(package = name, "mutation attempted on a package frozen by another operation");
        Err(PackageManagerError::internal(format!(
            "package {name} is frozen by another operation"
        )))
    }

    fn claim_shared(&self, unit: &FreezeUnit) -> FreezeGuard {
        let names = unit.names();
        let mut frozen = self
            .inner
            .frozen
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for name in &names {
            *frozen.entry(name.clone()).or_default() += 1;
        }
        FreezeGuard {
            inner: Arc::clone(&self.inner),
            names,
            exclusive: false,
        }
    }

    fn try_claim_exclusive(&self, unit: &FreezeUnit) -> Result<FreezeGuard, PackageFrozen> {
        let names = unit.names();
        let mut frozen = self
            .inner
            .frozen
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(busy) = names.iter().find(|name| frozen.contains_key(*name)) {
            return Err(PackageFrozen(busy.clone()));
        }
        for name in &names {
            frozen.insert(name.clone(), 1);
        }
        Ok(FreezeGuard {
            inner: Arc::clone(&self.inner),
            names,
            exclusive: true,
        })
    }

    fn kill(&self, unit: &FreezeUnit, reason: &str) {
        let Some(app_id) = unit.app_id else {
            return;
        };
        if let Err(err) = self
            .inner
            .processes
            .kill_application(app_id, &unit.name, reason)
        {
            warn!(package = %unit.name, app_id, reason, error = %format!("{err:#}"), "kill request failed");
        }
    }
}

impl FreezeGuard {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn covers(&self, name: &str) -> bool {
        self.names.iter().any(|candidate| candidate == name)
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        let mut frozen = self
            .inner
            .frozen
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for name in &self.names {
            if let Some(count) = frozen.get_mut(name) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    frozen.remove(name);
                }
            }
        }
        drop(frozen);
        self.inner.released.notify_waiters();
    }
}
