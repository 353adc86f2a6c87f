use std::sync::Arc;

use pkgmgr_core::{UninstallFlags, UninstallOutcome, UserId, UserTarget};
use pkgmgr_registry::{CleanupRecord, RegistryEntry, UserState};
use thiserror::Error;
use tracing::{info, warn};

use crate::context::ServiceContext;
use crate::events::LifecycleEvent;
use crate::freezer::{FreezeUnit, FreezeWait};
use crate::permissions::PermissionPass;
use crate::replace::RemovedInfo;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{outcome}: {message}")]
pub struct UninstallError {
    pub outcome: UninstallOutcome,
    pub message: String,
}

impl UninstallError {
    fn new(outcome: UninstallOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(UninstallOutcome::InternalError, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallResult {
    pub outcome: UninstallOutcome,
    pub message: String,
    pub removed: Option<RemovedInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemovalKind {
    /// Other users keep the package.
    ForUsers,
    /// Drop a user update and fall back to the factory version.
    FactoryUpdate,
    /// A factory package stays on the image and is only hidden.
    Factory,
    Full,
}

/// Removes packages for one user or for all of them.
#[derive(Clone)]
pub struct Remover {
    context: Arc<ServiceContext>,
}

impl Remover {
    pub fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    pub async fn uninstall(
        &self,
        name: &str,
        target: UserTarget,
        flags: UninstallFlags,
    ) -> UninstallResult {
        match self.try_uninstall(name, target, flags).await {
            Ok(removed) => UninstallResult {
                outcome: UninstallOutcome::Succeeded,
                message: format!("removed {name}"),
                removed: Some(removed),
            },
            Err(err) => {
                warn!(package = name, outcome = %err.outcome, message = %err.message, "uninstall failed");
                UninstallResult {
                    outcome: err.outcome,
                    message: err.message,
                    removed: None,
                }
            }
        }
    }

    fn precheck(
        &self,
        name: &str,
        target: UserTarget,
        flags: UninstallFlags,
    ) -> Result<(RegistryEntry, Vec<UserId>), UninstallError> {
        let settings = self.context.registry.lock();
        let entry = settings
            .package(name)
            .cloned()
            .ok_or_else(|| UninstallError::internal(format!("package {name} is not installed")))?;
        if let Some(parent) = &entry.parent {
            return Err(UninstallError::internal(format!(
                "sub-package {name} can only be removed with {parent}"
            )));
        }

        let all_users = flags.all_users || target == UserTarget::All;
        let users = if all_users {
            settings.users()
        } else {
            settings
                .users()
                .into_iter()
                .filter(|user| target.includes(*user))
                .collect()
        };
        if users.is_empty() {
            return Err(UninstallError::internal(format!("unknown user {target}")));
        }
        if !all_users && !users.iter().any(|user| entry.is_installed_for(*user)) {
            return Err(UninstallError::internal(format!(
                "package {name} is not installed for user {target}"
            )));
        }

        let policy = &self.context.collaborators.policy;
        if all_users && policy.protected_role_holders().contains(name) {
            return Err(UninstallError::new(
                UninstallOutcome::OwnerBlocked,
                format!("package {name} holds a protected role and cannot be removed for all users"),
            ));
        }
        if let Some(user) = users.iter().find(|user| {
            entry
                .user_state(**user)
                .is_some_and(|state| state.block_uninstall)
        }) {
            return Err(UninstallError::new(
                UninstallOutcome::OwnerBlocked,
                format!("uninstall of {name} is blocked for user {user}"),
            ));
        }
        if let Some(user) = users
            .iter()
            .find(|user| policy.uninstall_blocked_by_policy(**user))
        {
            return Err(UninstallError::new(
                UninstallOutcome::UserRestricted,
                format!("user {user} may not uninstall applications"),
            ));
        }
        Ok((entry, users))
    }

    async fn try_uninstall(
        &self,
        name: &str,
        target: UserTarget,
        flags: UninstallFlags,
    ) -> Result<RemovedInfo, UninstallError> {
        let (entry, users) = self.precheck(name, target, flags)?;
        let context = &self.context;
        let unit = FreezeUnit::from_entry(&entry);
        let _freeze = context
            .freezer
            .acquire(&unit, "uninstall", FreezeWait::Block, !flags.dont_kill_app)
            .await
            .map_err(|err| UninstallError::new(UninstallOutcome::Aborted, err.to_string()))?;

        // Another operation may have run while we waited for the freeze.
        let (entry, kind) = {
            let settings = context.registry.lock();
            let entry = settings.package(name).cloned().ok_or_else(|| {
                UninstallError::internal(format!("package {name} disappeared before removal"))
            })?;
            let remaining = entry
                .installed_users()
                .into_iter()
                .filter(|user| !users.contains(user))
                .count();
            let kind = if remaining > 0 && !flags.system_app {
                RemovalKind::ForUsers
            } else if settings.disabled_system_package(name).is_some() {
                RemovalKind::FactoryUpdate
            } else if entry.flags.system {
                RemovalKind::Factory
            } else {
                RemovalKind::Full
            };
            (entry, kind)
        };
        info!(package = name, ?kind, users = ?users, keep_data = flags.keep_data, "removing package");

        let mut removed = RemovedInfo {
            name: name.to_string(),
            previous_app_id: entry.app_id,
            previous_version: entry.version_code,
            previous_code_path: entry.code_path.clone(),
            previous_users: entry.installed_users(),
            was_update: entry.flags.updated_system,
            data_removed: false,
            removed_children: entry.children.clone(),
            replacing: false,
        };
        let unit_names = unit.names();

        match kind {
            RemovalKind::ForUsers | RemovalKind::Factory => {
                context.registry.with(|settings| {
                    for unit_name in &unit_names {
                        if let Some(unit_entry) = settings.package_mut(unit_name) {
                            for user in &users {
                                unit_entry.users.insert(*user, UserState::not_installed());
                            }
                        }
                        if let Some(unit_entry) = settings.package_mut(unit_name) {
                            // Shared grants stay with the remaining members.
                            if unit_entry.shared_user.is_none() {
                                for user in &users {
                                    unit_entry.permissions.remove_user(*user);
                                }
                            }
                        }
                    }
                });
                if !flags.keep_data {
                    self.destroy_data(&entry, &unit_names, &users).await;
                    removed.data_removed = true;
                }
            }
            RemovalKind::FactoryUpdate => {
                let restored = context.registry.with(|settings| {
                    let restored = settings.enable_system_package(name).cloned();
                    context
                        .migrator
                        .update_permissions(settings, Some(name), &PermissionPass::default());
                    restored
                });
                let Some(restored) = restored else {
                    return Err(UninstallError::internal(format!(
                        "factory version of {name} vanished"
                    )));
                };
                context
                    .collaborators
                    .components
                    .components_added(name, &restored.components);
                self.remove_code(name, &entry).await;
                info!(package = name, version = restored.version_code, "factory version restored");
            }
            RemovalKind::Full => {
                context.registry.with(|settings| {
                    for unit_name in &unit_names {
                        context.migrator.remove_definitions(settings, unit_name);
                    }
                    if flags.keep_data {
                        for unit_name in &unit_names {
                            if let Some(unit_entry) = settings.package_mut(unit_name) {
                                for user in unit_entry.users.values_mut() {
                                    *user = UserState::not_installed();
                                }
                            }
                        }
                    } else {
                        for child in &entry.children {
                            settings.remove_entry(child);
                        }
                        if let Some(gone) = settings.remove_entry(name) {
                            if let Some(app_id) = gone.freed_app_id {
                                info!(package = name, app_id, "app id released");
                            }
                        }
                    }
                });
                for unit_name in &unit_names {
                    context.collaborators.components.components_removed(unit_name);
                }
                self.remove_code(name, &entry).await;
                if !flags.keep_data {
                    let users = context.registry.with(|settings| settings.users());
                    self.destroy_data(&entry, &unit_names, &users).await;
                    removed.data_removed = true;
                }
            }
        }

        context.persist(true);

        for user in &users {
            if entry.is_installed_for(*user) {
                context.emit(LifecycleEvent::PackageRemoved {
                    name: name.to_string(),
                    user: *user,
                    app_id: entry.app_id,
                    data_removed: removed.data_removed,
                    replacing: kind == RemovalKind::FactoryUpdate,
                });
            }
            if kind == RemovalKind::FactoryUpdate && entry.is_installed_for(*user) {
                context.emit(LifecycleEvent::PackageReplaced {
                    name: name.to_string(),
                    user: *user,
                    app_id: entry.app_id,
                });
            }
        }
        if kind == RemovalKind::Full && !flags.keep_data {
            context.emit(LifecycleEvent::PackageFullyRemoved {
                name: name.to_string(),
                app_id: entry.app_id,
            });
        }
        Ok(removed)
    }

    async fn remove_code(&self, name: &str, entry: &RegistryEntry) {
        if entry.flags.system {
            return;
        }
        let result = {
            let mut helper = self.context.install_lock.lock().await;
            helper.remove_code_path(&entry.code_path).await
        };
        if let Err(err) = result {
            warn!(package = name, error = %err, "could not remove code; cleaning up later");
            self.context.registry.with(|settings| {
                settings.schedule_cleanup(CleanupRecord {
                    name: name.to_string(),
                    user: None,
                    code_path: Some(entry.code_path.clone()),
                    keep_data: true,
                })
            });
        }
    }

    async fn destroy_data(&self, entry: &RegistryEntry, unit_names: &[String], users: &[UserId]) {
        let mut failed = Vec::new();
        {
            let mut helper = self.context.install_lock.lock().await;
            for unit_name in unit_names {
                for user in users {
                    if let Err(err) = helper
                        .destroy_app_data(entry.volume_uuid.as_deref(), *user, unit_name)
                        .await
                    {
                        warn!(package = %unit_name, user, error = %err, "could not destroy data; cleaning up later");
                        failed.push((unit_name.clone(), *user));
                    }
                }
            }
        }
        if failed.is_empty() {
            return;
        }
        self.context.registry.with(|settings| {
            for (unit_name, user) in failed {
                settings.schedule_cleanup(CleanupRecord {
                    name: unit_name,
                    user: Some(user),
                    code_path: None,
                    keep_data: false,
                });
            }
        });
    }
}
