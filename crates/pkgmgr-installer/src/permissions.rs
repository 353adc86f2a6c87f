use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use pkgmgr_core::{
    CertificateSet, PermissionFlags, ProtectionFlag, ProtectionLevel, UserId,
    RUNTIME_PERMISSIONS_TARGET_SDK,
};
use pkgmgr_registry::{
    AppId, PermissionDefinition, PermissionsState, RegistryEntry, RegistryGuard, Settings,
};
use pkgmgr_security::compare_signatures;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::collaborators::PolicyOracle;
use crate::config::ServiceConfig;

/// Asks for a package's processes to be restarted so they pick up a new
/// group membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillRequest {
    pub app_id: AppId,
    pub package: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionPass {
    /// Users that receive every requested runtime permission up front.
    pub grant_runtime_to: Vec<UserId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionChanges {
    pub granted: Vec<String>,
    pub revoked: Vec<String>,
    pub promoted: Vec<String>,
    pub kill_requested: bool,
}

impl PermissionChanges {
    /// Revocations must reach disk before the triggering call returns.
    pub fn security_relevant(&self) -> bool {
        !self.revoked.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.revoked.is_empty() && self.promoted.is_empty()
    }

    fn merge(&mut self, other: PermissionChanges) {
        self.granted.extend(other.granted);
        self.revoked.extend(other.revoked);
        self.promoted.extend(other.promoted);
        self.kill_requested |= other.kill_requested;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    #[error("unknown package {0}")]
    UnknownPackage(String),
    #[error("unknown permission {0}")]
    UnknownPermission(String),
    #[error("unknown user {0}")]
    UnknownUser(UserId),
    #[error("package {package} has not requested {permission}")]
    NotRequested { package: String, permission: String },
    #[error("{permission} is not a runtime permission for {package}")]
    NotRuntime { package: String, permission: String },
    #[error("{permission} is fixed by policy for {package}")]
    PolicyFixed { package: String, permission: String },
}

enum GrantDecision {
    Install(bool),
    Runtime,
    Promote,
    Undefined,
}

struct RoleHolders {
    installer: Option<String>,
    verifier: Option<String>,
}

/// Recomputes grants after packages change. Runs under the registry lock and
/// never blocks: kills it decides on are queued for the service to deliver.
#[derive(Clone)]
pub struct PermissionMigrator {
    config: Arc<ServiceConfig>,
    policy: Arc<dyn PolicyOracle>,
    kills: mpsc::UnboundedSender<KillRequest>,
}

impl PermissionMigrator {
    pub fn new(
        config: Arc<ServiceConfig>,
        policy: Arc<dyn PolicyOracle>,
        kills: mpsc::UnboundedSender<KillRequest>,
    ) -> Self {
        Self {
            config,
            policy,
            kills,
        }
    }

    /// With a changed package, updates it and every package requesting a
    /// permission it defines; without one, updates every package.
    pub fn update_permissions(
        &self,
        settings: &mut RegistryGuard<'_>,
        changed: Option<&str>,
        pass: &PermissionPass,
    ) -> PermissionChanges {
        let targets = match changed {
            None => settings.package_names(),
            Some(name) => {
                let defined = settings
                    .permission_definitions()
                    .iter()
                    .filter(|(_, definition)| definition.owner == name)
                    .map(|(permission, _)| permission.clone())
                    .collect::<BTreeSet<_>>();
                let mut targets = vec![name.to_string()];
                targets.extend(
                    dependents_of(settings, &defined)
                        .into_iter()
                        .filter(|dependent| dependent != name),
                );
                targets
            }
        };

        let mut changes = PermissionChanges::default();
        for target in targets {
            let empty = PermissionPass::default();
            let pass = if Some(target.as_str()) == changed {
                pass
            } else {
                &empty
            };
            changes.merge(self.update_package(settings, &target, pass));
        }
        changes
    }

    pub fn update_package(
        &self,
        settings: &mut RegistryGuard<'_>,
        name: &str,
        pass: &PermissionPass,
    ) -> PermissionChanges {
        self.update_package_with(settings, name, pass, None)
    }

    /// `removed_definitions` holds the definitions as they were before a
    /// definer went away; gid changes are measured against them.
    fn update_package_with(
        &self,
        settings: &mut Settings,
        name: &str,
        pass: &PermissionPass,
        removed_definitions: Option<&BTreeMap<String, PermissionDefinition>>,
    ) -> PermissionChanges {
        let mut changes = PermissionChanges::default();
        let Some(entry) = settings.package(name).cloned() else {
            return changes;
        };
        let Some(before) = settings.permissions(name).cloned() else {
            return changes;
        };
        let definitions = settings.permission_definitions().clone();
        let users = settings.users();
        let requested = requested_by_holder(settings, &entry);
        let legacy = entry.target_sdk < RUNTIME_PERMISSIONS_TARGET_SDK;
        let roles = RoleHolders {
            installer: self.policy.required_installer(),
            verifier: self.policy.required_verifier(),
        };

        let decisions = requested
            .iter()
            .map(|permission| {
                let decision = match definitions.get(permission) {
                    None => GrantDecision::Undefined,
                    Some(definition) => match definition.declaration.protection {
                        ProtectionLevel::Normal => GrantDecision::Install(true),
                        ProtectionLevel::Dangerous if legacy => GrantDecision::Install(true),
                        ProtectionLevel::Dangerous if before.install_grant(permission).is_some() => {
                            GrantDecision::Promote
                        }
                        ProtectionLevel::Dangerous => GrantDecision::Runtime,
                        ProtectionLevel::Signature | ProtectionLevel::SignatureOrSystem => {
                            GrantDecision::Install(self.signature_grant_allowed(
                                settings,
                                &entry,
                                definition,
                                before.has_install_permission(permission),
                                &roles,
                            ))
                        }
                    },
                };
                (permission.clone(), decision)
            })
            .collect::<Vec<_>>();

        let Some(holder) = settings.permissions_mut(name) else {
            return changes;
        };
        for (permission, decision) in decisions {
            match decision {
                GrantDecision::Install(true) => {
                    if holder.grant_install(&permission) {
                        changes.granted.push(permission);
                    }
                }
                GrantDecision::Install(false) => {
                    if holder.revoke_install(&permission) {
                        changes.revoked.push(permission);
                    }
                }
                GrantDecision::Promote => {
                    promote_to_runtime(holder, &permission, &users);
                    debug!(package = name, %permission, "promoted install grant to runtime grants");
                    changes.promoted.push(permission);
                }
                GrantDecision::Runtime => {
                    for user in &pass.grant_runtime_to {
                        if entry.is_installed_for(*user) && holder.grant_runtime(&permission, *user)
                        {
                            changes.granted.push(permission.clone());
                        }
                    }
                }
                GrantDecision::Undefined => {
                    if forget_everywhere(holder, &permission, &users) {
                        changes.revoked.push(permission);
                    }
                }
            }
        }

        match &entry.shared_user {
            None => {
                let stale = holder
                    .install_permission_names()
                    .into_iter()
                    .chain(
                        users
                            .iter()
                            .flat_map(|user| holder.runtime_permission_names(*user)),
                    )
                    .filter(|permission| !requested.contains(permission))
                    .collect::<BTreeSet<_>>();
                for permission in stale {
                    if forget_everywhere(holder, &permission, &users) {
                        changes.revoked.push(permission);
                    }
                }
            }
            Some(shared) => {
                changes
                    .revoked
                    .extend(settings.prune_shared_user_permissions(shared));
            }
        }

        if !changes.revoked.is_empty() {
            if let Some(after) = settings.permissions(name) {
                let gid_definitions = removed_definitions.unwrap_or(&definitions);
                let gids_changed = users.iter().any(|user| {
                    before.gids(*user, gid_definitions) != after.gids(*user, gid_definitions)
                });
                if gids_changed {
                    self.request_kill(&entry, "permission grant or revoke changed gids");
                    changes.kill_requested = true;
                }
            }
        }
        if !changes.is_empty() {
            info!(
                package = name,
                granted = changes.granted.len(),
                revoked = changes.revoked.len(),
                promoted = changes.promoted.len(),
                "permissions updated"
            );
        }
        changes
    }

    fn signature_grant_allowed(
        &self,
        settings: &Settings,
        entry: &RegistryEntry,
        definition: &PermissionDefinition,
        already_granted: bool,
        roles: &RoleHolders,
    ) -> bool {
        let declaration = &definition.declaration;
        let owner_signed = settings.package(&definition.owner).is_some_and(|owner| {
            compare_signatures(&owner.certificates, &entry.certificates).is_match()
        });
        if owner_signed {
            return true;
        }
        if !self.config.platform_certificates.is_empty() {
            let platform = CertificateSet::new(&self.config.platform_certificates);
            if compare_signatures(&platform, &entry.certificates).is_match() {
                return true;
            }
        }
        if self
            .config
            .signature_allowlisted(&entry.name, &declaration.name)
        {
            return true;
        }

        let factory_original = settings.disabled_system_package(&entry.name);
        let factory = entry.flags.system || factory_original.is_some();
        let privileged = entry.flags.privileged
            || factory_original.is_some_and(|original| original.flags.privileged);
        if declaration.protection == ProtectionLevel::SignatureOrSystem && factory {
            return true;
        }
        if declaration.has_flag(ProtectionFlag::Privileged) && privileged {
            return true;
        }
        if declaration.has_flag(ProtectionFlag::Installer)
            && roles.installer.as_deref() == Some(entry.name.as_str())
        {
            return true;
        }
        if declaration.has_flag(ProtectionFlag::Verifier)
            && roles.verifier.as_deref() == Some(entry.name.as_str())
        {
            return true;
        }
        if declaration.has_flag(ProtectionFlag::Development) && already_granted {
            return true;
        }
        declaration.has_flag(ProtectionFlag::PreRuntime)
            && entry.target_sdk < RUNTIME_PERMISSIONS_TARGET_SDK
    }

    fn runtime_permission_target(
        &self,
        settings: &Settings,
        package: &str,
        permission: &str,
        user: UserId,
    ) -> Result<(), PermissionError> {
        let entry = settings
            .package(package)
            .ok_or_else(|| PermissionError::UnknownPackage(package.to_string()))?;
        if !settings.has_user(user) {
            return Err(PermissionError::UnknownUser(user));
        }
        let definition = settings
            .permission_definition(permission)
            .ok_or_else(|| PermissionError::UnknownPermission(permission.to_string()))?;
        if !requested_by_holder(settings, entry).contains(permission) {
            return Err(PermissionError::NotRequested {
                package: package.to_string(),
                permission: permission.to_string(),
            });
        }
        if definition.declaration.protection != ProtectionLevel::Dangerous
            || entry.target_sdk < RUNTIME_PERMISSIONS_TARGET_SDK
        {
            return Err(PermissionError::NotRuntime {
                package: package.to_string(),
                permission: permission.to_string(),
            });
        }
        Ok(())
    }

    fn ensure_not_fixed(
        settings: &Settings,
        package: &str,
        permission: &str,
        user: UserId,
    ) -> Result<(), PermissionError> {
        let flags = settings
            .permissions(package)
            .map(|holder| holder.flags(permission, user))
            .unwrap_or_default();
        if flags.intersects(PermissionFlags::POLICY_FIXED | PermissionFlags::SYSTEM_FIXED) {
            return Err(PermissionError::PolicyFixed {
                package: package.to_string(),
                permission: permission.to_string(),
            });
        }
        Ok(())
    }

    pub fn grant_runtime_permission(
        &self,
        settings: &mut RegistryGuard<'_>,
        package: &str,
        permission: &str,
        user: UserId,
    ) -> Result<bool, PermissionError> {
        self.runtime_permission_target(settings, package, permission, user)?;
        Self::ensure_not_fixed(settings, package, permission, user)?;
        let holder = settings
            .permissions_mut(package)
            .ok_or_else(|| PermissionError::UnknownPackage(package.to_string()))?;
        let changed = holder.grant_runtime(permission, user);
        if changed {
            info!(package, permission, user, "runtime permission granted");
        }
        Ok(changed)
    }

    pub fn revoke_runtime_permission(
        &self,
        settings: &mut RegistryGuard<'_>,
        package: &str,
        permission: &str,
        user: UserId,
    ) -> Result<bool, PermissionError> {
        self.runtime_permission_target(settings, package, permission, user)?;
        Self::ensure_not_fixed(settings, package, permission, user)?;
        let holder = settings
            .permissions_mut(package)
            .ok_or_else(|| PermissionError::UnknownPackage(package.to_string()))?;
        let changed = holder.revoke_runtime(permission, user);
        if changed {
            info!(package, permission, user, "runtime permission revoked");
            if let Some(entry) = settings.package(package) {
                let entry = entry.clone();
                self.request_kill(&entry, "permission revoked");
            }
        }
        Ok(changed)
    }

    pub fn update_permission_flags(
        &self,
        settings: &mut RegistryGuard<'_>,
        package: &str,
        permission: &str,
        user: UserId,
        mask: PermissionFlags,
        values: PermissionFlags,
    ) -> Result<bool, PermissionError> {
        self.runtime_permission_target(settings, package, permission, user)?;
        let holder = settings
            .permissions_mut(package)
            .ok_or_else(|| PermissionError::UnknownPackage(package.to_string()))?;
        Ok(holder.update_runtime_flags(permission, user, mask, values))
    }

    /// Undoes what the user changed for `package` on `user`, as part of
    /// clearing its data.
    pub fn reset_user_changes(
        &self,
        settings: &mut RegistryGuard<'_>,
        package: &str,
        user: UserId,
    ) -> Vec<String> {
        let Some(holder) = settings.permissions_mut(package) else {
            return Vec::new();
        };
        let revoked = holder.reset_runtime_user_changes(user);
        if !revoked.is_empty() {
            if let Some(entry) = settings.package(package) {
                let entry = entry.clone();
                self.request_kill(&entry, "permissions reset");
            }
        }
        revoked
    }

    /// Drops every definition `owner` holds and revokes the matching grants.
    pub fn remove_definitions(
        &self,
        settings: &mut RegistryGuard<'_>,
        owner: &str,
    ) -> PermissionChanges {
        let previous = settings.permission_definitions().clone();
        let removed = settings
            .remove_permission_definitions(owner)
            .into_iter()
            .collect::<BTreeSet<_>>();
        let mut changes = PermissionChanges::default();
        if removed.is_empty() {
            return changes;
        }
        debug!(owner, permissions = ?removed, "permission definitions removed");
        for dependent in dependents_of(settings, &removed) {
            if dependent != owner {
                changes.merge(self.update_package_with(
                    settings,
                    &dependent,
                    &PermissionPass::default(),
                    Some(&previous),
                ));
            }
        }
        changes
    }

    fn request_kill(&self, entry: &RegistryEntry, reason: &str) {
        let request = KillRequest {
            app_id: entry.app_id,
            package: entry.name.clone(),
            reason: reason.to_string(),
        };
        if self.kills.send(request).is_err() {
            warn!(package = %entry.name, reason, "kill dispatcher is gone; dropping kill request");
        }
    }
}

/// Permissions requested by the grant holder: the package itself, or every
/// member of its shared identity.
fn requested_by_holder(settings: &Settings, entry: &RegistryEntry) -> BTreeSet<String> {
    match entry
        .shared_user
        .as_deref()
        .and_then(|shared| settings.shared_user(shared))
    {
        Some(shared) => shared
            .members
            .iter()
            .filter_map(|member| settings.package(member))
            .flat_map(|member| member.requested_permissions.iter().cloned())
            .collect(),
        None => entry.requested_permissions.iter().cloned().collect(),
    }
}

fn dependents_of(settings: &Settings, permissions: &BTreeSet<String>) -> Vec<String> {
    settings
        .packages()
        .filter(|entry| {
            entry
                .requested_permissions
                .iter()
                .any(|permission| permissions.contains(permission))
        })
        .map(|entry| entry.name.clone())
        .collect()
}

/// Moves an install-time grant to every user. A grant marked
/// revoke-on-upgrade is not carried over and loses the mark.
fn promote_to_runtime(holder: &mut PermissionsState, permission: &str, users: &[UserId]) {
    let grant = holder.forget_install(permission).unwrap_or_default();
    let mut flags = grant.flags;
    let revoke = flags.contains(PermissionFlags::REVOKE_ON_UPGRADE);
    flags.remove(PermissionFlags::REVOKE_ON_UPGRADE);
    for user in users {
        if grant.granted && !revoke {
            holder.grant_runtime(permission, *user);
        } else {
            holder.revoke_runtime(permission, *user);
        }
        holder.update_runtime_flags(permission, *user, PermissionFlags::ALL, flags);
    }
}

fn forget_everywhere(holder: &mut PermissionsState, permission: &str, users: &[UserId]) -> bool {
    let mut was_granted = holder
        .forget_install(permission)
        .is_some_and(|grant| grant.granted);
    for user in users {
        was_granted |= holder
            .forget_runtime(permission, *user)
            .is_some_and(|grant| grant.granted);
    }
    was_granted
}
