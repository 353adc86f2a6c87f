use std::collections::{BTreeMap, BTreeSet};

use pkgmgr_core::{PermissionDeclaration, PermissionFlags, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    #[serde(default)]
    pub granted: bool,
    #[serde(default)]
    pub flags: PermissionFlags,
}

/// A permission definition and the package that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDefinition {
    pub owner: String,
    pub declaration: PermissionDeclaration,
}

/// Install-time grants plus per-user runtime grants of one permission holder
/// (a package, or the shared identity it belongs to).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionsState {
    #[serde(default)]
    install: BTreeMap<String, PermissionGrant>,
    #[serde(skip)]
    runtime: BTreeMap<UserId, BTreeMap<String, PermissionGrant>>,
}

impl PermissionsState {
    pub fn has_install_permission(&self, name: &str) -> bool {
        self.install.get(name).is_some_and(|grant| grant.granted)
    }

    pub fn has_runtime_permission(&self, name: &str, user: UserId) -> bool {
        self.runtime
            .get(&user)
            .and_then(|grants| grants.get(name))
            .is_some_and(|grant| grant.granted)
    }

    pub fn has_permission(&self, name: &str, user: UserId) -> bool {
        self.has_install_permission(name) || self.has_runtime_permission(name, user)
    }

    pub fn install_grant(&self, name: &str) -> Option<PermissionGrant> {
        self.install.get(name).copied()
    }

    pub fn runtime_grant(&self, name: &str, user: UserId) -> Option<PermissionGrant> {
        self.runtime.get(&user)?.get(name).copied()
    }

    /// Returns true when the grant state changed.
    pub fn grant_install(&mut self, name: &str) -> bool {
        let grant = self.install.entry(name.to_string()).or_default();
        let changed = !grant.granted;
        grant.granted = true;
        changed
    }

    /// Returns true when a granted permission was revoked. Flags survive.
    pub fn revoke_install(&mut self, name: &str) -> bool {
        match self.install.get_mut(name) {
            Some(grant) if grant.granted => {
                grant.granted = false;
                true
            }
            _ => false,
        }
    }

    pub fn grant_runtime(&mut self, name: &str, user: UserId) -> bool {
        let grant = self
            .runtime
            .entry(user)
            .or_default()
            .entry(name.to_string())
            .or_default();
        let changed = !grant.granted;
        grant.granted = true;
        changed
    }

    pub fn revoke_runtime(&mut self, name: &str, user: UserId) -> bool {
        match self
            .runtime
            .get_mut(&user)
            .and_then(|grants| grants.get_mut(name))
        {
            Some(grant) if grant.granted => {
                grant.granted = false;
                true
            }
            _ => false,
        }
    }

    /// Drops an install-time record, flags included.
    pub fn forget_install(&mut self, name: &str) -> Option<PermissionGrant> {
        self.install.remove(name)
    }

    pub fn forget_runtime(&mut self, name: &str, user: UserId) -> Option<PermissionGrant> {
        self.runtime.get_mut(&user)?.remove(name)
    }

    /// Runtime flags for `user` when present, otherwise the install flags.
    pub fn flags(&self, name: &str, user: UserId) -> PermissionFlags {
        self.runtime_grant(name, user)
            .or_else(|| self.install_grant(name))
            .map(|grant| grant.flags)
            .unwrap_or_default()
    }

    pub fn update_install_flags(
        &mut self,
        name: &str,
        mask: PermissionFlags,
        values: PermissionFlags,
    ) -> bool {
        let grant = self.install.entry(name.to_string()).or_default();
        let before = grant.flags;
        grant.flags.apply(mask, values);
        before != grant.flags
    }

    pub fn update_runtime_flags(
        &mut self,
        name: &str,
        user: UserId,
        mask: PermissionFlags,
        values: PermissionFlags,
    ) -> bool {
        let grant = self
            .runtime
            .entry(user)
            .or_default()
            .entry(name.to_string())
            .or_default();
        let before = grant.flags;
        grant.flags.apply(mask, values);
        before != grant.flags
    }

    pub fn install_permission_names(&self) -> Vec<String> {
        self.install.keys().cloned().collect()
    }

    pub fn runtime_permission_names(&self, user: UserId) -> Vec<String> {
        self.runtime
            .get(&user)
            .map(|grants| grants.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn runtime_users(&self) -> Vec<UserId> {
        self.runtime.keys().copied().collect()
    }

    /// Every permission held, install or runtime, for `user`.
    pub fn granted_permissions(&self, user: UserId) -> BTreeSet<String> {
        let install = self
            .install
            .iter()
            .filter(|(_, grant)| grant.granted)
            .map(|(name, _)| name.clone());
        let runtime = self
            .runtime
            .get(&user)
            .into_iter()
            .flat_map(|grants| grants.iter())
            .filter(|(_, grant)| grant.granted)
            .map(|(name, _)| name.clone());
        install.chain(runtime).collect()
    }

    pub fn runtime_grants_for(&self, user: UserId) -> BTreeMap<String, PermissionGrant> {
        self.runtime.get(&user).cloned().unwrap_or_default()
    }

    pub fn set_runtime_grants_for(&mut self, user: UserId, grants: BTreeMap<String, PermissionGrant>) {
        if grants.is_empty() {
            self.runtime.remove(&user);
        } else {
            self.runtime.insert(user, grants);
        }
    }

    /// Clears user-set and user-fixed flags on runtime grants and revokes
    /// whatever the user had granted. Policy and system grants are kept.
    pub fn reset_runtime_user_changes(&mut self, user: UserId) -> Vec<String> {
        let mut revoked = Vec::new();
        if let Some(grants) = self.runtime.get_mut(&user) {
            for (name, grant) in grants.iter_mut() {
                let fixed_by_system = grant
                    .flags
                    .intersects(PermissionFlags::POLICY_FIXED | PermissionFlags::SYSTEM_FIXED);
                if fixed_by_system {
                    continue;
                }
                let by_default = grant.flags.contains(PermissionFlags::GRANTED_BY_DEFAULT);
                grant.flags.remove(PermissionFlags::USER_CHANGES);
                if grant.granted && !by_default {
                    grant.granted = false;
                    revoked.push(name.clone());
                }
            }
        }
        revoked
    }

    pub fn remove_user(&mut self, user: UserId) {
        self.runtime.remove(&user);
    }

    pub fn clear(&mut self) {
        self.install.clear();
        self.runtime.clear();
    }

    /// Supplementary group ids implied by the permissions held for `user`.
    pub fn gids(
        &self,
        user: UserId,
        definitions: &BTreeMap<String, PermissionDefinition>,
    ) -> BTreeSet<u32> {
        self.granted_permissions(user)
            .iter()
            .filter_map(|name| definitions.get(name))
            .flat_map(|definition| definition.declaration.gids.iter().copied())
            .collect()
    }
}
