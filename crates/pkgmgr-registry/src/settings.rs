use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use pkgmgr_core::{
    DomainVerificationStatus, PermissionDeclaration, UserId, SYSTEM_USER,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entry::{AppId, RegistryEntry, UserState, FIRST_APPLICATION_UID, LAST_APPLICATION_UID};
use crate::permissions::{PermissionDefinition, PermissionsState};
use crate::shared::{AppIdOwner, SharedUser};

/// Leftover code or data a removal could not delete; retried at boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRecord {
    pub name: String,
    #[serde(default)]
    pub user: Option<UserId>,
    #[serde(default)]
    pub code_path: Option<PathBuf>,
    #[serde(default)]
    pub keep_data: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedEntry {
    pub entry: RegistryEntry,
    /// Set when the app id went back to the free pool.
    pub freed_app_id: Option<AppId>,
}

/// The in-memory registry. Every mutation happens behind the registry lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub(crate) entries: BTreeMap<String, RegistryEntry>,
    pub(crate) shared_users: BTreeMap<String, SharedUser>,
    pub(crate) disabled_system: BTreeMap<String, RegistryEntry>,
    /// New name -> original name.
    pub(crate) renamed: BTreeMap<String, String>,
    pub(crate) app_ids: BTreeMap<AppId, AppIdOwner>,
    pub(crate) users: BTreeSet<UserId>,
    pub(crate) permission_definitions: BTreeMap<String, PermissionDefinition>,
    pub(crate) expecting_better: BTreeMap<String, PathBuf>,
    pub(crate) packages_to_clean: Vec<CleanupRecord>,
    pub(crate) warnings: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

impl Settings {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            shared_users: BTreeMap::new(),
            disabled_system: BTreeMap::new(),
            renamed: BTreeMap::new(),
            app_ids: BTreeMap::new(),
            users: BTreeSet::from([SYSTEM_USER]),
            permission_definitions: BTreeMap::new(),
            expecting_better: BTreeMap::new(),
            packages_to_clean: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn users(&self) -> Vec<UserId> {
        self.users.iter().copied().collect()
    }

    pub fn has_user(&self, user: UserId) -> bool {
        self.users.contains(&user)
    }

    /// Adds a user. Factory packages become installed for it; everything
    /// else starts uninstalled.
    pub fn add_user(&mut self, user: UserId) -> bool {
        if !self.users.insert(user) {
            return false;
        }
        for entry in self.entries.values_mut() {
            let state = if entry.flags.system {
                UserState::fresh_install()
            } else {
                UserState::not_installed()
            };
            entry.users.insert(user, state);
        }
        true
    }

    pub fn remove_user(&mut self, user: UserId) -> bool {
        if user == SYSTEM_USER || !self.users.remove(&user) {
            return false;
        }
        for entry in self.entries.values_mut() {
            entry.users.remove(&user);
            entry.permissions.remove_user(user);
        }
        for shared in self.shared_users.values_mut() {
            shared.permissions.remove_user(user);
        }
        true
    }

    pub fn package(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn package_mut(&mut self, name: &str) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn packages(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    pub fn package_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn installed_packages(&self, user: UserId) -> Vec<&RegistryEntry> {
        self.entries
            .values()
            .filter(|entry| entry.is_installed_for(user))
            .collect()
    }

    /// Inserts or replaces an entry and records its app id ownership.
    pub fn insert_entry(&mut self, entry: RegistryEntry) -> Option<RegistryEntry> {
        match &entry.shared_user {
            Some(shared_name) => {
                if let Some(shared) = self.shared_users.get_mut(shared_name) {
                    shared.members.insert(entry.name.clone());
                    if shared.certificates.is_empty() {
                        shared.certificates = entry.certificates.clone();
                    }
                    shared.system |= entry.flags.system;
                    shared.privileged |= entry.flags.privileged;
                } else {
                    warn!(
                        package = %entry.name,
                        shared_user = %shared_name,
                        "inserting entry for unknown shared identity"
                    );
                }
            }
            None => {
                self.app_ids.insert(entry.app_id, entry.app_id_owner());
            }
        }
        let previous = self.entries.insert(entry.name.clone(), entry);
        if let Some(previous) = &previous {
            if let Some(current) = self.entries.get(&previous.name) {
                if previous.app_id != current.app_id && previous.shared_user.is_none() {
                    self.release_app_id_if_owned(previous.app_id, &previous.name);
                }
            }
        }
        previous
    }

    /// Removes an entry, dropping shared membership and freeing the app id
    /// when nothing else holds it.
    pub fn remove_entry(&mut self, name: &str) -> Option<RemovedEntry> {
        let entry = self.entries.remove(name)?;
        let mut freed_app_id = None;
        match &entry.shared_user {
            Some(shared_name) => {
                let now_empty = match self.shared_users.get_mut(shared_name) {
                    Some(shared) => {
                        shared.members.remove(name);
                        shared.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    if let Some(shared) = self.shared_users.remove(shared_name) {
                        self.app_ids.remove(&shared.app_id);
                        freed_app_id = Some(shared.app_id);
                    }
                }
            }
            None => {
                let retained_by_factory = self
                    .disabled_system
                    .get(name)
                    .is_some_and(|disabled| disabled.app_id == entry.app_id);
                if !retained_by_factory && self.release_app_id_if_owned(entry.app_id, name) {
                    freed_app_id = Some(entry.app_id);
                }
            }
        }
        self.renamed.remove(name);
        Some(RemovedEntry {
            entry,
            freed_app_id,
        })
    }

    /// Allocates the lowest free application id.
    pub fn acquire_app_id(&mut self, owner: AppIdOwner) -> Option<AppId> {
        let app_id = (FIRST_APPLICATION_UID..=LAST_APPLICATION_UID)
            .find(|candidate| !self.app_ids.contains_key(candidate))?;
        debug!(app_id, owner = owner.name(), "allocated app id");
        self.app_ids.insert(app_id, owner);
        Some(app_id)
    }

    /// Claims a specific id, e.g. when a renamed or reinstalled package keeps
    /// its prior identity. Fails when someone else holds it.
    pub fn register_app_id(&mut self, app_id: AppId, owner: AppIdOwner) -> bool {
        match self.app_ids.get(&app_id) {
            Some(existing) if existing != &owner => false,
            _ => {
                self.app_ids.insert(app_id, owner);
                true
            }
        }
    }

    pub fn app_id_owner(&self, app_id: AppId) -> Option<&AppIdOwner> {
        self.app_ids.get(&app_id)
    }

    fn release_app_id_if_owned(&mut self, app_id: AppId, name: &str) -> bool {
        if self.app_ids.get(&app_id) == Some(&AppIdOwner::Package(name.to_string())) {
            self.app_ids.remove(&app_id);
            return true;
        }
        false
    }

    pub fn shared_user(&self, name: &str) -> Option<&SharedUser> {
        self.shared_users.get(name)
    }

    pub fn shared_user_mut(&mut self, name: &str) -> Option<&mut SharedUser> {
        self.shared_users.get_mut(name)
    }

    /// Returns the shared identity, creating it with a fresh app id when
    /// missing. `None` when the id space is exhausted.
    pub fn get_or_create_shared_user(&mut self, name: &str) -> Option<&mut SharedUser> {
        if !self.shared_users.contains_key(name) {
            let app_id = self.acquire_app_id(AppIdOwner::Shared(name.to_string()))?;
            self.shared_users
                .insert(name.to_string(), SharedUser::new(name, app_id));
        }
        self.shared_users.get_mut(name)
    }

    /// Revokes shared-identity grants no remaining member requests.
    pub fn prune_shared_user_permissions(&mut self, name: &str) -> Vec<String> {
        let Some(shared) = self.shared_users.get(name) else {
            return Vec::new();
        };
        let requested = shared
            .members
            .iter()
            .filter_map(|member| self.entries.get(member))
            .flat_map(|entry| entry.requested_permissions.iter().cloned())
            .collect::<BTreeSet<_>>();
        let users = self.users.clone();
        let Some(shared) = self.shared_users.get_mut(name) else {
            return Vec::new();
        };
        let mut revoked = Vec::new();
        for permission in shared.permissions.install_permission_names() {
            if !requested.contains(&permission) && shared.permissions.revoke_install(&permission) {
                revoked.push(permission.clone());
            }
        }
        for user in users {
            for permission in shared.permissions.runtime_permission_names(user) {
                if !requested.contains(&permission)
                    && shared.permissions.revoke_runtime(&permission, user)
                {
                    revoked.push(permission);
                }
            }
        }
        revoked
    }

    /// The grant holder of a package: its shared identity when it has one.
    pub fn permissions(&self, package: &str) -> Option<&PermissionsState> {
        let entry = self.entries.get(package)?;
        match &entry.shared_user {
            Some(shared) => self
                .shared_users
                .get(shared)
                .map(|shared| &shared.permissions),
            None => Some(&entry.permissions),
        }
    }

    pub fn permissions_mut(&mut self, package: &str) -> Option<&mut PermissionsState> {
        let shared = self.entries.get(package)?.shared_user.clone();
        match shared {
            Some(shared) => self
                .shared_users
                .get_mut(&shared)
                .map(|shared| &mut shared.permissions),
            None => self
                .entries
                .get_mut(package)
                .map(|entry| &mut entry.permissions),
        }
    }

    /// Moves a copy of the factory entry aside so a user update can shadow it.
    pub fn disable_system_package(&mut self, name: &str) -> bool {
        let Some(entry) = self.entries.get_mut(name) else {
            return false;
        };
        if !entry.flags.system || self.disabled_system.contains_key(name) {
            return false;
        }
        let mut disabled = entry.clone();
        disabled.flags.updated_system = false;
        entry.flags.updated_system = true;
        self.disabled_system.insert(name.to_string(), disabled);
        true
    }

    /// Restores the factory entry, carrying over per-user state and grants of
    /// the update it replaces.
    pub fn enable_system_package(&mut self, name: &str) -> Option<&RegistryEntry> {
        let mut restored = self.disabled_system.remove(name)?;
        if let Some(current) = self.entries.remove(name) {
            restored.users = current.users;
            restored.permissions = current.permissions;
            if current.app_id != restored.app_id && current.shared_user.is_none() {
                self.release_app_id_if_owned(current.app_id, name);
            }
        }
        restored.flags.updated_system = false;
        if restored.shared_user.is_none() {
            self.app_ids
                .insert(restored.app_id, AppIdOwner::Package(name.to_string()));
        }
        self.entries.insert(name.to_string(), restored);
        self.entries.get(name)
    }

    pub fn disabled_system_package(&self, name: &str) -> Option<&RegistryEntry> {
        self.disabled_system.get(name)
    }

    pub fn remove_disabled_system_package(&mut self, name: &str) -> Option<RegistryEntry> {
        self.disabled_system.remove(name)
    }

    pub fn record_rename(&mut self, new_name: &str, original: &str) {
        self.renamed
            .insert(new_name.to_string(), original.to_string());
    }

    pub fn renamed_from(&self, new_name: &str) -> Option<&str> {
        self.renamed.get(new_name).map(String::as_str)
    }

    pub fn permission_definition(&self, name: &str) -> Option<&PermissionDefinition> {
        self.permission_definitions.get(name)
    }

    pub fn permission_definitions(&self) -> &BTreeMap<String, PermissionDefinition> {
        &self.permission_definitions
    }

    /// Records `owner` as the definer of a permission. Redefinition by the
    /// same owner updates it; another owner gets its name back as the error.
    pub fn define_permission(
        &mut self,
        owner: &str,
        declaration: PermissionDeclaration,
    ) -> Result<(), String> {
        if let Some(existing) = self.permission_definitions.get(&declaration.name) {
            if existing.owner != owner {
                return Err(existing.owner.clone());
            }
        }
        self.permission_definitions.insert(
            declaration.name.clone(),
            PermissionDefinition {
                owner: owner.to_string(),
                declaration,
            },
        );
        Ok(())
    }

    pub fn remove_permission_definitions(&mut self, owner: &str) -> Vec<String> {
        let owned = self
            .permission_definitions
            .iter()
            .filter(|(_, definition)| definition.owner == owner)
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        for name in &owned {
            self.permission_definitions.remove(name);
        }
        owned
    }

    pub fn authority_owner(&self, authority: &str) -> Option<&str> {
        self.entries
            .values()
            .find(|entry| {
                entry
                    .provider_authorities
                    .iter()
                    .any(|candidate| candidate == authority)
            })
            .map(|entry| entry.name.as_str())
    }

    /// Remembers a factory archive that lost to a newer user update so boot
    /// can fall back to it if the update disappears.
    pub fn expect_better(&mut self, name: &str, code_path: &Path) {
        self.expecting_better
            .insert(name.to_string(), code_path.to_path_buf());
    }

    pub fn expecting_better(&self, name: &str) -> Option<&Path> {
        self.expecting_better.get(name).map(PathBuf::as_path)
    }

    pub fn take_expecting_better(&mut self) -> BTreeMap<String, PathBuf> {
        std::mem::take(&mut self.expecting_better)
    }

    pub fn schedule_cleanup(&mut self, record: CleanupRecord) {
        if !self.packages_to_clean.contains(&record) {
            self.packages_to_clean.push(record);
        }
    }

    pub fn packages_to_clean(&self) -> &[CleanupRecord] {
        &self.packages_to_clean
    }

    pub fn take_packages_to_clean(&mut self) -> Vec<CleanupRecord> {
        std::mem::take(&mut self.packages_to_clean)
    }

    pub fn record_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(%message, "registry warning");
        self.warnings.push(message);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn domain_verification_status(
        &self,
        name: &str,
        user: UserId,
    ) -> Option<DomainVerificationStatus> {
        self.entries
            .get(name)?
            .user_state(user)
            .map(|state| state.domain_verification)
    }

    pub fn set_domain_verification_status(
        &mut self,
        name: &str,
        user: UserId,
        status: DomainVerificationStatus,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(name) else {
            return false;
        };
        let state = entry.user_state_mut(user);
        let changed = state.domain_verification != status;
        state.domain_verification = status;
        changed
    }
}
