use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use pkgmgr_core::{
    CertificateSet, ComponentDeclaration, DomainVerificationStatus, EnabledState,
    KeySetDeclaration, PackageDescriptor, UserId,
};
use serde::{Deserialize, Serialize};

use crate::permissions::PermissionsState;
use crate::shared::AppIdOwner;

pub type AppId = u32;

pub const FIRST_APPLICATION_UID: AppId = 10_000;
pub const LAST_APPLICATION_UID: AppId = 19_999;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFlags {
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub privileged: bool,
    /// A user-installed update shadowing a disabled factory version.
    #[serde(default)]
    pub updated_system: bool,
    #[serde(default)]
    pub forward_locked: bool,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub debuggable: bool,
    #[serde(default)]
    pub test_only: bool,
    #[serde(default)]
    pub has_code: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    #[default]
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub stopped: bool,
    #[serde(default)]
    pub not_launched: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub block_uninstall: bool,
    #[serde(default)]
    pub enabled: EnabledState,
    #[serde(default)]
    pub domain_verification: DomainVerificationStatus,
    #[serde(default)]
    pub disabled_components: BTreeSet<String>,
    #[serde(default)]
    pub enabled_components: BTreeSet<String>,
    /// Components that only the package itself or the system may toggle.
    #[serde(default)]
    pub protected_components: BTreeSet<String>,
    /// Components made visible to instant apps for this user.
    #[serde(default)]
    pub visible_components: BTreeSet<String>,
}

impl Default for UserState {
    fn default() -> Self {
        Self::not_installed()
    }
}

impl UserState {
    /// State for a user that just received the package: not yet launched.
    pub fn fresh_install() -> Self {
        Self {
            installed: true,
            stopped: true,
            not_launched: true,
            ..Self::not_installed()
        }
    }

    pub fn not_installed() -> Self {
        Self {
            installed: false,
            stopped: false,
            not_launched: false,
            hidden: false,
            suspended: false,
            block_uninstall: false,
            enabled: EnabledState::Default,
            domain_verification: DomainVerificationStatus::Undefined,
            disabled_components: BTreeSet::new(),
            enabled_components: BTreeSet::new(),
            protected_components: BTreeSet::new(),
            visible_components: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    /// Name the package was first installed under when it has since been renamed.
    #[serde(default)]
    pub real_name: Option<String>,
    #[serde(default)]
    pub shared_user: Option<String>,
    pub app_id: AppId,
    pub code_path: PathBuf,
    pub resource_path: PathBuf,
    #[serde(default)]
    pub native_library_path: Option<PathBuf>,
    #[serde(default)]
    pub primary_abi: Option<String>,
    #[serde(default)]
    pub secondary_abi: Option<String>,
    #[serde(default)]
    pub volume_uuid: Option<String>,
    pub version_code: u64,
    #[serde(default)]
    pub version_name: Option<String>,
    pub target_sdk: u32,
    #[serde(default)]
    pub flags: EntryFlags,
    #[serde(default)]
    pub certificates: CertificateSet,
    #[serde(default)]
    pub certificate_history: Vec<CertificateSet>,
    #[serde(default)]
    pub key_sets: Vec<KeySetDeclaration>,
    #[serde(default)]
    pub upgrade_key_sets: Vec<String>,
    #[serde(default)]
    pub installer: Option<String>,
    #[serde(default)]
    pub first_install_time: u64,
    #[serde(default)]
    pub last_update_time: u64,
    #[serde(default)]
    pub install_status: InstallStatus,
    #[serde(skip)]
    pub users: BTreeMap<UserId, UserState>,
    #[serde(default)]
    pub permissions: PermissionsState,
    #[serde(default)]
    pub requested_permissions: Vec<String>,
    #[serde(default)]
    pub declared_permissions: Vec<String>,
    #[serde(default)]
    pub provider_authorities: Vec<String>,
    #[serde(default)]
    pub components: Vec<ComponentDeclaration>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub verify_hosts: BTreeSet<String>,
    #[serde(default)]
    pub needs_certificate_recollection: bool,
}

impl RegistryEntry {
    pub fn new(name: impl Into<String>, app_id: AppId, code_path: impl Into<PathBuf>) -> Self {
        let code_path = code_path.into();
        let now = current_unix_timestamp();
        Self {
            name: name.into(),
            real_name: None,
            shared_user: None,
            app_id,
            resource_path: code_path.clone(),
            code_path,
            native_library_path: None,
            primary_abi: None,
            secondary_abi: None,
            volume_uuid: None,
            version_code: 0,
            version_name: None,
            target_sdk: 0,
            flags: EntryFlags::default(),
            certificates: CertificateSet::default(),
            certificate_history: Vec::new(),
            key_sets: Vec::new(),
            upgrade_key_sets: Vec::new(),
            installer: None,
            first_install_time: now,
            last_update_time: now,
            install_status: InstallStatus::Complete,
            users: BTreeMap::new(),
            permissions: PermissionsState::default(),
            requested_permissions: Vec::new(),
            declared_permissions: Vec::new(),
            provider_authorities: Vec::new(),
            components: Vec::new(),
            parent: None,
            children: Vec::new(),
            verify_hosts: BTreeSet::new(),
            needs_certificate_recollection: false,
        }
    }

    /// Refreshes every field that comes from the scanned descriptor. Identity,
    /// app id, user state and grants are left alone.
    pub fn apply_descriptor(&mut self, descriptor: &PackageDescriptor) {
        if !self.certificates.is_empty() && self.certificates != descriptor.certificates {
            self.certificate_history.push(self.certificates.clone());
        }
        self.shared_user = descriptor.shared_user_id.clone();
        self.code_path = descriptor.code_path.clone();
        self.resource_path = descriptor.code_path.clone();
        self.version_code = descriptor.version_code;
        self.version_name = descriptor.version_name.clone();
        self.target_sdk = descriptor.target_sdk;
        self.flags.system = descriptor.attributes.system;
        self.flags.privileged = descriptor.attributes.privileged;
        self.flags.forward_locked = descriptor.attributes.forward_locked;
        self.flags.external = descriptor.attributes.external;
        self.flags.ephemeral = descriptor.attributes.ephemeral;
        self.flags.debuggable = descriptor.flags.debuggable;
        self.flags.test_only = descriptor.flags.test_only;
        self.flags.has_code = descriptor.flags.has_code;
        self.certificates = descriptor.certificates.clone();
        self.key_sets = descriptor.key_sets.clone();
        self.upgrade_key_sets = descriptor.upgrade_key_sets.clone();
        self.requested_permissions = descriptor.requested_permissions.clone();
        self.declared_permissions = descriptor
            .permissions
            .iter()
            .map(|permission| permission.name.clone())
            .collect();
        self.provider_authorities = descriptor
            .provider_authorities()
            .into_iter()
            .map(str::to_string)
            .collect();
        self.components = descriptor.components.clone();
        self.children = descriptor
            .child_packages
            .iter()
            .map(|child| child.name.clone())
            .collect();
        self.verify_hosts = descriptor.hosts_to_verify();
        self.needs_certificate_recollection = false;
        self.last_update_time = current_unix_timestamp();
    }

    pub fn user_state(&self, user: UserId) -> Option<&UserState> {
        self.users.get(&user)
    }

    pub fn user_state_mut(&mut self, user: UserId) -> &mut UserState {
        self.users.entry(user).or_insert_with(UserState::not_installed)
    }

    pub fn is_installed_for(&self, user: UserId) -> bool {
        self.users.get(&user).is_some_and(|state| state.installed)
    }

    pub fn installed_users(&self) -> Vec<UserId> {
        self.users
            .iter()
            .filter(|(_, state)| state.installed)
            .map(|(user, _)| *user)
            .collect()
    }

    pub fn is_installed_for_any(&self) -> bool {
        self.users.values().any(|state| state.installed)
    }

    pub fn is_factory(&self) -> bool {
        self.flags.system
    }

    /// Sub-packages run under their parent's app id.
    pub fn app_id_owner(&self) -> AppIdOwner {
        match (&self.shared_user, &self.parent) {
            (Some(shared), _) => AppIdOwner::Shared(shared.clone()),
            (None, Some(parent)) => AppIdOwner::Package(parent.clone()),
            (None, None) => AppIdOwner::Package(self.name.clone()),
        }
    }

    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.install_status == InstallStatus::Complete
    }
}

pub(crate) fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
