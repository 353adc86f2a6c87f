use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::certificates::{CertificateSet, KeySetDeclaration};
use crate::component::{validate_web_host, ComponentDeclaration};
use crate::error::{PackageManagerError, PmResult};
use crate::flags::InstallLocationPreference;
use crate::outcome::InstallOutcome;
use crate::permission::{PermissionDeclaration, RUNTIME_PERMISSIONS_TARGET_SDK};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DescriptorFlags {
    #[serde(default)]
    pub has_code: bool,
    #[serde(default)]
    pub debuggable: bool,
    #[serde(default)]
    pub test_only: bool,
}

/// Facts about a package that come from where and how it is installed rather
/// than from its manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallerAttributes {
    pub system: bool,
    pub privileged: bool,
    pub forward_locked: bool,
    pub external: bool,
    pub ephemeral: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageDescriptor {
    pub name: String,
    pub version_code: u64,
    pub version_name: Option<String>,
    /// Names this package was previously published under.
    #[serde(default)]
    pub original_names: Vec<String>,
    pub shared_user_id: Option<String>,
    #[serde(default)]
    pub min_sdk: u32,
    #[serde(default = "default_target_sdk")]
    pub target_sdk: u32,
    #[serde(default)]
    pub install_location: InstallLocationPreference,
    #[serde(default)]
    pub requested_permissions: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<PermissionDeclaration>,
    #[serde(default)]
    pub components: Vec<ComponentDeclaration>,
    #[serde(default)]
    pub child_packages: Vec<PackageDescriptor>,
    #[serde(default)]
    pub native_abis: Vec<String>,
    #[serde(default)]
    pub key_sets: Vec<KeySetDeclaration>,
    #[serde(default)]
    pub upgrade_key_sets: Vec<String>,
    #[serde(default)]
    pub flags: DescriptorFlags,
    #[serde(skip)]
    pub certificates: CertificateSet,
    #[serde(skip)]
    pub attributes: InstallerAttributes,
    #[serde(skip)]
    pub code_path: PathBuf,
}

fn default_target_sdk() -> u32 {
    RUNTIME_PERMISSIONS_TARGET_SDK
}

impl PackageDescriptor {
    pub fn from_toml_str(input: &str) -> PmResult<Self> {
        let descriptor: Self = toml::from_str(input).map_err(|err| {
            PackageManagerError::new(
                InstallOutcome::ParseFailedManifestMalformed,
                format!("failed to parse package manifest: {err}"),
            )
        })?;
        descriptor.validate(true)?;
        Ok(descriptor)
    }

    fn validate(&self, allow_children: bool) -> PmResult<()> {
        validate_package_name(&self.name).map_err(|reason| {
            PackageManagerError::new(
                InstallOutcome::ParseFailedBadPackageName,
                format!("invalid package name '{}': {reason}", self.name),
            )
        })?;
        if let Some(shared_user) = &self.shared_user_id {
            validate_package_name(shared_user).map_err(|reason| {
                PackageManagerError::new(
                    InstallOutcome::ParseFailedBadSharedUserId,
                    format!("invalid shared identity '{shared_user}': {reason}"),
                )
            })?;
        }
        for original in &self.original_names {
            validate_package_name(original).map_err(|reason| {
                malformed(format!("invalid original package name '{original}': {reason}"))
            })?;
            if original == &self.name {
                return Err(malformed(format!(
                    "package '{}' lists itself as an original name",
                    self.name
                )));
            }
        }

        let mut seen_components = HashSet::new();
        for component in &self.components {
            if component.name.trim().is_empty() {
                return Err(malformed(format!(
                    "component name must not be empty in '{}'",
                    self.name
                )));
            }
            if !seen_components.insert((component.kind, component.name.clone())) {
                return Err(malformed(format!(
                    "duplicate {} declaration '{}' in '{}'",
                    component.kind.as_str(),
                    component.name,
                    self.name
                )));
            }
            if !component.is_provider() && !component.authorities.is_empty() {
                return Err(malformed(format!(
                    "only providers may declare authorities ('{}' in '{}')",
                    component.name, self.name
                )));
            }
            for host in &component.web_hosts {
                validate_web_host(host).map_err(|err| {
                    malformed(format!(
                        "invalid web host for component '{}' in '{}': {err}",
                        component.name, self.name
                    ))
                })?;
            }
        }

        let mut seen_permissions = HashSet::new();
        for permission in &self.permissions {
            if permission.name.trim().is_empty() {
                return Err(malformed(format!(
                    "permission name must not be empty in '{}'",
                    self.name
                )));
            }
            if !seen_permissions.insert(permission.name.as_str()) {
                return Err(malformed(format!(
                    "permission '{}' declared twice in '{}'",
                    permission.name, self.name
                )));
            }
        }

        for key_set in &self.upgrade_key_sets {
            if self.declared_key_set(key_set).is_none() {
                return Err(malformed(format!(
                    "upgrade key set '{key_set}' is not declared by '{}'",
                    self.name
                )));
            }
        }

        if !self.child_packages.is_empty() && !allow_children {
            return Err(malformed(format!(
                "sub-package '{}' must not declare sub-packages of its own",
                self.name
            )));
        }
        let mut child_names = HashSet::new();
        for child in &self.child_packages {
            child.validate(false)?;
            if child.name == self.name || !child_names.insert(child.name.as_str()) {
                return Err(malformed(format!(
                    "sub-package name '{}' is not unique within '{}'",
                    child.name, self.name
                )));
            }
            if child.shared_user_id.is_some() && child.shared_user_id != self.shared_user_id {
                return Err(PackageManagerError::new(
                    InstallOutcome::ParseFailedBadSharedUserId,
                    format!(
                        "sub-package '{}' must share the identity of '{}'",
                        child.name, self.name
                    ),
                ));
            }
        }

        Ok(())
    }

    pub fn uses_runtime_permissions(&self) -> bool {
        self.target_sdk >= RUNTIME_PERMISSIONS_TARGET_SDK
    }

    pub fn has_children(&self) -> bool {
        !self.child_packages.is_empty()
    }

    /// The parent followed by every declared sub-package name.
    pub fn unit_names(&self) -> Vec<String> {
        std::iter::once(self.name.clone())
            .chain(self.child_packages.iter().map(|child| child.name.clone()))
            .collect()
    }

    pub fn provider_authorities(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|component| component.is_provider())
            .flat_map(|component| component.authorities.iter().map(String::as_str))
            .collect()
    }

    pub fn hosts_to_verify(&self) -> BTreeSet<String> {
        self.components
            .iter()
            .filter(|component| component.needs_domain_verification())
            .flat_map(|component| component.web_hosts.iter().cloned())
            .collect()
    }

    pub fn declared_key_set(&self, name: &str) -> Option<&KeySetDeclaration> {
        self.key_sets.iter().find(|key_set| key_set.name == name)
    }

    pub fn declared_permission(&self, name: &str) -> Option<&PermissionDeclaration> {
        self.permissions
            .iter()
            .find(|permission| permission.name == name)
    }

    /// Sub-packages live in the parent's archive: same signers, same code
    /// location, same install attributes.
    pub fn propagate_to_children(&mut self) {
        for child in &mut self.child_packages {
            child.certificates = self.certificates.clone();
            child.attributes = self.attributes;
            child.code_path = self.code_path.clone();
            if child.shared_user_id.is_none() {
                child.shared_user_id = self.shared_user_id.clone();
            }
        }
    }
}

fn malformed(message: String) -> PackageManagerError {
    PackageManagerError::new(InstallOutcome::ParseFailedManifestMalformed, message)
}

pub fn validate_package_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name must not be empty");
    }
    let segments = name.split('.').collect::<Vec<_>>();
    if segments.len() < 2 {
        return Err("name must have at least one '.' separator");
    }
    for segment in segments {
        let mut chars = segment.chars();
        let Some(first) = chars.next() else {
            return Err("name contains an empty segment");
        };
        if !first.is_ascii_alphabetic() {
            return Err("each segment must start with an ASCII letter");
        }
        if chars.any(|ch| !(ch.is_ascii_alphanumeric() || ch == '_')) {
            return Err("name contains invalid character(s)");
        }
    }
    Ok(())
}
