use serde::{Deserialize, Serialize};

use crate::error::{PackageManagerError, PmResult};
use crate::outcome::InstallOutcome;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallFlags {
    pub replace_existing: bool,
    pub allow_test: bool,
    pub allow_downgrade: bool,
    /// Force placement on internal storage.
    pub internal: bool,
    /// Force placement on removable media.
    pub external: bool,
    /// Explicit target volume; wins over `internal`/`external`.
    pub volume_uuid: Option<String>,
    pub forward_locked: bool,
    pub from_shell: bool,
    pub grant_runtime_permissions: bool,
    pub ephemeral: bool,
    pub dont_kill_app: bool,
}

impl InstallFlags {
    pub fn validate(&self) -> PmResult<()> {
        if self.internal && self.external {
            return Err(PackageManagerError::new(
                InstallOutcome::InvalidInstallLocation,
                "requested both internal and external install location",
            ));
        }
        if self.ephemeral && (self.external || self.forward_locked) {
            return Err(PackageManagerError::new(
                InstallOutcome::InvalidInstallLocation,
                "ephemeral packages must be installed internally and unlocked",
            ));
        }
        if self.forward_locked && self.external && self.volume_uuid.is_none() {
            return Err(PackageManagerError::new(
                InstallOutcome::InvalidInstallLocation,
                "forward-locked packages cannot be placed on removable media",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UninstallFlags {
    pub keep_data: bool,
    pub all_users: bool,
    /// Remove a factory package for every user (it stays on the read-only image).
    pub system_app: bool,
    pub dont_kill_app: bool,
}

/// Placement preference declared by the package itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallLocationPreference {
    #[default]
    Auto,
    InternalOnly,
    PreferExternal,
}

/// Where the pipeline decided to put the package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallLocation {
    Internal,
    External,
    Volume(String),
}

impl InstallLocation {
    pub fn volume_uuid(&self) -> Option<&str> {
        match self {
            Self::Volume(uuid) => Some(uuid),
            _ => None,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Self::External)
    }
}
