use std::collections::BTreeSet;

use pkgmgr_core::CertificateSet;
use serde::{Deserialize, Serialize};

use crate::entry::AppId;
use crate::permissions::PermissionsState;

/// A named group of packages sharing one app id, one permission set and one
/// signing identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedUser {
    pub name: String,
    pub app_id: AppId,
    #[serde(default)]
    pub members: BTreeSet<String>,
    #[serde(default)]
    pub certificates: CertificateSet,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub permissions: PermissionsState,
}

impl SharedUser {
    pub fn new(name: impl Into<String>, app_id: AppId) -> Self {
        Self {
            name: name.into(),
            app_id,
            members: BTreeSet::new(),
            certificates: CertificateSet::default(),
            system: false,
            privileged: false,
            permissions: PermissionsState::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Who holds a numeric app id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum AppIdOwner {
    Package(String),
    Shared(String),
}

impl AppIdOwner {
    pub fn name(&self) -> &str {
        match self {
            Self::Package(name) | Self::Shared(name) => name,
        }
    }
}
