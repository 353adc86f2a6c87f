use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub type UserId = u32;

/// The owner user, present on every system.
pub const SYSTEM_USER: UserId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserTarget {
    All,
    User(UserId),
}

impl UserTarget {
    pub fn includes(self, user: UserId) -> bool {
        match self {
            Self::All => true,
            Self::User(id) => id == user,
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "all" => Some(Self::All),
            other => other.parse().ok().map(Self::User),
        }
    }
}

impl std::fmt::Display for UserTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::User(id) => write!(f, "{id}"),
        }
    }
}

/// Where an install request's archive comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// An archive somewhere on disk; copied into a private staging area.
    File(PathBuf),
    /// A directory already staged by an install session; moved, not copied.
    Staged(PathBuf),
    /// An archive inside a removable-media container.
    Container(String),
    /// An already-installed package being moved between volumes.
    Existing(String),
}

impl Origin {
    pub fn describe(&self) -> String {
        match self {
            Self::File(path) => format!("file:{}", path.display()),
            Self::Staged(path) => format!("staged:{}", path.display()),
            Self::Container(cid) => format!("container:{cid}"),
            Self::Existing(name) => format!("existing:{name}"),
        }
    }

    pub fn is_staged(&self) -> bool {
        matches!(self, Self::Staged(_) | Self::Existing(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnabledState {
    #[default]
    Default,
    Enabled,
    Disabled,
    DisabledUser,
}

impl EnabledState {
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Default | Self::Enabled)
    }
}

/// Per-user policy for handling the web domains a package claims.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DomainVerificationStatus {
    #[default]
    Undefined,
    Ask,
    Always,
    Never,
    AlwaysAsk,
}
