use serde::{Deserialize, Serialize};

/// First target SDK level at which dangerous permissions become per-user
/// runtime grants instead of install-time grants.
pub const RUNTIME_PERMISSIONS_TARGET_SDK: u32 = 23;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ProtectionLevel {
    Normal,
    Dangerous,
    Signature,
    SignatureOrSystem,
}

impl ProtectionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Dangerous => "dangerous",
            Self::Signature => "signature",
            Self::SignatureOrSystem => "signature-or-system",
        }
    }

    pub fn is_signature(self) -> bool {
        matches!(self, Self::Signature | Self::SignatureOrSystem)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ProtectionFlag {
    Privileged,
    Installer,
    Verifier,
    Development,
    PreRuntime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionDeclaration {
    pub name: String,
    pub protection: ProtectionLevel,
    #[serde(default)]
    pub protection_flags: Vec<ProtectionFlag>,
    pub group: Option<String>,
    #[serde(default)]
    pub gids: Vec<u32>,
}

impl PermissionDeclaration {
    pub fn has_flag(&self, flag: ProtectionFlag) -> bool {
        self.protection_flags.contains(&flag)
    }
}

/// Per-grant flag word. Bit positions are persisted, do not renumber.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct PermissionFlags(u32);

impl PermissionFlags {
    pub const NONE: Self = Self(0);
    pub const USER_SET: Self = Self(1 << 0);
    pub const USER_FIXED: Self = Self(1 << 1);
    pub const POLICY_FIXED: Self = Self(1 << 2);
    pub const REVOKE_ON_UPGRADE: Self = Self(1 << 3);
    pub const SYSTEM_FIXED: Self = Self(1 << 4);
    pub const GRANTED_BY_DEFAULT: Self = Self(1 << 5);
    pub const REVIEW_REQUIRED: Self = Self(1 << 6);
    pub const ALL: Self = Self((1 << 7) - 1);

    /// Flags recording an explicit user decision.
    pub const USER_CHANGES: Self = Self(Self::USER_SET.0 | Self::USER_FIXED.0);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Replaces the bits selected by `mask` with the matching bits of `values`.
    pub fn apply(&mut self, mask: Self, values: Self) {
        self.0 = (self.0 & !mask.0) | (values.0 & mask.0);
    }

    pub fn describe(self) -> Vec<&'static str> {
        const NAMES: [(PermissionFlags, &str); 7] = [
            (PermissionFlags::USER_SET, "user-set"),
            (PermissionFlags::USER_FIXED, "user-fixed"),
            (PermissionFlags::POLICY_FIXED, "policy-fixed"),
            (PermissionFlags::REVOKE_ON_UPGRADE, "revoke-on-upgrade"),
            (PermissionFlags::SYSTEM_FIXED, "system-fixed"),
            (PermissionFlags::GRANTED_BY_DEFAULT, "granted-by-default"),
            (PermissionFlags::REVIEW_REQUIRED, "review-required"),
        ];
        NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for PermissionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
