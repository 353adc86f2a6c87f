mod certificates;
mod component;
mod descriptor;
mod error;
mod flags;
mod outcome;
mod permission;
mod user;

pub use certificates::{CertificateSet, KeySetDeclaration};
pub use component::{ComponentDeclaration, ComponentKind};
pub use descriptor::{
    validate_package_name, DescriptorFlags, InstallerAttributes, PackageDescriptor,
};
pub use error::{ErrorCategory, PackageManagerError, PmResult};
pub use flags::{InstallFlags, InstallLocation, InstallLocationPreference, UninstallFlags};
pub use outcome::{InstallOutcome, MoveOutcome, UninstallOutcome, VerificationDecision};
pub use permission::{
    PermissionDeclaration, PermissionFlags, ProtectionFlag, ProtectionLevel,
    RUNTIME_PERMISSIONS_TARGET_SDK,
};
pub use user::{DomainVerificationStatus, EnabledState, Origin, UserId, UserTarget, SYSTEM_USER};

#[cfg(test)]
mod tests;
