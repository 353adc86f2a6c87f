mod entry;
mod lock;
mod permissions;
mod settings;
mod shared;
mod store;

pub use entry::{
    AppId, EntryFlags, InstallStatus, RegistryEntry, UserState, FIRST_APPLICATION_UID,
    LAST_APPLICATION_UID,
};
pub use lock::{RegistryGuard, RegistryLock};
pub use permissions::{PermissionDefinition, PermissionGrant, PermissionsState};
pub use settings::{CleanupRecord, RemovedEntry, Settings};
pub use shared::{AppIdOwner, SharedUser};
pub use store::{
    write_json_atomic, DatabaseVersion, LoadReport, RegistryStore, PACKAGE_RESTRICTIONS_FILE,
    RUNTIME_PERMISSIONS_FILE, SETTINGS_FILE,
};

#[cfg(test)]
mod tests;
