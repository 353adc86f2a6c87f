use std::path::Path;
use std::sync::Arc;

use pkgmgr_core::{InstallLocation, MoveOutcome, PackageManagerError, UserId};
use pkgmgr_registry::{CleanupRecord, RegistryEntry};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::context::ServiceContext;
use crate::events::LifecycleEvent;
use crate::freezer::{FreezeUnit, FreezeWait};
use crate::helper::InstallGuard;
use crate::journal::InstallJournal;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{outcome}: {message}")]
pub struct MoveError {
    pub outcome: MoveOutcome,
    pub message: String,
}

impl MoveError {
    fn new(outcome: MoveOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
        }
    }

    fn internal(err: PackageManagerError) -> Self {
        Self::new(MoveOutcome::InternalError, err.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveResult {
    pub outcome: MoveOutcome,
    pub message: String,
    pub volume_uuid: Option<String>,
}

/// Relocates an installed package's code, and its data when the volume
/// changes.
#[derive(Clone)]
pub struct PackageMover {
    context: Arc<ServiceContext>,
}

impl PackageMover {
    pub fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    pub async fn move_package(&self, name: &str, target: InstallLocation) -> MoveResult {
        match self.try_move(name, &target).await {
            Ok(()) => MoveResult {
                outcome: MoveOutcome::Succeeded,
                message: format!("moved {name}"),
                volume_uuid: target.volume_uuid().map(str::to_string),
            },
            Err(err) => {
                warn!(package = name, outcome = %err.outcome, message = %err.message, "move failed");
                MoveResult {
                    outcome: err.outcome,
                    message: err.message,
                    volume_uuid: None,
                }
            }
        }
    }

    fn precheck(&self, name: &str, target: &InstallLocation) -> Result<RegistryEntry, MoveError> {
        let entry = self
            .context
            .registry
            .with(|settings| settings.package(name).cloned())
            .ok_or_else(|| {
                MoveError::new(MoveOutcome::DoesntExist, format!("package {name} is not installed"))
            })?;
        if entry.flags.system || entry.flags.updated_system {
            return Err(MoveError::new(
                MoveOutcome::SystemPackage,
                format!("{name} is a system package"),
            ));
        }
        if entry.flags.forward_locked && target.is_external() {
            return Err(MoveError::new(
                MoveOutcome::ForwardLocked,
                format!("{name} is forward locked and cannot leave internal storage"),
            ));
        }
        if current_location(&entry) == *target {
            return Err(MoveError::new(
                MoveOutcome::InvalidLocation,
                format!("{name} is already at {}", describe(target)),
            ));
        }
        if let InstallLocation::Volume(uuid) = target {
            if !self.context.layout.volume_dir(uuid).is_dir() {
                return Err(MoveError::new(
                    MoveOutcome::InvalidLocation,
                    format!("volume {uuid} is not mounted"),
                ));
            }
        }
        Ok(entry)
    }

    async fn try_move(&self, name: &str, target: &InstallLocation) -> Result<(), MoveError> {
        let entry = self.precheck(name, target)?;
        let context = &self.context;
        let unit = FreezeUnit::from_entry(&entry);
        let _freeze = context
            .freezer
            .acquire(&unit, "move", FreezeWait::Fail, true)
            .await
            .map_err(|err| MoveError::new(MoveOutcome::OperationPending, err.to_string()))?;

        let new_code = context
            .layout
            .code_dir(target, name, InstallJournal::seed_token());
        let from_volume = entry.volume_uuid.clone();
        let to_volume = target.volume_uuid().map(str::to_string);
        let users = entry.installed_users();

        let native = {
            let mut helper = context.install_lock.lock().await;
            let size = helper.compute_size(&entry.code_path).await.map_err(MoveError::internal)?;
            let available = helper
                .available_bytes(&context.layout.app_dir_for(target))
                .await
                .map_err(MoveError::internal)?;
            if available.is_some_and(|available| available < size) {
                return Err(MoveError::new(
                    MoveOutcome::InsufficientStorage,
                    format!("{name} needs {size} bytes on {}", describe(target)),
                ));
            }
            if let Some(parent) = new_code.parent() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    MoveError::new(
                        MoveOutcome::InternalError,
                        format!("failed to create {}: {err}", parent.display()),
                    )
                })?;
            }
            if let Err(err) = helper.copy_package(&entry.code_path, &new_code).await {
                self.discard_new_code(&mut helper, name, &new_code).await;
                return Err(MoveError::internal(err));
            }
            let native = match helper
                .derive_native_libraries(&new_code, &context.config.supported_abis)
                .await
            {
                Ok(native) => native,
                Err(err) => {
                    self.discard_new_code(&mut helper, name, &new_code).await;
                    return Err(MoveError::internal(err));
                }
            };
            // Data moves last; nothing after it can fail before the registry update.
            if from_volume != to_volume {
                if let Err(err) = helper
                    .move_app_data(from_volume.as_deref(), to_volume.as_deref(), name, &users)
                    .await
                {
                    self.move_data_back(
                        &mut helper,
                        name,
                        from_volume.as_deref(),
                        to_volume.as_deref(),
                        &users,
                    )
                    .await;
                    self.discard_new_code(&mut helper, name, &new_code).await;
                    return Err(MoveError::internal(err));
                }
            }
            native
        };

        let moved = context.registry.with(|settings| {
            let Some(current) = settings.package_mut(name) else {
                return false;
            };
            current.code_path = new_code.clone();
            current.resource_path = new_code.clone();
            current.native_library_path = native.path.clone();
            current.volume_uuid = to_volume.clone();
            current.flags.external = target.is_external();
            let children = current.children.clone();
            for child in children {
                if let Some(child) = settings.package_mut(&child) {
                    child.code_path = new_code.clone();
                    child.resource_path = new_code.clone();
                    child.volume_uuid = to_volume.clone();
                    child.flags.external = target.is_external();
                }
            }
            true
        });
        if !moved {
            let mut helper = context.install_lock.lock().await;
            if from_volume != to_volume {
                self.move_data_back(
                    &mut helper,
                    name,
                    from_volume.as_deref(),
                    to_volume.as_deref(),
                    &users,
                )
                .await;
            }
            self.discard_new_code(&mut helper, name, &new_code).await;
            return Err(MoveError::new(
                MoveOutcome::DoesntExist,
                format!("package {name} disappeared during the move"),
            ));
        }
        context.persist(true);

        {
            let mut helper = context.install_lock.lock().await;
            if let Err(err) = helper.remove_code_path(&entry.code_path).await {
                warn!(package = name, path = %entry.code_path.display(), error = %err, "failed to remove old code after move");
            }
        }
        info!(package = name, to = %describe(target), "package moved");
        context.emit(LifecycleEvent::PackageMoved {
            name: name.to_string(),
            volume_uuid: to_volume,
        });
        Ok(())
    }

    /// Removes a partial copy. A copy that cannot be removed is queued for
    /// cleanup at the next boot.
    async fn discard_new_code(&self, helper: &mut InstallGuard, name: &str, new_code: &Path) {
        let Err(err) = helper.remove_code_path(new_code).await else {
            return;
        };
        warn!(package = name, path = %new_code.display(), error = %err, "could not remove partial move target; cleaning up later");
        self.context.registry.with(|settings| {
            settings.schedule_cleanup(CleanupRecord {
                name: name.to_string(),
                user: None,
                code_path: Some(new_code.to_path_buf()),
                keep_data: true,
            })
        });
        self.context.persist(false);
    }

    async fn move_data_back(
        &self,
        helper: &mut InstallGuard,
        name: &str,
        from_volume: Option<&str>,
        to_volume: Option<&str>,
        users: &[UserId],
    ) {
        if let Err(err) = helper
            .move_app_data(to_volume, from_volume, name, users)
            .await
        {
            error!(package = name, error = %err, "could not move app data back after a failed move");
        }
    }
}

fn current_location(entry: &RegistryEntry) -> InstallLocation {
    match &entry.volume_uuid {
        Some(uuid) => InstallLocation::Volume(uuid.clone()),
        None if entry.flags.external => InstallLocation::External,
        None => InstallLocation::Internal,
    }
}

fn describe(location: &InstallLocation) -> String {
    match location {
        InstallLocation::Internal => "internal storage".to_string(),
        InstallLocation::External => "external storage".to_string(),
        InstallLocation::Volume(uuid) => format!("volume {uuid}"),
    }
}
