use std::sync::Arc;

use pkgmgr_core::{InstallOutcome, PackageManagerError, PmResult, UserId};
use tracing::info;

use crate::context::ServiceContext;
use crate::events::LifecycleEvent;
use crate::freezer::{FreezeUnit, FreezeWait};

/// Wipes a package's data for one user and undoes that user's permission
/// choices.
#[derive(Clone)]
pub struct DataClearer {
    context: Arc<ServiceContext>,
}

impl DataClearer {
    pub fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    pub async fn clear_application_data(&self, name: &str, user: UserId) -> PmResult<()> {
        let context = &self.context;
        let entry = context
            .registry
            .with(|settings| settings.package(name).cloned())
            .ok_or_else(|| PackageManagerError::internal(format!("package {name} is not installed")))?;
        if !entry.is_installed_for(user) {
            return Err(PackageManagerError::internal(format!(
                "package {name} is not installed for user {user}"
            )));
        }
        if context.collaborators.policy.protected_role_holders().contains(name) {
            return Err(PackageManagerError::new(
                InstallOutcome::UserRestricted,
                format!("data of {name} is protected"),
            ));
        }

        let unit = FreezeUnit::from_entry(&entry);
        let _freeze = context
            .freezer
            .acquire(&unit, "clear data", FreezeWait::Block, true)
            .await
            .map_err(|err| PackageManagerError::new(InstallOutcome::Aborted, err.to_string()))?;

        {
            let mut helper = context.install_lock.lock().await;
            helper
                .clear_app_data(entry.volume_uuid.as_deref(), user, name)
                .await?;
        }
        let reset = context
            .registry
            .with(|settings| context.migrator.reset_user_changes(settings, name, user));
        context.persist(true);

        info!(package = name, user, reset = reset.len(), "application data cleared");
        context.emit(LifecycleEvent::PackageDataCleared {
            name: name.to_string(),
            user,
        });
        if !reset.is_empty() {
            context.emit(LifecycleEvent::PermissionsChanged {
                name: name.to_string(),
                app_id: entry.app_id,
            });
        }
        Ok(())
    }
}
