use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pkgmgr_core::{
    CertificateSet, DomainVerificationStatus, InstallFlags, InstallLocation, Origin,
    PermissionFlags, PmResult, UninstallFlags, UserId, UserTarget, VerificationDecision,
};
use pkgmgr_registry::{RegistryEntry, RegistryLock, RegistryStore, Settings};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::boot::{BootReport, BootScanner};
use crate::clear::DataClearer;
use crate::collaborators::Collaborators;
use crate::config::ServiceConfig;
use crate::context::{dispatch_kills, ServiceContext};
use crate::domain::DomainVerificationResult;
use crate::events::{EventBus, LifecycleEvent};
use crate::layout::DeviceLayout;
use crate::mover::{MoveResult, PackageMover};
use crate::pipeline::{InstallHandle, InstallPipeline, InstallRequest, InstallResult, SessionState, SessionToken};
use crate::remove::{Remover, UninstallResult};
use crate::verification::VerificationId;

/// The package manager: owns both locks and every component, and is the
/// one entry point callers use.
pub struct PackageManagerService {
    context: Arc<ServiceContext>,
    pipeline: InstallPipeline,
    remover: Remover,
    mover: PackageMover,
    clearer: DataClearer,
    boot: BootScanner,
    events: Option<EventBus>,
}

impl PackageManagerService {
    /// Loads the registry and starts the background tasks. Must be called
    /// from within a tokio runtime.
    pub fn open(
        layout: DeviceLayout,
        config: ServiceConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        layout.ensure_base_dirs()?;
        let store = RegistryStore::new(layout.registry_dir());
        let (settings, report) = store
            .load()
            .with_context(|| format!("failed to load registry from {}", store.root().display()))?;
        if let Some(from) = report.migrated_from {
            info!(from, "registry migrated to the current schema");
        }
        for warning in &report.warnings {
            warn!(%warning, "registry load warning");
        }
        let registry = RegistryLock::new(settings);
        let (context, kill_requests) =
            ServiceContext::new(layout, config, registry, store, collaborators);
        let context = Arc::new(context);
        tokio::spawn(dispatch_kills(Arc::clone(&context), kill_requests));

        info!(root = %context.layout.root().display(), fresh = report.fresh, "package manager opened");
        Ok(Self {
            pipeline: InstallPipeline::start(Arc::clone(&context)),
            remover: Remover::new(Arc::clone(&context)),
            mover: PackageMover::new(Arc::clone(&context)),
            clearer: DataClearer::new(Arc::clone(&context)),
            boot: BootScanner::new(Arc::clone(&context)),
            context,
            events: None,
        })
    }

    /// Opens a device root with the local filesystem collaborators and an
    /// in-process event bus.
    pub fn open_local(root: impl Into<PathBuf>) -> Result<Self> {
        let layout = DeviceLayout::new(root);
        let config = ServiceConfig::load(&layout.config_path())?;
        let bus = EventBus::default();
        let mut collaborators = Collaborators::local(&layout, &config);
        collaborators.events = Arc::new(bus.clone());
        let mut service = Self::open(layout, config, collaborators)?;
        service.events = Some(bus);
        Ok(service)
    }

    pub fn layout(&self) -> &DeviceLayout {
        &self.context.layout
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.context.config
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<LifecycleEvent>> {
        self.events.as_ref().map(EventBus::subscribe)
    }

    pub async fn boot_scan(&self) -> Result<BootReport> {
        self.boot.scan().await
    }

    /// Writes any pending registry changes.
    pub fn flush(&self) -> Result<()> {
        self.context.persist.flush()
    }

    /// Registry changes not yet written, e.g. after a failed write.
    pub fn has_unsaved_changes(&self) -> bool {
        self.context.persist.is_dirty()
    }

    pub fn install_from_origin(&self, request: InstallRequest) -> InstallHandle {
        self.pipeline.submit(request)
    }

    pub async fn install(&self, request: InstallRequest) -> InstallResult {
        self.pipeline.submit(request).wait().await
    }

    /// Installs a staged directory whose package name and signers the
    /// caller already committed to.
    pub fn install_from_staged(
        &self,
        name: &str,
        staged_dir: PathBuf,
        flags: InstallFlags,
        installer: Option<String>,
        user: UserTarget,
        expected_certificates: Option<CertificateSet>,
    ) -> InstallHandle {
        self.pipeline.submit(InstallRequest {
            origin: Origin::Staged(staged_dir),
            flags,
            installer,
            user,
            expected_name: Some(name.to_string()),
            expected_certificates,
        })
    }

    pub fn session_state(&self, token: SessionToken) -> Option<SessionState> {
        self.pipeline.session_state(token)
    }

    pub async fn uninstall(&self, name: &str, target: UserTarget, flags: UninstallFlags) -> UninstallResult {
        self.remover.uninstall(name, target, flags).await
    }

    pub async fn move_package(&self, name: &str, target: InstallLocation) -> MoveResult {
        self.mover.move_package(name, target).await
    }

    pub async fn clear_application_data(&self, name: &str, user: UserId) -> PmResult<()> {
        self.clearer.clear_application_data(name, user).await
    }

    pub fn verify_result(&self, id: VerificationId, responder: &str, decision: VerificationDecision) -> bool {
        self.context.verifier.record_response(id, responder, decision)
    }

    pub fn extend_verification_timeout(
        &self,
        id: VerificationId,
        fallback: VerificationDecision,
        delay: Duration,
    ) -> bool {
        self.context.verifier.extend_timeout(id, fallback, delay)
    }

    pub fn domain_verification_response(
        &self,
        id: u64,
        responder: &str,
        result: DomainVerificationResult,
    ) -> bool {
        self.context.domains.record_response(id, responder, result)
    }

    pub fn installed_packages(&self, user: UserId) -> Vec<RegistryEntry> {
        self.context.registry.with(|settings| {
            settings
                .installed_packages(user)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn package(&self, name: &str) -> Option<RegistryEntry> {
        self.context
            .registry
            .with(|settings| settings.package(name).cloned())
    }

    /// Every permission `name` holds for `user`, install and runtime.
    pub fn permission_state(&self, name: &str, user: UserId) -> Option<BTreeSet<String>> {
        self.context.registry.with(|settings| {
            settings
                .permissions(name)
                .map(|holder| holder.granted_permissions(user))
        })
    }

    pub fn permission_flags(&self, name: &str, permission: &str, user: UserId) -> Option<PermissionFlags> {
        self.context.registry.with(|settings| {
            settings
                .permissions(name)
                .map(|holder| holder.flags(permission, user))
        })
    }

    pub fn domain_verification_status(&self, name: &str, user: UserId) -> Option<DomainVerificationStatus> {
        self.context
            .registry
            .with(|settings| settings.domain_verification_status(name, user))
    }

    pub fn grant_runtime_permission(&self, name: &str, permission: &str, user: UserId) -> Result<bool> {
        let context = &self.context;
        let changed = context.registry.with(|settings| {
            context
                .migrator
                .grant_runtime_permission(settings, name, permission, user)
        })?;
        if changed {
            context.persist(false);
            self.permissions_changed(name);
        }
        Ok(changed)
    }

    /// Revocations are written before this returns.
    pub fn revoke_runtime_permission(&self, name: &str, permission: &str, user: UserId) -> Result<bool> {
        let context = &self.context;
        let changed = context.registry.with(|settings| {
            context
                .migrator
                .revoke_runtime_permission(settings, name, permission, user)
        })?;
        if changed {
            context.persist(true);
            self.permissions_changed(name);
        }
        Ok(changed)
    }

    pub fn update_permission_flags(
        &self,
        name: &str,
        permission: &str,
        user: UserId,
        mask: PermissionFlags,
        values: PermissionFlags,
    ) -> Result<bool> {
        let context = &self.context;
        let changed = context.registry.with(|settings| {
            context
                .migrator
                .update_permission_flags(settings, name, permission, user, mask, values)
        })?;
        if changed {
            context.persist(false);
        }
        Ok(changed)
    }

    fn permissions_changed(&self, name: &str) {
        if let Some(app_id) = self
            .context
            .registry
            .with(|settings| settings.package(name).map(|entry| entry.app_id))
        {
            self.context.emit(LifecycleEvent::PermissionsChanged {
                name: name.to_string(),
                app_id,
            });
        }
    }

    /// Adds a user; factory packages become installed for it.
    pub async fn create_user(&self, user: UserId) -> Result<bool> {
        let context = &self.context;
        let installed = context.registry.with(|settings| {
            if !settings.add_user(user) {
                return None;
            }
            Some(
                settings
                    .installed_packages(user)
                    .into_iter()
                    .map(|entry| (entry.name.clone(), entry.app_id, entry.volume_uuid.clone()))
                    .collect::<Vec<_>>(),
            )
        });
        let Some(installed) = installed else {
            return Ok(false);
        };
        {
            let mut helper = context.install_lock.lock().await;
            for (name, app_id, volume) in &installed {
                if let Err(err) = helper.create_app_data(volume.as_deref(), user, name, *app_id).await {
                    warn!(package = %name, user, error = %err, "failed to prepare data for new user");
                }
            }
        }
        context.persist(true);
        info!(user, packages = installed.len(), "user created");
        Ok(true)
    }

    pub async fn remove_user(&self, user: UserId) -> Result<bool> {
        let context = &self.context;
        let installed = context.registry.with(|settings| {
            let installed = settings
                .installed_packages(user)
                .into_iter()
                .map(|entry| (entry.name.clone(), entry.volume_uuid.clone()))
                .collect::<Vec<_>>();
            settings.remove_user(user).then_some(installed)
        });
        let Some(installed) = installed else {
            return Ok(false);
        };
        {
            let mut helper = context.install_lock.lock().await;
            for (name, volume) in &installed {
                if let Err(err) = helper.destroy_app_data(volume.as_deref(), user, name).await {
                    warn!(package = %name, user, error = %err, "failed to destroy data of removed user");
                }
            }
        }
        context.persist(true);
        context.persist.store().remove_user_files(user)?;
        info!(user, "user removed");
        Ok(true)
    }

    /// A copy of the whole registry, for inspection.
    pub fn snapshot(&self) -> Settings {
        self.context.registry.snapshot()
    }
}
