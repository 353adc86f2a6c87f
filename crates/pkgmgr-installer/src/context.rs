use std::sync::Arc;

use pkgmgr_registry::{RegistryLock, RegistryStore};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::collaborators::Collaborators;
use crate::config::ServiceConfig;
use crate::domain::IntentDomainVerifier;
use crate::events::LifecycleEvent;
use crate::freezer::PackageFreezer;
use crate::helper::InstallLock;
use crate::journal::InstallJournal;
use crate::layout::DeviceLayout;
use crate::permissions::{KillRequest, PermissionMigrator};
use crate::persist::PersistScheduler;
use crate::replace::UpgradeReplacer;
use crate::scan::ScanEngine;
use crate::verification::VerificationCoordinator;

/// Everything an operation needs: both locks and the components built on
/// them. Shared behind an `Arc` by the service and its session tasks.
pub struct ServiceContext {
    pub config: Arc<ServiceConfig>,
    pub layout: DeviceLayout,
    pub registry: RegistryLock,
    pub persist: PersistScheduler,
    pub freezer: PackageFreezer,
    pub verifier: VerificationCoordinator,
    pub domains: IntentDomainVerifier,
    pub engine: ScanEngine,
    pub replacer: UpgradeReplacer,
    pub migrator: PermissionMigrator,
    pub install_lock: InstallLock,
    pub journal: InstallJournal,
    pub collaborators: Collaborators,
}

impl ServiceContext {
    /// Wires the components together. Kill requests raised by permission
    /// changes arrive on the returned receiver.
    pub fn new(
        layout: DeviceLayout,
        config: ServiceConfig,
        registry: RegistryLock,
        store: RegistryStore,
        collaborators: Collaborators,
    ) -> (Self, mpsc::UnboundedReceiver<KillRequest>) {
        let config = Arc::new(config);
        let (kills, kill_requests) = mpsc::unbounded_channel();
        let persist = PersistScheduler::new(store, registry.clone(), config.write_debounce());
        let engine = ScanEngine::new(
            Arc::clone(&config),
            Arc::clone(&collaborators.components),
            Arc::clone(&collaborators.compiler),
        );
        let context = Self {
            persist: persist.clone(),
            freezer: PackageFreezer::new(Arc::clone(&collaborators.processes)),
            verifier: VerificationCoordinator::new(
                config.verification.clone(),
                Arc::clone(&collaborators.verifiers),
            ),
            domains: IntentDomainVerifier::new(
                Arc::clone(&collaborators.verifiers),
                registry.clone(),
                persist,
            ),
            replacer: UpgradeReplacer::new(engine.clone(), Arc::clone(&collaborators.parser)),
            engine,
            migrator: PermissionMigrator::new(
                Arc::clone(&config),
                Arc::clone(&collaborators.policy),
                kills,
            ),
            install_lock: InstallLock::new(
                Arc::clone(&collaborators.helper),
                config.helper_max_retries,
                config.helper_retry_backoff(),
            ),
            journal: InstallJournal::new(layout.clone()),
            config,
            layout,
            registry,
            collaborators,
        };
        (context, kill_requests)
    }

    pub fn emit(&self, event: LifecycleEvent) {
        self.collaborators.events.emit(event);
    }

    /// Writes a change already applied to the in-memory registry. The
    /// change stands either way. Security-relevant changes, such as
    /// revocations or signer updates, are written before this returns; a
    /// failed write is logged and handed to the scheduler for retry.
    pub fn persist(&self, security_relevant: bool) {
        if !security_relevant {
            self.persist.schedule();
            return;
        }
        if let Err(err) = self.persist.write_now() {
            error!(error = %format!("{err:#}"), "failed to write registry; retrying in the background");
            self.persist.schedule();
        }
    }
}

/// Delivers queued kill requests until every sender is gone.
pub async fn dispatch_kills(context: Arc<ServiceContext>, mut requests: mpsc::UnboundedReceiver<KillRequest>) {
    while let Some(request) = requests.recv().await {
        info!(package = %request.package, app_id = request.app_id, reason = %request.reason, "delivering kill request");
        if let Err(err) = context.collaborators.processes.kill_application(
            request.app_id,
            &request.package,
            &request.reason,
        ) {
            error!(package = %request.package, error = %format!("{err:#}"), "kill request failed");
        }
    }
}
