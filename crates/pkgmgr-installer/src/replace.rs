use std::path::PathBuf;
use std::sync::Arc;

use pkgmgr_core::{InstallFlags, PackageDescriptor, PackageManagerError, PmResult, UserId};
use pkgmgr_registry::{AppId, InstallStatus, RegistryEntry, RegistryGuard};
use tracing::{error, info, warn};

use crate::collaborators::ArchiveParser;
use crate::freezer::FreezeGuard;
use crate::scan::{CommitReport, ScanCheck, ScanEngine, ScanOptions, ScanPlan, ScanResult};

/// What a replacement took away; decides the per-user events of an install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedInfo {
    pub name: String,
    pub previous_app_id: AppId,
    pub previous_version: u64,
    pub previous_code_path: PathBuf,
    /// Users that had the previous version installed.
    pub previous_users: Vec<UserId>,
    /// The previous version was itself an update of a factory package.
    pub was_update: bool,
    pub data_removed: bool,
    pub removed_children: Vec<String>,
    pub replacing: bool,
}

impl RemovedInfo {
    fn from_entry(entry: &RegistryEntry) -> Self {
        Self {
            name: entry.name.clone(),
            previous_app_id: entry.app_id,
            previous_version: entry.version_code,
            previous_code_path: entry.code_path.clone(),
            previous_users: entry.installed_users(),
            was_update: entry.flags.updated_system,
            data_removed: false,
            removed_children: Vec::new(),
            replacing: true,
        }
    }

    pub fn had_user(&self, user: UserId) -> bool {
        self.previous_users.contains(&user)
    }
}

#[derive(Debug, Clone)]
pub struct Replacement {
    pub report: CommitReport,
    pub removed: RemovedInfo,
}

/// Installs a new version over a registered one. Factory originals are
/// disabled and re-enabled on failure; user installs get a best-effort
/// compensating re-scan of the archive they came from.
#[derive(Clone)]
pub struct UpgradeReplacer {
    engine: ScanEngine,
    parser: Arc<dyn ArchiveParser>,
}

impl UpgradeReplacer {
    pub fn new(engine: ScanEngine, parser: Arc<dyn ArchiveParser>) -> Self {
        Self { engine, parser }
    }

    pub fn replace(
        &self,
        settings: &mut RegistryGuard<'_>,
        descriptor: &PackageDescriptor,
        options: &ScanOptions,
        freeze: &FreezeGuard,
    ) -> PmResult<Replacement> {
        let existing = settings.package(&descriptor.name).cloned().ok_or_else(|| {
            PackageManagerError::internal(format!(
                "cannot replace {}: no registered version",
                descriptor.name
            ))
        })?;
        let plan = match self.engine.check(settings, descriptor, options)? {
            ScanCheck::Ready(plan) => *plan,
            ScanCheck::Shadowed(shadowed) => {
                return Err(PackageManagerError::internal(format!(
                    "replacement of {} unexpectedly shadowed by version {}",
                    shadowed.name, shadowed.active_version
                )));
            }
        };
        let mut removed = RemovedInfo::from_entry(&existing);

        let report = if existing.flags.system && !existing.flags.updated_system {
            self.replace_factory(settings, plan, freeze)?
        } else {
            self.replace_user_install(settings, &existing, plan, options, freeze)?
        };
        removed.removed_children = report.dropped_children.clone();
        info!(
            package = %descriptor.name,
            from = existing.version_code,
            to = descriptor.version_code,
            "package replaced"
        );
        Ok(Replacement { report, removed })
    }

    fn replace_factory(
        &self,
        settings: &mut RegistryGuard<'_>,
        plan: ScanPlan,
        freeze: &FreezeGuard,
    ) -> PmResult<CommitReport> {
        let name = plan.name().to_string();
        settings.disable_system_package(&name);
        match self.engine.commit(settings, plan, freeze) {
            Ok(report) => Ok(report),
            Err(err) => {
                if settings.enable_system_package(&name).is_none() {
                    error!(package = %name, "factory original missing while rolling back update");
                } else {
                    warn!(package = %name, "update failed; factory version re-enabled");
                }
                Err(err)
            }
        }
    }

    fn replace_user_install(
        &self,
        settings: &mut RegistryGuard<'_>,
        existing: &RegistryEntry,
        plan: ScanPlan,
        options: &ScanOptions,
        freeze: &FreezeGuard,
    ) -> PmResult<CommitReport> {
        if let Some(entry) = settings.package_mut(&existing.name) {
            entry.install_status = InstallStatus::Incomplete;
        }
        match self.engine.commit(settings, plan, freeze) {
            Ok(report) => Ok(report),
            Err(err) => {
                self.roll_back(settings, existing, options, freeze);
                Err(err)
            }
        }
    }

    /// Re-scans the archive the previous version was installed from; falls
    /// back to restoring its row as it was. Either way every unit keeps the
    /// per-user state it had before the failed replacement.
    fn roll_back(
        &self,
        settings: &mut RegistryGuard<'_>,
        existing: &RegistryEntry,
        options: &ScanOptions,
        freeze: &FreezeGuard,
    ) {
        let user_states = std::iter::once(&existing.name)
            .chain(existing.children.iter())
            .filter_map(|unit| {
                settings
                    .package(unit)
                    .map(|entry| (unit.clone(), entry.users.clone()))
            })
            .collect::<Vec<_>>();
        let rescanned = self
            .parser
            .parse(&existing.code_path)
            .and_then(|mut original| {
                original.attributes.forward_locked = existing.flags.forward_locked;
                original.attributes.external = existing.flags.external;
                original.attributes.ephemeral = existing.flags.ephemeral;
                original.propagate_to_children();
                let restore = ScanOptions {
                    fresh_install: false,
                    replacing: true,
                    skip_compilation: true,
                    allow_test: true,
                    ephemeral: existing.flags.ephemeral,
                    installer: existing.installer.clone(),
                    volume_uuid: existing.volume_uuid.clone(),
                    ..ScanOptions::for_install(&InstallFlags::default(), None, options.target_users)
                };
                self.engine.scan(settings, &original, &restore, freeze)
            });
        match rescanned {
            Ok(ScanResult::Committed(_)) => {
                for (unit, users) in user_states {
                    if let Some(entry) = settings.package_mut(&unit) {
                        entry.users = users;
                    }
                }
                info!(package = %existing.name, "previous version restored from its archive");
            }
            Ok(_) | Err(_) => {
                if let Err(err) = &rescanned {
                    warn!(package = %existing.name, error = %err, "re-scan of previous version failed; restoring its registry row");
                }
                settings.insert_entry(existing.clone());
            }
        }
    }
}
