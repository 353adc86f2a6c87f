use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use pkgmgr_core::{PackageDescriptor, PmResult};
use pkgmgr_registry::CleanupRecord;
use tracing::{debug, info, warn};

use crate::archive::MANIFEST_FILE;
use crate::context::ServiceContext;
use crate::freezer::FreezeUnit;
use crate::fs_utils::child_dirs;
use crate::permissions::PermissionPass;
use crate::scan::{ScanOptions, ScanResult};

/// What a boot scan found and changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootReport {
    pub factory_committed: Vec<String>,
    pub shadowed: Vec<String>,
    pub data_committed: Vec<String>,
    pub recovered: Vec<String>,
    /// Registered packages whose code was gone.
    pub vanished: Vec<String>,
    pub incomplete_removed: Vec<String>,
    pub abandoned_installs: Vec<u64>,
    pub cleanups_retried: usize,
    pub failures: Vec<BootFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Rebuilds the registry's view of the device after a restart.
#[derive(Clone)]
pub struct BootScanner {
    context: Arc<ServiceContext>,
}

impl BootScanner {
    pub fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    pub async fn scan(&self) -> Result<BootReport> {
        let mut report = BootReport::default();
        self.context
            .layout
            .ensure_base_dirs()
            .context("failed to prepare device layout")?;

        self.abandon_unfinished_installs(&mut report).await?;
        self.retry_cleanups(&mut report).await;

        let mut seen_factory = BTreeSet::new();
        for (dir, privileged) in [
            (self.context.layout.priv_app_dir(), true),
            (self.context.layout.system_app_dir(), false),
        ] {
            self.scan_factory_dir(&dir, privileged, &mut seen_factory, &mut report)
                .await?;
        }
        self.drop_vanished(&seen_factory, &mut report);
        self.scan_data_dirs(&mut report).await?;
        self.recover_expected_better(&mut report);
        self.remove_incomplete(&mut report).await;

        let context = &self.context;
        context.registry.with(|settings| {
            context
                .migrator
                .update_permissions(settings, None, &PermissionPass::default());
            for entry in settings.packages() {
                if !report.factory_committed.contains(&entry.name)
                    && !report.data_committed.contains(&entry.name)
                    && !report.recovered.contains(&entry.name)
                {
                    context
                        .collaborators
                        .components
                        .components_added(&entry.name, &entry.components);
                }
            }
        });
        context
            .persist
            .write_now()
            .context("failed to write registry after boot scan")?;

        info!(
            factory = report.factory_committed.len(),
            shadowed = report.shadowed.len(),
            data = report.data_committed.len(),
            recovered = report.recovered.len(),
            vanished = report.vanished.len(),
            failures = report.failures.len(),
            "boot scan finished"
        );
        Ok(report)
    }

    /// Deletes code that installs interrupted before commit had copied.
    async fn abandon_unfinished_installs(&self, report: &mut BootReport) -> Result<()> {
        let context = &self.context;
        let unfinished = context
            .journal
            .unfinished()
            .context("failed to read install journal")?;
        for install in unfinished {
            let token = install.record.token;
            if install.committed() {
                debug!(token, "install committed before shutdown; closing its journal");
                context.journal.finish(token, "committed")?;
                continue;
            }
            let mut helper = context.install_lock.lock().await;
            for path in install.created_paths() {
                warn!(token, path = %path.display(), "removing code of interrupted install");
                if let Err(err) = helper.remove_code_path(&path).await {
                    warn!(token, path = %path.display(), error = %err, "failed to remove interrupted install");
                }
            }
            drop(helper);
            context.journal.finish(token, "abandoned")?;
            report.abandoned_installs.push(token);
        }
        Ok(())
    }

    async fn retry_cleanups(&self, report: &mut BootReport) {
        let context = &self.context;
        let (records, users) = context
            .registry
            .with(|settings| (settings.take_packages_to_clean(), settings.users()));
        if records.is_empty() {
            return;
        }
        let mut failed = Vec::new();
        {
            let mut helper = context.install_lock.lock().await;
            for record in records {
                report.cleanups_retried += 1;
                let mut ok = true;
                if let Some(code_path) = &record.code_path {
                    ok &= helper.remove_code_path(code_path).await.is_ok();
                }
                if !record.keep_data {
                    let targets = record.user.map_or_else(|| users.clone(), |user| vec![user]);
                    for user in targets {
                        ok &= helper
                            .destroy_app_data(None, user, &record.name)
                            .await
                            .is_ok();
                    }
                }
                if !ok {
                    warn!(package = %record.name, "cleanup failed again; keeping it for next boot");
                    failed.push(record);
                }
            }
        }
        context.registry.with(|settings| {
            for record in failed {
                settings.schedule_cleanup(record);
            }
        });
    }

    async fn scan_factory_dir(
        &self,
        dir: &Path,
        privileged: bool,
        seen: &mut BTreeSet<String>,
        report: &mut BootReport,
    ) -> Result<()> {
        let context = &self.context;
        let mut superseded = Vec::new();
        for archive in archives_in(dir)? {
            let descriptor = match self.parse(&archive, true, privileged) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    warn!(path = %archive.display(), error = %err, "skipping unparsable factory archive");
                    report.failures.push(BootFailure {
                        path: archive,
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            if !seen.insert(descriptor.name.clone()) {
                warn!(package = %descriptor.name, path = %archive.display(), "duplicate factory package ignored");
                continue;
            }
            let options = ScanOptions::for_boot_scan(true, privileged);
            let freeze = context
                .freezer
                .freeze_without_kill(&FreezeUnit::from_descriptor(&descriptor, None));
            let scanned = context.registry.with(|settings| {
                let result = context.engine.scan(settings, &descriptor, &options, &freeze);
                if let Ok(ScanResult::Shadowed(shadowed)) = &result {
                    settings.expect_better(&shadowed.name, &shadowed.code_path);
                }
                result
            });
            match scanned {
                Ok(ScanResult::Committed(committed)) => {
                    seen.extend(committed.units.iter().cloned());
                    if let Some(path) = committed.superseded_code_path {
                        superseded.push(path);
                    }
                    report.factory_committed.push(committed.name);
                }
                Ok(ScanResult::Shadowed(shadowed)) => report.shadowed.push(shadowed.name),
                Ok(ScanResult::CheckedOnly) => {}
                Err(err) => {
                    warn!(package = %descriptor.name, error = %err, "factory package rejected");
                    report.failures.push(BootFailure {
                        path: archive,
                        message: err.to_string(),
                    });
                }
            }
        }

        if !superseded.is_empty() {
            let mut helper = context.install_lock.lock().await;
            for path in superseded {
                info!(path = %path.display(), "removing user update superseded by the system image");
                if let Err(err) = helper.remove_code_path(&path).await {
                    warn!(path = %path.display(), error = %err, "failed to remove superseded update");
                }
            }
        }
        Ok(())
    }

    /// Factory packages that left the image and user installs whose code is
    /// gone are dropped; updates lose their factory fallback if it vanished.
    fn drop_vanished(&self, seen_factory: &BTreeSet<String>, report: &mut BootReport) {
        let context = &self.context;
        context.registry.with(|settings| {
            let candidates = settings
                .packages()
                .filter(|entry| !entry.is_child())
                .map(|entry| {
                    (
                        entry.name.clone(),
                        entry.flags.system,
                        entry.code_path.exists(),
                        entry.children.clone(),
                    )
                })
                .collect::<Vec<_>>();
            for (name, system, code_exists, children) in candidates {
                let factory_gone = settings
                    .disabled_system_package(&name)
                    .is_some_and(|_| !seen_factory.contains(&name));
                if factory_gone && code_exists {
                    settings.remove_disabled_system_package(&name);
                    if let Some(entry) = settings.package_mut(&name) {
                        entry.flags.updated_system = false;
                    }
                    info!(package = %name, "factory version left the image; update kept as a regular install");
                    continue;
                }
                if code_exists && (!system || seen_factory.contains(&name)) {
                    continue;
                }
                if !system && !factory_gone && settings.disabled_system_package(&name).is_some() {
                    if settings.enable_system_package(&name).is_some() {
                        warn!(package = %name, "update vanished; factory version restored");
                        report.recovered.push(name);
                    }
                    continue;
                }
                if settings.expecting_better(&name).is_some() {
                    // A factory fallback is known; recovery below re-scans it.
                    settings.remove_entry(&name);
                    continue;
                }
                for child in &children {
                    settings.remove_permission_definitions(child);
                    settings.remove_entry(child);
                }
                settings.remove_permission_definitions(&name);
                settings.remove_disabled_system_package(&name);
                settings.remove_entry(&name);
                warn!(package = %name, "package vanished; dropped from the registry");
                report.vanished.push(name);
            }
        });
    }

    async fn scan_data_dirs(&self, report: &mut BootReport) -> Result<()> {
        let context = &self.context;
        let layout = &context.layout;
        let mut dirs = vec![layout.data_app_dir(), layout.external_app_dir()];
        for volume in child_dirs(&layout.volumes_dir())? {
            dirs.push(volume.join("app"));
        }

        let registered = context.registry.with(|settings| {
            settings
                .packages()
                .map(|entry| entry.code_path.clone())
                .collect::<BTreeSet<_>>()
        });
        let mut stale = Vec::new();
        for dir in dirs {
            for archive in archives_in(&dir)? {
                if registered.contains(&archive) {
                    continue;
                }
                match self.adopt(&archive) {
                    Ok(Some(name)) => report.data_committed.push(name),
                    Ok(None) => stale.push(archive),
                    Err(err) => {
                        warn!(path = %archive.display(), error = %err, "removing unusable package code");
                        report.failures.push(BootFailure {
                            path: archive.clone(),
                            message: err.to_string(),
                        });
                        stale.push(archive);
                    }
                }
            }
        }

        if !stale.is_empty() {
            let mut helper = context.install_lock.lock().await;
            for path in stale {
                if let Err(err) = helper.remove_code_path(&path).await {
                    warn!(path = %path.display(), error = %err, "failed to remove stale code");
                }
            }
        }
        Ok(())
    }

    /// Registers code found in an app directory that the registry does not
    /// know. Returns `None` when another copy of the package is registered.
    fn adopt(&self, archive: &Path) -> PmResult<Option<String>> {
        let context = &self.context;
        let mut descriptor = self.parse(archive, false, false)?;
        descriptor.attributes.external = archive.starts_with(context.layout.external_app_dir());
        descriptor.propagate_to_children();
        if context
            .registry
            .with(|settings| settings.contains(&descriptor.name))
        {
            debug!(package = %descriptor.name, path = %archive.display(), "stale copy of a registered package");
            return Ok(None);
        }
        let mut options = ScanOptions::for_boot_scan(false, false);
        options.volume_uuid = archive
            .strip_prefix(context.layout.volumes_dir())
            .ok()
            .and_then(|rest| rest.components().next())
            .map(|uuid| uuid.as_os_str().to_string_lossy().into_owned());
        let freeze = context
            .freezer
            .freeze_without_kill(&FreezeUnit::from_descriptor(&descriptor, None));
        let scanned = context
            .registry
            .with(|settings| context.engine.scan(settings, &descriptor, &options, &freeze))?;
        match scanned {
            ScanResult::Committed(report) => {
                info!(package = %report.name, path = %archive.display(), "adopted package found on disk");
                Ok(Some(report.name))
            }
            ScanResult::CheckedOnly | ScanResult::Shadowed(_) => Ok(None),
        }
    }

    /// Falls back to factory archives whose update did not survive.
    fn recover_expected_better(&self, report: &mut BootReport) {
        let context = &self.context;
        let expected = context
            .registry
            .with(|settings| settings.take_expecting_better());
        for (name, code_path) in expected {
            if context.registry.with(|settings| settings.contains(&name)) {
                continue;
            }
            let privileged = code_path.starts_with(context.layout.priv_app_dir());
            let descriptor = match self.parse(&code_path, true, privileged) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    warn!(package = %name, path = %code_path.display(), error = %err, "factory fallback unusable");
                    report.failures.push(BootFailure {
                        path: code_path,
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            let options = ScanOptions::for_boot_scan(true, privileged);
            let freeze = context
                .freezer
                .freeze_without_kill(&FreezeUnit::from_descriptor(&descriptor, None));
            match context
                .registry
                .with(|settings| context.engine.scan(settings, &descriptor, &options, &freeze))
            {
                Ok(ScanResult::Committed(_)) => {
                    info!(package = %name, "recovered factory version after its update vanished");
                    report.recovered.push(name);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(package = %name, error = %err, "factory fallback rejected");
                    report.failures.push(BootFailure {
                        path: code_path,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    /// Entries left mid-replacement by a crash are removed with their data.
    async fn remove_incomplete(&self, report: &mut BootReport) {
        let context = &self.context;
        let (removed, users) = context.registry.with(|settings| {
            let incomplete = settings
                .packages()
                .filter(|entry| !entry.is_complete() && !entry.is_child())
                .cloned()
                .collect::<Vec<_>>();
            for entry in &incomplete {
                if settings.disabled_system_package(&entry.name).is_some() {
                    settings.enable_system_package(&entry.name);
                    continue;
                }
                for child in &entry.children {
                    settings.remove_entry(child);
                }
                context.migrator.remove_definitions(settings, &entry.name);
                settings.remove_entry(&entry.name);
            }
            (incomplete, settings.users())
        });
        if removed.is_empty() {
            return;
        }

        let mut failed = Vec::new();
        {
            let mut helper = context.install_lock.lock().await;
            for entry in &removed {
                warn!(package = %entry.name, "removing package left incomplete by an interrupted install");
                if !entry.flags.system && helper.remove_code_path(&entry.code_path).await.is_err() {
                    failed.push(CleanupRecord {
                        name: entry.name.clone(),
                        user: None,
                        code_path: Some(entry.code_path.clone()),
                        keep_data: true,
                    });
                }
                for user in &users {
                    if helper
                        .destroy_app_data(entry.volume_uuid.as_deref(), *user, &entry.name)
                        .await
                        .is_err()
                    {
                        failed.push(CleanupRecord {
                            name: entry.name.clone(),
                            user: Some(*user),
                            code_path: None,
                            keep_data: false,
                        });
                    }
                }
                report.incomplete_removed.push(entry.name.clone());
            }
        }
        context.registry.with(|settings| {
            for record in failed {
                settings.schedule_cleanup(record);
            }
        });
    }

    fn parse(&self, archive: &Path, factory: bool, privileged: bool) -> PmResult<PackageDescriptor> {
        let mut descriptor = self.context.collaborators.parser.parse(archive)?;
        descriptor.code_path = archive.to_path_buf();
        descriptor.attributes.system = factory;
        descriptor.attributes.privileged = factory && privileged;
        descriptor.propagate_to_children();
        Ok(descriptor)
    }
}

fn archives_in(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(child_dirs(dir)?
        .into_iter()
        .filter(|candidate| candidate.join(MANIFEST_FILE).is_file())
        .collect())
}
