use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use pkgmgr_core::{
    InstallFlags, InstallOutcome, PackageDescriptor, PackageManagerError, PmResult, UserId,
    UserTarget, RUNTIME_PERMISSIONS_TARGET_SDK,
};
use pkgmgr_registry::{
    AppId, AppIdOwner, InstallStatus, RegistryEntry, RegistryGuard, Settings, UserState,
};
use pkgmgr_security::{compare_signatures, update_signatures_acceptable};
use tracing::{debug, error, info, warn};

use crate::collaborators::{CompilationScheduler, ComponentRegistrar};
use crate::config::ServiceConfig;
use crate::freezer::FreezeGuard;

/// Every recognized scan option. Built through the constructors below and
/// checked by [`ScanOptions::validate`] before any policy runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    /// The archive lives in a factory directory of the system image.
    pub factory: bool,
    pub privileged: bool,
    pub fresh_install: bool,
    pub replacing: bool,
    /// Run every check and discard the result.
    pub check_only: bool,
    pub skip_compilation: bool,
    pub initial_boot_scan: bool,
    pub allow_downgrade: bool,
    pub allow_test: bool,
    pub ephemeral: bool,
    pub grant_runtime_permissions: bool,
    pub target_users: UserTarget,
    pub installer: Option<String>,
    pub volume_uuid: Option<String>,
}

impl ScanOptions {
    pub fn for_install(flags: &InstallFlags, installer: Option<String>, user: UserTarget) -> Self {
        Self {
            factory: false,
            privileged: false,
            fresh_install: !flags.replace_existing,
            replacing: flags.replace_existing,
            check_only: false,
            skip_compilation: false,
            initial_boot_scan: false,
            allow_downgrade: flags.allow_downgrade,
            allow_test: flags.allow_test,
            ephemeral: flags.ephemeral,
            grant_runtime_permissions: flags.grant_runtime_permissions,
            target_users: user,
            installer,
            volume_uuid: flags.volume_uuid.clone(),
        }
    }

    pub fn for_boot_scan(factory: bool, privileged: bool) -> Self {
        Self {
            factory,
            privileged,
            fresh_install: false,
            replacing: false,
            check_only: false,
            skip_compilation: true,
            initial_boot_scan: true,
            allow_downgrade: false,
            allow_test: factory,
            ephemeral: false,
            grant_runtime_permissions: false,
            target_users: UserTarget::All,
            installer: None,
            volume_uuid: None,
        }
    }

    pub fn check_only(mut self) -> Self {
        self.check_only = true;
        self
    }

    pub fn validate(&self) -> PmResult<()> {
        let problem = if self.privileged && !self.factory {
            Some("only factory packages may be scanned as privileged")
        } else if self.ephemeral && self.factory {
            Some("factory packages cannot be ephemeral")
        } else if self.fresh_install && self.replacing {
            Some("a scan cannot be both a fresh install and a replacement")
        } else {
            None
        };
        match problem {
            Some(problem) => Err(PackageManagerError::internal(format!(
                "invalid scan options: {problem}"
            ))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Identity {
    Reuse(AppId),
    Allocate,
    Shared(String),
    Parent,
}

/// A checked descriptor ready to be committed under the same registry lock.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    descriptor: PackageDescriptor,
    options: ScanOptions,
    identity: Identity,
    previous: Option<RegistryEntry>,
    renamed_from: Option<String>,
    disable_factory: bool,
    superseded_update: Option<PathBuf>,
    factory_warning: Option<String>,
    children: Vec<ScanPlan>,
}

impl ScanPlan {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &PackageDescriptor {
        &self.descriptor
    }

    pub fn previous(&self) -> Option<&RegistryEntry> {
        self.previous.as_ref()
    }

    pub fn unit_names(&self) -> Vec<String> {
        std::iter::once(self.name().to_string())
            .chain(self.children.iter().map(|child| child.name().to_string()))
            .collect()
    }
}

/// A factory archive that lost to a newer update already registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowedFactory {
    pub name: String,
    pub code_path: PathBuf,
    pub version_code: u64,
    pub active_version: u64,
}

#[derive(Debug, Clone)]
pub enum ScanCheck {
    Ready(Box<ScanPlan>),
    Shadowed(ShadowedFactory),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub name: String,
    pub app_id: AppId,
    pub units: Vec<String>,
    pub previous_version: Option<u64>,
    pub renamed_from: Option<String>,
    /// Sub-packages the previous version had and this one dropped.
    pub dropped_children: Vec<String>,
    /// Code of a user update the factory version superseded.
    pub superseded_code_path: Option<PathBuf>,
    /// Signers changed or a trust warning was recorded; write through.
    pub security_relevant: bool,
}

#[derive(Debug, Clone)]
pub enum ScanResult {
    Committed(CommitReport),
    CheckedOnly,
    Shadowed(ShadowedFactory),
}

/// Turns descriptors into registry entries. Synchronous and non-blocking:
/// callers hold the registry lock for the whole of a check plus commit.
#[derive(Clone)]
pub struct ScanEngine {
    config: Arc<ServiceConfig>,
    components: Arc<dyn ComponentRegistrar>,
    compiler: Arc<dyn CompilationScheduler>,
}

impl ScanEngine {
    pub fn new(
        config: Arc<ServiceConfig>,
        components: Arc<dyn ComponentRegistrar>,
        compiler: Arc<dyn CompilationScheduler>,
    ) -> Self {
        Self {
            config,
            components,
            compiler,
        }
    }

    /// Check and, unless the options say check-only, commit.
    pub fn scan(
        &self,
        settings: &mut RegistryGuard<'_>,
        descriptor: &PackageDescriptor,
        options: &ScanOptions,
        freeze: &FreezeGuard,
    ) -> PmResult<ScanResult> {
        match self.check(settings, descriptor, options)? {
            ScanCheck::Shadowed(shadowed) => Ok(ScanResult::Shadowed(shadowed)),
            ScanCheck::Ready(_) if options.check_only => Ok(ScanResult::CheckedOnly),
            ScanCheck::Ready(plan) => self.commit(settings, *plan, freeze).map(ScanResult::Committed),
        }
    }

    /// Runs every policy against the current registry without touching it.
    /// Sub-packages are checked as part of their parent; one failing unit
    /// fails the whole plan.
    pub fn check(
        &self,
        settings: &Settings,
        descriptor: &PackageDescriptor,
        options: &ScanOptions,
    ) -> PmResult<ScanCheck> {
        options.validate()?;
        let mut descriptor = descriptor.clone();
        if descriptor.has_children() && !options.privileged {
            warn!(
                package = %descriptor.name,
                children = ?descriptor.child_packages.iter().map(|child| &child.name).collect::<Vec<_>>(),
                "ignoring sub-packages declared by a non-privileged package"
            );
            descriptor.child_packages.clear();
        }
        let unit = descriptor.unit_names();

        let existing = settings.package(&descriptor.name).cloned();
        if let Some(existing) = &existing {
            if existing.parent.is_some() {
                return Err(PackageManagerError::new(
                    InstallOutcome::DuplicatePackage,
                    format!(
                        "package {} is already installed as a sub-package of {}",
                        descriptor.name,
                        existing.parent.as_deref().unwrap_or_default()
                    ),
                ));
            }
        }

        let renamed_from = match &existing {
            Some(_) => None,
            None => descriptor
                .original_names
                .iter()
                .find(|original| settings.contains(original))
                .cloned(),
        };
        let previous = existing.clone().or_else(|| {
            renamed_from
                .as_deref()
                .and_then(|original| settings.package(original).cloned())
        });

        if options.factory {
            if let Some(active) = existing.as_ref().filter(|entry| !entry.flags.system) {
                if active.version_code >= descriptor.version_code {
                    info!(
                        package = %descriptor.name,
                        factory_version = descriptor.version_code,
                        active_version = active.version_code,
                        "factory package shadowed by a newer update"
                    );
                    return Ok(ScanCheck::Shadowed(ShadowedFactory {
                        name: descriptor.name.clone(),
                        code_path: descriptor.code_path.clone(),
                        version_code: descriptor.version_code,
                        active_version: active.version_code,
                    }));
                }
            }
        }

        let identity = self.resolve_identity(settings, &descriptor, previous.as_ref())?;

        let disable_factory = !options.factory
            && existing
                .as_ref()
                .is_some_and(|entry| entry.flags.system && !entry.flags.updated_system);
        let superseded_update = if options.factory {
            existing
                .as_ref()
                .filter(|entry| !entry.flags.system)
                .map(|entry| entry.code_path.clone())
        } else {
            None
        };

        let factory_warning = self.check_certificates(&descriptor, options, previous.as_ref())?;

        if let Some(previous) = previous.as_ref().filter(|_| !options.factory) {
            self.check_version(&descriptor, options, previous)?;
        }
        self.check_package_rules(&descriptor, options)?;
        check_conflicts(settings, &descriptor, &unit, renamed_from.as_deref())?;

        let mut children = Vec::with_capacity(descriptor.child_packages.len());
        for child in &descriptor.child_packages {
            children.push(self.check_child(settings, &descriptor, child, options, &unit)?);
        }

        debug!(
            package = %descriptor.name,
            ?identity,
            renamed_from = ?renamed_from,
            disable_factory,
            children = children.len(),
            "scan checks passed"
        );
        Ok(ScanCheck::Ready(Box::new(ScanPlan {
            descriptor,
            options: options.clone(),
            identity,
            previous,
            renamed_from,
            disable_factory,
            superseded_update,
            factory_warning,
            children,
        })))
    }

    fn resolve_identity(
        &self,
        settings: &Settings,
        descriptor: &PackageDescriptor,
        previous: Option<&RegistryEntry>,
    ) -> PmResult<Identity> {
        if let Some(previous) = previous {
            if previous.shared_user != descriptor.shared_user_id {
                return Err(PackageManagerError::new(
                    InstallOutcome::SharedUserIncompatible,
                    format!(
                        "package {} changed its shared identity from {:?} to {:?}",
                        descriptor.name, previous.shared_user, descriptor.shared_user_id
                    ),
                ));
            }
        }
        if let Some(shared_name) = &descriptor.shared_user_id {
            if let Some(shared) = settings.shared_user(shared_name) {
                let signers = compare_signatures(&shared.certificates, &descriptor.certificates);
                if !shared.certificates.is_empty() && !signers.is_match() {
                    return Err(PackageManagerError::new(
                        InstallOutcome::SharedUserIncompatible,
                        format!(
                            "package {} is not signed like the other members of {shared_name}",
                            descriptor.name
                        ),
                    ));
                }
            }
            return Ok(Identity::Shared(shared_name.clone()));
        }
        if let Some(previous) = previous {
            return Ok(Identity::Reuse(previous.app_id));
        }
        if let Some(disabled) = settings.disabled_system_package(&descriptor.name) {
            return Ok(Identity::Reuse(disabled.app_id));
        }
        Ok(Identity::Allocate)
    }

    /// Returns the warning to record when a factory package is let through
    /// with changed signers.
    fn check_certificates(
        &self,
        descriptor: &PackageDescriptor,
        options: &ScanOptions,
        previous: Option<&RegistryEntry>,
    ) -> PmResult<Option<String>> {
        let Some(previous) = previous else {
            return Ok(None);
        };
        if previous.needs_certificate_recollection {
            debug!(package = %descriptor.name, "accepting signers recollected after a schema upgrade");
            return Ok(None);
        }
        if update_signatures_acceptable(
            &previous.certificates,
            &previous.key_sets,
            &previous.upgrade_key_sets,
            &descriptor.certificates,
        ) {
            return Ok(None);
        }
        if options.factory {
            let message = format!(
                "factory package {} is signed differently than its registered version; accepting the system image",
                descriptor.name
            );
            warn!(package = %descriptor.name, "tolerating factory signature mismatch");
            return Ok(Some(message));
        }
        Err(PackageManagerError::new(
            InstallOutcome::UpdateIncompatible,
            format!(
                "package {} signatures do not match the previously installed version",
                descriptor.name
            ),
        ))
    }

    fn check_version(
        &self,
        descriptor: &PackageDescriptor,
        options: &ScanOptions,
        previous: &RegistryEntry,
    ) -> PmResult<()> {
        if descriptor.version_code < previous.version_code {
            let debuggable = previous.flags.debuggable || self.config.debuggable_build;
            if !(options.allow_downgrade && debuggable) {
                return Err(PackageManagerError::new(
                    InstallOutcome::VersionDowngrade,
                    format!(
                        "package {} version {} is older than installed version {}",
                        descriptor.name, descriptor.version_code, previous.version_code
                    ),
                ));
            }
            info!(
                package = %descriptor.name,
                from = previous.version_code,
                to = descriptor.version_code,
                "allowing requested downgrade"
            );
        }
        if previous.target_sdk >= RUNTIME_PERMISSIONS_TARGET_SDK
            && !descriptor.uses_runtime_permissions()
        {
            return Err(PackageManagerError::new(
                InstallOutcome::PermissionModelDowngrade,
                format!(
                    "package {} cannot move from runtime permissions back to install-time permissions",
                    descriptor.name
                ),
            ));
        }
        Ok(())
    }

    fn check_package_rules(&self, descriptor: &PackageDescriptor, options: &ScanOptions) -> PmResult<()> {
        if descriptor.flags.test_only && !options.allow_test && !options.factory {
            return Err(PackageManagerError::new(
                InstallOutcome::TestOnly,
                format!("package {} is test-only", descriptor.name),
            ));
        }
        if descriptor.min_sdk > self.config.platform_sdk {
            return Err(PackageManagerError::new(
                InstallOutcome::OlderSdk,
                format!(
                    "package {} requires platform {} but this device runs {}",
                    descriptor.name, descriptor.min_sdk, self.config.platform_sdk
                ),
            ));
        }
        if options.ephemeral
            && (descriptor.shared_user_id.is_some() || !descriptor.uses_runtime_permissions())
        {
            return Err(PackageManagerError::new(
                InstallOutcome::EphemeralInvalid,
                format!(
                    "ephemeral package {} must target runtime permissions and may not share an identity",
                    descriptor.name
                ),
            ));
        }
        if !descriptor.native_abis.is_empty()
            && !descriptor
                .native_abis
                .iter()
                .any(|abi| self.config.supported_abis.contains(abi))
        {
            return Err(PackageManagerError::new(
                InstallOutcome::NoMatchingAbis,
                format!(
                    "package {} ships native code for {:?}; device supports {:?}",
                    descriptor.name, descriptor.native_abis, self.config.supported_abis
                ),
            ));
        }
        Ok(())
    }

    fn check_child(
        &self,
        settings: &Settings,
        parent: &PackageDescriptor,
        child: &PackageDescriptor,
        options: &ScanOptions,
        unit: &[String],
    ) -> PmResult<ScanPlan> {
        let previous = settings.package(&child.name).cloned();
        if let Some(previous) = &previous {
            if previous.parent.as_deref() != Some(parent.name.as_str()) {
                return Err(PackageManagerError::new(
                    InstallOutcome::DuplicatePackage,
                    format!(
                        "sub-package {} of {} is already installed on its own",
                        child.name, parent.name
                    ),
                ));
            }
        }
        self.check_package_rules(child, options)?;
        check_conflicts(settings, child, unit, None)?;
        Ok(ScanPlan {
            descriptor: child.clone(),
            options: options.clone(),
            identity: Identity::Parent,
            previous,
            renamed_from: None,
            disable_factory: false,
            superseded_update: None,
            factory_warning: None,
            children: Vec::new(),
        })
    }

    /// Applies a checked plan. Any failure restores the registry to its
    /// state before the call, sub-packages included.
    pub fn commit(
        &self,
        settings: &mut RegistryGuard<'_>,
        plan: ScanPlan,
        freeze: &FreezeGuard,
    ) -> PmResult<CommitReport> {
        if plan.options.check_only {
            return Err(PackageManagerError::internal(format!(
                "check-only scan of {} cannot be committed",
                plan.name()
            )));
        }
        for name in plan.unit_names() {
            if !freeze.covers(&name) {
                error!(package = %name, "commit attempted without holding the package freeze");
                return Err(PackageManagerError::internal(format!(
                    "package {name} must be frozen before it is committed"
                )));
            }
        }

        let snapshot = Settings::clone(settings);
        match self.apply(settings, &plan) {
            Ok(report) => {
                for unit in [&plan].into_iter().chain(plan.children.iter()) {
                    self.components
                        .components_added(unit.name(), &unit.descriptor.components);
                }
                for dropped in &report.dropped_children {
                    self.components.components_removed(dropped);
                }
                if !plan.options.skip_compilation {
                    if let Err(err) = self.compiler.schedule(
                        plan.name(),
                        &plan.descriptor.code_path,
                        &plan.descriptor.native_abis,
                    ) {
                        warn!(package = plan.name(), error = %format!("{err:#}"), "failed to schedule compilation");
                    }
                }
                info!(
                    package = plan.name(),
                    app_id = report.app_id,
                    version = plan.descriptor.version_code,
                    units = report.units.len(),
                    "package committed"
                );
                Ok(report)
            }
            Err(err) => {
                **settings = snapshot;
                warn!(package = plan.name(), error = %err, "commit failed; registry restored");
                Err(err)
            }
        }
    }

    fn apply(&self, settings: &mut Settings, plan: &ScanPlan) -> PmResult<CommitReport> {
        let name = plan.name().to_string();
        let mut base = plan.previous.clone();

        if let Some(original) = &plan.renamed_from {
            if let Some(removed) = settings.remove_entry(original) {
                base = Some(removed.entry);
            }
            settings.remove_permission_definitions(original);
            settings.record_rename(&name, original);
            info!(package = %name, original = %original, "package renamed");
        }
        if plan.disable_factory && settings.disable_system_package(&name) {
            info!(package = %name, "factory package disabled by update");
        }
        if plan.superseded_update.is_some() {
            settings.remove_disabled_system_package(&name);
            info!(package = %name, "factory package supersedes user update");
        }

        let app_id = match &plan.identity {
            Identity::Reuse(app_id) => {
                if !settings.register_app_id(*app_id, AppIdOwner::Package(name.clone())) {
                    return Err(PackageManagerError::internal(format!(
                        "app id {app_id} of {name} is held by another package"
                    )));
                }
                *app_id
            }
            Identity::Allocate => settings
                .acquire_app_id(AppIdOwner::Package(name.clone()))
                .ok_or_else(|| {
                    PackageManagerError::new(
                        InstallOutcome::InsufficientStorage,
                        format!("no free application id left for {name}"),
                    )
                })?,
            Identity::Shared(shared) => settings
                .get_or_create_shared_user(shared)
                .map(|shared| shared.app_id)
                .ok_or_else(|| {
                    PackageManagerError::new(
                        InstallOutcome::InsufficientStorage,
                        format!("no free application id left for shared identity {shared}"),
                    )
                })?,
            Identity::Parent => {
                return Err(PackageManagerError::internal(format!(
                    "sub-package {name} committed without its parent"
                )))
            }
        };

        let previous_children = base
            .as_ref()
            .map(|entry| entry.children.clone())
            .unwrap_or_default();
        let signers_changed = base
            .as_ref()
            .is_some_and(|entry| entry.certificates != plan.descriptor.certificates);
        let entry = self.build_entry(settings, plan, base, app_id, None);
        let security_relevant = signers_changed || plan.factory_warning.is_some();
        self.define_permissions(settings, &name, &plan.descriptor)?;
        settings.insert_entry(entry);
        if let Some(message) = &plan.factory_warning {
            settings.record_warning(message.clone());
        }

        let mut units = vec![name.clone()];
        for child in &plan.children {
            let child_base = settings.package(child.name()).cloned();
            let entry = self.build_entry(settings, child, child_base, app_id, Some(&name));
            self.define_permissions(settings, child.name(), &child.descriptor)?;
            settings.insert_entry(entry);
            units.push(child.name().to_string());
        }

        let dropped_children = previous_children
            .into_iter()
            .filter(|child| !units.contains(child))
            .collect::<Vec<_>>();
        for dropped in &dropped_children {
            settings.remove_permission_definitions(dropped);
            settings.remove_entry(dropped);
            debug!(package = %name, child = %dropped, "sub-package no longer declared");
        }

        Ok(CommitReport {
            name,
            app_id,
            units,
            previous_version: plan.previous.as_ref().map(|entry| entry.version_code),
            renamed_from: plan.renamed_from.clone(),
            dropped_children,
            superseded_code_path: plan.superseded_update.clone(),
            security_relevant,
        })
    }

    fn build_entry(
        &self,
        settings: &Settings,
        plan: &ScanPlan,
        base: Option<RegistryEntry>,
        app_id: AppId,
        parent: Option<&str>,
    ) -> RegistryEntry {
        let name = plan.name();
        let fresh = base.is_none();
        let mut entry = base.unwrap_or_else(|| {
            RegistryEntry::new(name, app_id, plan.descriptor.code_path.clone())
        });
        let was_update = entry.flags.updated_system;
        entry.name = name.to_string();
        entry.app_id = app_id;
        entry.apply_descriptor(&plan.descriptor);
        entry.parent = parent.map(str::to_string);
        entry.install_status = InstallStatus::Complete;
        entry.flags.updated_system = !plan.options.factory
            && (plan.disable_factory || was_update || settings.disabled_system_package(name).is_some());
        if plan.options.installer.is_some() {
            entry.installer = plan.options.installer.clone();
        }
        if !plan.options.factory {
            entry.volume_uuid = plan.options.volume_uuid.clone();
        }
        if let Some(original) = &plan.renamed_from {
            entry.real_name = Some(original.clone());
        }

        for user in settings.users() {
            let targeted = plan.options.factory || plan.options.target_users.includes(user);
            let installed = entry.is_installed_for(user);
            if fresh || (targeted && !installed) {
                let state = if targeted {
                    UserState::fresh_install()
                } else {
                    UserState::not_installed()
                };
                entry.users.insert(user, state);
            }
        }
        entry
    }

    fn define_permissions(
        &self,
        settings: &mut Settings,
        owner: &str,
        descriptor: &PackageDescriptor,
    ) -> PmResult<()> {
        let declared = descriptor
            .permissions
            .iter()
            .map(|permission| permission.name.as_str())
            .collect::<BTreeSet<_>>();
        let stale = settings
            .permission_definitions()
            .iter()
            .filter(|(permission, definition)| {
                definition.owner == owner && !declared.contains(permission.as_str())
            })
            .map(|(permission, _)| permission.clone())
            .collect::<Vec<_>>();
        if !stale.is_empty() {
            settings.remove_permission_definitions(owner);
        }
        for declaration in &descriptor.permissions {
            settings
                .define_permission(owner, declaration.clone())
                .map_err(|existing| {
                    PackageManagerError::new(
                        InstallOutcome::DuplicatePermission,
                        format!(
                            "package {owner} redefines permission {} owned by {existing}",
                            declaration.name
                        ),
                    )
                })?;
        }
        Ok(())
    }
}

/// Rejects provider authorities and permission names that belong to a
/// package outside the unit being scanned.
fn check_conflicts(
    settings: &Settings,
    descriptor: &PackageDescriptor,
    unit: &[String],
    renamed_from: Option<&str>,
) -> PmResult<()> {
    let ours = |owner: &str| unit.iter().any(|name| name == owner) || renamed_from == Some(owner);
    for authority in descriptor.provider_authorities() {
        if let Some(owner) = settings.authority_owner(authority) {
            if !ours(owner) {
                return Err(PackageManagerError::new(
                    InstallOutcome::ConflictingProvider,
                    format!(
                        "package {} declares provider authority {authority} already owned by {owner}",
                        descriptor.name
                    ),
                ));
            }
        }
    }
    for permission in &descriptor.permissions {
        if let Some(definition) = settings.permission_definition(&permission.name) {
            if !ours(&definition.owner) {
                return Err(PackageManagerError::new(
                    InstallOutcome::DuplicatePermission,
                    format!(
                        "package {} declares permission {} already defined by {}",
                        descriptor.name, permission.name, definition.owner
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Users a scan installs the package for.
pub fn target_user_ids(settings: &Settings, target: UserTarget) -> Vec<UserId> {
    settings
        .users()
        .into_iter()
        .filter(|user| target.includes(*user))
        .collect()
}
