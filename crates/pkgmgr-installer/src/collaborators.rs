//! Narrow interfaces to the subsystems the service drives but does not own.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use pkgmgr_core::{
    ComponentDeclaration, InstallLocationPreference, PackageDescriptor, PmResult, UserId,
};
use pkgmgr_registry::AppId;
use tracing::{debug, info};

use crate::archive::ManifestArchiveParser;
use crate::config::ServiceConfig;
use crate::domain::DomainVerificationRequest;
use crate::events::{EventBus, EventSink};
use crate::helper::{HelperConnector, LocalHelperConnector};
use crate::layout::DeviceLayout;
use crate::verification::VerificationRequest;

/// What a cheap pre-parse reveals before the archive is copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteDescriptor {
    pub name: String,
    pub version_code: u64,
    pub install_location: InstallLocationPreference,
    pub native_abis: Vec<String>,
    pub child_names: Vec<String>,
    pub size_bytes: u64,
    pub path: PathBuf,
}

pub trait ArchiveParser: Send + Sync {
    fn parse_lite(&self, archive: &Path) -> PmResult<LiteDescriptor>;

    /// Full parse, including signer verification.
    fn parse(&self, archive: &Path) -> PmResult<PackageDescriptor>;
}

/// Ahead-of-time compilation. Fire-and-forget; errors are only logged.
pub trait CompilationScheduler: Send + Sync {
    fn schedule(&self, name: &str, code_path: &Path, abis: &[String]) -> Result<()>;
}

pub trait ComponentRegistrar: Send + Sync {
    fn components_added(&self, name: &str, components: &[ComponentDeclaration]);
    fn components_removed(&self, name: &str);
}

pub trait ProcessController: Send + Sync {
    fn kill_application(&self, app_id: AppId, name: &str, reason: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifierSet {
    pub required: Option<String>,
    pub optional: Vec<String>,
}

impl VerifierSet {
    pub fn is_empty(&self) -> bool {
        self.required.is_none() && self.optional.is_empty()
    }
}

pub trait VerifierAgents: Send + Sync {
    fn content_verifiers(&self) -> VerifierSet;
    fn send_verification_request(&self, request: &VerificationRequest);
    fn domain_verifier(&self) -> Option<String>;
    fn send_domain_verification_request(&self, request: &DomainVerificationRequest);
}

/// Device policy and role assignments.
pub trait PolicyOracle: Send + Sync {
    fn protected_role_holders(&self) -> BTreeSet<String>;
    fn required_installer(&self) -> Option<String>;
    fn required_verifier(&self) -> Option<String>;
    fn uninstall_blocked_by_policy(&self, user: UserId) -> bool;
    fn install_blocked_by_policy(&self, user: UserId) -> bool;
    fn shell_installs_disallowed(&self, user: UserId) -> bool;
}

#[derive(Debug, Default)]
pub struct LoggingCompilationScheduler;

impl CompilationScheduler for LoggingCompilationScheduler {
    fn schedule(&self, name: &str, code_path: &Path, abis: &[String]) -> Result<()> {
        debug!(package = name, path = %code_path.display(), ?abis, "compilation scheduled");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LoggingProcessController;

impl ProcessController for LoggingProcessController {
    fn kill_application(&self, app_id: AppId, name: &str, reason: &str) -> Result<()> {
        info!(app_id, package = name, reason, "killing application");
        Ok(())
    }
}

/// In-memory component resolution table.
#[derive(Debug, Default)]
pub struct ComponentTable {
    components: Mutex<BTreeMap<String, Vec<ComponentDeclaration>>>,
}

impl ComponentTable {
    pub fn components(&self, name: &str) -> Vec<ComponentDeclaration> {
        self.components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn registered_packages(&self) -> Vec<String> {
        self.components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl ComponentRegistrar for ComponentTable {
    fn components_added(&self, name: &str, components: &[ComponentDeclaration]) {
        self.components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), components.to_vec());
    }

    fn components_removed(&self, name: &str) {
        self.components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

/// No verifier agents installed.
#[derive(Debug, Default)]
pub struct NoVerifiers;

impl VerifierAgents for NoVerifiers {
    fn content_verifiers(&self) -> VerifierSet {
        VerifierSet::default()
    }

    fn send_verification_request(&self, _request: &VerificationRequest) {}

    fn domain_verifier(&self) -> Option<String> {
        None
    }

    fn send_domain_verification_request(&self, _request: &DomainVerificationRequest) {}
}

/// Policy fixed at startup from the service config.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    pub protected: BTreeSet<String>,
    pub required_installer: Option<String>,
    pub required_verifier: Option<String>,
    pub uninstall_blocked_users: BTreeSet<UserId>,
    pub install_blocked_users: BTreeSet<UserId>,
    pub shell_blocked_users: BTreeSet<UserId>,
}

impl StaticPolicy {
    pub fn from_config(config: &ServiceConfig) -> Self {
        let mut protected = config.protected_packages.clone();
        protected.extend(config.required_installer.iter().cloned());
        protected.extend(config.required_verifier.iter().cloned());
        Self {
            protected,
            required_installer: config.required_installer.clone(),
            required_verifier: config.required_verifier.clone(),
            ..Self::default()
        }
    }
}

impl PolicyOracle for StaticPolicy {
    fn protected_role_holders(&self) -> BTreeSet<String> {
        self.protected.clone()
    }

    fn required_installer(&self) -> Option<String> {
        self.required_installer.clone()
    }

    fn required_verifier(&self) -> Option<String> {
        self.required_verifier.clone()
    }

    fn uninstall_blocked_by_policy(&self, user: UserId) -> bool {
        self.uninstall_blocked_users.contains(&user)
    }

    fn install_blocked_by_policy(&self, user: UserId) -> bool {
        self.install_blocked_users.contains(&user)
    }

    fn shell_installs_disallowed(&self, user: UserId) -> bool {
        self.shell_blocked_users.contains(&user)
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub parser: Arc<dyn ArchiveParser>,
    pub helper: Arc<dyn HelperConnector>,
    pub compiler: Arc<dyn CompilationScheduler>,
    pub components: Arc<dyn ComponentRegistrar>,
    pub processes: Arc<dyn ProcessController>,
    pub verifiers: Arc<dyn VerifierAgents>,
    pub policy: Arc<dyn PolicyOracle>,
    pub events: Arc<dyn EventSink>,
}

impl Collaborators {
    /// Everything backed by the local filesystem and in-process tables.
    pub fn local(layout: &DeviceLayout, config: &ServiceConfig) -> Self {
        Self {
            parser: Arc::new(ManifestArchiveParser::new()),
            helper: Arc::new(LocalHelperConnector::new(layout.clone())),
            compiler: Arc::new(LoggingCompilationScheduler),
            components: Arc::new(ComponentTable::default()),
            processes: Arc::new(LoggingProcessController),
            verifiers: Arc::new(NoVerifiers),
            policy: Arc::new(StaticPolicy::from_config(config)),
            events: Arc::new(EventBus::default()),
        }
    }
}
