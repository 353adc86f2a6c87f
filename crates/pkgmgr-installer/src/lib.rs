mod archive;
mod boot;
mod clear;
mod collaborators;
mod config;
mod context;
mod domain;
mod events;
mod freezer;
mod fs_utils;
mod helper;
mod journal;
mod layout;
mod mover;
mod permissions;
mod persist;
mod pipeline;
mod remove;
mod replace;
mod scan;
mod service;
mod verification;

pub use archive::{
    ArchiveSigner, ManifestArchiveParser, SignaturesFile, CODE_FILE, MANIFEST_FILE,
    NATIVE_LIB_DIR, SIGNATURES_FILE,
};
pub use boot::{BootFailure, BootReport, BootScanner};
pub use clear::DataClearer;
pub use collaborators::{
    ArchiveParser, Collaborators, CompilationScheduler, ComponentRegistrar, ComponentTable,
    LiteDescriptor, LoggingCompilationScheduler, LoggingProcessController, NoVerifiers,
    PolicyOracle, ProcessController, StaticPolicy, VerifierAgents, VerifierSet,
};
pub use config::{ServiceConfig, VerificationConfig};
pub use context::{dispatch_kills, ServiceContext};
pub use domain::{DomainVerificationRequest, DomainVerificationResult, IntentDomainVerifier};
pub use events::{EventBus, EventSink, LifecycleEvent};
pub use freezer::{FreezeGuard, FreezeUnit, FreezeWait, PackageFreezer, PackageFrozen};
pub use helper::{
    HelperConnector, HelperError, InstallGuard, InstallLock, LocalFileHelper,
    LocalHelperConnector, MinimalPackageInfo, NativeLibraries, PrivilegedFileHelper,
};
pub use journal::{InstallJournal, InstallRecord, JournalStep, UnfinishedInstall};
pub use layout::{default_device_root, DeviceLayout};
pub use mover::{MoveError, MoveResult, PackageMover};
pub use permissions::{
    KillRequest, PermissionChanges, PermissionError, PermissionMigrator, PermissionPass,
};
pub use persist::PersistScheduler;
pub use pipeline::{
    resolve_staged_archive, InstallHandle, InstallPipeline, InstallRequest, InstallResult,
    SessionState, SessionToken,
};
pub use remove::{Remover, UninstallError, UninstallResult};
pub use replace::{RemovedInfo, Replacement, UpgradeReplacer};
pub use scan::{
    target_user_ids, CommitReport, ScanCheck, ScanEngine, ScanOptions, ScanPlan, ScanResult,
    ShadowedFactory,
};
pub use service::PackageManagerService;
pub use verification::{
    ContentVerification, PendingDecision, VerificationCoordinator, VerificationId,
    VerificationOutcome, VerificationRequest,
};
