use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use pkgmgr_core::{
    CertificateSet, InstallFlags, InstallLocation, InstallLocationPreference, InstallOutcome,
    Origin, PackageDescriptor, PackageManagerError, PmResult, UserId, UserTarget,
};
use pkgmgr_registry::{AppId, RegistryEntry};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::archive::MANIFEST_FILE;
use crate::collaborators::LiteDescriptor;
use crate::context::ServiceContext;
use crate::events::LifecycleEvent;
use crate::freezer::{FreezeUnit, FreezeWait};
use crate::fs_utils::child_dirs;
use crate::helper::NativeLibraries;
use crate::permissions::{PermissionChanges, PermissionPass};
use crate::replace::RemovedInfo;
use crate::scan::{target_user_ids, CommitReport, ScanOptions, ScanResult};
use crate::verification::ContentVerification;

pub type SessionToken = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Staging,
    Verifying,
    Copying,
    Scanning,
    Committing,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub origin: Origin,
    pub flags: InstallFlags,
    pub installer: Option<String>,
    pub user: UserTarget,
    /// Name the caller expects the archive to carry.
    pub expected_name: Option<String>,
    pub expected_certificates: Option<CertificateSet>,
}

impl InstallRequest {
    pub fn new(origin: Origin, user: UserTarget) -> Self {
        Self {
            origin,
            flags: InstallFlags::default(),
            installer: None,
            user,
            expected_name: None,
            expected_certificates: None,
        }
    }
}

/// The single terminal answer to an install request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallResult {
    pub token: SessionToken,
    pub outcome: InstallOutcome,
    pub message: String,
    pub name: Option<String>,
    pub app_id: Option<AppId>,
    pub removed: Option<RemovedInfo>,
}

impl InstallResult {
    fn failure(token: SessionToken, name: Option<String>, err: PackageManagerError) -> Self {
        Self {
            token,
            outcome: err.outcome,
            message: err.message,
            name,
            app_id: None,
            removed: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

#[derive(Debug)]
pub struct InstallHandle {
    token: SessionToken,
    receiver: oneshot::Receiver<InstallResult>,
}

impl InstallHandle {
    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub async fn wait(self) -> InstallResult {
        let token = self.token;
        self.receiver.await.unwrap_or_else(|_| {
            InstallResult::failure(
                token,
                None,
                PackageManagerError::internal(format!("install session {token} was dropped")),
            )
        })
    }
}

/// Sends exactly one result: the one given, or an internal error if the
/// session ends without producing one.
struct ResultSink {
    token: SessionToken,
    reply: Option<oneshot::Sender<InstallResult>>,
}

impl ResultSink {
    fn send(mut self, result: InstallResult) {
        if let Some(reply) = self.reply.take() {
            if reply.send(result).is_err() {
                debug!(token = self.token, "install observer went away before the result");
            }
        }
    }
}

impl Drop for ResultSink {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            error!(token = self.token, "install session ended without a result");
            let _ = reply.send(InstallResult::failure(
                self.token,
                None,
                PackageManagerError::internal("install session ended without a result"),
            ));
        }
    }
}

enum PipelineMessage {
    Install {
        token: SessionToken,
        request: InstallRequest,
        reply: ResultSink,
    },
}

type SessionTable = Arc<Mutex<BTreeMap<SessionToken, SessionState>>>;

/// Accepts install requests and runs each as its own task. Different
/// packages move through staging and copying concurrently; the registry
/// lock serializes their commits and the freeze serializes same-name work.
#[derive(Clone)]
pub struct InstallPipeline {
    sender: mpsc::UnboundedSender<PipelineMessage>,
    next_token: Arc<AtomicU64>,
    sessions: SessionTable,
}

impl InstallPipeline {
    /// Spawns the handler task; must run inside a tokio runtime.
    pub fn start(context: Arc<ServiceContext>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<PipelineMessage>();
        let sessions: SessionTable = Arc::new(Mutex::new(BTreeMap::new()));
        let handler_sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    PipelineMessage::Install {
                        token,
                        request,
                        reply,
                    } => {
                        let session = InstallSession {
                            context: Arc::clone(&context),
                            token,
                            request,
                            sessions: Arc::clone(&handler_sessions),
                        };
                        tokio::spawn(session.run(reply));
                    }
                }
            }
            debug!("install handler stopped");
        });
        Self {
            sender,
            next_token: Arc::new(AtomicU64::new(crate::journal::InstallJournal::seed_token())),
            sessions,
        }
    }

    pub fn submit(&self, request: InstallRequest) -> InstallHandle {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let (reply, receiver) = oneshot::channel();
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, SessionState::Staging);
        info!(token, origin = %request.origin.describe(), user = %request.user, "install requested");
        let message = PipelineMessage::Install {
            token,
            request,
            reply: ResultSink {
                token,
                reply: Some(reply),
            },
        };
        if self.sender.send(message).is_err() {
            error!(token, "install handler is not running");
        }
        InstallHandle { token, receiver }
    }

    pub fn session_state(&self, token: SessionToken) -> Option<SessionState> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&token)
            .copied()
    }
}

struct Staged {
    archive: PathBuf,
    lite: LiteDescriptor,
    location: InstallLocation,
    existing: Option<RegistryEntry>,
}

struct Copied {
    code_path: PathBuf,
    descriptor: PackageDescriptor,
    native: NativeLibraries,
}

struct Committed {
    report: CommitReport,
    removed: Option<RemovedInfo>,
    permissions: PermissionChanges,
    entry: RegistryEntry,
}

struct InstallSession {
    context: Arc<ServiceContext>,
    token: SessionToken,
    request: InstallRequest,
    sessions: SessionTable,
}

impl InstallSession {
    fn advance(&self, state: SessionState) {
        debug!(token = self.token, ?state, "install session advanced");
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.token, state);
    }

    async fn run(self, reply: ResultSink) {
        let mut name = None;
        let result = match self.execute(&mut name).await {
            Ok(committed) => InstallResult {
                token: self.token,
                outcome: InstallOutcome::Succeeded,
                message: format!(
                    "installed {} version {}",
                    committed.entry.name, committed.entry.version_code
                ),
                name: Some(committed.entry.name.clone()),
                app_id: Some(committed.entry.app_id),
                removed: committed.removed,
            },
            Err(err) => {
                warn!(token = self.token, package = ?name, outcome = %err.outcome, message = %err.message, "install failed");
                InstallResult::failure(self.token, name, err)
            }
        };
        let status = if result.is_success() { "committed" } else { "failed" };
        if let Err(err) = self.context.journal.finish(self.token, status) {
            warn!(token = self.token, error = %format!("{err:#}"), "failed to close install journal");
        }
        self.advance(SessionState::Done);
        info!(token = self.token, outcome = %result.outcome, "install finished");
        reply.send(result);
    }

    async fn execute(&self, name: &mut Option<String>) -> PmResult<Committed> {
        let context = &self.context;
        context
            .journal
            .begin(self.token, &self.request.origin.describe())
            .map_err(|err| PackageManagerError::from_anyhow(InstallOutcome::InternalError, &err))?;

        self.advance(SessionState::Staging);
        let staged = self.stage().await?;
        *name = Some(staged.lite.name.clone());

        self.advance(SessionState::Verifying);
        self.verify(&staged).await?;

        self.advance(SessionState::Copying);
        let unit = FreezeUnit {
            name: staged.lite.name.clone(),
            children: staged.lite.child_names.clone(),
            app_id: staged.existing.as_ref().map(|entry| entry.app_id),
        };
        let freeze = context
            .freezer
            .acquire(&unit, "install", FreezeWait::Block, false)
            .await
            .map_err(|err| PackageManagerError::new(InstallOutcome::Aborted, err.to_string()))?;

        let code_path = self.code_path_for(&staged);
        let copied = match self.copy(&staged, code_path.clone()).await {
            Ok(copied) => copied,
            Err(err) => {
                self.discard_code(&code_path).await;
                return Err(err);
            }
        };

        self.advance(SessionState::Scanning);
        let replacing = staged.existing.is_some();
        let _kill = (replacing && !self.request.flags.dont_kill_app)
            .then(|| context.freezer.freeze(&unit, "replacing package"));
        let committed = match self.commit(&copied, &freeze) {
            Ok(committed) => committed,
            Err(err) => {
                self.discard_code(&copied.code_path).await;
                return Err(err);
            }
        };
        if let Err(err) = context.journal.append_step(self.token, "commit", None) {
            warn!(token = self.token, error = %format!("{err:#}"), "failed to journal commit");
        }

        self.advance(SessionState::Committing);
        context.persist(committed.report.security_relevant || committed.permissions.security_relevant());
        self.finish_commit(&committed).await;
        Ok(committed)
    }

    async fn stage(&self) -> PmResult<Staged> {
        let context = &self.context;
        let archive = self.resolve_archive()?;
        self.request.flags.validate()?;

        let users = context
            .registry
            .with(|settings| target_user_ids(settings, self.request.user));
        if users.is_empty() {
            return Err(PackageManagerError::new(
                InstallOutcome::InternalError,
                format!("unknown user {}", self.request.user),
            ));
        }
        let policy = &context.collaborators.policy;
        for user in &users {
            if policy.install_blocked_by_policy(*user)
                || (self.request.flags.from_shell && policy.shell_installs_disallowed(*user))
            {
                return Err(PackageManagerError::new(
                    InstallOutcome::UserRestricted,
                    format!("user {user} may not install applications"),
                ));
            }
        }

        let lite = context.collaborators.parser.parse_lite(&archive)?;
        if let Some(expected) = &self.request.expected_name {
            if expected != &lite.name {
                return Err(PackageManagerError::new(
                    InstallOutcome::InvalidApk,
                    format!("session expected {expected} but the archive contains {}", lite.name),
                ));
            }
        }
        if let Err(err) = context.journal.record_package(self.token, &lite.name) {
            warn!(token = self.token, error = %format!("{err:#}"), "failed to journal package name");
        }

        let existing = context
            .registry
            .with(|settings| settings.package(&lite.name).cloned());
        if let Some(existing) = &existing {
            if existing.is_installed_for_any() && !self.request.flags.replace_existing {
                return Err(PackageManagerError::new(
                    InstallOutcome::AlreadyExists,
                    format!("package {} is already installed", lite.name),
                ));
            }
            let debuggable = existing.flags.debuggable || context.config.debuggable_build;
            if lite.version_code < existing.version_code
                && !(self.request.flags.allow_downgrade && debuggable)
            {
                return Err(PackageManagerError::new(
                    InstallOutcome::VersionDowngrade,
                    format!(
                        "package {} version {} is older than installed version {}",
                        lite.name, lite.version_code, existing.version_code
                    ),
                ));
            }
        }

        let location = self.resolve_location(&lite, existing.as_ref())?;
        let target_dir = context.layout.app_dir_for(&location);
        let (size, available) = {
            let mut helper = context.install_lock.lock().await;
            let info = helper.minimal_package_info(&archive).await?;
            let available = helper.available_bytes(&target_dir).await?;
            (info.size_bytes.max(lite.size_bytes), available)
        };
        if let Some(available) = available {
            if available < size {
                return Err(PackageManagerError::new(
                    InstallOutcome::InsufficientStorage,
                    format!(
                        "{} needs {size} bytes but only {available} are free in {}",
                        lite.name,
                        target_dir.display()
                    ),
                ));
            }
        }
        debug!(token = self.token, package = %lite.name, ?location, size, "install staged");
        Ok(Staged {
            archive,
            lite,
            location,
            existing,
        })
    }

    fn resolve_archive(&self) -> PmResult<PathBuf> {
        match &self.request.origin {
            Origin::File(path) => {
                if !path.exists() {
                    return Err(PackageManagerError::new(
                        InstallOutcome::InvalidUri,
                        format!("archive {} does not exist", path.display()),
                    ));
                }
                Ok(path.clone())
            }
            Origin::Staged(dir) => resolve_staged_archive(dir),
            Origin::Container(container_id) => {
                let path = self.context.layout.container_path(container_id);
                if !path.is_dir() {
                    return Err(PackageManagerError::new(
                        InstallOutcome::MediaUnavailable,
                        format!("container {container_id} is not mounted"),
                    ));
                }
                resolve_staged_archive(&path)
            }
            Origin::Existing(name) => Err(PackageManagerError::new(
                InstallOutcome::InvalidUri,
                format!("{name} is already installed; move it instead of reinstalling"),
            )),
        }
    }

    fn resolve_location(
        &self,
        lite: &LiteDescriptor,
        existing: Option<&RegistryEntry>,
    ) -> PmResult<InstallLocation> {
        let flags = &self.request.flags;
        if let Some(volume) = &flags.volume_uuid {
            if !self.context.layout.volume_dir(volume).is_dir() {
                return Err(PackageManagerError::new(
                    InstallOutcome::InvalidInstallLocation,
                    format!("volume {volume} is not mounted"),
                ));
            }
            return Ok(InstallLocation::Volume(volume.clone()));
        }
        if flags.external && lite.install_location == InstallLocationPreference::InternalOnly {
            return Err(PackageManagerError::new(
                InstallOutcome::InvalidInstallLocation,
                format!("package {} must be installed internally", lite.name),
            ));
        }
        if flags.internal || flags.ephemeral {
            return Ok(InstallLocation::Internal);
        }
        if flags.external {
            return Ok(InstallLocation::External);
        }
        if let Some(existing) = existing {
            if let Some(volume) = &existing.volume_uuid {
                return Ok(InstallLocation::Volume(volume.clone()));
            }
            if existing.flags.external {
                return Ok(InstallLocation::External);
            }
            return Ok(InstallLocation::Internal);
        }
        Ok(match lite.install_location {
            InstallLocationPreference::PreferExternal if !flags.forward_locked => {
                InstallLocation::External
            }
            _ => InstallLocation::Internal,
        })
    }

    async fn verify(&self, staged: &Staged) -> PmResult<()> {
        let context = &self.context;
        let policy = context.verifier.policy();
        if !policy.enabled || (self.request.flags.from_shell && !policy.verify_shell_installs) {
            debug!(token = self.token, "verification not required for this install");
            return Ok(());
        }
        let user = match self.request.user {
            UserTarget::User(user) => user,
            UserTarget::All => pkgmgr_core::SYSTEM_USER,
        };
        let pending = context
            .verifier
            .begin_content_verification(ContentVerification {
                package: staged.lite.name.clone(),
                version_code: staged.lite.version_code,
                archive: staged.archive.clone(),
                installer: self.request.installer.clone(),
                user,
            });
        let id = pending.id();
        let outcome = pending.wait().await?;
        info!(token = self.token, id, ?outcome, "verification decided");
        outcome.into_result(&staged.lite.name)
    }

    fn code_path_for(&self, staged: &Staged) -> PathBuf {
        self.context
            .layout
            .code_dir(&staged.location, &staged.lite.name, self.token)
    }

    async fn copy(&self, staged: &Staged, code_path: PathBuf) -> PmResult<Copied> {
        let context = &self.context;
        if let Err(err) = context
            .journal
            .append_step(self.token, "copy", Some(code_path.clone()))
        {
            warn!(token = self.token, error = %format!("{err:#}"), "failed to journal copy");
        }
        if let Some(parent) = code_path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                PackageManagerError::new(
                    InstallOutcome::ContainerError,
                    format!("failed to create {}: {err}", parent.display()),
                )
            })?;
        }

        let moved = self.request.origin.is_staged() && fs::rename(&staged.archive, &code_path).is_ok();
        let mut helper = context.install_lock.lock().await;
        if !moved {
            helper.copy_package(&staged.archive, &code_path).await?;
        }

        let mut descriptor = context.collaborators.parser.parse(&code_path)?;
        if descriptor.name != staged.lite.name {
            return Err(PackageManagerError::new(
                InstallOutcome::PackageChanged,
                format!(
                    "archive changed from {} to {} while installing",
                    staged.lite.name, descriptor.name
                ),
            ));
        }
        if let Some(expected) = &self.request.expected_certificates {
            if &descriptor.certificates != expected {
                return Err(PackageManagerError::new(
                    InstallOutcome::InvalidApk,
                    format!("{} is not signed by the session's expected signers", descriptor.name),
                ));
            }
        }
        descriptor.code_path = code_path.clone();
        descriptor.attributes.forward_locked = self.request.flags.forward_locked;
        descriptor.attributes.external = staged.location.is_external();
        descriptor.attributes.ephemeral = self.request.flags.ephemeral;
        descriptor.propagate_to_children();

        let native = helper
            .derive_native_libraries(&code_path, &context.config.supported_abis)
            .await?;
        if native.has_native_code && native.primary_abi.is_none() {
            return Err(PackageManagerError::new(
                InstallOutcome::NoMatchingAbis,
                format!(
                    "{} has no native code for {:?}",
                    descriptor.name, context.config.supported_abis
                ),
            ));
        }
        Ok(Copied {
            code_path,
            descriptor,
            native,
        })
    }

    /// Scan, commit and permission update in one registry critical section.
    fn commit(&self, copied: &Copied, freeze: &crate::freezer::FreezeGuard) -> PmResult<Committed> {
        let context = &self.context;
        let mut options = ScanOptions::for_install(
            &self.request.flags,
            self.request.installer.clone(),
            self.request.user,
        );
        if options.volume_uuid.is_none() {
            options.volume_uuid = copied
                .code_path
                .strip_prefix(context.layout.volumes_dir())
                .ok()
                .and_then(|rest| rest.components().next())
                .map(|uuid| uuid.as_os_str().to_string_lossy().into_owned());
        }

        let mut settings = context.registry.lock();
        let registered = settings.package(&copied.descriptor.name).map(RegistryEntry::is_installed_for_any);
        if registered == Some(true) && !self.request.flags.replace_existing {
            return Err(PackageManagerError::new(
                InstallOutcome::AlreadyExists,
                format!("package {} was installed while this session ran", copied.descriptor.name),
            ));
        }
        options.replacing = registered.is_some();
        options.fresh_install = registered.is_none();
        let (report, removed) = if registered.is_some() {
            let replacement =
                context
                    .replacer
                    .replace(&mut settings, &copied.descriptor, &options, freeze)?;
            (replacement.report, Some(replacement.removed))
        } else {
            match context
                .engine
                .scan(&mut settings, &copied.descriptor, &options, freeze)?
            {
                ScanResult::Committed(report) => (report, None),
                other => {
                    return Err(PackageManagerError::internal(format!(
                        "install scan of {} did not commit: {other:?}",
                        copied.descriptor.name
                    )));
                }
            }
        };

        for unit in &report.units {
            if let Some(entry) = settings.package_mut(unit) {
                entry.native_library_path = copied.native.path.clone();
                entry.primary_abi = copied.native.primary_abi.clone();
                entry.secondary_abi = copied.native.secondary_abi.clone();
            }
        }

        let grant_runtime_to = if self.request.flags.grant_runtime_permissions {
            target_user_ids(&settings, self.request.user)
        } else {
            Vec::new()
        };
        let pass = PermissionPass { grant_runtime_to };
        let mut permissions = PermissionChanges::default();
        for unit in &report.units {
            let changes = context
                .migrator
                .update_permissions(&mut settings, Some(unit), &pass);
            permissions.granted.extend(changes.granted);
            permissions.revoked.extend(changes.revoked);
            permissions.promoted.extend(changes.promoted);
            permissions.kill_requested |= changes.kill_requested;
        }

        let entry = settings.package(&report.name).cloned().ok_or_else(|| {
            PackageManagerError::internal(format!("{} missing right after commit", report.name))
        })?;
        Ok(Committed {
            report,
            removed,
            permissions,
            entry,
        })
    }

    /// Work that follows a durable commit. Failures here are logged; the
    /// install already happened.
    async fn finish_commit(&self, committed: &Committed) {
        let context = &self.context;
        let entry = &committed.entry;
        let users = entry.installed_users();
        {
            let mut helper = context.install_lock.lock().await;
            for unit in &committed.report.units {
                for user in &users {
                    if let Err(err) = helper
                        .create_app_data(entry.volume_uuid.as_deref(), *user, unit, entry.app_id)
                        .await
                    {
                        warn!(package = %unit, user, error = %err, "failed to prepare app data");
                    }
                }
            }
            if let Some(removed) = &committed.removed {
                let old = &removed.previous_code_path;
                if old != &entry.code_path && !old.starts_with(context.layout.system_dir()) {
                    if let Err(err) = helper.remove_code_path(old).await {
                        warn!(package = %entry.name, path = %old.display(), error = %err, "failed to remove replaced code");
                    }
                }
            }
        }

        context.domains.start(&entry.name, &entry.verify_hosts, &users);
        self.emit_install_events(committed, &users);
    }

    fn emit_install_events(&self, committed: &Committed, users: &[UserId]) {
        let context = &self.context;
        let entry = &committed.entry;
        for user in users {
            let had_it = committed
                .removed
                .as_ref()
                .is_some_and(|removed| removed.had_user(*user));
            context.emit(LifecycleEvent::PackageAdded {
                name: entry.name.clone(),
                user: *user,
                app_id: entry.app_id,
                replacing: had_it,
            });
            if had_it {
                context.emit(LifecycleEvent::PackageReplaced {
                    name: entry.name.clone(),
                    user: *user,
                    app_id: entry.app_id,
                });
            } else {
                context.emit(LifecycleEvent::FirstLaunch {
                    name: entry.name.clone(),
                    user: *user,
                    installer: entry.installer.clone(),
                });
            }
        }
        if !committed.permissions.is_empty() {
            context.emit(LifecycleEvent::PermissionsChanged {
                name: entry.name.clone(),
                app_id: entry.app_id,
            });
        }
    }

    async fn discard_code(&self, code_path: &Path) {
        if !code_path.exists() {
            return;
        }
        let mut helper = self.context.install_lock.lock().await;
        if let Err(err) = helper.remove_code_path(code_path).await {
            warn!(token = self.token, path = %code_path.display(), error = %err, "failed to remove uncommitted code");
        }
    }
}

/// A staged directory is either an archive itself or holds exactly one.
pub fn resolve_staged_archive(dir: &Path) -> PmResult<PathBuf> {
    if dir.join(MANIFEST_FILE).is_file() {
        return Ok(dir.to_path_buf());
    }
    if !dir.is_dir() {
        return Err(PackageManagerError::new(
            InstallOutcome::InvalidUri,
            format!("staged directory {} does not exist", dir.display()),
        ));
    }
    let candidates = child_dirs(dir)
        .map_err(|err| PackageManagerError::from_anyhow(InstallOutcome::InvalidApk, &err))?
        .into_iter()
        .filter(|child| child.join(MANIFEST_FILE).is_file())
        .collect::<Vec<_>>();
    match candidates.as_slice() {
        [archive] => Ok(archive.clone()),
        [] => Err(PackageManagerError::new(
            InstallOutcome::InvalidApk,
            format!("no archive staged in {}", dir.display()),
        )),
        _ => Err(PackageManagerError::new(
            InstallOutcome::InvalidApk,
            format!(
                "{} archives staged in {}; expected exactly one",
                candidates.len(),
                dir.display()
            ),
        )),
    }
}
