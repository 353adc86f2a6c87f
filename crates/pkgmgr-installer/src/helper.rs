//! The privileged file helper: a single-threaded worker doing every copy,
//! measurement and data-directory operation on behalf of the service. All
//! calls go through [`InstallGuard`], which owns the connection for as long
//! as the install lock is held.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pkgmgr_core::{InstallOutcome, PackageManagerError, PmResult, UserId};
use pkgmgr_registry::AppId;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, warn};

use crate::fs_utils::{
    available_space, child_dirs, copy_dir_recursive, dir_size, remove_dir_if_exists,
};
use crate::layout::DeviceLayout;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MinimalPackageInfo {
    pub size_bytes: u64,
    pub has_native_code: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeLibraries {
    pub path: Option<PathBuf>,
    pub primary_abi: Option<String>,
    pub secondary_abi: Option<String>,
    /// The archive ships native code, whether or not an ABI matched.
    pub has_native_code: bool,
}

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("privileged file helper connection dropped")]
    Disconnected,
    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HelperError {
    fn into_package_error(self, operation: &str, failure: InstallOutcome) -> PackageManagerError {
        match self {
            Self::InsufficientStorage(detail) => PackageManagerError::new(
                InstallOutcome::InsufficientStorage,
                format!("{operation}: {detail}"),
            ),
            Self::Disconnected => PackageManagerError::internal(format!(
                "{operation}: privileged file helper connection dropped"
            )),
            Self::Failed(err) => {
                PackageManagerError::new(failure, format!("{operation} failed: {err:#}"))
            }
        }
    }
}

#[async_trait]
pub trait PrivilegedFileHelper: Send {
    async fn minimal_package_info(&mut self, archive: &Path)
        -> Result<MinimalPackageInfo, HelperError>;

    /// Free bytes under `dir`; `None` when the helper cannot tell.
    async fn available_bytes(&mut self, dir: &Path) -> Result<Option<u64>, HelperError>;

    async fn copy_package(&mut self, source: &Path, target: &Path) -> Result<(), HelperError>;

    async fn derive_native_libraries(
        &mut self,
        code_path: &Path,
        supported_abis: &[String],
    ) -> Result<NativeLibraries, HelperError>;

    async fn create_app_data(
        &mut self,
        volume_uuid: Option<&str>,
        user: UserId,
        name: &str,
        app_id: AppId,
    ) -> Result<(), HelperError>;

    async fn destroy_app_data(
        &mut self,
        volume_uuid: Option<&str>,
        user: UserId,
        name: &str,
    ) -> Result<(), HelperError>;

    async fn clear_app_data(
        &mut self,
        volume_uuid: Option<&str>,
        user: UserId,
        name: &str,
    ) -> Result<(), HelperError>;

    async fn compute_size(&mut self, path: &Path) -> Result<u64, HelperError>;

    async fn remove_code_path(&mut self, path: &Path) -> Result<(), HelperError>;

    async fn move_app_data(
        &mut self,
        from_volume: Option<&str>,
        to_volume: Option<&str>,
        name: &str,
        users: &[UserId],
    ) -> Result<(), HelperError>;
}

pub trait HelperConnector: Send + Sync {
    fn connect(&self) -> anyhow::Result<Box<dyn PrivilegedFileHelper>>;
}

struct HelperConnection {
    connector: Arc<dyn HelperConnector>,
    helper: Option<Box<dyn PrivilegedFileHelper>>,
    max_retries: u32,
    backoff: Duration,
}

/// Serializes helper work: the helper handles one request at a time, so
/// callers queue on this lock in FIFO order.
#[derive(Clone)]
pub struct InstallLock {
    inner: Arc<Mutex<HelperConnection>>,
}

pub struct InstallGuard {
    connection: OwnedMutexGuard<HelperConnection>,
}

impl InstallLock {
    pub fn new(connector: Arc<dyn HelperConnector>, max_retries: u32, backoff: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HelperConnection {
                connector,
                helper: None,
                max_retries,
                backoff,
            })),
        }
    }

    pub async fn lock(&self) -> InstallGuard {
        InstallGuard {
            connection: Arc::clone(&self.inner).lock_owned().await,
        }
    }
}

/// Runs one helper call, reconnecting and retrying when the connection drops.
macro_rules! with_retry {
    ($guard:expr, $operation:literal, $failure:expr, |$helper:ident| $call:expr) => {{
        let mut attempts: u32 = 0;
        loop {
            let result = match $guard.helper() {
                Ok($helper) => $call.await,
                Err(err) => Err(err),
            };
            match result {
                Err(HelperError::Disconnected) => {
                    $guard.disconnect();
                    attempts += 1;
                    if attempts > $guard.connection.max_retries {
                        error!(operation = $operation, attempts, "privileged file helper unreachable");
                        break Err(PackageManagerError::internal(format!(
                            "failed to bind to privileged file helper during {}",
                            $operation
                        )));
                    }
                    warn!(operation = $operation, attempt = attempts, "helper connection dropped; reconnecting");
                    tokio::time::sleep($guard.connection.backoff).await;
                }
                other => {
                    break other.map_err(|err| err.into_package_error($operation, $failure));
                }
            }
        }
    }};
}

impl InstallGuard {
    fn helper(&mut self) -> Result<&mut (dyn PrivilegedFileHelper + 'static), HelperError> {
        let connection = &mut *self.connection;
        if connection.helper.is_none() {
            match connection.connector.connect() {
                Ok(helper) => {
                    debug!("connected to privileged file helper");
                    connection.helper = Some(helper);
                }
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to connect to privileged file helper");
                    return Err(HelperError::Disconnected);
                }
            }
        }
        connection
            .helper
            .as_deref_mut()
            .ok_or(HelperError::Disconnected)
    }

    fn disconnect(&mut self) {
        self.connection.helper = None;
    }

    pub async fn minimal_package_info(&mut self, archive: &Path) -> PmResult<MinimalPackageInfo> {
        with_retry!(self, "minimal_package_info", InstallOutcome::InvalidApk, |helper| {
            helper.minimal_package_info(archive)
        })
    }

    pub async fn available_bytes(&mut self, dir: &Path) -> PmResult<Option<u64>> {
        with_retry!(self, "available_bytes", InstallOutcome::InternalError, |helper| {
            helper.available_bytes(dir)
        })
    }

    pub async fn copy_package(&mut self, source: &Path, target: &Path) -> PmResult<()> {
        with_retry!(self, "copy_package", InstallOutcome::ContainerError, |helper| {
            helper.copy_package(source, target)
        })
    }

    pub async fn derive_native_libraries(
        &mut self,
        code_path: &Path,
        supported_abis: &[String],
    ) -> PmResult<NativeLibraries> {
        with_retry!(self, "derive_native_libraries", InstallOutcome::InternalError, |helper| {
            helper.derive_native_libraries(code_path, supported_abis)
        })
    }

    pub async fn create_app_data(
        &mut self,
        volume_uuid: Option<&str>,
        user: UserId,
        name: &str,
        app_id: AppId,
    ) -> PmResult<()> {
        with_retry!(self, "create_app_data", InstallOutcome::InternalError, |helper| {
            helper.create_app_data(volume_uuid, user, name, app_id)
        })
    }

    pub async fn destroy_app_data(
        &mut self,
        volume_uuid: Option<&str>,
        user: UserId,
        name: &str,
    ) -> PmResult<()> {
        with_retry!(self, "destroy_app_data", InstallOutcome::InternalError, |helper| {
            helper.destroy_app_data(volume_uuid, user, name)
        })
    }

    pub async fn clear_app_data(
        &mut self,
        volume_uuid: Option<&str>,
        user: UserId,
        name: &str,
    ) -> PmResult<()> {
        with_retry!(self, "clear_app_data", InstallOutcome::InternalError, |helper| {
            helper.clear_app_data(volume_uuid, user, name)
        })
    }

    pub async fn compute_size(&mut self, path: &Path) -> PmResult<u64> {
        with_retry!(self, "compute_size", InstallOutcome::InternalError, |helper| {
            helper.compute_size(path)
        })
    }

    pub async fn remove_code_path(&mut self, path: &Path) -> PmResult<()> {
        with_retry!(self, "remove_code_path", InstallOutcome::InternalError, |helper| {
            helper.remove_code_path(path)
        })
    }

    pub async fn move_app_data(
        &mut self,
        from_volume: Option<&str>,
        to_volume: Option<&str>,
        name: &str,
        users: &[UserId],
    ) -> PmResult<()> {
        with_retry!(self, "move_app_data", InstallOutcome::InternalError, |helper| {
            helper.move_app_data(from_volume, to_volume, name, users)
        })
    }
}

/// Performs helper operations directly on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileHelper {
    layout: DeviceLayout,
}

impl LocalFileHelper {
    pub fn new(layout: DeviceLayout) -> Self {
        Self { layout }
    }
}

async fn blocking<T, F>(work: F) -> Result<T, HelperError>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(HelperError::Failed),
        Err(err) => Err(HelperError::Failed(anyhow::Error::new(err))),
    }
}

#[async_trait]
impl PrivilegedFileHelper for LocalFileHelper {
    async fn minimal_package_info(
        &mut self,
        archive: &Path,
    ) -> Result<MinimalPackageInfo, HelperError> {
        let archive = archive.to_path_buf();
        blocking(move || {
            Ok(MinimalPackageInfo {
                size_bytes: dir_size(&archive)?,
                has_native_code: !child_dirs(&archive.join(crate::archive::NATIVE_LIB_DIR))?
                    .is_empty(),
            })
        })
        .await
    }

    async fn available_bytes(&mut self, dir: &Path) -> Result<Option<u64>, HelperError> {
        let dir = dir.to_path_buf();
        blocking(move || available_space(&dir).map(Some)).await
    }

    async fn copy_package(&mut self, source: &Path, target: &Path) -> Result<(), HelperError> {
        let source = source.to_path_buf();
        let target = target.to_path_buf();
        blocking(move || copy_dir_recursive(&source, &target)).await
    }

    async fn derive_native_libraries(
        &mut self,
        code_path: &Path,
        supported_abis: &[String],
    ) -> Result<NativeLibraries, HelperError> {
        let lib_dir = code_path.join(crate::archive::NATIVE_LIB_DIR);
        let supported = supported_abis.to_vec();
        blocking(move || {
            let present = child_dirs(&lib_dir)?
                .iter()
                .filter_map(|dir| dir.file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .collect::<Vec<_>>();
            let mut matching = supported
                .iter()
                .filter(|abi| present.contains(abi))
                .cloned();
            let primary_abi = matching.next();
            let secondary_abi = matching.next();
            Ok(NativeLibraries {
                path: primary_abi.as_ref().map(|abi| lib_dir.join(abi)),
                primary_abi,
                secondary_abi,
                has_native_code: !present.is_empty(),
            })
        })
        .await
    }

    async fn create_app_data(
        &mut self,
        volume_uuid: Option<&str>,
        user: UserId,
        name: &str,
        app_id: AppId,
    ) -> Result<(), HelperError> {
        let dir = self.layout.package_data_dir(volume_uuid, user, name);
        tokio::fs::create_dir_all(&dir).await.map_err(|err| {
            HelperError::Failed(anyhow::Error::new(err).context(format!(
                "failed to create data directory {} for app id {app_id}",
                dir.display()
            )))
        })
    }

    async fn destroy_app_data(
        &mut self,
        volume_uuid: Option<&str>,
        user: UserId,
        name: &str,
    ) -> Result<(), HelperError> {
        let dir = self.layout.package_data_dir(volume_uuid, user, name);
        blocking(move || {
            remove_dir_if_exists(&dir)
                .map_err(|err| anyhow::Error::new(err).context(format!("failed to remove {}", dir.display())))
        })
        .await
    }

    async fn clear_app_data(
        &mut self,
        volume_uuid: Option<&str>,
        user: UserId,
        name: &str,
    ) -> Result<(), HelperError> {
        let dir = self.layout.package_data_dir(volume_uuid, user, name);
        blocking(move || {
            remove_dir_if_exists(&dir)
                .map_err(|err| anyhow::Error::new(err).context(format!("failed to clear {}", dir.display())))?;
            std::fs::create_dir_all(&dir)
                .map_err(|err| anyhow::Error::new(err).context(format!("failed to recreate {}", dir.display())))
        })
        .await
    }

    async fn compute_size(&mut self, path: &Path) -> Result<u64, HelperError> {
        let path = path.to_path_buf();
        blocking(move || dir_size(&path)).await
    }

    async fn remove_code_path(&mut self, path: &Path) -> Result<(), HelperError> {
        let path = path.to_path_buf();
        blocking(move || {
            remove_dir_if_exists(&path)
                .map_err(|err| anyhow::Error::new(err).context(format!("failed to remove {}", path.display())))
        })
        .await
    }

    async fn move_app_data(
        &mut self,
        from_volume: Option<&str>,
        to_volume: Option<&str>,
        name: &str,
        users: &[UserId],
    ) -> Result<(), HelperError> {
        let moves = users
            .iter()
            .map(|user| {
                (
                    self.layout.package_data_dir(from_volume, *user, name),
                    self.layout.package_data_dir(to_volume, *user, name),
                )
            })
            .collect::<Vec<_>>();
        blocking(move || {
            for (from, to) in moves {
                if !from.exists() {
                    continue;
                }
                copy_dir_recursive(&from, &to)?;
                remove_dir_if_exists(&from).map_err(|err| {
                    anyhow::Error::new(err).context(format!("failed to remove {}", from.display()))
                })?;
            }
            Ok(())
        })
        .await
    }
}

#[derive(Debug, Clone)]
pub struct LocalHelperConnector {
    layout: DeviceLayout,
}

impl LocalHelperConnector {
    pub fn new(layout: DeviceLayout) -> Self {
        Self { layout }
    }
}

impl HelperConnector for LocalHelperConnector {
    fn connect(&self) -> anyhow::Result<Box<dyn PrivilegedFileHelper>> {
        Ok(Box::new(LocalFileHelper::new(self.layout.clone())))
    }
}
