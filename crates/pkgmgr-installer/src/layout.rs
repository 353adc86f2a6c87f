use anyhow::{Context, Result};
use pkgmgr_core::{InstallLocation, UserId};
use std::fs;
use std::path::{Path, PathBuf};

/// Every on-disk location the service touches, derived from one device root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLayout {
    root: PathBuf,
}

impl DeviceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn system_dir(&self) -> PathBuf {
        self.root.join("system")
    }

    pub fn priv_app_dir(&self) -> PathBuf {
        self.system_dir().join("priv-app")
    }

    pub fn system_app_dir(&self) -> PathBuf {
        self.system_dir().join("app")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn data_app_dir(&self) -> PathBuf {
        self.data_dir().join("app")
    }

    pub fn external_app_dir(&self) -> PathBuf {
        self.root.join("mnt").join("asec")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("mnt").join("containers")
    }

    pub fn container_path(&self, container_id: &str) -> PathBuf {
        self.containers_dir().join(container_id)
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("mnt").join("expand")
    }

    pub fn volume_dir(&self, uuid: &str) -> PathBuf {
        self.volumes_dir().join(uuid)
    }

    pub fn volume_app_dir(&self, uuid: &str) -> PathBuf {
        self.volume_dir(uuid).join("app")
    }

    /// Base of per-user data directories on internal storage or an adopted volume.
    pub fn user_data_root(&self, volume_uuid: Option<&str>, user: UserId) -> PathBuf {
        let base = match volume_uuid {
            Some(uuid) => self.volume_dir(uuid),
            None => self.data_dir(),
        };
        base.join("user").join(user.to_string())
    }

    pub fn package_data_dir(&self, volume_uuid: Option<&str>, user: UserId, name: &str) -> PathBuf {
        self.user_data_root(volume_uuid, user).join(name)
    }

    pub fn app_dir_for(&self, location: &InstallLocation) -> PathBuf {
        match location {
            InstallLocation::Internal => self.data_app_dir(),
            InstallLocation::External => self.external_app_dir(),
            InstallLocation::Volume(uuid) => self.volume_app_dir(uuid),
        }
    }

    /// Final code directory of a package installed by session `token`.
    pub fn code_dir(&self, location: &InstallLocation, name: &str, token: u64) -> PathBuf {
        self.app_dir_for(location).join(format!("{name}-{token}"))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir().join("staging")
    }

    pub fn installs_dir(&self) -> PathBuf {
        self.state_dir().join("installs")
    }

    pub fn install_record_path(&self, token: u64) -> PathBuf {
        self.installs_dir().join(format!("{token}.json"))
    }

    pub fn install_journal_path(&self, token: u64) -> PathBuf {
        self.installs_dir().join(format!("{token}.journal"))
    }

    pub fn install_active_path(&self, token: u64) -> PathBuf {
        self.installs_dir().join(format!("{token}.active"))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.registry_dir(),
            self.priv_app_dir(),
            self.system_app_dir(),
            self.data_app_dir(),
            self.external_app_dir(),
            self.containers_dir(),
            self.volumes_dir(),
            self.user_data_root(None, pkgmgr_core::SYSTEM_USER),
            self.staging_dir(),
            self.installs_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_device_root() -> Result<PathBuf> {
    if let Ok(root) = std::env::var("PKGMGR_ROOT") {
        if !root.trim().is_empty() {
            return Ok(PathBuf::from(root));
        }
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve device root")?;
    Ok(PathBuf::from(home).join(".pkgmgr"))
}
