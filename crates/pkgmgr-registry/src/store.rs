use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pkgmgr_core::{UserId, SYSTEM_USER};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::entry::{RegistryEntry, UserState};
use crate::permissions::{PermissionDefinition, PermissionGrant};
use crate::settings::{CleanupRecord, Settings};
use crate::shared::{AppIdOwner, SharedUser};

pub const SETTINGS_FILE: &str = "settings.json";
pub const PACKAGE_RESTRICTIONS_FILE: &str = "package-restrictions.json";
pub const RUNTIME_PERMISSIONS_FILE: &str = "runtime-permissions.json";
const USER_FILE_VERSION: u32 = 1;

/// Schema revisions of `settings.json`. Older files are migrated forward on
/// load; newer ones are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DatabaseVersion {
    First = 1,
    /// Certificates are recorded as end-entity keys only.
    SignatureEndEntity = 2,
    /// Entries whose certificates failed to load are re-collected.
    SignatureMalformedRecover = 3,
}

impl DatabaseVersion {
    pub const CURRENT: Self = Self::SignatureMalformedRecover;

    pub fn number(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SettingsFile {
    version: u32,
    #[serde(default)]
    users: BTreeSet<UserId>,
    #[serde(default)]
    packages: Vec<RegistryEntry>,
    #[serde(default)]
    shared_users: Vec<SharedUser>,
    #[serde(default)]
    disabled_system: Vec<RegistryEntry>,
    #[serde(default)]
    renamed: BTreeMap<String, String>,
    #[serde(default)]
    permissions: Vec<PermissionDefinition>,
    #[serde(default)]
    expecting_better: BTreeMap<String, PathBuf>,
    #[serde(default)]
    packages_to_clean: Vec<CleanupRecord>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SettingsFileLegacy {
    #[serde(default)]
    packages: Vec<RegistryEntry>,
    #[serde(default)]
    shared_users: Vec<SharedUser>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PackageRestrictionsFile {
    #[serde(default = "user_file_version")]
    version: u32,
    #[serde(default)]
    packages: BTreeMap<String, UserState>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RuntimePermissionsFile {
    #[serde(default = "user_file_version")]
    version: u32,
    #[serde(default)]
    packages: BTreeMap<String, BTreeMap<String, PermissionGrant>>,
    #[serde(default)]
    shared_users: BTreeMap<String, BTreeMap<String, PermissionGrant>>,
}

fn user_file_version() -> u32 {
    USER_FILE_VERSION
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// No `settings.json` existed; the registry starts empty.
    pub fresh: bool,
    pub migrated_from: Option<u32>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RegistryStore {
    root: PathBuf,
}

impl RegistryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    pub fn user_dir(&self, user: UserId) -> PathBuf {
        self.root.join("users").join(user.to_string())
    }

    pub fn load(&self) -> Result<(Settings, LoadReport)> {
        let path = self.settings_path();
        let mut report = LoadReport::default();
        if !path.exists() {
            let tmp = path.with_extension("json.tmp");
            if tmp.exists() {
                let message = format!(
                    "ignoring partially written settings file {}",
                    tmp.display()
                );
                warn!("{message}");
                report.warnings.push(message);
            }
            report.fresh = true;
            return Ok((Settings::new(), report));
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let (file, version) = parse_settings_file(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let mut settings = self.assemble(file, &mut report);
        if version < DatabaseVersion::CURRENT.number() {
            migrate_settings(&mut settings, version, &mut report);
            report.migrated_from = Some(version);
        }

        for user in settings.users() {
            self.load_user_files(&mut settings, user, &mut report)?;
        }
        for warning in &report.warnings {
            warn!("{warning}");
        }
        Ok((settings, report))
    }

    fn assemble(&self, file: SettingsFile, report: &mut LoadReport) -> Settings {
        let mut settings = Settings::new();
        settings.users.extend(file.users);

        for shared in file.shared_users {
            if !settings.register_app_id(shared.app_id, AppIdOwner::Shared(shared.name.clone())) {
                report.warnings.push(format!(
                    "dropping shared identity '{}': app id {} already in use",
                    shared.name, shared.app_id
                ));
                continue;
            }
            settings.shared_users.insert(shared.name.clone(), shared);
        }

        for entry in file.packages {
            let registered = match &entry.shared_user {
                Some(shared) => match settings.shared_users.get(shared) {
                    Some(shared_user) if shared_user.app_id == entry.app_id => true,
                    _ => {
                        report.warnings.push(format!(
                            "dropping package '{}': shared identity '{}' is not defined",
                            entry.name, shared
                        ));
                        false
                    }
                },
                None => {
                    let ok = settings.register_app_id(entry.app_id, entry.app_id_owner());
                    if !ok {
                        report.warnings.push(format!(
                            "dropping package '{}': app id {} already in use",
                            entry.name, entry.app_id
                        ));
                    }
                    ok
                }
            };
            if registered {
                settings.entries.insert(entry.name.clone(), entry);
            }
        }
        for shared in settings.shared_users.values_mut() {
            shared
                .members
                .retain(|member| settings.entries.contains_key(member));
        }

        for entry in file.disabled_system {
            settings.disabled_system.insert(entry.name.clone(), entry);
        }
        settings.renamed = file.renamed;
        for definition in file.permissions {
            settings
                .permission_definitions
                .insert(definition.declaration.name.clone(), definition);
        }
        settings.expecting_better = file.expecting_better;
        settings.packages_to_clean = file.packages_to_clean;
        settings.warnings = file.warnings;
        settings
    }

    fn load_user_files(
        &self,
        settings: &mut Settings,
        user: UserId,
        report: &mut LoadReport,
    ) -> Result<()> {
        let restrictions_path = self.user_dir(user).join(PACKAGE_RESTRICTIONS_FILE);
        let restrictions = read_json_if_exists::<PackageRestrictionsFile>(&restrictions_path)?;
        if restrictions.is_none() {
            info!(
                user,
                "no package restrictions on disk; treating every package as installed"
            );
        }
        let mut restrictions = restrictions.unwrap_or_default();
        for entry in settings.entries.values_mut() {
            let state = restrictions
                .packages
                .remove(&entry.name)
                .unwrap_or_else(|| UserState {
                    installed: true,
                    ..UserState::not_installed()
                });
            entry.users.insert(user, state);
        }
        for orphan in restrictions.packages.keys() {
            report.warnings.push(format!(
                "ignoring restrictions for unknown package '{orphan}' (user {user})"
            ));
        }

        let runtime_path = self.user_dir(user).join(RUNTIME_PERMISSIONS_FILE);
        if let Some(runtime) = read_json_if_exists::<RuntimePermissionsFile>(&runtime_path)? {
            for (name, grants) in runtime.packages {
                match settings.entries.get_mut(&name) {
                    Some(entry) => entry.permissions.set_runtime_grants_for(user, grants),
                    None => report.warnings.push(format!(
                        "ignoring runtime grants for unknown package '{name}' (user {user})"
                    )),
                }
            }
            for (name, grants) in runtime.shared_users {
                match settings.shared_users.get_mut(&name) {
                    Some(shared) => shared.permissions.set_runtime_grants_for(user, grants),
                    None => report.warnings.push(format!(
                        "ignoring runtime grants for unknown shared identity '{name}' (user {user})"
                    )),
                }
            }
        }
        Ok(())
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        let file = SettingsFile {
            version: DatabaseVersion::CURRENT.number(),
            users: settings.users.clone(),
            packages: settings.entries.values().cloned().collect(),
            shared_users: settings.shared_users.values().cloned().collect(),
            disabled_system: settings.disabled_system.values().cloned().collect(),
            renamed: settings.renamed.clone(),
            permissions: settings.permission_definitions.values().cloned().collect(),
            expecting_better: settings.expecting_better.clone(),
            packages_to_clean: settings.packages_to_clean.clone(),
            warnings: settings.warnings.clone(),
        };
        write_json_atomic(&self.settings_path(), &file)?;
        for user in settings.users() {
            self.save_user(settings, user)?;
        }
        Ok(())
    }

    pub fn save_user(&self, settings: &Settings, user: UserId) -> Result<()> {
        let restrictions = PackageRestrictionsFile {
            version: USER_FILE_VERSION,
            packages: settings
                .entries
                .values()
                .filter_map(|entry| {
                    entry
                        .user_state(user)
                        .map(|state| (entry.name.clone(), state.clone()))
                })
                .collect(),
        };
        let runtime = RuntimePermissionsFile {
            version: USER_FILE_VERSION,
            packages: settings
                .entries
                .values()
                .filter(|entry| entry.shared_user.is_none())
                .map(|entry| {
                    (
                        entry.name.clone(),
                        entry.permissions.runtime_grants_for(user),
                    )
                })
                .filter(|(_, grants)| !grants.is_empty())
                .collect(),
            shared_users: settings
                .shared_users
                .values()
                .map(|shared| {
                    (
                        shared.name.clone(),
                        shared.permissions.runtime_grants_for(user),
                    )
                })
                .filter(|(_, grants)| !grants.is_empty())
                .collect(),
        };

        let user_dir = self.user_dir(user);
        write_json_atomic(&user_dir.join(PACKAGE_RESTRICTIONS_FILE), &restrictions)?;
        write_json_atomic(&user_dir.join(RUNTIME_PERMISSIONS_FILE), &runtime)
    }

    pub fn remove_user_files(&self, user: UserId) -> Result<()> {
        if user == SYSTEM_USER {
            anyhow::bail!("refusing to remove files of the system user");
        }
        let dir = self.user_dir(user);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove {}", dir.display()))?;
        }
        Ok(())
    }
}

fn parse_settings_file(content: &str) -> Result<(SettingsFile, u32)> {
    let value = serde_json::from_str::<serde_json::Value>(content)?;
    if value.get("version").is_some() {
        let parsed = serde_json::from_value::<SettingsFile>(value)
            .context("failed parsing versioned settings")?;
        let expected = DatabaseVersion::CURRENT.number();
        if parsed.version > expected || parsed.version == 0 {
            anyhow::bail!(
                "unsupported settings version {} (expected at most {})",
                parsed.version,
                expected
            );
        }
        let version = parsed.version;
        Ok((parsed, version))
    } else {
        let parsed = serde_json::from_value::<SettingsFileLegacy>(value)
            .context("failed parsing legacy settings")?;
        Ok((
            SettingsFile {
                version: DatabaseVersion::First.number(),
                users: BTreeSet::from([SYSTEM_USER]),
                packages: parsed.packages,
                shared_users: parsed.shared_users,
                disabled_system: Vec::new(),
                renamed: BTreeMap::new(),
                permissions: Vec::new(),
                expecting_better: BTreeMap::new(),
                packages_to_clean: Vec::new(),
                warnings: Vec::new(),
            },
            DatabaseVersion::First.number(),
        ))
    }
}

fn migrate_settings(settings: &mut Settings, from: u32, report: &mut LoadReport) {
    info!(
        from,
        to = DatabaseVersion::CURRENT.number(),
        "migrating registry schema"
    );
    if from < DatabaseVersion::SignatureEndEntity.number() {
        for entry in settings.entries.values_mut() {
            entry.needs_certificate_recollection = true;
        }
    }
    if from < DatabaseVersion::SignatureMalformedRecover.number() {
        for entry in settings.entries.values_mut() {
            if entry.certificates.is_empty() {
                entry.needs_certificate_recollection = true;
                report.warnings.push(format!(
                    "package '{}' has no recorded certificates; re-collecting on next scan",
                    entry.name
                ));
            }
        }
    }
}

fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(parsed))
}

/// Writes `value` as pretty JSON next to `path` and renames it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}
