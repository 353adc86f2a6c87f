use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::layout::DeviceLayout;

const INSTALL_RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub version: u32,
    pub token: u64,
    pub origin: String,
    #[serde(default)]
    pub package: Option<String>,
    pub status: String,
    pub started_at_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalStep {
    pub seq: u64,
    pub step: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// An install that was still running when the service stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnfinishedInstall {
    pub record: InstallRecord,
    pub steps: Vec<JournalStep>,
}

impl UnfinishedInstall {
    /// Directories the install created that nothing may have committed.
    pub fn created_paths(&self) -> Vec<PathBuf> {
        self.steps
            .iter()
            .filter(|step| step.step == "copy")
            .filter_map(|step| step.path.clone())
            .collect()
    }

    pub fn committed(&self) -> bool {
        self.steps.iter().any(|step| step.step == "commit")
    }
}

/// Per-install record, append-only step journal and active marker under
/// `state/installs`. Boot uses them to undo half-finished installs.
#[derive(Debug, Clone)]
pub struct InstallJournal {
    layout: DeviceLayout,
}

impl InstallJournal {
    pub fn new(layout: DeviceLayout) -> Self {
        Self { layout }
    }

    /// First token for this process; above anything a previous run handed out.
    pub fn seed_token() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default()
    }

    pub fn begin(&self, token: u64, origin: &str) -> Result<()> {
        let dir = self.layout.installs_dir();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let active = self.layout.install_active_path(token);
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&active)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(anyhow!("install {token} is already active"));
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to claim active install marker: {}", active.display())
                });
            }
        };
        file.write_all(format!("{token}\n").as_bytes())
            .with_context(|| format!("failed to write active install marker: {}", active.display()))?;

        self.write_record(&InstallRecord {
            version: INSTALL_RECORD_VERSION,
            token,
            origin: origin.to_string(),
            package: None,
            status: "staging".to_string(),
            started_at_unix: current_unix_timestamp()?,
        })
    }

    pub fn record_package(&self, token: u64, package: &str) -> Result<()> {
        let mut record = self
            .read_record(token)?
            .ok_or_else(|| anyhow!("install record not found for {token}"))?;
        record.package = Some(package.to_string());
        self.write_record(&record)
    }

    pub fn append_step(&self, token: u64, step: &str, path: Option<PathBuf>) -> Result<()> {
        let journal = self.layout.install_journal_path(token);
        let seq = self.read_steps(token)?.len() as u64 + 1;
        let line = serde_json::to_string(&JournalStep {
            seq,
            step: step.to_string(),
            path,
        })
        .context("failed to serialize install journal step")?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal)
            .with_context(|| format!("failed to open install journal: {}", journal.display()))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.flush())
            .with_context(|| format!("failed to append install journal: {}", journal.display()))?;
        Ok(())
    }

    /// Stores the final status and drops the journal and active marker.
    pub fn finish(&self, token: u64, status: &str) -> Result<()> {
        if let Some(mut record) = self.read_record(token)? {
            record.status = status.to_string();
            self.write_record(&record)?;
        }
        for path in [
            self.layout.install_journal_path(token),
            self.layout.install_active_path(token),
        ] {
            remove_file_if_exists(&path)?;
        }
        Ok(())
    }

    pub fn discard(&self, token: u64) -> Result<()> {
        for path in [
            self.layout.install_record_path(token),
            self.layout.install_journal_path(token),
            self.layout.install_active_path(token),
        ] {
            remove_file_if_exists(&path)?;
        }
        Ok(())
    }

    pub fn unfinished(&self) -> Result<Vec<UnfinishedInstall>> {
        let dir = self.layout.installs_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()));
            }
        };

        let mut tokens = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("failed to iterate {}", dir.display()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("active") {
                continue;
            }
            let Some(token) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            else {
                continue;
            };
            tokens.push(token);
        }
        tokens.sort_unstable();

        let mut unfinished = Vec::with_capacity(tokens.len());
        for token in tokens {
            let record = self.read_record(token)?.unwrap_or_else(|| InstallRecord {
                version: INSTALL_RECORD_VERSION,
                token,
                origin: String::new(),
                package: None,
                status: "unknown".to_string(),
                started_at_unix: 0,
            });
            unfinished.push(UnfinishedInstall {
                record,
                steps: self.read_steps(token)?,
            });
        }
        Ok(unfinished)
    }

    pub fn read_record(&self, token: u64) -> Result<Option<InstallRecord>> {
        let path = self.layout.install_record_path(token);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read install record: {}", path.display()));
            }
        };
        let record = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing install record: {}", path.display()))?;
        Ok(Some(record))
    }

    fn write_record(&self, record: &InstallRecord) -> Result<()> {
        let path = self.layout.install_record_path(record.token);
        let raw = serde_json::to_string_pretty(record).context("failed to serialize install record")?;
        fs::write(&path, raw)
            .with_context(|| format!("failed to write install record: {}", path.display()))
    }

    fn read_steps(&self, token: u64) -> Result<Vec<JournalStep>> {
        let path = self.layout.install_journal_path(token);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read install journal: {}", path.display()));
            }
        };
        raw.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str(line).with_context(|| {
                    format!("failed parsing install journal line in {}", path.display())
                })
            })
            .collect()
    }
}

fn remove_file_if_exists(path: &std::path::Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}
