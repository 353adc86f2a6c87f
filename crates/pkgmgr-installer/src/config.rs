use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use pkgmgr_core::{VerificationDecision, RUNTIME_PERMISSIONS_TARGET_SDK};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
    /// Upper bound for a single `extend_timeout` call.
    pub max_extension_ms: u64,
    pub default_decision: VerificationDecision,
    pub verify_shell_installs: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 10_000,
            max_extension_ms: 60 * 60 * 1000,
            default_decision: VerificationDecision::Allow,
            verify_shell_installs: true,
        }
    }
}

impl VerificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_extension(&self) -> Duration {
        Duration::from_millis(self.max_extension_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Instruction-set architectures in preference order.
    pub supported_abis: Vec<String>,
    pub platform_sdk: u32,
    pub debuggable_build: bool,
    pub verification: VerificationConfig,
    pub required_verifier: Option<String>,
    pub required_installer: Option<String>,
    /// Packages holding a protected role; they cannot be removed for all users.
    pub protected_packages: BTreeSet<String>,
    /// Signing keys of the platform itself.
    pub platform_certificates: BTreeSet<String>,
    /// Package name -> signature permissions granted regardless of signer.
    pub signature_permission_allowlist: BTreeMap<String, BTreeSet<String>>,
    pub helper_max_retries: u32,
    pub helper_retry_backoff_ms: u64,
    pub write_debounce_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            supported_abis: vec!["arm64-v8a".to_string(), "armeabi-v7a".to_string()],
            platform_sdk: 30,
            debuggable_build: false,
            verification: VerificationConfig::default(),
            required_verifier: None,
            required_installer: None,
            protected_packages: BTreeSet::new(),
            platform_certificates: BTreeSet::new(),
            signature_permission_allowlist: BTreeMap::new(),
            helper_max_retries: 4,
            helper_retry_backoff_ms: 50,
            write_debounce_ms: 500,
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("failed to load config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content).context("failed to parse config TOML")?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.supported_abis.is_empty() {
            anyhow::bail!("supported_abis must name at least one ABI");
        }
        if self.platform_sdk < RUNTIME_PERMISSIONS_TARGET_SDK {
            anyhow::bail!(
                "platform_sdk {} predates runtime permissions ({})",
                self.platform_sdk,
                RUNTIME_PERMISSIONS_TARGET_SDK
            );
        }
        if self.verification.enabled && self.verification.timeout_ms == 0 {
            anyhow::bail!("verification.timeout_ms must be greater than zero");
        }
        Ok(())
    }

    fn normalize(&mut self) {
        self.platform_certificates = self
            .platform_certificates
            .iter()
            .map(|key| key.trim().to_ascii_lowercase())
            .filter(|key| !key.is_empty())
            .collect();
    }

    pub fn helper_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.helper_retry_backoff_ms)
    }

    pub fn write_debounce(&self) -> Duration {
        Duration::from_millis(self.write_debounce_ms)
    }

    pub fn signature_allowlisted(&self, package: &str, permission: &str) -> bool {
        self.signature_permission_allowlist
            .get(package)
            .is_some_and(|permissions| permissions.contains(permission))
    }
}
