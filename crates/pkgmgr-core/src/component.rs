use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Activity,
    Service,
    Receiver,
    Provider,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::Service => "service",
            Self::Receiver => "receiver",
            Self::Provider => "provider",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentDeclaration {
    pub kind: ComponentKind,
    pub name: String,
    #[serde(default)]
    pub exported: bool,
    /// Data-provider authorities; only meaningful for providers.
    #[serde(default)]
    pub authorities: Vec<String>,
    #[serde(default)]
    pub web_hosts: Vec<String>,
    #[serde(default)]
    pub auto_verify: bool,
}

impl ComponentDeclaration {
    pub fn is_provider(&self) -> bool {
        self.kind == ComponentKind::Provider
    }

    pub fn needs_domain_verification(&self) -> bool {
        self.auto_verify && !self.web_hosts.is_empty()
    }
}

pub(crate) fn validate_web_host(host: &str) -> anyhow::Result<()> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        anyhow::bail!("web host must not be empty");
    }

    let bare = trimmed.strip_prefix("*.").unwrap_or(trimmed);
    if bare.is_empty() || bare.starts_with('.') || bare.ends_with('.') {
        anyhow::bail!("web host is not a valid domain: {host}");
    }
    if bare
        .chars()
        .any(|ch| !(ch.is_ascii_alphanumeric() || ch == '-' || ch == '.'))
    {
        anyhow::bail!("web host contains invalid character(s): {host}");
    }

    Ok(())
}
