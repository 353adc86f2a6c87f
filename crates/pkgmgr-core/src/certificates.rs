use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// The signing identities of a package: lowercase hex public keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CertificateSet(BTreeSet<String>);

impl CertificateSet {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            keys.into_iter()
                .map(|key| key.as_ref().trim().to_ascii_lowercase())
                .filter(|key| !key.is_empty())
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(&key.trim().to_ascii_lowercase())
    }

    pub fn contains_all<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> bool {
        keys.into_iter().all(|key| self.contains(key))
    }
}

/// A named set of public keys declared by a package, referenced by
/// `upgrade_key_sets` to allow a future version to be signed differently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeySetDeclaration {
    pub name: String,
    pub public_keys: Vec<String>,
}
