use pkgmgr_core::{CertificateSet, KeySetDeclaration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMatch {
    BothUnsigned,
    FirstUnsigned,
    SecondUnsigned,
    Match,
    NoMatch,
}

impl SignatureMatch {
    pub fn is_match(self) -> bool {
        self == Self::Match
    }
}

/// Two signer sets match only when they are identical.
pub fn compare_signatures(first: &CertificateSet, second: &CertificateSet) -> SignatureMatch {
    match (first.is_empty(), second.is_empty()) {
        (true, true) => SignatureMatch::BothUnsigned,
        (true, false) => SignatureMatch::FirstUnsigned,
        (false, true) => SignatureMatch::SecondUnsigned,
        (false, false) if first == second => SignatureMatch::Match,
        (false, false) => SignatureMatch::NoMatch,
    }
}

/// True when the incoming signers hold every key of at least one key set the
/// installed version named as an upgrade key set.
pub fn satisfies_upgrade_key_sets(
    declared_key_sets: &[KeySetDeclaration],
    upgrade_key_sets: &[String],
    incoming: &CertificateSet,
) -> bool {
    upgrade_key_sets.iter().any(|name| {
        declared_key_sets
            .iter()
            .find(|key_set| &key_set.name == name)
            .is_some_and(|key_set| {
                !key_set.public_keys.is_empty()
                    && incoming.contains_all(key_set.public_keys.iter().map(String::as_str))
            })
    })
}

/// Whether an update signed by `incoming` may replace a package signed by
/// `installed`. Upgrade key sets, when declared, replace the exact-match rule.
pub fn update_signatures_acceptable(
    installed: &CertificateSet,
    declared_key_sets: &[KeySetDeclaration],
    upgrade_key_sets: &[String],
    incoming: &CertificateSet,
) -> bool {
    if !upgrade_key_sets.is_empty() {
        return satisfies_upgrade_key_sets(declared_key_sets, upgrade_key_sets, incoming);
    }
    compare_signatures(installed, incoming).is_match()
}
