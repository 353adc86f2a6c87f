use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use pkgmgr_core::{DomainVerificationStatus, UserId};
use pkgmgr_registry::RegistryLock;
use tracing::{info, warn};

use crate::collaborators::VerifierAgents;
use crate::persist::PersistScheduler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainVerificationRequest {
    pub id: u64,
    pub package: String,
    pub hosts: Vec<String>,
    pub users: Vec<UserId>,
    pub verifier: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainVerificationResult {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
struct PendingDomainCheck {
    package: String,
    verifier: String,
    users: Vec<UserId>,
}

/// Asks the designated domain verifier to confirm the web hosts a package
/// claims. Answers adjust per-user link handling and never gate an install.
#[derive(Clone)]
pub struct IntentDomainVerifier {
    agents: Arc<dyn VerifierAgents>,
    registry: RegistryLock,
    persist: PersistScheduler,
    next_id: Arc<AtomicU64>,
    pending: Arc<Mutex<BTreeMap<u64, PendingDomainCheck>>>,
}

impl IntentDomainVerifier {
    pub fn new(
        agents: Arc<dyn VerifierAgents>,
        registry: RegistryLock,
        persist: PersistScheduler,
    ) -> Self {
        Self {
            agents,
            registry,
            persist,
            next_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Returns the correlation id when a request went out.
    pub fn start(&self, package: &str, hosts: &BTreeSet<String>, users: &[UserId]) -> Option<u64> {
        if hosts.is_empty() || users.is_empty() {
            return None;
        }
        let Some(verifier) = self.agents.domain_verifier() else {
            info!(package, "no domain verifier installed; leaving link handling undefined");
            return None;
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                PendingDomainCheck {
                    package: package.to_string(),
                    verifier: verifier.clone(),
                    users: users.to_vec(),
                },
            );
        self.agents
            .send_domain_verification_request(&DomainVerificationRequest {
                id,
                package: package.to_string(),
                hosts: hosts.iter().cloned().collect(),
                users: users.to_vec(),
                verifier,
            });
        Some(id)
    }

    pub fn record_response(&self, id: u64, responder: &str, result: DomainVerificationResult) -> bool {
        let check = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let expected = pending.get(&id).map(|check| check.verifier.clone());
            match expected {
                None => {
                    warn!(id, responder, "dropping domain verification response for unknown id");
                    return false;
                }
                Some(expected) if expected != responder => {
                    warn!(id, responder, %expected, "dropping domain verification response from unexpected verifier");
                    return false;
                }
                Some(_) => pending.remove(&id),
            }
        };
        let Some(check) = check else {
            return false;
        };

        let status = match result {
            DomainVerificationResult::Success => DomainVerificationStatus::Always,
            DomainVerificationResult::Failure => DomainVerificationStatus::Never,
        };
        let changed = self.registry.with(|settings| {
            let mut changed = false;
            for user in &check.users {
                // Statuses other than undefined were chosen by the user.
                if settings.domain_verification_status(&check.package, *user)
                    == Some(DomainVerificationStatus::Undefined)
                {
                    changed |= settings.set_domain_verification_status(&check.package, *user, status);
                }
            }
            changed
        });
        info!(id, package = %check.package, ?result, changed, "domain verification answered");
        if changed {
            self.persist.schedule();
        }
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
