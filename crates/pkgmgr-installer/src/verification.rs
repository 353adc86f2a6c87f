use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pkgmgr_core::{
    InstallOutcome, PackageManagerError, PmResult, UserId, VerificationDecision,
};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::collaborators::VerifierAgents;
use crate::config::VerificationConfig;

pub type VerificationId = u64;

/// Broadcast to every content verifier of a pending install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub id: VerificationId,
    pub package: String,
    pub version_code: u64,
    pub archive: PathBuf,
    pub installer: Option<String>,
    pub user: UserId,
    pub required: Option<String>,
    pub optional: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentVerification {
    pub package: String,
    pub version_code: u64,
    pub archive: PathBuf,
    pub installer: Option<String>,
    pub user: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Allowed(VerificationDecision),
    Rejected { responder: String },
    /// Nobody authoritative answered in time; the fallback decision applied.
    TimedOut { applied: VerificationDecision },
}

impl VerificationOutcome {
    pub fn allows(&self) -> bool {
        match self {
            Self::Allowed(_) => true,
            Self::Rejected { .. } => false,
            Self::TimedOut { applied } => applied.allows(),
        }
    }

    pub fn into_result(self, package: &str) -> PmResult<()> {
        match self {
            Self::Allowed(_) => Ok(()),
            Self::TimedOut { applied } if applied.allows() => Ok(()),
            Self::Rejected { responder } => Err(PackageManagerError::new(
                InstallOutcome::VerificationFailure,
                format!("install of {package} rejected by verifier {responder}"),
            )),
            Self::TimedOut { .. } => Err(PackageManagerError::new(
                InstallOutcome::VerificationTimeout,
                format!("verification of {package} timed out"),
            )),
        }
    }
}

/// The continuation of a content verification: awaits its final decision.
#[derive(Debug)]
pub struct PendingDecision {
    id: VerificationId,
    receiver: oneshot::Receiver<VerificationOutcome>,
}

impl PendingDecision {
    pub fn id(&self) -> VerificationId {
        self.id
    }

    pub async fn wait(self) -> PmResult<VerificationOutcome> {
        self.receiver.await.map_err(|_| {
            PackageManagerError::internal(format!(
                "verification {} was abandoned without a decision",
                self.id
            ))
        })
    }
}

struct PendingVerification {
    package: String,
    required: Option<String>,
    optional: BTreeSet<String>,
    responded: BTreeSet<String>,
    required_decision: Option<VerificationDecision>,
    extended: bool,
    fallback: VerificationDecision,
    deadline: Instant,
    reply: oneshot::Sender<VerificationOutcome>,
}

impl PendingVerification {
    fn expects(&self, responder: &str) -> bool {
        self.required.as_deref() == Some(responder) || self.optional.contains(responder)
    }

    fn all_responded(&self) -> bool {
        self.required
            .iter()
            .chain(self.optional.iter())
            .all(|responder| self.responded.contains(responder))
    }

    /// The decision reachable before the deadline, if any.
    fn early_outcome(&self) -> Option<VerificationOutcome> {
        match (&self.required, self.required_decision) {
            (Some(required), Some(VerificationDecision::Reject)) => {
                Some(VerificationOutcome::Rejected {
                    responder: required.clone(),
                })
            }
            (Some(_), Some(decision)) if self.all_responded() => {
                Some(VerificationOutcome::Allowed(decision))
            }
            (None, _) if self.all_responded() => {
                Some(VerificationOutcome::Allowed(VerificationDecision::Allow))
            }
            _ => None,
        }
    }

    fn timeout_outcome(&self) -> VerificationOutcome {
        match (&self.required, self.required_decision) {
            (Some(required), Some(VerificationDecision::Reject)) => {
                VerificationOutcome::Rejected {
                    responder: required.clone(),
                }
            }
            (Some(_), Some(decision)) => VerificationOutcome::Allowed(decision),
            // Optional verifiers only observe; silence from them never blocks.
            (None, _) => VerificationOutcome::Allowed(VerificationDecision::Allow),
            (Some(_), None) => VerificationOutcome::TimedOut {
                applied: self.fallback,
            },
        }
    }
}

#[derive(Default)]
struct CoordinatorState {
    next_id: VerificationId,
    pending: BTreeMap<VerificationId, PendingVerification>,
}

/// Tracks content verifications from request to decision.
#[derive(Clone)]
pub struct VerificationCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
    policy: VerificationConfig,
    agents: Arc<dyn VerifierAgents>,
}

impl VerificationCoordinator {
    pub fn new(policy: VerificationConfig, agents: Arc<dyn VerifierAgents>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinatorState::default())),
            policy,
            agents,
        }
    }

    pub fn policy(&self) -> &VerificationConfig {
        &self.policy
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Asks every installed verifier about an install. Must be called from
    /// within a tokio runtime; the deadline is tracked by a spawned task.
    pub fn begin_content_verification(&self, request: ContentVerification) -> PendingDecision {
        let (reply, receiver) = oneshot::channel();
        let verifiers = self.agents.content_verifiers();
        let mut state = self.lock_state();
        state.next_id += 1;
        let id = state.next_id;

        if !self.policy.enabled || verifiers.is_empty() {
            drop(state);
            debug!(id, package = %request.package, "no verifier to consult; allowing");
            let _ = reply.send(VerificationOutcome::Allowed(VerificationDecision::Allow));
            return PendingDecision { id, receiver };
        }

        let deadline = Instant::now() + self.policy.timeout();
        state.pending.insert(
            id,
            PendingVerification {
                package: request.package.clone(),
                required: verifiers.required.clone(),
                optional: verifiers.optional.iter().cloned().collect(),
                responded: BTreeSet::new(),
                required_decision: None,
                extended: false,
                fallback: self.policy.default_decision,
                deadline,
                reply,
            },
        );
        drop(state);

        info!(
            id,
            package = %request.package,
            required = ?verifiers.required,
            optional = verifiers.optional.len(),
            "verification requested"
        );
        self.agents.send_verification_request(&VerificationRequest {
            id,
            package: request.package,
            version_code: request.version_code,
            archive: request.archive,
            installer: request.installer,
            user: request.user,
            required: verifiers.required,
            optional: verifiers.optional,
        });
        self.spawn_deadline_watch(id, deadline);
        PendingDecision { id, receiver }
    }

    fn spawn_deadline_watch(&self, id: VerificationId, deadline: Instant) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut deadline = deadline;
            loop {
                tokio::time::sleep_until(deadline).await;
                let mut state = coordinator.lock_state();
                let Some(pending) = state.pending.get(&id) else {
                    return;
                };
                if pending.deadline > Instant::now() {
                    deadline = pending.deadline;
                    continue;
                }
                let Some(pending) = state.pending.remove(&id) else {
                    return;
                };
                drop(state);
                let outcome = pending.timeout_outcome();
                info!(id, package = %pending.package, ?outcome, "verification deadline reached");
                let _ = pending.reply.send(outcome);
                return;
            }
        });
    }

    /// Records one verifier's vote. Unknown ids and unexpected responders
    /// are dropped; the return value says whether the vote was accepted.
    pub fn record_response(
        &self,
        id: VerificationId,
        responder: &str,
        decision: VerificationDecision,
    ) -> bool {
        let mut state = self.lock_state();
        let Some(pending) = state.pending.get_mut(&id) else {
            warn!(id, responder, "dropping response for unknown verification");
            return false;
        };
        if !pending.expects(responder) {
            warn!(id, responder, package = %pending.package, "dropping response from unexpected verifier");
            return false;
        }
        if !pending.responded.insert(responder.to_string()) {
            warn!(id, responder, "dropping duplicate verification response");
            return false;
        }
        if pending.required.as_deref() == Some(responder) {
            pending.required_decision = Some(decision);
        }
        debug!(id, responder, ?decision, "verification response recorded");

        if let Some(outcome) = pending.early_outcome() {
            if let Some(pending) = state.pending.remove(&id) {
                drop(state);
                info!(id, package = %pending.package, ?outcome, "verification complete");
                let _ = pending.reply.send(outcome);
            }
        }
        true
    }

    /// Pushes the deadline out once and replaces the fallback decision.
    /// Later calls for the same id change nothing.
    pub fn extend_timeout(
        &self,
        id: VerificationId,
        fallback: VerificationDecision,
        delay: Duration,
    ) -> bool {
        let mut state = self.lock_state();
        let Some(pending) = state.pending.get_mut(&id) else {
            warn!(id, "cannot extend unknown verification");
            return false;
        };
        if pending.extended {
            debug!(id, "verification already extended");
            return false;
        }
        let delay = delay.min(self.policy.max_extension());
        pending.extended = true;
        pending.fallback = fallback;
        pending.deadline += delay;
        info!(id, package = %pending.package, delay_ms = delay.as_millis() as u64, ?fallback, "verification extended");
        true
    }

    pub fn is_pending(&self, id: VerificationId) -> bool {
        self.lock_state().pending.contains_key(&id)
    }

    pub fn deadline(&self, id: VerificationId) -> Option<Instant> {
        self.lock_state()
            .pending
            .get(&id)
            .map(|pending| pending.deadline)
    }

    pub fn pending_count(&self) -> usize {
        self.lock_state().pending.len()
    }
}
