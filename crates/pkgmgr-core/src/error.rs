use thiserror::Error;

use crate::outcome::InstallOutcome;

/// Where a failure sits in the error taxonomy; drives retry and rollback
/// decisions, not user-visible codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Parse,
    Policy,
    Resource,
    Verification,
    Invariant,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{outcome}: {message}")]
pub struct PackageManagerError {
    pub outcome: InstallOutcome,
    pub message: String,
}

pub type PmResult<T> = Result<T, PackageManagerError>;

impl PackageManagerError {
    pub fn new(outcome: InstallOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(InstallOutcome::InternalError, message)
    }

    /// Wraps a plumbing error, keeping its full context chain as the message.
    pub fn from_anyhow(outcome: InstallOutcome, err: &anyhow::Error) -> Self {
        Self::new(outcome, format!("{err:#}"))
    }

    pub fn category(&self) -> ErrorCategory {
        match self.outcome {
            InstallOutcome::ParseFailedNotApk
            | InstallOutcome::ParseFailedBadManifest
            | InstallOutcome::ParseFailedUnexpectedException
            | InstallOutcome::ParseFailedNoCertificates
            | InstallOutcome::ParseFailedInconsistentCertificates
            | InstallOutcome::ParseFailedCertificateEncoding
            | InstallOutcome::ParseFailedBadPackageName
            | InstallOutcome::ParseFailedBadSharedUserId
            | InstallOutcome::ParseFailedManifestMalformed
            | InstallOutcome::InvalidApk => ErrorCategory::Parse,
            InstallOutcome::InsufficientStorage
            | InstallOutcome::ContainerError
            | InstallOutcome::MediaUnavailable
            | InstallOutcome::Dexopt => ErrorCategory::Resource,
            InstallOutcome::VerificationFailure | InstallOutcome::VerificationTimeout => {
                ErrorCategory::Verification
            }
            InstallOutcome::InternalError => ErrorCategory::Invariant,
            _ => ErrorCategory::Policy,
        }
    }
}
