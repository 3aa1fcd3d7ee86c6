//! Error taxonomy for the beacon backend
//!
//! Verification failures are typed so callers can tell a malformed pledge
//! from a revoked one; everything else the orchestrator can hit during a
//! project check folds into [`BackendError`].

use crate::model::OutPoint;
use std::sync::Arc;
use thiserror::Error;

/// Why a pledge failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// More dependency transactions than the mode allows.
    #[error("pledge carries {found} dependency transactions, limit is {max}")]
    TooManyDependencies { found: usize, max: usize },

    /// A referenced outpoint is absent from (or disputed in) the UTXO set.
    /// Treated as revocation, not as a check failure.
    #[error("outpoint {0} is not in the UTXO set")]
    UnknownUtxo(OutPoint),

    /// Two accepted pledges spend the same outpoint.
    #[error("outpoint {0} is spent by more than one pledge")]
    DuplicatedOutPoint(OutPoint),

    /// Structurally invalid pledge.
    #[error("malformed pledge: {0}")]
    BadFormat(String),

    /// The UTXO behind an input does not match the pledge's claim.
    #[error("UTXO at {0} does not match the pledged script or value")]
    ScriptMismatch(OutPoint),
}

/// Failures surfaced by the orchestrator: per-project check errors,
/// submission errors, and transport-level trouble.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error("only {available} of {required} connected peers answer UTXO queries")]
    NoCapablePeers { available: usize, required: usize },

    /// No peer produced a usable answer inside the round deadline.
    #[error("UTXO query round produced no replies")]
    NoUtxoReplies,

    #[error("project server request failed: {0}")]
    Transport(String),

    #[error("failed to broadcast dependency transaction: {0}")]
    Broadcast(String),

    #[error("unknown project")]
    UnknownProject,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether this failure means "the pledge is gone" rather than "the
    /// check broke". Revocation-equivalents are a normal pledge exit.
    pub fn is_revocation(&self) -> bool {
        matches!(
            self,
            BackendError::Verification(VerificationError::UnknownUtxo(_))
        )
    }
}

/// Per-project check status: present while a check is in flight or after
/// the last check failed, absent otherwise.
#[derive(Debug, Clone)]
pub enum CheckStatus {
    InProgress,
    Failed(Arc<BackendError>),
}

impl CheckStatus {
    pub fn failed(err: BackendError) -> CheckStatus {
        CheckStatus::Failed(Arc::new(err))
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, CheckStatus::InProgress)
    }

    pub fn error(&self) -> Option<&BackendError> {
        match self {
            CheckStatus::InProgress => None,
            CheckStatus::Failed(e) => Some(e),
        }
    }
}
