//! Stateless pledge verification
//!
//! Two layers: [`sanity_check`] validates a pledge's structure against its
//! project without touching the network; [`verify`] checks the pledge's
//! input claims against a UTXO snapshot produced by a query round.
//! [`check_outpoints_disjoint`] is the cross-pledge half of the
//! no-double-pledged-outpoint invariant.

use crate::error::VerificationError;
use crate::model::{OutPoint, Pledge, Project, SighashMode, UtxoEntry};
use std::collections::{HashMap, HashSet};

/// Outpoint → unspent-output facts, agreed by the peer quorum.
pub type UtxoSnapshot = HashMap<OutPoint, UtxoEntry>;

/// Structural validation: transactions linked, sighash discipline, claims
/// aligned, values sane. `max_dependencies` is 5 on servers, 1 for client
/// submissions.
pub fn sanity_check(
    project: &Project,
    pledge: &Pledge,
    max_dependencies: usize,
) -> Result<(), VerificationError> {
    if pledge.project_id != project.id {
        return Err(VerificationError::BadFormat(
            "pledge references a different project".into(),
        ));
    }
    if pledge.main_tx.inputs.is_empty() {
        return Err(VerificationError::BadFormat(
            "main transaction has no inputs".into(),
        ));
    }
    if pledge.dependencies.len() > max_dependencies {
        return Err(VerificationError::TooManyDependencies {
            found: pledge.dependencies.len(),
            max: max_dependencies,
        });
    }

    // Each input consumed at most once across the whole pledge.
    let mut seen = HashSet::new();
    for tx in std::iter::once(&pledge.main_tx).chain(pledge.dependencies.iter()) {
        for outpoint in tx.input_outpoints() {
            if !seen.insert(outpoint) {
                return Err(VerificationError::DuplicatedOutPoint(outpoint));
            }
        }
    }

    // Every dependency must actually be depended on.
    let dep_hashes: HashSet<_> = pledge.dependencies.iter().map(|d| d.hash()).collect();
    for dep_hash in &dep_hashes {
        let spent = std::iter::once(&pledge.main_tx)
            .chain(pledge.dependencies.iter())
            .flat_map(|tx| tx.input_outpoints())
            .any(|o| o.txid == *dep_hash);
        if !spent {
            return Err(VerificationError::BadFormat(
                "dependency transaction is not spent by the pledge".into(),
            ));
        }
    }

    // The append-more-inputs discipline: anything else would pin the claim
    // transaction to exactly this input set.
    for input in &pledge.main_tx.inputs {
        if input.sighash != SighashMode::AllAnyoneCanPay {
            return Err(VerificationError::BadFormat(format!(
                "input {} signed with {:?}, expected AllAnyoneCanPay",
                input.outpoint, input.sighash
            )));
        }
        if input.script_sig.is_empty() {
            return Err(VerificationError::BadFormat(format!(
                "input {} is unsigned",
                input.outpoint
            )));
        }
    }

    if pledge.input_claims.len() != pledge.main_tx.inputs.len() {
        return Err(VerificationError::BadFormat(
            "input claims do not line up with main transaction inputs".into(),
        ));
    }
    for (input, claim) in pledge.main_tx.inputs.iter().zip(&pledge.input_claims) {
        if input.outpoint != claim.outpoint {
            return Err(VerificationError::BadFormat(
                "input claims do not line up with main transaction inputs".into(),
            ));
        }
    }

    let claimed_sum: u64 = pledge.input_claims.iter().map(|c| c.value).sum();
    if claimed_sum == 0 {
        return Err(VerificationError::BadFormat("pledge claims no value".into()));
    }
    if claimed_sum != pledge.total_input_value {
        return Err(VerificationError::BadFormat(format!(
            "claimed total {} does not match input claims sum {}",
            pledge.total_input_value, claimed_sum
        )));
    }
    if claimed_sum > project.goal_value() {
        return Err(VerificationError::BadFormat(format!(
            "pledge of {} exceeds project goal {}",
            claimed_sum,
            project.goal_value()
        )));
    }
    Ok(())
}

/// Check the pledge's input claims against the quorum snapshot. An absent
/// outpoint means the pledge was revoked (or never funded); a present but
/// different one means the pledge lies about what it spends.
pub fn verify(pledge: &Pledge, snapshot: &UtxoSnapshot) -> Result<(), VerificationError> {
    for claim in &pledge.input_claims {
        let entry = snapshot
            .get(&claim.outpoint)
            .ok_or(VerificationError::UnknownUtxo(claim.outpoint))?;
        if entry.value != claim.value || entry.script_pubkey != claim.script_pubkey {
            return Err(VerificationError::ScriptMismatch(claim.outpoint));
        }
    }
    Ok(())
}

/// No two pledges in `pledges`, and none of them against `reserved`
/// (the outpoints of already-accepted pledges), may share an input.
pub fn check_outpoints_disjoint(
    pledges: &[Pledge],
    reserved: &HashSet<OutPoint>,
) -> Result<(), VerificationError> {
    let mut seen: HashSet<OutPoint> = reserved.clone();
    for pledge in pledges {
        for outpoint in pledge.outpoints() {
            if !seen.insert(outpoint) {
                return Err(VerificationError::DuplicatedOutPoint(outpoint));
            }
        }
    }
    Ok(())
}
