//! Claim transaction watcher
//!
//! Watches transactions the wallet reports and recognises the ones that
//! pay a known project's target outputs. Drives the project state machine:
//! Open → Claimed when a claim propagates or confirms, → Error when it
//! dies. Confidence can move both ways (reorg, double-spend), so the
//! handling is symmetric.

use crate::configuration::Mode;
use crate::disk::{DiskManager, StateRegistry};
use crate::model::{
    Project, ProjectState, ProjectStateInfo, Sha256Hash, Transaction, TxConfidence,
};
use crate::scheduler::Scheduler;
use crate::store::PledgeStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// What the orchestrator should do after a claim observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimAction {
    None,
    /// The project has a server; it owns the truth about what got claimed.
    RefreshFromServer(Project),
}

pub struct ClaimWatcher {
    scheduler: Scheduler,
    store: Arc<PledgeStore>,
    disk: Arc<dyn DiskManager>,
    states: Arc<StateRegistry>,
    mode: Mode,
    min_broadcast_peers: usize,
    /// Claim transactions we have seen, by hash. The sync algorithm uses
    /// these to move invalidated pledges into the claimed set.
    claim_txs: Mutex<HashMap<Sha256Hash, Transaction>>,
}

impl ClaimWatcher {
    pub fn new(
        scheduler: Scheduler,
        store: Arc<PledgeStore>,
        disk: Arc<dyn DiskManager>,
        states: Arc<StateRegistry>,
        mode: Mode,
        min_broadcast_peers: usize,
    ) -> Self {
        ClaimWatcher {
            scheduler,
            store,
            disk,
            states,
            mode,
            min_broadcast_peers,
            claim_txs: Mutex::new(HashMap::new()),
        }
    }

    /// A claim transaction by hash, if we have seen one.
    pub fn claim_tx(&self, txid: &Sha256Hash) -> Option<Transaction> {
        self.claim_txs.lock().unwrap().get(txid).cloned()
    }

    /// Process a wallet transaction at its current confidence. Engine
    /// thread only.
    pub fn process_transaction(&self, tx: &Transaction, confidence: TxConfidence) -> ClaimAction {
        self.scheduler.assert_on_thread();
        let Some(project) = self.disk.project_for_claim(tx) else {
            return ClaimAction::None;
        };
        let txid = tx.hash();
        debug!(project = %project.title, %txid, ?confidence, "claim transaction observed");

        match confidence {
            TxConfidence::Unknown => ClaimAction::None,
            TxConfidence::Pending { broadcast_peers }
                if broadcast_peers < self.min_broadcast_peers =>
            {
                // Not propagated far enough to act on yet.
                ClaimAction::None
            }
            TxConfidence::Pending { .. } | TxConfidence::Building { .. } => {
                self.claim_txs.lock().unwrap().insert(txid, tx.clone());
                if self.mode == Mode::Client && project.payment_url.is_some() {
                    return ClaimAction::RefreshFromServer(project);
                }
                let moved = self.store.move_open_to_claimed(project.id, tx);
                if !moved.is_empty() {
                    info!(
                        project = %project.title,
                        pledges = moved.len(),
                        "claim absorbed open pledges"
                    );
                }
                self.states.set(
                    project.id,
                    ProjectStateInfo {
                        state: ProjectState::Claimed,
                        claimed_by: Some(txid),
                    },
                );
                ClaimAction::None
            }
            TxConfidence::Dead => {
                warn!(project = %project.title, %txid, "claim transaction died");
                self.claim_txs.lock().unwrap().remove(&txid);
                let dropped = self.store.clear_claimed(project.id);
                if !dropped.is_empty() {
                    debug!(pledges = dropped.len(), "cleared claimed set after dead claim");
                }
                self.states.set(
                    project.id,
                    ProjectStateInfo {
                        state: ProjectState::Error,
                        claimed_by: None,
                    },
                );
                ClaimAction::None
            }
        }
    }
}
