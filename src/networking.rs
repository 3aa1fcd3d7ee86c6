//! Peer-network seam and the UTXO query coordinator
//!
//! The backend talks to the Bitcoin network through the [`PeerGroup`] and
//! [`UtxoPeer`] traits; wire transport lives with the peer implementation.
//! [`UtxoQueryCoordinator`] owns the replicated-oracle discipline: one
//! batched query per round, fanned to a quorum of capable peers, answers
//! cross-checked per outpoint.

use crate::configuration::UTXO_ROUND_DEADLINE;
use crate::error::BackendError;
use crate::model::{OutPoint, Transaction, UtxoEntry};
use crate::verifier::UtxoSnapshot;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Chain-level notifications relevant to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEvent {
    /// The wallet's chain tip moved to `height`.
    TipAdvanced { height: u64 },
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("only {available} of {required} peers answer UTXO queries")]
    NotEnoughCapable { available: usize, required: usize },
    #[error("peer protocol error: {0}")]
    Protocol(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

impl From<PeerError> for BackendError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::NotEnoughCapable { available, required } => {
                BackendError::NoCapablePeers { available, required }
            }
            PeerError::Protocol(msg) => BackendError::Transport(msg),
            PeerError::Rejected(msg) => BackendError::Broadcast(msg),
        }
    }
}

/// A connected peer that advertises the UTXO-query service bit.
#[async_trait]
pub trait UtxoPeer: Send + Sync {
    /// Human-readable peer address for logs.
    fn label(&self) -> String;

    /// Look up the current unspent-output set at `outpoints`. The reply
    /// must be parallel to the request: `None` marks a spent or unknown
    /// outpoint.
    async fn get_utxos(&self, outpoints: &[OutPoint]) -> Result<Vec<Option<UtxoEntry>>, PeerError>;
}

/// The wallet's peer group, reduced to what the backend needs.
#[async_trait]
pub trait PeerGroup: Send + Sync {
    /// Wait until at least `min` UTXO-capable peers are connected and
    /// return them. Implementations that know no more peers will appear
    /// fail fast with [`PeerError::NotEnoughCapable`].
    async fn wait_for_utxo_peers(&self, min: usize) -> Result<Vec<Arc<dyn UtxoPeer>>, PeerError>;

    /// The chain height most of the connected peers agree on.
    fn most_common_height(&self) -> u64;

    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<(), PeerError>;

    /// Chain-tip notifications, FIFO per subscriber.
    fn subscribe_chain(&self) -> mpsc::UnboundedReceiver<ChainEvent>;
}

/// One completed query round: the facts all responders agreed on, plus the
/// outpoints they disagreed about (untrusted for this round).
#[derive(Debug, Default)]
pub struct UtxoRound {
    pub snapshot: UtxoSnapshot,
    pub disputed: HashSet<OutPoint>,
}

/// Serialises outbound UTXO queries. The engine thread blocks on
/// [`UtxoQueryCoordinator::query`], which is what guarantees at most one
/// round in flight backend-wide.
pub struct UtxoQueryCoordinator {
    peers: Arc<dyn PeerGroup>,
    min_peers: usize,
    deadline: Duration,
}

impl UtxoQueryCoordinator {
    pub fn new(peers: Arc<dyn PeerGroup>, min_peers: usize) -> Self {
        Self {
            peers,
            min_peers,
            deadline: UTXO_ROUND_DEADLINE,
        }
    }

    /// Run one batched, replicated query round over `outpoints`.
    ///
    /// Peers that miss the deadline or return garbage are dropped for the
    /// round; whatever subset answered carries the quorum. Disagreement on
    /// an outpoint removes it from the snapshot.
    pub async fn query(&self, outpoints: Vec<OutPoint>) -> Result<UtxoRound, BackendError> {
        if outpoints.is_empty() {
            return Ok(UtxoRound::default());
        }
        let peers = self.peers.wait_for_utxo_peers(self.min_peers).await?;
        debug!(
            peers = peers.len(),
            outpoints = outpoints.len(),
            "dispatching UTXO query round"
        );

        let answers = futures::future::join_all(peers.iter().map(|peer| {
            let outpoints = &outpoints;
            async move {
                match tokio::time::timeout(self.deadline, peer.get_utxos(outpoints)).await {
                    Ok(Ok(reply)) if reply.len() == outpoints.len() => Some(reply),
                    Ok(Ok(reply)) => {
                        warn!(
                            peer = peer.label(),
                            got = reply.len(),
                            want = outpoints.len(),
                            "UTXO reply has wrong arity, dropping peer for this round"
                        );
                        None
                    }
                    Ok(Err(err)) => {
                        warn!(peer = peer.label(), %err, "UTXO query failed");
                        None
                    }
                    Err(_) => {
                        warn!(peer = peer.label(), "UTXO query missed the deadline");
                        None
                    }
                }
            }
        }))
        .await;

        let answers: Vec<Vec<Option<UtxoEntry>>> = answers.into_iter().flatten().collect();
        if answers.is_empty() {
            return Err(BackendError::NoUtxoReplies);
        }

        let mut round = UtxoRound::default();
        for (i, outpoint) in outpoints.iter().enumerate() {
            let first = &answers[0][i];
            if answers.iter().any(|a| &a[i] != first) {
                warn!(%outpoint, "peers disagree, marking outpoint untrusted for this round");
                round.disputed.insert(*outpoint);
                continue;
            }
            if let Some(entry) = first {
                round.snapshot.insert(*outpoint, entry.clone());
            }
        }
        Ok(round)
    }
}

/// A fixed, explicitly managed peer set. Used by deployments that point the
/// backend at known trusted nodes, and by tests. Knows its full roster, so
/// a quorum it cannot meet fails fast instead of waiting forever.
pub struct StaticPeerSet {
    peers: Mutex<Vec<Arc<dyn UtxoPeer>>>,
    peer_arrived: Notify,
    height: AtomicU64,
    chain_subscribers: Mutex<Vec<mpsc::UnboundedSender<ChainEvent>>>,
    /// When false, `wait_for_utxo_peers` blocks for stragglers instead of
    /// failing fast.
    roster_complete: std::sync::atomic::AtomicBool,
}

impl StaticPeerSet {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
            peer_arrived: Notify::new(),
            height: AtomicU64::new(0),
            chain_subscribers: Mutex::new(Vec::new()),
            roster_complete: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Mark the roster as still filling up; quorum waits block until
    /// [`StaticPeerSet::roster_done`].
    pub fn expect_more_peers(&self) {
        self.roster_complete.store(false, Ordering::SeqCst);
    }

    pub fn roster_done(&self) {
        self.roster_complete.store(true, Ordering::SeqCst);
        self.peer_arrived.notify_waiters();
    }

    pub fn add_peer(&self, peer: Arc<dyn UtxoPeer>) {
        self.peers.lock().unwrap().push(peer);
        self.peer_arrived.notify_waiters();
    }

    /// Advance the agreed chain height and tell subscribers.
    pub fn announce_tip(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
        self.chain_subscribers
            .lock()
            .unwrap()
            .retain(|s| s.send(ChainEvent::TipAdvanced { height }).is_ok());
    }
}

impl Default for StaticPeerSet {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerGroup for StaticPeerSet {
    async fn wait_for_utxo_peers(&self, min: usize) -> Result<Vec<Arc<dyn UtxoPeer>>, PeerError> {
        loop {
            let notified = self.peer_arrived.notified();
            {
                let peers = self.peers.lock().unwrap();
                if peers.len() >= min {
                    return Ok(peers.iter().take(min.max(1)).cloned().collect());
                }
                if self.roster_complete.load(Ordering::SeqCst) {
                    return Err(PeerError::NotEnoughCapable {
                        available: peers.len(),
                        required: min,
                    });
                }
            }
            notified.await;
        }
    }

    fn most_common_height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    async fn broadcast_transaction(&self, _tx: &Transaction) -> Result<(), PeerError> {
        let peers = self.peers.lock().unwrap();
        if peers.is_empty() {
            return Err(PeerError::Rejected("no connected peers".into()));
        }
        // Static peers are UTXO oracles; relaying is accepted as a no-op
        // and left to the wallet's own peer connections.
        Ok(())
    }

    fn subscribe_chain(&self) -> mpsc::UnboundedReceiver<ChainEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.chain_subscribers.lock().unwrap().push(tx);
        rx
    }
}
