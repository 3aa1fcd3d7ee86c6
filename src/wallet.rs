//! Wallet seam
//!
//! The pledging wallet (key management, chain sync, pledge construction)
//! is an external collaborator; the backend consumes its events and asks
//! it a handful of questions through [`PledgingWallet`].

use crate::model::{Pledge, Sha256Hash, Transaction, TxConfidence};
use std::collections::HashSet;
use tokio::sync::mpsc;

/// Events the wallet pushes at the backend. Per-subscriber FIFO.
#[derive(Debug, Clone)]
pub enum WalletEvent {
    /// The user created a pledge in this wallet.
    PledgeCreated(Pledge),
    /// The user revoked a pledge by double-spending its outpoints.
    PledgeRevoked(Pledge),
    /// An incoming transaction touched a registered script.
    CoinsReceived {
        tx: Transaction,
        confidence: TxConfidence,
    },
    /// A known transaction's confidence moved (either direction).
    ConfidenceChanged {
        tx: Transaction,
        confidence: TxConfidence,
    },
}

pub trait PledgingWallet: Send + Sync {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<WalletEvent>;

    /// Pledges this wallet authored and still holds.
    fn pledges(&self) -> Vec<Pledge>;

    /// Whether the wallet knows `pledge`'s outpoints were re-spent.
    fn is_revoked(&self, pledge: &Pledge) -> bool;

    /// Hashes of pledges this wallet authored, for correlating scrubbed
    /// server copies via `orig_hash`.
    fn authored_pledge_hashes(&self) -> HashSet<Sha256Hash>;

    /// Whether the wallet holds a pledge equivalent to `pledge`: the same
    /// pledge, or the original of a scrubbed copy.
    fn holds_equivalent(&self, pledge: &Pledge) -> bool {
        let authored = self.authored_pledge_hashes();
        authored.contains(&pledge.hash())
            || pledge.orig_hash.is_some_and(|h| authored.contains(&h))
    }

    /// Register a project's target output scripts so incoming claim
    /// transactions are noticed.
    fn register_output_scripts(&self, scripts: Vec<Vec<u8>>);
}

/// The wallet of a server deployment: no keys, no pledges. Claim spotting
/// still works because output scripts are registered with the chain
/// monitor the server operator runs separately.
#[derive(Default)]
pub struct EmptyWallet {
    // Held so subscribers stay pending instead of seeing a closed channel.
    subscribers: std::sync::Mutex<Vec<mpsc::UnboundedSender<WalletEvent>>>,
}

impl PledgingWallet for EmptyWallet {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<WalletEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    fn pledges(&self) -> Vec<Pledge> {
        Vec::new()
    }

    fn is_revoked(&self, _pledge: &Pledge) -> bool {
        false
    }

    fn authored_pledge_hashes(&self) -> HashSet<Sha256Hash> {
        HashSet::new()
    }

    fn register_output_scripts(&self, _scripts: Vec<Vec<u8>>) {}
}
