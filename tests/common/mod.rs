//! Shared test harness: stub wallet, oracle peers, builders and polling
//! helpers for driving the backend end to end.

#![allow(dead_code)]

use async_trait::async_trait;
use beacon::backend::Backend;
use beacon::configuration::{Config, Mode};
use beacon::error::CheckStatus;
use beacon::model::{
    InputClaim, Network, OutPoint, Pledge, PledgeDetails, Project, ProjectId, ProjectStateInfo,
    Sha256Hash, SighashMode, Transaction, TxInput, TxOutput, UtxoEntry,
};
use beacon::networking::{PeerError, UtxoPeer};
use beacon::wallet::{PledgingWallet, WalletEvent};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub const SATOSHI_COIN: u64 = 100_000_000;

/// A config with all delays zeroed so checks run immediately.
pub fn test_config(mode: Mode, min_peers: usize) -> Config {
    let mut config = Config::default();
    config.mode = mode;
    config.network = Network::Regtest;
    config.peers.min_peers_for_utxo_query = min_peers;
    config.peers.min_broadcast_peers = 2;
    config.timing.tx_propagation_secs = 0;
    config.timing.max_jitter_secs = 0;
    config
}

pub fn test_project(goal: u64, payment_url: Option<String>) -> Project {
    Project::new(
        "test project".into(),
        "integration".into(),
        vec![TxOutput {
            value: goal,
            script_pubkey: vec![0xA9, 0x14, 0x42],
        }],
        payment_url,
        Network::Regtest,
    )
}

pub fn outpoint(tag: u8) -> OutPoint {
    OutPoint {
        txid: Sha256Hash([tag; 32]),
        vout: 0,
    }
}

/// The locking script the oracle reports for an outpoint; pledges claim
/// the same one so verification lines up.
pub fn script_for(o: &OutPoint) -> Vec<u8> {
    vec![0x76, 0xA9, o.txid.0[0]]
}

pub fn entry_for(o: &OutPoint, value: u64) -> UtxoEntry {
    UtxoEntry {
        value,
        script_pubkey: script_for(o),
    }
}

/// A pledge spending `outpoints` with the given claimed values.
pub fn pledge_spending(project: &Project, outpoints: &[(OutPoint, u64)]) -> Pledge {
    Pledge {
        project_id: project.id,
        main_tx: Transaction {
            inputs: outpoints
                .iter()
                .map(|(o, _)| TxInput {
                    outpoint: *o,
                    script_sig: vec![0x47, 0x30],
                    sighash: SighashMode::AllAnyoneCanPay,
                })
                .collect(),
            outputs: project.outputs.clone(),
            lock_time: 0,
        },
        dependencies: vec![],
        input_claims: outpoints
            .iter()
            .map(|(o, value)| InputClaim {
                outpoint: *o,
                value: *value,
                script_pubkey: script_for(o),
            })
            .collect(),
        total_input_value: outpoints.iter().map(|(_, v)| v).sum(),
        orig_hash: None,
        details: PledgeDetails {
            memo: "count me in".into(),
            contact: "pledger@example.com".into(),
            timestamp: 1_700_000_000,
        },
    }
}

/// A claim transaction spending the given pledges' inputs and paying the
/// project's targets.
pub fn claim_of(project: &Project, pledges: &[&Pledge]) -> Transaction {
    Transaction {
        inputs: pledges
            .iter()
            .flat_map(|p| p.main_tx.inputs.iter().cloned())
            .collect(),
        outputs: project.outputs.clone(),
        lock_time: 0,
    }
}

/// A peer answering UTXO queries from a canned table.
pub struct OraclePeer {
    label: String,
    utxos: Mutex<HashMap<OutPoint, UtxoEntry>>,
}

impl OraclePeer {
    pub fn new(label: &str, utxos: &[(OutPoint, UtxoEntry)]) -> Self {
        OraclePeer {
            label: label.into(),
            utxos: Mutex::new(utxos.iter().cloned().collect()),
        }
    }

    pub fn spend(&self, o: &OutPoint) {
        self.utxos.lock().unwrap().remove(o);
    }

    pub fn insert(&self, o: OutPoint, entry: UtxoEntry) {
        self.utxos.lock().unwrap().insert(o, entry);
    }
}

#[async_trait]
impl UtxoPeer for OraclePeer {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn get_utxos(&self, outpoints: &[OutPoint]) -> Result<Vec<Option<UtxoEntry>>, PeerError> {
        let utxos = self.utxos.lock().unwrap();
        Ok(outpoints.iter().map(|o| utxos.get(o).cloned()).collect())
    }
}

#[derive(Default)]
struct StubWalletInner {
    pledges: Vec<Pledge>,
    revoked: HashSet<Sha256Hash>,
    subscribers: Vec<mpsc::UnboundedSender<WalletEvent>>,
    registered_scripts: Vec<Vec<u8>>,
}

/// A controllable wallet double.
#[derive(Default)]
pub struct StubWallet {
    inner: Mutex<StubWalletInner>,
}

impl StubWallet {
    pub fn with_pledges(pledges: Vec<Pledge>) -> Self {
        let wallet = StubWallet::default();
        wallet.inner.lock().unwrap().pledges = pledges;
        wallet
    }

    pub fn mark_revoked(&self, pledge: &Pledge) {
        self.inner.lock().unwrap().revoked.insert(pledge.hash());
    }

    pub fn send(&self, event: WalletEvent) {
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .retain(|s| s.send(event.clone()).is_ok());
    }

    pub fn registered_scripts(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().registered_scripts.clone()
    }
}

impl PledgingWallet for StubWallet {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<WalletEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }

    fn pledges(&self) -> Vec<Pledge> {
        self.inner.lock().unwrap().pledges.clone()
    }

    fn is_revoked(&self, pledge: &Pledge) -> bool {
        self.inner.lock().unwrap().revoked.contains(&pledge.hash())
    }

    fn authored_pledge_hashes(&self) -> HashSet<Sha256Hash> {
        self.inner
            .lock()
            .unwrap()
            .pledges
            .iter()
            .map(|p| p.hash())
            .collect()
    }

    fn register_output_scripts(&self, scripts: Vec<Vec<u8>>) {
        self.inner.lock().unwrap().registered_scripts.extend(scripts);
    }
}

// Fresh-snapshot readers. Each takes a new mirror, which registers and
// immediately drops a subscriber; the store prunes those on its next
// publish.

pub fn open_pledges(backend: &Backend, project: &ProjectId) -> HashSet<Pledge> {
    backend.mirror_open_pledges(project).snapshot
}

pub fn claimed_pledges(backend: &Backend, project: &ProjectId) -> HashSet<Pledge> {
    backend.mirror_claimed_pledges(project).snapshot
}

pub fn check_statuses(backend: &Backend) -> HashMap<ProjectId, CheckStatus> {
    backend.mirror_check_statuses().snapshot
}

pub fn project_states(backend: &Backend) -> HashMap<ProjectId, ProjectStateInfo> {
    backend.mirror_project_states().snapshot
}

/// Poll `poll` every few milliseconds until it yields, or panic after
/// `timeout`.
pub fn wait_until<T>(timeout: Duration, what: &str, mut poll: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = poll() {
            return value;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
