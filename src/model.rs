//! Domain model for the beacon backend
//!
//! Projects, pledges, transactions and the state attached to them.
//! All types serialize with serde; canonical binary encoding (used for
//! hashing and on-disk persistence) goes through bincode.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// A 32-byte SHA-256 digest, used for transaction hashes, pledge hashes and
/// project ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sha256Hash(pub [u8; 32]);

impl Sha256Hash {
    /// Hash arbitrary bytes.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Sha256Hash(digest.into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Sha256Hash(arr))
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        write!(f, "{}", &self.to_hex()[..12])
    }
}

/// Identifies a project: the hash of its project file bytes.
pub type ProjectId = Sha256Hash;

/// Canonical binary encoding used for hashing and file persistence.
pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .expect("bincode encoding of in-memory value cannot fail")
}

/// Decode a value previously produced by [`encode`].
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, bincode::error::DecodeError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard()).map(|(v, _)| v)
}

/// A reference to a transaction output: `(txid, vout)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Sha256Hash,
    pub vout: u32,
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// Signature hashing mode recorded on a signed input. Pledge inputs must use
/// `AllAnyoneCanPay` so that further inputs and outputs can be appended when
/// the claim transaction is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SighashMode {
    All,
    None,
    Single,
    AllAnyoneCanPay,
    NoneAnyoneCanPay,
    SingleAnyoneCanPay,
}

impl SighashMode {
    pub fn anyone_can_pay(&self) -> bool {
        matches!(
            self,
            SighashMode::AllAnyoneCanPay
                | SighashMode::NoneAnyoneCanPay
                | SighashMode::SingleAnyoneCanPay
        )
    }
}

/// A signed transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxInput {
    pub outpoint: OutPoint,
    pub script_sig: Vec<u8>,
    pub sighash: SighashMode,
}

/// A transaction output: value in satoshis plus the locking script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// A Bitcoin transaction as this backend sees it. Wire-level encoding lives
/// with the wallet and peer layers; here the structural fields are enough.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Hash over the canonical encoding.
    pub fn hash(&self) -> Sha256Hash {
        Sha256Hash::of(&encode(self))
    }

    /// The outpoints consumed by this transaction, in input order.
    pub fn input_outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        self.inputs.iter().map(|i| i.outpoint)
    }
}

/// What a pledge claims about one of its main-transaction inputs: the UTXO
/// it spends, its value and its locking script. Verification checks these
/// claims against the live UTXO set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputClaim {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// Pledger-supplied metadata. Servers strip this before republishing a
/// pledge (see [`Pledge::scrubbed`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PledgeDetails {
    pub memo: String,
    pub contact: String,
    /// Unix epoch seconds at pledge creation.
    pub timestamp: u64,
}

impl PledgeDetails {
    pub fn is_scrubbed(&self) -> bool {
        self.memo.is_empty() && self.contact.is_empty() && self.timestamp == 0
    }
}

/// A partial, off-chain signed contribution toward a project.
///
/// Carries one main transaction plus up to [`crate::configuration::MAX_DEPENDENCIES`]
/// dependency transactions the main transaction spends from, and a claim for
/// every main-transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pledge {
    pub project_id: ProjectId,
    /// The transaction carrying the pledged inputs.
    pub main_tx: Transaction,
    /// Unconfirmed transactions the main transaction depends on.
    pub dependencies: Vec<Transaction>,
    /// One claim per main-transaction input, in input order.
    pub input_claims: Vec<InputClaim>,
    /// Sum of claimed input values, in satoshis.
    pub total_input_value: u64,
    /// Hash of the pre-scrub pledge, set by a server when republishing.
    pub orig_hash: Option<Sha256Hash>,
    pub details: PledgeDetails,
}

impl Pledge {
    /// Hash of the full pledge encoding. Used as the on-disk file stem and
    /// for scrubbed-copy correlation.
    pub fn hash(&self) -> Sha256Hash {
        Sha256Hash::of(&encode(self))
    }

    /// The outpoints this pledge contributes, i.e. the main transaction's
    /// inputs.
    pub fn outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        self.main_tx.input_outpoints()
    }

    /// A copy with identifying metadata removed and `orig_hash` pointing at
    /// the original, suitable for publication by a server.
    pub fn scrubbed(&self) -> Pledge {
        let mut copy = self.clone();
        copy.orig_hash = Some(self.hash());
        copy.details = PledgeDetails::default();
        copy
    }

    /// True when any input of `tx` spends one of this pledge's outpoints,
    /// i.e. `tx` consumed the pledge.
    pub fn appears_in(&self, tx: &Transaction) -> bool {
        let spent: HashSet<OutPoint> = tx.input_outpoints().collect();
        self.outpoints().any(|o| spent.contains(&o))
    }
}

/// The Bitcoin network a project lives on. Quorum defaults differ on
/// regtest, where a single local node is the whole network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Main,
    Test,
    Regtest,
}

impl Default for Network {
    fn default() -> Self {
        Network::Test
    }
}

/// An assurance contract: the goal outputs that, once collectively funded,
/// become a single claim transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub title: String,
    pub memo: String,
    /// Ordered target outputs of the claim transaction.
    pub outputs: Vec<TxOutput>,
    /// Where pledges are submitted and status is served, when the project
    /// owner runs a server.
    pub payment_url: Option<String>,
    pub network: Network,
}

impl Project {
    /// Build a project, deriving its id from the canonical encoding of the
    /// identifying fields.
    pub fn new(
        title: String,
        memo: String,
        outputs: Vec<TxOutput>,
        payment_url: Option<String>,
        network: Network,
    ) -> Project {
        let mut project = Project {
            id: Sha256Hash([0; 32]),
            title,
            memo,
            outputs,
            payment_url,
            network,
        };
        project.id = Sha256Hash::of(&encode(&(
            &project.title,
            &project.outputs,
            &project.payment_url,
        )));
        project
    }

    /// Sum of the target output values, in satoshis.
    pub fn goal_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Whether `tx` is a claim of this project: its outputs must include
    /// every target output.
    pub fn is_claim(&self, tx: &Transaction) -> bool {
        self.outputs.iter().all(|target| tx.outputs.contains(target))
    }

    /// The path component used to index this project on a server, derived
    /// from the payment URL.
    pub fn url_path(&self) -> Option<String> {
        let url = self.payment_url.as_ref()?;
        let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
        let path = after_scheme.split_once('/').map(|(_, p)| p).unwrap_or("");
        Some(path.trim_end_matches('/').to_string())
    }

    /// The status endpoint served by the project's server.
    pub fn status_url(&self) -> Option<String> {
        self.payment_url
            .as_ref()
            .map(|u| format!("{}/status", u.trim_end_matches('/')))
    }
}

/// Lifecycle state of a project, owned by the disk layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectState {
    Open,
    Claimed,
    Error,
}

/// State plus the claim transaction hash once one is known. Terminal states
/// are soft: external evidence can revert them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStateInfo {
    pub state: ProjectState,
    pub claimed_by: Option<Sha256Hash>,
}

impl Default for ProjectStateInfo {
    fn default() -> Self {
        ProjectStateInfo {
            state: ProjectState::Open,
            claimed_by: None,
        }
    }
}

/// What the network knows about one unspent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// How confident the wallet is that a transaction will confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxConfidence {
    /// Seen but unconfirmed; `broadcast_peers` peers have announced it.
    Pending { broadcast_peers: usize },
    /// Included in a block at the given depth.
    Building { depth: u32 },
    /// Double-spent or otherwise unconfirmable.
    Dead,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outpoint(n: u8) -> OutPoint {
        OutPoint {
            txid: Sha256Hash([n; 32]),
            vout: 0,
        }
    }

    fn pledge_spending(outpoints: &[OutPoint]) -> Pledge {
        let inputs = outpoints
            .iter()
            .map(|o| TxInput {
                outpoint: *o,
                script_sig: vec![1],
                sighash: SighashMode::AllAnyoneCanPay,
            })
            .collect();
        let claims = outpoints
            .iter()
            .map(|o| InputClaim {
                outpoint: *o,
                value: 1000,
                script_pubkey: vec![2],
            })
            .collect();
        Pledge {
            project_id: Sha256Hash([9; 32]),
            main_tx: Transaction {
                inputs,
                outputs: vec![],
                lock_time: 0,
            },
            dependencies: vec![],
            input_claims: claims,
            total_input_value: 1000 * outpoints.len() as u64,
            orig_hash: None,
            details: PledgeDetails {
                memo: "for the cause".into(),
                contact: "alice@example.com".into(),
                timestamp: 1_700_000_000,
            },
        }
    }

    #[test]
    fn scrubbing_strips_details_and_records_origin() {
        let pledge = pledge_spending(&[outpoint(1)]);
        let scrubbed = pledge.scrubbed();
        assert!(scrubbed.details.is_scrubbed());
        assert_eq!(scrubbed.orig_hash, Some(pledge.hash()));
        assert_ne!(scrubbed.hash(), pledge.hash());
        // The economic content is untouched.
        assert_eq!(scrubbed.total_input_value, pledge.total_input_value);
        assert_eq!(scrubbed.input_claims, pledge.input_claims);
    }

    #[test]
    fn claim_matching_requires_every_target_output() {
        let target = TxOutput {
            value: 100_000_000,
            script_pubkey: vec![0xA9, 0x14],
        };
        let project = Project::new("roof".into(), String::new(), vec![target.clone()], None, Network::Regtest);
        let claim = Transaction {
            inputs: vec![],
            outputs: vec![
                TxOutput {
                    value: 5,
                    script_pubkey: vec![0x51],
                },
                target,
            ],
            lock_time: 0,
        };
        assert!(project.is_claim(&claim));
        let unrelated = Transaction {
            inputs: vec![],
            outputs: vec![TxOutput {
                value: 1,
                script_pubkey: vec![0x52],
            }],
            lock_time: 0,
        };
        assert!(!project.is_claim(&unrelated));
    }

    #[test]
    fn pledge_appears_in_claim_spending_its_outpoints() {
        let pledge = pledge_spending(&[outpoint(3), outpoint(4)]);
        let claim = Transaction {
            inputs: vec![TxInput {
                outpoint: outpoint(3),
                script_sig: vec![],
                sighash: SighashMode::All,
            }],
            outputs: vec![],
            lock_time: 0,
        };
        assert!(pledge.appears_in(&claim));
        let other = Transaction {
            inputs: vec![TxInput {
                outpoint: outpoint(7),
                script_sig: vec![],
                sighash: SighashMode::All,
            }],
            outputs: vec![],
            lock_time: 0,
        };
        assert!(!pledge.appears_in(&other));
    }

    #[test]
    fn url_path_strips_scheme_and_host() {
        let project = Project::new(
            "p".into(),
            String::new(),
            vec![],
            Some("https://example.com/projects/roof".into()),
            Network::Test,
        );
        assert_eq!(project.url_path().as_deref(), Some("projects/roof"));
        assert_eq!(
            project.status_url().as_deref(),
            Some("https://example.com/projects/roof/status")
        );
    }

    #[test]
    fn project_id_is_stable_across_memo_changes() {
        let a = Project::new("t".into(), "memo one".into(), vec![], None, Network::Main);
        let b = Project::new("t".into(), "memo two".into(), vec![], None, Network::Main);
        assert_eq!(a.id, b.id);
        let c = Project::new("other".into(), "memo one".into(), vec![], None, Network::Main);
        assert_ne!(a.id, c.id);
    }
}
