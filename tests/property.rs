//! Property tests for the engine's quantified invariants: set
//! disjointness, outpoint exclusivity, and disk/open-set convergence.

mod common;

use beacon::backend::Backend;
use beacon::configuration::Mode;
use beacon::disk::{DirectoryManager, DiskManager};
use beacon::model::{OutPoint, Pledge};
use beacon::networking::StaticPeerSet;
use beacon::scheduler::Scheduler;
use beacon::store::PledgeStore;
use beacon::verifier;
use common::*;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};

/// Engine operations a backend performs against the store, as the
/// orchestrator would issue them.
#[derive(Debug, Clone)]
enum StoreOp {
    AddOpen(usize),
    RemoveOpen(usize),
    /// A claim transaction for pledge `i` propagates.
    Claim(usize),
    /// A full check found pledge `i` invalid but spent by a known claim.
    AbsorbInvalid(usize),
}

fn store_op() -> impl Strategy<Value = StoreOp> {
    (0usize..6, 0u8..4).prop_map(|(i, kind)| match kind {
        0 => StoreOp::AddOpen(i),
        1 => StoreOp::RemoveOpen(i),
        2 => StoreOp::Claim(i),
        _ => StoreOp::AbsorbInvalid(i),
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Invariant: a pledge is never in both the open and the claimed set.
    #[test]
    fn open_and_claimed_sets_stay_disjoint(ops in prop::collection::vec(store_op(), 1..40)) {
        let scheduler = Scheduler::start();
        let store = Arc::new(PledgeStore::new(scheduler.clone()));
        let project = test_project(SATOSHI_COIN, None);
        let pledges: Vec<Pledge> = (0u8..6)
            .map(|i| pledge_spending(&project, &[(outpoint(i + 1), 1_000)]))
            .collect();

        let id = project.id;
        let (open, claimed) = {
            let store = store.clone();
            let project = project.clone();
            scheduler.run_on_thread(move || {
                for op in ops {
                    match op {
                        StoreOp::AddOpen(i) => {
                            // The orchestrator never opens a pledge that is
                            // already claimed.
                            if !store.claimed_snapshot(&id).contains(&pledges[i]) {
                                store.add_open(id, pledges[i].clone());
                            }
                        }
                        StoreOp::RemoveOpen(i) => {
                            store.remove_open(id, &pledges[i]);
                        }
                        StoreOp::Claim(i) => {
                            let claim = claim_of(&project, &[&pledges[i]]);
                            store.move_open_to_claimed(id, &claim);
                        }
                        StoreOp::AbsorbInvalid(i) => {
                            store.remove_open(id, &pledges[i]);
                            store.add_claimed(id, pledges[i].clone());
                        }
                    }
                }
                (store.open_snapshot(&id), store.claimed_snapshot(&id))
            })
        };
        scheduler.shutdown();
        prop_assert!(open.is_disjoint(&claimed));
    }

    /// Invariant: a pledge set is accepted iff no outpoint is spent twice.
    #[test]
    fn outpoint_exclusivity_matches_overlap(
        tags in prop::collection::vec(prop::collection::vec(1u8..8, 1..3), 1..5)
    ) {
        let project = test_project(SATOSHI_COIN, None);
        let pledges: Vec<Pledge> = tags
            .iter()
            .map(|pledge_tags| {
                let outpoints: Vec<(OutPoint, u64)> = pledge_tags
                    .iter()
                    .map(|t| (outpoint(*t), 1_000))
                    .collect();
                pledge_spending(&project, &outpoints)
            })
            .collect();

        let mut seen = HashSet::new();
        let has_overlap = pledges
            .iter()
            .flat_map(|p| p.outpoints())
            .any(|o| !seen.insert(o));

        let result = verifier::check_outpoints_disjoint(&pledges, &HashSet::new());
        prop_assert_eq!(result.is_err(), has_overlap);
    }
}

/// What ends up in `open(p)` after an arbitrary add/remove sequence is
/// exactly the set of pledge files still present.
#[derive(Debug, Clone, Copy)]
enum DiskOp {
    Add(usize),
    Remove(usize),
}

fn disk_op() -> impl Strategy<Value = DiskOp> {
    (0usize..4, prop::bool::ANY).prop_map(|(i, add)| if add { DiskOp::Add(i) } else { DiskOp::Remove(i) })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn open_set_converges_to_the_files_on_disk(ops in prop::collection::vec(disk_op(), 1..12)) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::TempDir::new().unwrap();
            let disk = Arc::new(DirectoryManager::new(dir.path()).unwrap());
            let project = test_project(SATOSHI_COIN, None);
            disk.save_project(&project).unwrap();

            let pledges: Vec<Pledge> = (0u8..4)
                .map(|i| pledge_spending(&project, &[(outpoint(i + 1), 1_000)]))
                .collect();
            let oracle: Vec<_> = pledges
                .iter()
                .map(|p| {
                    let o = p.input_claims[0].outpoint;
                    (o, entry_for(&o, 1_000))
                })
                .collect();
            let peers = Arc::new(StaticPeerSet::new());
            peers.add_peer(Arc::new(OraclePeer::new("a", &oracle)));
            peers.add_peer(Arc::new(OraclePeer::new("b", &oracle)));

            let backend = Backend::new(
                test_config(Mode::Client, 2),
                Arc::new(StubWallet::default()),
                disk.clone(),
                peers,
                Handle::current(),
            );
            backend.wait_for_init();

            let mut present: HashSet<Pledge> = HashSet::new();
            for op in &ops {
                match op {
                    DiskOp::Add(i) => {
                        disk.notify_pledge_added(&project.id, pledges[*i].clone());
                        present.insert(pledges[*i].clone());
                    }
                    DiskOp::Remove(i) => {
                        disk.notify_pledge_removed(&project.id, &pledges[*i]);
                        present.remove(&pledges[*i]);
                    }
                }
            }

            wait_until(Duration::from_secs(15), "open set to match disk", || {
                (open_pledges(&backend, &project.id) == present).then_some(())
            });
            backend.shutdown();
        });
    }
}
