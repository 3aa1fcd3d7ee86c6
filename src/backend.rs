//! Backend orchestrator
//!
//! Wires the asynchronous sources (disk watcher, wallet, chain tip, peer
//! network, project servers) into the engine thread, runs verification
//! rounds through the UTXO coordinator, and keeps the observable pledge
//! store consistent. Per-project failures land in the check-status map;
//! the orchestrator itself never dies on one.

use crate::claims::{ClaimAction, ClaimWatcher};
use crate::configuration::{
    Config, Mode, DEPENDENCY_BROADCAST_DEADLINE, MAX_DEPENDENCIES,
};
use crate::disk::{DiskEvent, DiskManager, StateRegistry};
use crate::error::{BackendError, CheckStatus, VerificationError};
use crate::model::{
    OutPoint, Pledge, Project, ProjectId, ProjectState, ProjectStateInfo, Transaction,
};
use crate::networking::{ChainEvent, PeerGroup, UtxoQueryCoordinator};
use crate::scheduler::{self, Scheduler};
use crate::server_client::ServerClient;
use crate::store::{MapMirror, ObservableSet, PledgeStore, SetMirror};
use crate::verifier;
use crate::wallet::{PledgingWallet, WalletEvent};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// How far behind the most common peer height the wallet tip may lag while
/// still counting as "near the chain head".
const NEAR_HEAD_SLACK: u64 = 2;

/// The pledge lifecycle and verification engine.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<BackendInner>,
}

struct BackendInner {
    config: Config,
    scheduler: Scheduler,
    store: Arc<PledgeStore>,
    coordinator: UtxoQueryCoordinator,
    server: ServerClient,
    wallet: Arc<dyn PledgingWallet>,
    disk: Arc<dyn DiskManager>,
    peers: Arc<dyn PeerGroup>,
    claims: ClaimWatcher,
    states: Arc<StateRegistry>,
    runtime: Handle,
    /// Engine-owned set of known projects.
    projects: Mutex<ObservableSet<Project>>,
    /// Payment-URL path → project, read by HTTP handler threads.
    url_index: Mutex<HashMap<String, Project>>,
    init: InitLatch,
}

impl Backend {
    /// Wire the backend and start its event pumps. The returned handle is
    /// cheap to clone; `runtime` must outlive it.
    pub fn new(
        config: Config,
        wallet: Arc<dyn PledgingWallet>,
        disk: Arc<dyn DiskManager>,
        peers: Arc<dyn PeerGroup>,
        runtime: Handle,
    ) -> Backend {
        let scheduler = Scheduler::start();
        let store = Arc::new(PledgeStore::new(scheduler.clone()));
        let states = Arc::new(StateRegistry::new(disk.clone()));
        let claims = ClaimWatcher::new(
            scheduler.clone(),
            store.clone(),
            disk.clone(),
            states.clone(),
            config.mode,
            config.peers.min_broadcast_peers,
        );
        let coordinator =
            UtxoQueryCoordinator::new(peers.clone(), config.peers.min_peers_for_utxo_query);
        let inner = Arc::new(BackendInner {
            config,
            scheduler,
            store,
            coordinator,
            server: ServerClient::new(),
            wallet,
            disk,
            peers,
            claims,
            states,
            runtime,
            projects: Mutex::new(ObservableSet::new()),
            url_index: Mutex::new(HashMap::new()),
            init: InitLatch::new(),
        });

        inner.spawn_event_pumps();

        // Initial load: pick up every project already on disk, then open
        // the init latch.
        let init_inner = inner.clone();
        inner.scheduler.submit(move || {
            for project in init_inner.disk.projects() {
                init_inner.handle_project_added(project);
            }
            init_inner.init.open();
        });

        Backend { inner }
    }

    /// Block until the initial project load finished on the engine thread.
    pub fn wait_for_init(&self) {
        self.inner.init.wait();
    }

    pub fn mode(&self) -> Mode {
        self.inner.config.mode
    }

    // Mirrors. Each returns a snapshot plus a diff stream delivered in
    // engine order; consumers poll the stream on whatever executor they
    // like.

    pub fn mirror_projects(&self) -> SetMirror<Project> {
        let inner = self.inner.clone();
        self.inner
            .scheduler
            .run_on_thread(move || inner.projects.lock().unwrap().mirror())
    }

    pub fn mirror_open_pledges(&self, project: &ProjectId) -> SetMirror<Pledge> {
        self.inner.store.mirror_open(*project)
    }

    pub fn mirror_claimed_pledges(&self, project: &ProjectId) -> SetMirror<Pledge> {
        self.inner.store.mirror_claimed(*project)
    }

    pub fn mirror_check_statuses(&self) -> MapMirror<ProjectId, CheckStatus> {
        self.inner.store.mirror_check_statuses()
    }

    pub fn mirror_project_states(&self) -> MapMirror<ProjectId, ProjectStateInfo> {
        let inner = self.inner.clone();
        self.inner
            .scheduler
            .run_on_thread(move || inner.states.mirror())
    }

    /// Live sum of pledged value (open ∪ claimed) for a project.
    pub fn total_pledged(&self, project: &ProjectId) -> watch::Receiver<u64> {
        self.inner.store.total_pledged(*project)
    }

    pub fn get_project_by_id(&self, id: &ProjectId) -> Option<Project> {
        let inner = self.inner.clone();
        let id = *id;
        self.inner.scheduler.run_on_thread(move || {
            inner
                .projects
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.id == id)
                .cloned()
        })
    }

    /// Look a project up by its payment-URL path. Callable from HTTP
    /// handler threads; only the URL index is touched.
    pub fn get_project_from_url(&self, path: &str) -> Option<Project> {
        let trimmed = path.trim_matches('/');
        self.inner.url_index.lock().unwrap().get(trimmed).cloned()
    }

    /// Persist a project file into the managed directory and start
    /// tracking it.
    pub fn save_project(&self, project: Project) -> io::Result<Project> {
        // The disk event pump will route the resulting ProjectAdded to the
        // engine thread.
        self.inner.disk.save_project(&project)
    }

    /// Load a project file from an arbitrary path and start tracking it.
    pub fn add_project_file(&self, path: &Path) -> io::Result<Project> {
        self.inner.disk.add_project_file(path)
    }

    /// Ask the engine to refresh a project from its server. Resolves when
    /// the refresh completed (or failed; failures also land in the
    /// check-status map).
    pub fn refresh_project_status_from_server(
        &self,
        project: Project,
    ) -> impl std::future::Future<Output = Result<(), String>> + use<> {
        let inner = self.inner.clone();
        let (tx, rx) = oneshot::channel();
        self.inner.scheduler.submit(move || {
            let result = inner.refresh_from_server(&project);
            let _ = tx.send(result.map_err(|e| e.to_string()));
        });
        async move {
            rx.await
                .unwrap_or_else(|_| Err("engine shut down during refresh".to_string()))
        }
    }

    /// Server-mode submission pipeline: fast sanity check, dependency
    /// broadcast, UTXO verification, atomic persist. The typed error tells
    /// a revoked pledge (`UnknownUtxo`) from a broken one.
    pub async fn submit_pledge(
        &self,
        project: Project,
        pledge: Pledge,
    ) -> Result<Pledge, BackendError> {
        let inner = self.inner.clone();
        let max_deps = inner.max_dependencies();
        verifier::sanity_check(&project, &pledge, max_deps)?;

        for dep in &pledge.dependencies {
            tokio::time::timeout(
                DEPENDENCY_BROADCAST_DEADLINE,
                inner.peers.broadcast_transaction(dep),
            )
            .await
            .map_err(|_| BackendError::Broadcast("dependency broadcast timed out".into()))?
            .map_err(BackendError::from)?;
        }

        // The UTXO round and the store mutation must happen on the engine
        // thread; park this task off the runtime while it waits.
        let scheduler = inner.scheduler.clone();
        let engine_inner = inner.clone();
        let engine_pledge = pledge.clone();
        let verified = tokio::task::spawn_blocking(move || {
            scheduler
                .run_on_thread(move || engine_inner.verify_submission(&project, engine_pledge))
        })
        .await
        .expect("engine verification task panicked");
        verified?;

        inner.disk.save_pledge(&pledge.project_id, &pledge)?;
        Ok(pledge)
    }

    /// The status document served to clients: scrubbed open pledges plus
    /// the claim transaction hash once one is known. Callable from any
    /// thread.
    pub fn project_status(&self, project: &Project) -> crate::server_client::ProjectStatus {
        let inner = self.inner.clone();
        let id = project.id;
        self.inner.scheduler.run_on_thread(move || {
            let pledges = inner
                .store
                .open_snapshot(&id)
                .iter()
                .map(|p| p.scrubbed())
                .collect();
            crate::server_client::ProjectStatus {
                pledges,
                claimed_by: inner.states.get(&id).claimed_by,
            }
        })
    }

    /// Stop accepting work. Queued engine tasks drain first.
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
    }
}

impl BackendInner {
    fn spawn_event_pumps(self: &Arc<Self>) {
        // One pump per source keeps per-source FIFO ordering; interleaving
        // across sources is whatever order the engine queue sees.
        let disk_rx = self.disk.subscribe();
        let wallet_rx = self.wallet.subscribe();
        let chain_rx = self.peers.subscribe_chain();

        let inner = self.clone();
        self.runtime.spawn(async move {
            let mut rx = disk_rx;
            while let Some(event) = rx.recv().await {
                let inner = inner.clone();
                inner
                    .scheduler
                    .clone()
                    .submit(move || inner.handle_disk_event(event));
            }
        });

        let inner = self.clone();
        self.runtime.spawn(async move {
            let mut rx = wallet_rx;
            while let Some(event) = rx.recv().await {
                let inner = inner.clone();
                inner
                    .scheduler
                    .clone()
                    .submit(move || inner.handle_wallet_event(event));
            }
        });

        let inner = self.clone();
        self.runtime.spawn(async move {
            let mut rx = chain_rx;
            while let Some(event) = rx.recv().await {
                let inner = inner.clone();
                inner
                    .scheduler
                    .clone()
                    .submit(move || inner.handle_chain_event(event));
            }
        });
    }

    fn max_dependencies(&self) -> usize {
        match self.config.mode {
            Mode::Client => 1,
            Mode::Server => MAX_DEPENDENCIES,
        }
    }

    // ---- engine-thread event handlers ----

    fn handle_disk_event(self: &Arc<Self>, event: DiskEvent) {
        self.scheduler.assert_on_thread();
        match event {
            DiskEvent::ProjectAdded(project) => self.handle_project_added(project),
            DiskEvent::ProjectRemoved(project) => self.handle_project_removed(project),
            DiskEvent::PledgeAdded { project, pledge } => {
                self.handle_disk_pledge_added(project, pledge)
            }
            DiskEvent::PledgeRemoved { project, pledge } => {
                self.handle_disk_pledge_removed(project, pledge)
            }
        }
    }

    fn handle_project_added(self: &Arc<Self>, project: Project) {
        self.scheduler.assert_on_thread();
        if !self.projects.lock().unwrap().insert(project.clone()) {
            return;
        }
        info!(title = %project.title, id = %project.id, "tracking project");
        self.states.refresh(project.id);

        if self.config.mode == Mode::Server {
            if let Some(path) = project.url_path() {
                self.url_index.lock().unwrap().insert(path, project.clone());
            }
        }

        // Let the wallet spot claim transactions for this project.
        self.wallet
            .register_output_scripts(project.outputs.iter().map(|o| o.script_pubkey.clone()).collect());

        // Pledges this wallet already made show up without verification:
        // we signed them ourselves.
        for pledge in self.wallet.pledges() {
            if pledge.project_id == project.id && !self.wallet.is_revoked(&pledge) {
                self.store.add_open(project.id, pledge);
            }
        }

        if self.config.mode == Mode::Client && project.payment_url.is_some() {
            let inner = self.clone();
            let refresh_project = project.clone();
            self.scheduler.submit(move || {
                let _ = inner.refresh_from_server(&refresh_project);
            });
        } else {
            let pledges = self.disk.pledges_for(&project.id);
            self.run_check(&project, pledges, true);
        }
    }

    fn handle_project_removed(self: &Arc<Self>, project: Project) {
        self.scheduler.assert_on_thread();
        info!(title = %project.title, "project removed from disk");
        self.projects.lock().unwrap().remove(&project);
        if let Some(path) = project.url_path() {
            self.url_index.lock().unwrap().remove(&path);
        }
        self.store.drop_project(&project.id);
        self.states.forget(&project.id);
    }

    fn handle_disk_pledge_added(self: &Arc<Self>, project_id: ProjectId, pledge: Pledge) {
        self.scheduler.assert_on_thread();
        if self.store.is_known(&project_id, &pledge) {
            debug!("pledge already known, ignoring disk echo");
            return;
        }
        // Give dependency transactions time to spread before peers are
        // asked about them.
        let base = Duration::from_secs(self.config.timing.tx_propagation_secs);
        let max_jitter = Duration::from_secs(self.config.timing.max_jitter_secs);
        let inner = self.clone();
        self.scheduler.schedule_jittered(base, max_jitter, move || {
            let Some(project) = inner.project_by_id(&project_id) else {
                return;
            };
            if inner.store.is_known(&project_id, &pledge) {
                // Something else (a submission, the wallet) accepted it in
                // the meantime.
                return;
            }
            if !inner.disk.pledges_for(&project_id).contains(&pledge) {
                // The file vanished again while the check waited; the open
                // set must keep matching what is on disk.
                return;
            }
            inner.run_check(&project, vec![pledge], false);
        });
    }

    fn handle_disk_pledge_removed(self: &Arc<Self>, project_id: ProjectId, pledge: Pledge) {
        self.scheduler.assert_on_thread();
        if self.wallet.holds_equivalent(&pledge) {
            // Our own copy vanished from disk; the wallet still has it, so
            // nothing observable changed.
            debug!("authored pledge file removed, wallet copy remains");
            return;
        }
        self.store.remove_open(project_id, &pledge);
        self.store.remove_claimed(project_id, &pledge);
    }

    fn handle_wallet_event(self: &Arc<Self>, event: WalletEvent) {
        self.scheduler.assert_on_thread();
        match event {
            WalletEvent::PledgeCreated(pledge) => {
                let project_id = pledge.project_id;
                if self.project_by_id(&project_id).is_some() {
                    self.store.add_open(project_id, pledge);
                } else {
                    warn!("wallet pledge for unknown project {project_id}");
                }
            }
            WalletEvent::PledgeRevoked(pledge) => {
                self.store.remove_open(pledge.project_id, &pledge);
            }
            WalletEvent::CoinsReceived { tx, confidence }
            | WalletEvent::ConfidenceChanged { tx, confidence } => {
                match self.claims.process_transaction(&tx, confidence) {
                    ClaimAction::None => {}
                    ClaimAction::RefreshFromServer(project) => {
                        let _ = self.refresh_from_server(&project);
                    }
                }
            }
        }
    }

    fn handle_chain_event(self: &Arc<Self>, event: ChainEvent) {
        self.scheduler.assert_on_thread();
        let ChainEvent::TipAdvanced { height } = event;
        let common = self.peers.most_common_height();
        if height + NEAR_HEAD_SLACK < common {
            // Still syncing; peers would only tell us about a stale chain.
            return;
        }
        let max_jitter = Duration::from_secs(self.config.timing.max_jitter_secs);
        let projects: Vec<Project> = self.projects.lock().unwrap().iter().cloned().collect();
        for project in projects {
            let inner = self.clone();
            let delay = scheduler::smear(max_jitter);
            if self.config.mode == Mode::Client && project.payment_url.is_some() {
                self.scheduler.schedule(delay, move || {
                    let _ = inner.refresh_from_server(&project);
                });
            } else {
                self.scheduler.schedule(delay, move || {
                    let Some(project) = inner.project_by_id(&project.id) else {
                        return;
                    };
                    let mut tested: HashSet<Pledge> =
                        inner.store.open_snapshot(&project.id);
                    tested.extend(inner.disk.pledges_for(&project.id));
                    inner.run_check(&project, tested.into_iter().collect(), true);
                });
            }
        }
    }

    fn project_by_id(&self, id: &ProjectId) -> Option<Project> {
        self.projects
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == *id)
            .cloned()
    }

    // ---- verification rounds ----

    /// Run one verification round over `tested` and reconcile the open set
    /// with the outcome. Engine thread only; the UTXO round blocks here,
    /// which is what serialises rounds backend-wide.
    fn run_check(self: &Arc<Self>, project: &Project, tested: Vec<Pledge>, checking_all: bool) {
        self.scheduler.assert_on_thread();
        if tested.is_empty() {
            self.store.clear_check_status(&project.id);
            return;
        }
        self.store
            .set_check_status(project.id, CheckStatus::InProgress);
        match self.perform_check(project, &tested) {
            Ok(verified) => {
                self.sync_pledges(project, tested, verified, checking_all);
                self.store.clear_check_status(&project.id);
            }
            Err(err) => {
                warn!(project = %project.title, %err, "project check failed");
                self.store
                    .set_check_status(project.id, CheckStatus::failed(err));
            }
        }
    }

    /// The checking half of a round: sanity, outpoint disjointness, one
    /// batched UTXO query, per-pledge verification. Returns the pledges
    /// that passed; `UnknownUtxo` pledges are silently dropped (revoked),
    /// anything else aborts the round.
    fn perform_check(
        &self,
        project: &Project,
        tested: &[Pledge],
    ) -> Result<Vec<Pledge>, BackendError> {
        let max_deps = self.max_dependencies();
        for pledge in tested {
            verifier::sanity_check(project, pledge, max_deps)?;
        }

        let tested_set: HashSet<Pledge> = tested.iter().cloned().collect();
        let reserved = self.store.accepted_outpoints(&project.id, &tested_set);
        verifier::check_outpoints_disjoint(tested, &reserved)?;

        let outpoints: Vec<OutPoint> = {
            let mut seen = HashSet::new();
            tested
                .iter()
                .flat_map(|p| p.outpoints())
                .filter(|o| seen.insert(*o))
                .collect()
        };
        let round = self.runtime.block_on(self.coordinator.query(outpoints))?;

        let mut verified = Vec::new();
        for pledge in tested {
            match verifier::verify(pledge, &round.snapshot) {
                Ok(()) => verified.push(pledge.clone()),
                Err(VerificationError::UnknownUtxo(outpoint)) => {
                    debug!(%outpoint, "pledge dropped: outpoint spent, unknown or disputed");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(verified)
    }

    /// Submission-path verification: one pledge, revocation is an error
    /// the submitter hears about. On success the pledge is already in the
    /// open set, so the disk echo deduplicates.
    fn verify_submission(
        self: &Arc<Self>,
        project: &Project,
        pledge: Pledge,
    ) -> Result<(), BackendError> {
        self.scheduler.assert_on_thread();
        self.store
            .set_check_status(project.id, CheckStatus::InProgress);
        let result: Result<(), BackendError> = (|| {
            let tested_set: HashSet<Pledge> = std::iter::once(pledge.clone()).collect();
            let reserved = self.store.accepted_outpoints(&project.id, &tested_set);
            verifier::check_outpoints_disjoint(std::slice::from_ref(&pledge), &reserved)?;
            let outpoints: Vec<OutPoint> = pledge.outpoints().collect();
            let round = self.runtime.block_on(self.coordinator.query(outpoints))?;
            verifier::verify(&pledge, &round.snapshot)?;
            Ok(())
        })();
        match &result {
            Ok(()) => {
                self.store.add_open(project.id, pledge);
                self.store.clear_check_status(&project.id);
            }
            Err(_) => {
                // Submission failures belong to the submitter, not to the
                // project's check status.
                self.store.clear_check_status(&project.id);
            }
        }
        result
    }

    /// Minimal set reconciliation: add what newly verified, drop what a
    /// full check newly invalidated, and absorb claim-spent pledges into
    /// the claimed set for serverless projects.
    fn sync_pledges(
        self: &Arc<Self>,
        project: &Project,
        tested: Vec<Pledge>,
        verified: Vec<Pledge>,
        checking_all: bool,
    ) {
        self.scheduler.assert_on_thread();
        let current_open = self.store.open_snapshot(&project.id);
        let authored = self.wallet.authored_pledge_hashes();

        for pledge in &verified {
            if current_open.contains(pledge) {
                continue;
            }
            if self.config.mode == Mode::Client {
                if self.wallet.is_revoked(pledge) {
                    debug!("dropping server-listed pledge the wallet knows is revoked");
                    continue;
                }
                if pledge.orig_hash.is_some_and(|h| authored.contains(&h)) {
                    // A scrubbed copy of a pledge we originated; the local
                    // original already represents it.
                    continue;
                }
            }
            self.store.add_open(project.id, pledge.clone());
        }

        if checking_all {
            let verified_set: HashSet<&Pledge> = verified.iter().collect();
            let claim_tx = self.claim_tx_for(project);
            for pledge in tested {
                if verified_set.contains(&pledge) || !current_open.contains(&pledge) {
                    continue;
                }
                self.store.remove_open(project.id, &pledge);
                if project.payment_url.is_none() {
                    if let Some(claim) = &claim_tx {
                        if pledge.appears_in(claim) {
                            self.store.add_claimed(project.id, pledge);
                        }
                    }
                }
            }
        }
    }

    fn claim_tx_for(&self, project: &Project) -> Option<Transaction> {
        let state = self.states.get(&project.id);
        state.claimed_by.and_then(|txid| self.claims.claim_tx(&txid))
    }

    // ---- server refresh ----

    /// Fetch the authoritative pledge list and reconcile. Engine thread;
    /// blocks on the transport.
    fn refresh_from_server(self: &Arc<Self>, project: &Project) -> Result<(), BackendError> {
        self.scheduler.assert_on_thread();
        self.store
            .set_check_status(project.id, CheckStatus::InProgress);
        match self.runtime.block_on(self.server.fetch_status(project)) {
            Ok(status) => {
                // The server is the truth for its own project; its list is
                // both the tested and the verified set.
                self.sync_pledges(project, status.pledges.clone(), status.pledges, true);
                if let Some(txid) = status.claimed_by {
                    let current = self.states.get(&project.id);
                    if current.state != ProjectState::Claimed {
                        self.states.set(
                            project.id,
                            ProjectStateInfo {
                                state: ProjectState::Claimed,
                                claimed_by: Some(txid),
                            },
                        );
                    }
                }
                self.store.clear_check_status(&project.id);
                Ok(())
            }
            Err(err) => {
                warn!(project = %project.title, %err, "server refresh failed");
                let message = err.to_string();
                self.store
                    .set_check_status(project.id, CheckStatus::failed(err));
                Err(BackendError::Transport(message))
            }
        }
    }
}

struct InitLatch {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl InitLatch {
    fn new() -> Self {
        InitLatch {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.done.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.condvar.wait(done).unwrap();
        }
    }
}
