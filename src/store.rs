//! Observable pledge store
//!
//! Per-project open and claimed pledge sets plus the per-project check
//! status. Mutators run on the engine thread only; readers on other threads
//! get a mirror: an atomic snapshot plus a stream of diffs delivered in the
//! order they were applied.

use crate::error::CheckStatus;
use crate::model::{OutPoint, Pledge, ProjectId, Transaction};
use crate::scheduler::Scheduler;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// One element added to or removed from a mirrored set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetDiff<T> {
    Added(T),
    Removed(T),
}

/// A read-only view of a set: the state at registration time plus every
/// change applied since, in engine order.
pub struct SetMirror<T> {
    pub snapshot: HashSet<T>,
    pub events: mpsc::UnboundedReceiver<SetDiff<T>>,
}

/// One key updated (`Some`) or cleared (`None`) in a mirrored map.
pub type MapDiff<K, V> = (K, Option<V>);

/// A read-only view of a map, same contract as [`SetMirror`].
pub struct MapMirror<K, V> {
    pub snapshot: HashMap<K, V>,
    pub events: mpsc::UnboundedReceiver<MapDiff<K, V>>,
}

/// A plain set that fans every change out to registered mirrors.
pub(crate) struct ObservableSet<T> {
    items: HashSet<T>,
    subscribers: Vec<mpsc::UnboundedSender<SetDiff<T>>>,
}

impl<T: Clone + Eq + Hash> ObservableSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: HashSet::new(),
            subscribers: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, item: T) -> bool {
        let added = self.items.insert(item.clone());
        if added {
            self.publish(SetDiff::Added(item));
        }
        added
    }

    pub(crate) fn remove(&mut self, item: &T) -> bool {
        let removed = self.items.remove(item);
        if removed {
            self.publish(SetDiff::Removed(item.clone()));
        }
        removed
    }

    pub(crate) fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub(crate) fn snapshot(&self) -> HashSet<T> {
        self.items.clone()
    }

    pub(crate) fn mirror(&mut self) -> SetMirror<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        SetMirror {
            snapshot: self.items.clone(),
            events: rx,
        }
    }

    fn publish(&mut self, diff: SetDiff<T>) {
        self.subscribers.retain(|s| s.send(diff.clone()).is_ok());
    }
}

/// A plain map that fans every change out to registered mirrors.
pub(crate) struct ObservableMap<K, V> {
    entries: HashMap<K, V>,
    subscribers: Vec<mpsc::UnboundedSender<MapDiff<K, V>>>,
}

impl<K: Clone + Eq + Hash, V: Clone> ObservableMap<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            subscribers: Vec::new(),
        }
    }

    pub(crate) fn set(&mut self, key: K, value: V) {
        self.entries.insert(key.clone(), value.clone());
        self.publish((key, Some(value)));
    }

    pub(crate) fn clear(&mut self, key: &K) {
        if self.entries.remove(key).is_some() {
            self.publish((key.clone(), None));
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub(crate) fn snapshot(&self) -> HashMap<K, V> {
        self.entries.clone()
    }

    pub(crate) fn mirror(&mut self) -> MapMirror<K, V> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        MapMirror {
            snapshot: self.entries.clone(),
            events: rx,
        }
    }

    fn publish(&mut self, diff: MapDiff<K, V>) {
        self.subscribers.retain(|s| s.send(diff.clone()).is_ok());
    }
}

/// The engine's view of every project's pledges.
///
/// The mutex is uncontended by construction: mutators assert the engine
/// thread, and cross-thread readers come in through
/// [`Scheduler::run_on_thread`].
pub struct PledgeStore {
    scheduler: Scheduler,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    open: HashMap<ProjectId, ObservableSet<Pledge>>,
    claimed: HashMap<ProjectId, ObservableSet<Pledge>>,
    statuses: ObservableMap<ProjectId, CheckStatus>,
    totals: HashMap<ProjectId, Vec<watch::Sender<u64>>>,
}

impl PledgeStore {
    pub fn new(scheduler: Scheduler) -> Self {
        PledgeStore {
            scheduler,
            inner: Mutex::new(StoreInner {
                open: HashMap::new(),
                claimed: HashMap::new(),
                statuses: ObservableMap::new(),
                totals: HashMap::new(),
            }),
        }
    }

    /// Add a pledge to the open set. Returns false when already present.
    pub fn add_open(&self, project: ProjectId, pledge: Pledge) -> bool {
        self.scheduler.assert_on_thread();
        let mut inner = self.inner.lock().unwrap();
        let added = inner
            .open
            .entry(project)
            .or_insert_with(ObservableSet::new)
            .insert(pledge);
        if added {
            inner.publish_total(project);
        }
        added
    }

    pub fn remove_open(&self, project: ProjectId, pledge: &Pledge) -> bool {
        self.scheduler.assert_on_thread();
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.open.get_mut(&project).is_some_and(|s| s.remove(pledge));
        if removed {
            inner.publish_total(project);
        }
        removed
    }

    pub fn add_claimed(&self, project: ProjectId, pledge: Pledge) -> bool {
        self.scheduler.assert_on_thread();
        let mut inner = self.inner.lock().unwrap();
        let added = inner
            .claimed
            .entry(project)
            .or_insert_with(ObservableSet::new)
            .insert(pledge);
        if added {
            inner.publish_total(project);
        }
        added
    }

    pub fn remove_claimed(&self, project: ProjectId, pledge: &Pledge) -> bool {
        self.scheduler.assert_on_thread();
        let mut inner = self.inner.lock().unwrap();
        let removed = inner
            .claimed
            .get_mut(&project)
            .is_some_and(|s| s.remove(pledge));
        if removed {
            inner.publish_total(project);
        }
        removed
    }

    /// Drop every claimed pledge (claim died or reorged out).
    pub fn clear_claimed(&self, project: ProjectId) -> Vec<Pledge> {
        self.scheduler.assert_on_thread();
        let mut inner = self.inner.lock().unwrap();
        let dropped: Vec<Pledge> = match inner.claimed.get_mut(&project) {
            Some(set) => {
                let items: Vec<Pledge> = set.iter().cloned().collect();
                for p in &items {
                    set.remove(p);
                }
                items
            }
            None => Vec::new(),
        };
        if !dropped.is_empty() {
            inner.publish_total(project);
        }
        dropped
    }

    /// Move every open pledge whose inputs appear in `claim_tx` into the
    /// claimed set. Returns the moved pledges.
    pub fn move_open_to_claimed(&self, project: ProjectId, claim_tx: &Transaction) -> Vec<Pledge> {
        self.scheduler.assert_on_thread();
        let mut inner = self.inner.lock().unwrap();
        let matching: Vec<Pledge> = inner
            .open
            .get(&project)
            .map(|set| set.iter().filter(|p| p.appears_in(claim_tx)).cloned().collect())
            .unwrap_or_default();
        for pledge in &matching {
            inner.open.get_mut(&project).unwrap().remove(pledge);
            inner
                .claimed
                .entry(project)
                .or_insert_with(ObservableSet::new)
                .insert(pledge.clone());
        }
        if !matching.is_empty() {
            inner.publish_total(project);
        }
        matching
    }

    pub fn open_snapshot(&self, project: &ProjectId) -> HashSet<Pledge> {
        self.scheduler.assert_on_thread();
        let inner = self.inner.lock().unwrap();
        inner.open.get(project).map(|s| s.snapshot()).unwrap_or_default()
    }

    pub fn claimed_snapshot(&self, project: &ProjectId) -> HashSet<Pledge> {
        self.scheduler.assert_on_thread();
        let inner = self.inner.lock().unwrap();
        inner.claimed.get(project).map(|s| s.snapshot()).unwrap_or_default()
    }

    pub fn is_known(&self, project: &ProjectId, pledge: &Pledge) -> bool {
        self.scheduler.assert_on_thread();
        let inner = self.inner.lock().unwrap();
        inner.open.get(project).is_some_and(|s| s.contains(pledge))
            || inner.claimed.get(project).is_some_and(|s| s.contains(pledge))
    }

    /// Outpoints consumed by currently-accepted (open or claimed) pledges,
    /// excluding `except`. The duplicate-outpoint index for a check round.
    pub fn accepted_outpoints(
        &self,
        project: &ProjectId,
        except: &HashSet<Pledge>,
    ) -> HashSet<OutPoint> {
        self.scheduler.assert_on_thread();
        let inner = self.inner.lock().unwrap();
        let mut outpoints = HashSet::new();
        for set in [inner.open.get(project), inner.claimed.get(project)]
            .into_iter()
            .flatten()
        {
            for pledge in set.iter().filter(|p| !except.contains(*p)) {
                outpoints.extend(pledge.outpoints());
            }
        }
        outpoints
    }

    pub fn set_check_status(&self, project: ProjectId, status: CheckStatus) {
        self.scheduler.assert_on_thread();
        self.inner.lock().unwrap().statuses.set(project, status);
    }

    pub fn clear_check_status(&self, project: &ProjectId) {
        self.scheduler.assert_on_thread();
        self.inner.lock().unwrap().statuses.clear(project);
    }

    pub fn check_status(&self, project: &ProjectId) -> Option<CheckStatus> {
        self.scheduler.assert_on_thread();
        self.inner.lock().unwrap().statuses.get(project).cloned()
    }

    /// Forget a removed project entirely, notifying mirrors of each
    /// element's removal.
    pub fn drop_project(&self, project: &ProjectId) {
        self.scheduler.assert_on_thread();
        let mut inner = self.inner.lock().unwrap();
        if let Some(set) = inner.open.get_mut(project) {
            for p in set.snapshot() {
                set.remove(&p);
            }
        }
        if let Some(set) = inner.claimed.get_mut(project) {
            for p in set.snapshot() {
                set.remove(&p);
            }
        }
        inner.open.remove(project);
        inner.claimed.remove(project);
        inner.statuses.clear(project);
        inner.totals.remove(project);
    }

    // Mirrors may be requested from any thread; registration is marshalled
    // to the engine so the snapshot and the diff stream line up exactly.

    pub fn mirror_open(self: &Arc<Self>, project: ProjectId) -> SetMirror<Pledge> {
        let store = self.clone();
        self.scheduler.run_on_thread(move || {
            store
                .inner
                .lock()
                .unwrap()
                .open
                .entry(project)
                .or_insert_with(ObservableSet::new)
                .mirror()
        })
    }

    pub fn mirror_claimed(self: &Arc<Self>, project: ProjectId) -> SetMirror<Pledge> {
        let store = self.clone();
        self.scheduler.run_on_thread(move || {
            store
                .inner
                .lock()
                .unwrap()
                .claimed
                .entry(project)
                .or_insert_with(ObservableSet::new)
                .mirror()
        })
    }

    pub fn mirror_check_statuses(self: &Arc<Self>) -> MapMirror<ProjectId, CheckStatus> {
        let store = self.clone();
        self.scheduler
            .run_on_thread(move || store.inner.lock().unwrap().statuses.mirror())
    }

    /// A live sum of `total_input_value` over open ∪ claimed, updated on
    /// the engine thread after every change.
    pub fn total_pledged(self: &Arc<Self>, project: ProjectId) -> watch::Receiver<u64> {
        let store = self.clone();
        self.scheduler.run_on_thread(move || {
            let mut guard = store.inner.lock().unwrap();
            let (tx, rx) = watch::channel(guard.total_of(&project));
            guard.totals.entry(project).or_default().push(tx);
            rx
        })
    }
}

impl StoreInner {
    fn total_of(&self, project: &ProjectId) -> u64 {
        let open = self
            .open
            .get(project)
            .map(|s| s.iter().map(|p| p.total_input_value).sum::<u64>())
            .unwrap_or(0);
        let claimed = self
            .claimed
            .get(project)
            .map(|s| s.iter().map(|p| p.total_input_value).sum::<u64>())
            .unwrap_or(0);
        open + claimed
    }

    fn publish_total(&mut self, project: ProjectId) {
        let total = self.total_of(&project);
        if let Some(senders) = self.totals.get_mut(&project) {
            senders.retain(|tx| tx.send(total).is_ok());
        }
    }
}
