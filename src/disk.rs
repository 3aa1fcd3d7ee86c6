//! Disk seam: project and pledge files
//!
//! The backend consumes disk events and asks the disk layer questions
//! through [`DiskManager`]. [`DirectoryManager`] is the concrete layer the
//! daemon and tests use: project files (`.project`) in watched directories,
//! pledges as `<sha256(pledge_bytes)>.pledge` siblings, every write going
//! through a temp file and an atomic rename so a partially written pledge
//! is never visible.

use crate::model::{self, Pledge, Project, ProjectId, ProjectStateInfo, Transaction};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const PROJECT_FILE_EXTENSION: &str = "project";
pub const PLEDGE_FILE_EXTENSION: &str = "pledge";

/// Events the disk layer pushes at the backend. Per-subscriber FIFO.
#[derive(Debug, Clone)]
pub enum DiskEvent {
    ProjectAdded(Project),
    ProjectRemoved(Project),
    PledgeAdded { project: ProjectId, pledge: Pledge },
    PledgeRemoved { project: ProjectId, pledge: Pledge },
}

pub trait DiskManager: Send + Sync {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DiskEvent>;

    fn projects(&self) -> Vec<Project>;

    /// Pledges currently on disk for `project`.
    fn pledges_for(&self, project: &ProjectId) -> Vec<Pledge>;

    fn project_state(&self, project: &ProjectId) -> ProjectStateInfo;

    fn set_project_state(&self, project: &ProjectId, info: ProjectStateInfo);

    /// The project whose target outputs `tx` pays, if any.
    fn project_for_claim(&self, tx: &Transaction) -> Option<Project>;

    /// Persist a project file into the managed directory.
    fn save_project(&self, project: &Project) -> io::Result<Project>;

    /// Load a project file from an arbitrary path and start managing it.
    fn add_project_file(&self, path: &Path) -> io::Result<Project>;

    /// Persist a pledge next to its project file. Atomic; the resulting
    /// file is named after the pledge hash.
    fn save_pledge(&self, project: &ProjectId, pledge: &Pledge) -> io::Result<PathBuf>;
}

/// Write `bytes` to `path` via a `.tmp` sibling and an atomic rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Observable write-through over the disk layer's project states.
///
/// The disk layer owns `ProjectStateInfo`; the backend routes every state
/// change through here so mirrors see them. Mutation is engine-thread only,
/// like the rest of the observable state.
pub struct StateRegistry {
    disk: std::sync::Arc<dyn DiskManager>,
    map: Mutex<crate::store::ObservableMap<ProjectId, ProjectStateInfo>>,
}

impl StateRegistry {
    pub fn new(disk: std::sync::Arc<dyn DiskManager>) -> Self {
        StateRegistry {
            disk,
            map: Mutex::new(crate::store::ObservableMap::new()),
        }
    }

    pub fn get(&self, project: &ProjectId) -> ProjectStateInfo {
        self.disk.project_state(project)
    }

    pub fn set(&self, project: ProjectId, info: ProjectStateInfo) {
        self.disk.set_project_state(&project, info.clone());
        self.map.lock().unwrap().set(project, info);
    }

    /// Publish the disk layer's current state without rewriting it.
    pub fn refresh(&self, project: ProjectId) {
        let info = self.disk.project_state(&project);
        self.map.lock().unwrap().set(project, info);
    }

    pub fn forget(&self, project: &ProjectId) {
        self.map.lock().unwrap().clear(project);
    }

    pub fn mirror(&self) -> crate::store::MapMirror<ProjectId, ProjectStateInfo> {
        self.map.lock().unwrap().mirror()
    }
}

struct ProjectRecord {
    project: Project,
    /// Directory holding the project file and its pledge siblings.
    dir: PathBuf,
    state: ProjectStateInfo,
    pledges: HashSet<Pledge>,
}

struct DirInner {
    records: HashMap<ProjectId, ProjectRecord>,
    subscribers: Vec<mpsc::UnboundedSender<DiskEvent>>,
}

/// Directory-backed disk layer.
///
/// File watching itself (inotify and friends) lives outside this crate;
/// whatever watches the filesystem reports changes through
/// [`DirectoryManager::notify_pledge_added`] /
/// [`DirectoryManager::notify_pledge_removed`], and everything this
/// process writes itself is reported the same way.
pub struct DirectoryManager {
    base_dir: PathBuf,
    inner: Mutex<DirInner>,
}

impl DirectoryManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        let manager = DirectoryManager {
            base_dir,
            inner: Mutex::new(DirInner {
                records: HashMap::new(),
                subscribers: Vec::new(),
            }),
        };
        manager.scan_directory()?;
        Ok(manager)
    }

    /// Load every project file (and its pledge siblings) already present
    /// in the managed directory.
    fn scan_directory(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(PROJECT_FILE_EXTENSION) {
                match self.load_project_file(&path) {
                    Ok(project) => {
                        info!(title = %project.title, "loaded project from {}", path.display())
                    }
                    Err(err) => warn!("skipping unreadable project {}: {err}", path.display()),
                }
            }
        }
        Ok(())
    }

    fn load_project_file(&self, path: &Path) -> io::Result<Project> {
        let bytes = fs::read(path)?;
        let project: Project = model::decode(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let dir = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let pledges = load_sibling_pledges(&dir, &project.id);
        let mut inner = self.inner.lock().unwrap();
        let record = ProjectRecord {
            project: project.clone(),
            dir,
            state: ProjectStateInfo::default(),
            pledges: pledges.clone(),
        };
        inner.records.insert(project.id, record);
        inner.publish(DiskEvent::ProjectAdded(project.clone()));
        for pledge in pledges {
            inner.publish(DiskEvent::PledgeAdded {
                project: project.id,
                pledge,
            });
        }
        Ok(project)
    }

    /// Report a pledge file the watcher saw appear. Also invoked for our
    /// own writes so every pledge flows through one path.
    pub fn notify_pledge_added(&self, project: &ProjectId, pledge: Pledge) {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.records.get_mut(project) else {
            warn!("pledge for unknown project {project}");
            return;
        };
        if record.pledges.insert(pledge.clone()) {
            inner.publish(DiskEvent::PledgeAdded {
                project: *project,
                pledge,
            });
        }
    }

    /// Report a pledge file the watcher saw disappear.
    pub fn notify_pledge_removed(&self, project: &ProjectId, pledge: &Pledge) {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.records.get_mut(project) else {
            return;
        };
        if record.pledges.remove(pledge) {
            inner.publish(DiskEvent::PledgeRemoved {
                project: *project,
                pledge: pledge.clone(),
            });
        }
    }

    /// Report a project file the watcher saw disappear.
    pub fn notify_project_removed(&self, project: &ProjectId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.remove(project) {
            inner.publish(DiskEvent::ProjectRemoved(record.project));
        }
    }
}

impl DirInner {
    fn publish(&mut self, event: DiskEvent) {
        self.subscribers.retain(|s| s.send(event.clone()).is_ok());
    }
}

fn load_sibling_pledges(dir: &Path, project: &ProjectId) -> HashSet<Pledge> {
    let mut pledges = HashSet::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return pledges;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(PLEDGE_FILE_EXTENSION) {
            continue;
        }
        match fs::read(&path).and_then(|bytes| {
            model::decode::<Pledge>(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        }) {
            Ok(pledge) if pledge.project_id == *project => {
                pledges.insert(pledge);
            }
            Ok(_) => {}
            Err(err) => warn!("skipping unreadable pledge {}: {err}", path.display()),
        }
    }
    pledges
}

impl DiskManager for DirectoryManager {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DiskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }

    fn projects(&self) -> Vec<Project> {
        self.inner
            .lock()
            .unwrap()
            .records
            .values()
            .map(|r| r.project.clone())
            .collect()
    }

    fn pledges_for(&self, project: &ProjectId) -> Vec<Pledge> {
        self.inner
            .lock()
            .unwrap()
            .records
            .get(project)
            .map(|r| r.pledges.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn project_state(&self, project: &ProjectId) -> ProjectStateInfo {
        self.inner
            .lock()
            .unwrap()
            .records
            .get(project)
            .map(|r| r.state.clone())
            .unwrap_or_default()
    }

    fn set_project_state(&self, project: &ProjectId, info: ProjectStateInfo) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.get_mut(project) {
            record.state = info;
        }
    }

    fn project_for_claim(&self, tx: &Transaction) -> Option<Project> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .values()
            .map(|r| &r.project)
            .find(|p| !p.outputs.is_empty() && p.is_claim(tx))
            .cloned()
    }

    fn save_project(&self, project: &Project) -> io::Result<Project> {
        let path = self
            .base_dir
            .join(format!("{}.{PROJECT_FILE_EXTENSION}", project.id.to_hex()));
        atomic_write(&path, &model::encode(project))?;
        let mut inner = self.inner.lock().unwrap();
        if !inner.records.contains_key(&project.id) {
            inner.records.insert(
                project.id,
                ProjectRecord {
                    project: project.clone(),
                    dir: self.base_dir.clone(),
                    state: ProjectStateInfo::default(),
                    pledges: HashSet::new(),
                },
            );
            inner.publish(DiskEvent::ProjectAdded(project.clone()));
        }
        Ok(project.clone())
    }

    fn add_project_file(&self, path: &Path) -> io::Result<Project> {
        self.load_project_file(path)
    }

    fn save_pledge(&self, project: &ProjectId, pledge: &Pledge) -> io::Result<PathBuf> {
        let dir = {
            let inner = self.inner.lock().unwrap();
            inner
                .records
                .get(project)
                .map(|r| r.dir.clone())
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown project"))?
        };
        let bytes = model::encode(pledge);
        let path = dir.join(format!(
            "{}.{PLEDGE_FILE_EXTENSION}",
            crate::model::Sha256Hash::of(&bytes).to_hex()
        ));
        atomic_write(&path, &bytes)?;
        self.notify_pledge_added(project, pledge.clone());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Network, PledgeDetails, Sha256Hash, TxOutput};
    use tempfile::TempDir;

    fn test_project() -> Project {
        Project::new(
            "community well".into(),
            "dig it".into(),
            vec![TxOutput {
                value: 50_000_000,
                script_pubkey: vec![0xA9, 0x14, 0x01],
            }],
            None,
            Network::Regtest,
        )
    }

    fn test_pledge(project: &Project) -> Pledge {
        Pledge {
            project_id: project.id,
            main_tx: Transaction {
                inputs: vec![crate::model::TxInput {
                    outpoint: crate::model::OutPoint {
                        txid: Sha256Hash([7; 32]),
                        vout: 0,
                    },
                    script_sig: vec![0x47],
                    sighash: crate::model::SighashMode::AllAnyoneCanPay,
                }],
                outputs: project.outputs.clone(),
                lock_time: 0,
            },
            dependencies: vec![],
            input_claims: vec![crate::model::InputClaim {
                outpoint: crate::model::OutPoint {
                    txid: Sha256Hash([7; 32]),
                    vout: 0,
                },
                value: 10_000,
                script_pubkey: vec![0x76],
            }],
            total_input_value: 10_000,
            orig_hash: None,
            details: PledgeDetails::default(),
        }
    }

    #[test]
    fn saved_pledge_lands_under_its_hash_with_no_tmp_left() {
        let dir = TempDir::new().unwrap();
        let manager = DirectoryManager::new(dir.path()).unwrap();
        let project = test_project();
        manager.save_project(&project).unwrap();
        let pledge = test_pledge(&project);
        let path = manager.save_pledge(&project.id, &pledge).unwrap();

        let expected_stem = Sha256Hash::of(&model::encode(&pledge)).to_hex();
        assert_eq!(path.file_stem().unwrap().to_str().unwrap(), expected_stem);
        assert!(path.exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn save_pledge_echoes_a_disk_event_once() {
        let dir = TempDir::new().unwrap();
        let manager = DirectoryManager::new(dir.path()).unwrap();
        let project = test_project();
        manager.save_project(&project).unwrap();
        let mut events = manager.subscribe();
        let pledge = test_pledge(&project);
        manager.save_pledge(&project.id, &pledge).unwrap();
        // Re-reporting the same pledge must not produce a second event.
        manager.notify_pledge_added(&project.id, pledge.clone());

        match events.try_recv().unwrap() {
            DiskEvent::PledgeAdded { pledge: got, .. } => assert_eq!(got, pledge),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn scan_picks_up_projects_and_their_pledges() {
        let dir = TempDir::new().unwrap();
        let project = test_project();
        let pledge = test_pledge(&project);
        {
            let first = DirectoryManager::new(dir.path()).unwrap();
            first.save_project(&project).unwrap();
            first.save_pledge(&project.id, &pledge).unwrap();
        }
        let reopened = DirectoryManager::new(dir.path()).unwrap();
        assert_eq!(reopened.projects(), vec![project.clone()]);
        assert_eq!(reopened.pledges_for(&project.id), vec![pledge]);
    }

    #[test]
    fn claim_lookup_matches_project_targets() {
        let dir = TempDir::new().unwrap();
        let manager = DirectoryManager::new(dir.path()).unwrap();
        let project = test_project();
        manager.save_project(&project).unwrap();
        let claim = Transaction {
            inputs: vec![],
            outputs: project.outputs.clone(),
            lock_time: 0,
        };
        assert_eq!(manager.project_for_claim(&claim), Some(project));
        let miss = Transaction {
            inputs: vec![],
            outputs: vec![TxOutput {
                value: 1,
                script_pubkey: vec![0x99],
            }],
            lock_time: 0,
        };
        assert!(manager.project_for_claim(&miss).is_none());
    }
}
