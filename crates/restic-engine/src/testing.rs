//! In-memory collaborators shared by unit tests.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{TimeZone, Utc};

use crate::backend::secrets::{self, Secret};
use crate::backend::tests::MapStore;
use crate::backend::{BackendConfig, LocalSpec, RepositoryRef, StorageSpec, resolve};
use crate::error::{Error, Result};
use crate::lock::{PodPhase, PodStatusLookup};
use crate::restic::{
    BackupOptions, DumpOptions, LockStats, RepositoryStats, RestoreOptions, RetentionPolicy,
    Snapshot, SnapshotEngine, SnapshotStats,
};

pub(crate) fn local_store(root: &Path) -> MapStore {
    let mut store = MapStore::default();
    store.storages.insert(
        "vol".into(),
        StorageSpec {
            local: Some(LocalSpec {
                mount_path: root.join("repos").to_string_lossy().to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    store.secrets.insert(
        "enc".into(),
        Secret::new("enc").with(secrets::RESTIC_PASSWORD, "pw"),
    );
    store
}

pub(crate) fn local_repo(name: &str) -> RepositoryRef {
    RepositoryRef {
        name: name.into(),
        storage: "vol".into(),
        directory: name.into(),
        encryption_secret: "enc".into(),
        namespace: "demo".into(),
    }
}

pub(crate) fn local_backend(root: &Path, name: &str) -> BackendConfig {
    let store = local_store(root);
    resolve(&local_repo(name), &store, &store, &root.join("scratch")).expect("resolve")
}

pub(crate) fn lock(exclusive: bool, hostname: &str) -> LockStats {
    LockStats {
        time: Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("time"),
        exclusive,
        hostname: hostname.into(),
        username: "root".into(),
        pid: 1,
        uid: 0,
        gid: 0,
    }
}

pub(crate) fn snapshot(id: &str) -> Snapshot {
    Snapshot {
        id: id.into(),
        short_id: id.chars().take(8).collect(),
        time: Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("time"),
        hostname: "h".into(),
        paths: vec!["/data".into()],
        tags: None,
    }
}

/// Records every call as `op:backend` and fails ops listed in `failing`
/// (either `op` or `op:backend`).
#[derive(Default)]
pub(crate) struct FakeEngine {
    calls: Mutex<Vec<String>>,
    locks: Mutex<Vec<(String, LockStats)>>,
    existing: Mutex<BTreeSet<String>>,
    failing: Mutex<BTreeSet<String>>,
    removes: Mutex<Vec<Snapshot>>,
}

impl FakeEngine {
    pub fn add_lock(&self, id: String, stats: LockStats) {
        self.locks.lock().expect("locks").push((id, stats));
    }

    pub fn fail_op(&self, op: &str) {
        self.failing.lock().expect("failing").insert(op.into());
    }

    pub fn mark_existing(&self, backend: &str) {
        self.existing.lock().expect("existing").insert(backend.into());
    }

    pub fn set_removes(&self, snaps: Vec<Snapshot>) {
        *self.removes.lock().expect("removes") = snaps;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(':').next() == Some(op))
            .count()
    }

    fn call(&self, op: &str, b: &BackendConfig) -> Result<()> {
        let key = format!("{op}:{}", b.name);
        self.calls.lock().expect("calls").push(key.clone());
        let failing = self.failing.lock().expect("failing");
        if failing.contains(op) || failing.contains(&key) {
            return Err(Error::process(format!("{key} failed")));
        }
        Ok(())
    }
}

impl SnapshotEngine for FakeEngine {
    fn initialize_repository(&self, b: &BackendConfig) -> Result<()> {
        self.call("init", b)?;
        self.mark_existing(&b.name);
        Ok(())
    }

    fn repository_exists(&self, b: &BackendConfig) -> Result<bool> {
        self.call("exists", b)?;
        Ok(self.existing.lock().expect("existing").contains(&b.name))
    }

    fn backup(&self, b: &BackendConfig, _opts: &BackupOptions) -> Result<Vec<SnapshotStats>> {
        self.call("backup", b)?;
        Ok(vec![SnapshotStats {
            snapshot_id: format!("snap-{}", b.name),
            ..Default::default()
        }])
    }

    fn restore(&self, b: &BackendConfig, _opts: &RestoreOptions) -> Result<()> {
        self.call("restore", b)
    }

    fn dump(&self, b: &BackendConfig, _opts: &DumpOptions) -> Result<()> {
        self.call("dump", b)
    }

    fn verify_repository_integrity(&self, b: &BackendConfig) -> Result<RepositoryStats> {
        self.call("check", b)?;
        Ok(RepositoryStats {
            integrity: true,
            size: "1.000 KiB".into(),
            snapshot_count: 1,
            snapshots_removed_by_last_clean_up: 0,
        })
    }

    fn list_snapshots(&self, b: &BackendConfig, _tags: &[String]) -> Result<Vec<Snapshot>> {
        self.call("snapshots", b)?;
        Ok(Vec::new())
    }

    fn delete_snapshots(&self, b: &BackendConfig, _ids: &[String]) -> Result<()> {
        self.call("delete", b)
    }

    fn apply_retention_policy(
        &self,
        b: &BackendConfig,
        _policy: &RetentionPolicy,
    ) -> Result<Vec<Snapshot>> {
        self.call("forget", b)?;
        Ok(self.removes.lock().expect("removes").clone())
    }

    fn list_locks(&self, b: &BackendConfig) -> Result<Vec<String>> {
        self.call("list_locks", b)?;
        Ok(self
            .locks
            .lock()
            .expect("locks")
            .iter()
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn lock_stats(&self, b: &BackendConfig, lock_id: &str) -> Result<Option<LockStats>> {
        self.call("lock_stats", b)?;
        Ok(self
            .locks
            .lock()
            .expect("locks")
            .iter()
            .find(|(id, _)| id == lock_id)
            .map(|(_, s)| s.clone()))
    }

    fn unlock(&self, b: &BackendConfig) -> Result<()> {
        self.call("unlock", b)?;
        self.locks.lock().expect("locks").clear();
        Ok(())
    }
}

/// Replays scripted answers; the last one repeats.
pub(crate) struct FakePods {
    answers: Mutex<VecDeque<Result<Option<PodPhase>>>>,
    polls: AtomicUsize,
}

impl FakePods {
    pub fn new(answers: Vec<Result<Option<PodPhase>>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            polls: AtomicUsize::new(0),
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl PodStatusLookup for FakePods {
    fn pod_phase(&self, _namespace: &str, _name: &str) -> Result<Option<PodPhase>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut q = self.answers.lock().expect("answers");
        if q.len() > 1 {
            return q.pop_front().unwrap_or(Ok(None));
        }
        q.front().cloned().unwrap_or(Ok(None))
    }
}
