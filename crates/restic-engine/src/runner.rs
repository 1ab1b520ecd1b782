use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::backend::{BackendConfig, RepositoryRef, SecretStore, StorageLookup, resolve};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::ledger::{Ledger, StaleSnapshot};
use crate::lock::{self, LockWaitOptions, PodStatusLookup};
use crate::pool::{PoolOptions, WorkerPool};
use crate::restic::{
    BackupOptions, DumpOptions, RepositoryStats, ResticWrapper, RestoreOptions, RetentionPolicy,
    SnapshotEngine, SnapshotStats,
};

/// Hands out an engine session per task so concurrent targets never share
/// process state.
pub trait EngineFactory: Send + Sync {
    fn session(&self, cancel: &CancelToken) -> Arc<dyn SnapshotEngine>;
}

impl EngineFactory for ResticWrapper {
    fn session(&self, cancel: &CancelToken) -> Arc<dyn SnapshotEngine> {
        Arc::new(self.copy().with_cancel(cancel.clone()))
    }
}

/// Everything the runner talks to besides the filesystem.
#[derive(Clone)]
pub struct Collaborators {
    pub storages: Arc<dyn StorageLookup>,
    pub secrets: Arc<dyn SecretStore>,
    pub pods: Arc<dyn PodStatusLookup>,
    pub engines: Arc<dyn EngineFactory>,
}

#[derive(Clone)]
pub struct RunOptions {
    pub scratch_dir: PathBuf,
    pub pool: PoolOptions,
    pub lock_wait: LockWaitOptions,
    pub init_missing: bool,
    /// Cancel the remaining targets after the first failure.
    pub fail_fast: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("restic-engine"),
            pool: PoolOptions::default(),
            lock_wait: LockWaitOptions::default(),
            init_missing: true,
            fail_fast: false,
        }
    }
}

/// Result for one repository. Failures of one target never hide the others.
#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome<T> {
    pub repository: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub error_kind: Option<crate::error::ErrorKind>,
}

impl<T> TargetOutcome<T> {
    pub fn from_result(repository: &str, r: Result<T>) -> Self {
        match r {
            Ok(v) => Self {
                repository: repository.to_string(),
                value: Some(v),
                error: None,
                error_kind: None,
            },
            Err(e) => Self {
                repository: repository.to_string(),
                value: None,
                error: Some(e.to_string()),
                error_kind: Some(e.kind()),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct BackupTarget {
    pub repo: RepositoryRef,
    pub opts: BackupOptions,
}

#[derive(Debug, Clone)]
pub enum RestoreAction {
    Restore(RestoreOptions),
    Dump(DumpOptions),
}

#[derive(Debug, Clone)]
pub struct RestoreTarget {
    pub repo: RepositoryRef,
    pub action: RestoreAction,
}

#[derive(Debug, Clone)]
pub struct RetentionTarget {
    pub repo: RepositoryRef,
    pub policy_ref: String,
    pub policy: RetentionPolicy,
}

fn resolve_target(
    c: &Collaborators,
    repo: &RepositoryRef,
    opts: &RunOptions,
) -> Result<BackendConfig> {
    resolve(repo, c.storages.as_ref(), c.secrets.as_ref(), &opts.scratch_dir)
}

fn ensure_repository(
    engine: &dyn SnapshotEngine,
    b: &BackendConfig,
    init_missing: bool,
) -> Result<()> {
    if engine.repository_exists(b)? {
        return Ok(());
    }
    if !init_missing {
        return Err(Error::config(format!(
            "repository '{}' is not initialized",
            b.name
        )));
    }
    engine.initialize_repository(b)
}

fn backup_one(
    c: &Collaborators,
    t: &BackupTarget,
    opts: &RunOptions,
    cancel: &CancelToken,
) -> Result<Vec<SnapshotStats>> {
    let b = resolve_target(c, &t.repo, opts)?;
    let engine = c.engines.session(cancel);
    ensure_repository(engine.as_ref(), &b, opts.init_missing)?;
    lock::ensure_no_exclusive_lock(engine.as_ref(), &b, c.pods.as_ref(), opts.lock_wait, cancel)?;
    engine.backup(&b, &t.opts)
}

fn restore_one(
    c: &Collaborators,
    t: &RestoreTarget,
    opts: &RunOptions,
    cancel: &CancelToken,
) -> Result<()> {
    let b = resolve_target(c, &t.repo, opts)?;
    let engine = c.engines.session(cancel);
    match &t.action {
        RestoreAction::Restore(r) => engine.restore(&b, r),
        RestoreAction::Dump(d) => engine.dump(&b, d),
    }
}

fn check_one(
    c: &Collaborators,
    repo: &RepositoryRef,
    opts: &RunOptions,
    cancel: &CancelToken,
) -> Result<RepositoryStats> {
    let b = resolve_target(c, repo, opts)?;
    let engine = c.engines.session(cancel);
    engine.verify_repository_integrity(&b)
}

/// Fan `targets` out on a worker pool and collect one outcome per target,
/// in input order.
fn fan_out<T, R, F>(
    targets: Vec<T>,
    name: impl Fn(&T) -> String,
    opts: &RunOptions,
    cancel: &CancelToken,
    work: F,
) -> Vec<TargetOutcome<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(&T, &CancelToken) -> Result<R> + Send + Sync + 'static,
{
    let pool = WorkerPool::new(cancel, opts.pool.clone());
    let results = Arc::new(Mutex::new(BTreeMap::<usize, Result<R>>::new()));
    let work = Arc::new(work);
    let names: Vec<String> = targets.iter().map(&name).collect();

    for (i, target) in targets.into_iter().enumerate() {
        let results = Arc::clone(&results);
        let work = Arc::clone(&work);
        let fail_fast = opts.fail_fast;
        let repo = names[i].clone();
        let admitted = pool.run(move |token| {
            let r = work(&target, &token);
            let task_err = match &r {
                Err(e) => {
                    error!(repo = %repo, error = %e, "target failed");
                    fail_fast.then(|| e.clone())
                }
                Ok(_) => {
                    info!(repo = %repo, "target finished");
                    None
                }
            };
            if let Ok(mut m) = results.lock() {
                m.insert(i, r);
            }
            match task_err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        });
        if !admitted {
            warn!(repo = %names[i], "target not started; pool cancelled");
        }
    }

    let pool_err = pool.wait().err();
    let mut done = results
        .lock()
        .map(|mut m| std::mem::take(&mut *m))
        .unwrap_or_default();
    names
        .iter()
        .enumerate()
        .map(|(i, repo)| {
            let r = done.remove(&i).unwrap_or_else(|| {
                let reason = pool_err.clone().unwrap_or_else(Error::cancelled);
                Err(Error::new(
                    reason.kind(),
                    format!("not completed: {reason}"),
                ))
            });
            TargetOutcome::from_result(repo, r)
        })
        .collect()
}

/// Back up every target: resolve, initialize if missing, wait out foreign
/// exclusive locks, then run the backup.
pub fn run_backup_targets(
    c: &Collaborators,
    targets: Vec<BackupTarget>,
    opts: &RunOptions,
    cancel: &CancelToken,
) -> Vec<TargetOutcome<Vec<SnapshotStats>>> {
    let c2 = c.clone();
    let o2 = opts.clone();
    fan_out(
        targets,
        |t| t.repo.name.clone(),
        opts,
        cancel,
        move |t, token| backup_one(&c2, t, &o2, token),
    )
}

pub fn run_restore_targets(
    c: &Collaborators,
    targets: Vec<RestoreTarget>,
    opts: &RunOptions,
    cancel: &CancelToken,
) -> Vec<TargetOutcome<()>> {
    let c2 = c.clone();
    let o2 = opts.clone();
    fan_out(
        targets,
        |t| t.repo.name.clone(),
        opts,
        cancel,
        move |t, token| restore_one(&c2, t, &o2, token),
    )
}

pub fn run_integrity_checks(
    c: &Collaborators,
    repos: Vec<RepositoryRef>,
    opts: &RunOptions,
    cancel: &CancelToken,
) -> Vec<TargetOutcome<RepositoryStats>> {
    let c2 = c.clone();
    let o2 = opts.clone();
    fan_out(
        repos,
        |r| r.name.clone(),
        opts,
        cancel,
        move |r, token| check_one(&c2, r, &o2, token),
    )
}

fn retention_one(
    c: &Collaborators,
    t: &RetentionTarget,
    opts: &RunOptions,
    cancel: &CancelToken,
) -> Result<Vec<StaleSnapshot>> {
    let b = resolve_target(c, &t.repo, opts)?;
    let engine = c.engines.session(cancel);
    lock::ensure_no_exclusive_lock(engine.as_ref(), &b, c.pods.as_ref(), opts.lock_wait, cancel)?;
    let removed = engine.apply_retention_policy(&b, &t.policy)?;
    Ok(removed
        .into_iter()
        .map(|s| StaleSnapshot {
            repository: b.name.clone(),
            name: s.id,
            namespace: b.namespace.clone(),
        })
        .collect())
}

/// Write one repository's ledger entries, status first. Every write is
/// attempted; the first failure is returned.
fn record_retention(
    ledger: &Ledger,
    t: &RetentionTarget,
    result: &Result<Vec<StaleSnapshot>>,
) -> Result<()> {
    let repo = t.repo.name.as_str();
    let err = result.as_ref().err();
    let stale = result.as_ref().map(Vec::as_slice).unwrap_or_default();
    let writes = [
        ledger.write_retention_policy_status(repo, &t.policy_ref, err),
        ledger.write_prune_error_to_file(repo, err),
        ledger
            .init_stale_snapshots_file(repo)
            .and_then(|()| ledger.add_snapshot_list_to_file(stale)),
    ];
    writes.into_iter().find_map(Result::err).map_or(Ok(()), Err)
}

/// Apply retention policies one repository at a time and record the results
/// in the ledger. Runs sequentially because the ledger has a single writer.
/// A failed ledger write fails that repository's outcome but not the others.
pub fn apply_retention_policies(
    c: &Collaborators,
    targets: &[RetentionTarget],
    ledger: &Ledger,
    opts: &RunOptions,
    cancel: &CancelToken,
) -> Vec<TargetOutcome<usize>> {
    let mut out = Vec::with_capacity(targets.len());
    for t in targets {
        let repo = t.repo.name.as_str();
        if let Err(e) = cancel.check() {
            out.push(TargetOutcome::from_result(repo, Err(e)));
            continue;
        }
        let result = retention_one(c, t, opts, cancel);
        let recorded = record_retention(ledger, t, &result);
        let r = match (result, recorded) {
            (Ok(stale), Ok(())) => Ok(stale.len()),
            (Ok(_), Err(le)) => Err(le.context("retention applied but the ledger update failed")),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(le)) => {
                warn!(repo = %repo, error = %le, "failed to record retention failure");
                Err(e)
            }
        };
        match &r {
            Ok(n) => info!(repo = %repo, removed = n, "retention applied"),
            Err(e) => error!(repo = %repo, error = %e, "retention failed"),
        }
        out.push(TargetOutcome::from_result(repo, r));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ledger::RetentionPhase;
    use crate::lock::PodPhase;
    use crate::testing::{FakeEngine, FakePods, local_repo, local_store, lock, snapshot};

    struct Shared(Arc<FakeEngine>);

    impl EngineFactory for Shared {
        fn session(&self, _cancel: &CancelToken) -> Arc<dyn SnapshotEngine> {
            Arc::clone(&self.0) as Arc<dyn SnapshotEngine>
        }
    }

    fn collaborators(
        root: &std::path::Path,
        engine: Arc<FakeEngine>,
        pods: FakePods,
    ) -> Collaborators {
        let store = Arc::new(local_store(root));
        Collaborators {
            storages: store.clone(),
            secrets: store,
            pods: Arc::new(pods),
            engines: Arc::new(Shared(engine)),
        }
    }

    fn opts(root: &std::path::Path) -> RunOptions {
        RunOptions {
            scratch_dir: root.join("scratch"),
            pool: PoolOptions::default().concurrency(2),
            ..Default::default()
        }
    }

    fn backup_target(name: &str) -> BackupTarget {
        BackupTarget {
            repo: local_repo(name),
            opts: BackupOptions {
                paths: vec!["/data".into()],
                ..Default::default()
            },
        }
    }

    #[test]
    fn partial_failure_is_reported_per_target() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::default());
        engine.mark_existing("a");
        engine.fail_op("backup:b");
        let c = collaborators(tmp.path(), Arc::clone(&engine), FakePods::new(vec![]));
        let mut bad_storage = backup_target("c");
        bad_storage.repo.storage = "missing".into();

        let out = run_backup_targets(
            &c,
            vec![backup_target("a"), backup_target("b"), bad_storage],
            &opts(tmp.path()),
            &CancelToken::new(),
        );
        assert_eq!(
            out.iter().map(|o| o.repository.as_str()).collect::<Vec<_>>(),
            ["a", "b", "c"]
        );
        assert!(out[0].is_ok());
        assert_eq!(out[0].value.as_ref().expect("stats")[0].snapshot_id, "snap-a");
        assert_eq!(out[1].error_kind, Some(ErrorKind::Process));
        assert_eq!(out[2].error_kind, Some(ErrorKind::Config));
        // "b" did not exist yet and was initialized before its backup.
        assert_eq!(engine.count("init"), 1);
        assert!(!engine.calls().contains(&"backup:c".to_string()));
    }

    #[test]
    fn fail_fast_cancels_remaining_targets() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::default());
        engine.fail_op("backup");
        let c = collaborators(tmp.path(), Arc::clone(&engine), FakePods::new(vec![]));
        let mut o = opts(tmp.path());
        o.fail_fast = true;
        o.pool = PoolOptions::default();
        let targets = (0..5).map(|i| backup_target(&format!("r{i}"))).collect();
        let out = run_backup_targets(&c, targets, &o, &CancelToken::new());
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|t| !t.is_ok()));
        assert!(engine.count("backup") < 5);
        assert!(out[4].error.as_deref().unwrap_or_default().contains("not completed"));
    }

    #[test]
    fn backup_waits_for_stale_lock_and_unlocks() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::default());
        engine.mark_existing("a");
        engine.add_lock("f".repeat(64), lock(true, "previous-job"));
        let c = collaborators(
            tmp.path(),
            Arc::clone(&engine),
            FakePods::new(vec![Ok(Some(PodPhase::Failed))]),
        );
        let out = run_backup_targets(
            &c,
            vec![backup_target("a")],
            &opts(tmp.path()),
            &CancelToken::new(),
        );
        assert!(out[0].is_ok(), "{:?}", out[0].error);
        let calls = engine.calls();
        let unlock = calls.iter().position(|c| c == "unlock:a").expect("unlock");
        let backup = calls.iter().position(|c| c == "backup:a").expect("backup");
        assert!(unlock < backup);
    }

    #[test]
    fn restore_and_dump_targets() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::default());
        let c = collaborators(tmp.path(), Arc::clone(&engine), FakePods::new(vec![]));
        let out = run_restore_targets(
            &c,
            vec![
                RestoreTarget {
                    repo: local_repo("a"),
                    action: RestoreAction::Restore(RestoreOptions {
                        target: tmp.path().join("out"),
                        ..Default::default()
                    }),
                },
                RestoreTarget {
                    repo: local_repo("b"),
                    action: RestoreAction::Dump(DumpOptions {
                        path: "/stdin".into(),
                        dest_file: Some(tmp.path().join("dump")),
                        ..Default::default()
                    }),
                },
            ],
            &opts(tmp.path()),
            &CancelToken::new(),
        );
        assert!(out.iter().all(TargetOutcome::is_ok));
        assert_eq!(engine.count("restore"), 1);
        assert_eq!(engine.count("dump"), 1);
    }

    #[test]
    fn integrity_checks_report_stats() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::default());
        let c = collaborators(tmp.path(), engine, FakePods::new(vec![]));
        let out = run_integrity_checks(
            &c,
            vec![local_repo("a"), local_repo("b")],
            &opts(tmp.path()),
            &CancelToken::new(),
        );
        assert!(out.iter().all(|o| o.value.as_ref().is_some_and(|s| s.integrity)));
    }

    #[test]
    fn retention_writes_the_ledger() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::default());
        engine.set_removes(vec![snapshot("aaaa1111"), snapshot("bbbb2222")]);
        engine.fail_op("forget:b");
        let c = collaborators(tmp.path(), Arc::clone(&engine), FakePods::new(vec![]));
        let ledger = Ledger::new(tmp.path().join("ledger"));
        let policy = RetentionPolicy {
            keep_last: Some(1),
            ..Default::default()
        };
        let targets = ["a", "b"].map(|n| RetentionTarget {
            repo: local_repo(n),
            policy_ref: "keep-one".into(),
            policy: policy.clone(),
        });

        let out =
            apply_retention_policies(&c, &targets, &ledger, &opts(tmp.path()), &CancelToken::new());
        assert_eq!(out[0].value, Some(2));
        assert!(!out[1].is_ok());

        let stale = ledger.read_stale_snapshots().expect("stale");
        assert_eq!(
            stale["a"].iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            ["aaaa1111", "bbbb2222"]
        );
        assert!(stale["b"].is_empty());
        let errors = ledger.read_prune_errors().expect("errors");
        assert!(errors["a"].is_empty());
        assert_eq!(errors["b"].len(), 1);
        let status = ledger.read_retention_policy_statuses().expect("status");
        assert_eq!(status["a"].phase, RetentionPhase::Applied);
        assert_eq!(status["b"].phase, RetentionPhase::FailedToApply);
        assert_eq!(status["b"].policy_ref, "keep-one");
    }

    #[test]
    fn ledger_failure_does_not_skip_later_repositories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::default());
        engine.set_removes(vec![snapshot("aaaa1111")]);
        let c = collaborators(tmp.path(), Arc::clone(&engine), FakePods::new(vec![]));
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, "x").expect("write");
        let ledger = Ledger::new(blocker.join("ledger"));
        let targets = ["a", "b"].map(|n| RetentionTarget {
            repo: local_repo(n),
            policy_ref: "keep-one".into(),
            policy: RetentionPolicy {
                keep_last: Some(1),
                ..Default::default()
            },
        });

        let out =
            apply_retention_policies(&c, &targets, &ledger, &opts(tmp.path()), &CancelToken::new());
        assert_eq!(engine.count("forget"), 2);
        for o in &out {
            assert_eq!(o.error_kind, Some(ErrorKind::Io), "{:?}", o.error);
            assert!(o.error.as_deref().is_some_and(|e| e.contains("ledger")));
        }
    }

    #[test]
    fn cancelled_retention_leaves_the_ledger_alone() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::default());
        let c = collaborators(tmp.path(), Arc::clone(&engine), FakePods::new(vec![]));
        let ledger = Ledger::new(tmp.path().join("ledger"));
        let targets = [RetentionTarget {
            repo: local_repo("a"),
            policy_ref: "keep-one".into(),
            policy: RetentionPolicy::default(),
        }];
        let token = CancelToken::new();
        token.cancel();

        let out = apply_retention_policies(&c, &targets, &ledger, &opts(tmp.path()), &token);
        assert_eq!(out[0].error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(engine.count("forget"), 0);
        assert!(ledger.read_retention_policy_statuses().expect("status").is_empty());
    }
}
