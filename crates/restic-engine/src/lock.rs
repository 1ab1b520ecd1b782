use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::BackendConfig;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::restic::{LockStats, SnapshotEngine};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// The pod ran to completion and can no longer hold a lock.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Pod status by name.
pub trait PodStatusLookup: Send + Sync {
    /// `Ok(None)` when the pod does not exist.
    fn pod_phase(&self, namespace: &str, name: &str) -> Result<Option<PodPhase>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockWaitOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for LockWaitOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

/// How the repository was cleared for mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResolution {
    NoLock,
    /// The holder pod no longer exists; its lock was removed.
    HolderGone { lock_id: String, pod: String },
    /// The holder pod finished without releasing; its lock was removed.
    HolderFinished {
        lock_id: String,
        pod: String,
        phase: PodPhase,
    },
}

/// First exclusive lock in the repository, if any. At most one can exist.
pub fn find_exclusive_lock(
    engine: &dyn SnapshotEngine,
    backend: &BackendConfig,
) -> Result<Option<(String, LockStats)>> {
    let ids = engine.list_locks(backend).map_err(|e| {
        Error::lock_query(format!(
            "backend '{}': failed to list locks: {e}",
            backend.name
        ))
    })?;
    for id in ids {
        let stats = match engine.lock_stats(backend, &id) {
            Ok(Some(s)) => s,
            // Released between listing and reading.
            Ok(None) => continue,
            Err(e) => {
                return Err(Error::lock_query(format!(
                    "backend '{}': failed to read lock {id}: {e}",
                    backend.name
                )));
            }
        };
        if stats.exclusive {
            return Ok(Some((id, stats)));
        }
    }
    Ok(None)
}

/// Make sure no other process holds an exclusive lock on the repository
/// before it is mutated. Waits for a live holder and clears locks left behind
/// by holders that are gone.
pub fn ensure_no_exclusive_lock(
    engine: &dyn SnapshotEngine,
    backend: &BackendConfig,
    pods: &dyn PodStatusLookup,
    opts: LockWaitOptions,
    cancel: &CancelToken,
) -> Result<LockResolution> {
    let Some((lock_id, stats)) = find_exclusive_lock(engine, backend)? else {
        debug!(backend = %backend.name, "no exclusive lock");
        return Ok(LockResolution::NoLock);
    };
    let pod = stats.hostname.trim().to_string();
    info!(
        backend = %backend.name,
        lock_id = %lock_id,
        pod = %pod,
        "repository is exclusively locked; waiting for holder"
    );

    let started = Instant::now();
    let mut polls = 0u32;
    loop {
        polls += 1;
        let phase = pods
            .pod_phase(&backend.namespace, &pod)
            .map_err(|e| {
                Error::lock_query(format!(
                    "backend '{}': failed to get status of lock holder '{pod}': {e}",
                    backend.name
                ))
            })?;
        match phase {
            None => {
                info!(
                    backend = %backend.name,
                    lock_id = %lock_id,
                    pod = %pod,
                    "lock holder is gone; unlocking"
                );
                engine.unlock(backend)?;
                return Ok(LockResolution::HolderGone { lock_id, pod });
            }
            Some(phase) if phase.is_finished() => {
                info!(
                    backend = %backend.name,
                    lock_id = %lock_id,
                    pod = %pod,
                    phase = %phase,
                    "lock holder finished; unlocking"
                );
                engine.unlock(backend)?;
                return Ok(LockResolution::HolderFinished {
                    lock_id,
                    pod,
                    phase,
                });
            }
            Some(phase) => {
                debug!(
                    backend = %backend.name,
                    pod = %pod,
                    phase = %phase,
                    polls,
                    "lock holder still active"
                );
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= opts.timeout {
            return Err(Error::lock_timeout(format!(
                "backend '{}': timed out after {polls} polls waiting for pod '{pod}' to release lock {lock_id}",
                backend.name
            )));
        }
        cancel.sleep(opts.interval.min(opts.timeout - elapsed))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{FakeEngine, FakePods, local_backend, lock};

    fn fast() -> LockWaitOptions {
        LockWaitOptions {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(60),
        }
    }

    #[test]
    fn no_lock_proceeds() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let b = local_backend(tmp.path(), "app");
        let engine = FakeEngine::default();
        engine.add_lock("1".repeat(64), lock(false, "reader"));
        let pods = FakePods::new(vec![]);
        let r = ensure_no_exclusive_lock(&engine, &b, &pods, fast(), &CancelToken::new())
            .expect("ensure");
        assert_eq!(r, LockResolution::NoLock);
        assert_eq!(pods.polls(), 0);
        assert_eq!(engine.count("unlock"), 0);
    }

    #[test]
    fn missing_holder_is_unlocked_without_waiting() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let b = local_backend(tmp.path(), "app");
        let engine = FakeEngine::default();
        engine.add_lock("a".repeat(64), lock(true, "old-backup-pod"));
        let pods = FakePods::new(vec![Ok(None)]);
        let opts = LockWaitOptions {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        };
        let start = Instant::now();
        let r = ensure_no_exclusive_lock(&engine, &b, &pods, opts, &CancelToken::new())
            .expect("ensure");
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(r, LockResolution::HolderGone { ref pod, .. } if pod == "old-backup-pod"));
        assert_eq!(engine.count("unlock"), 1);
        assert_eq!(pods.polls(), 1);
    }

    #[test]
    fn finished_holder_is_unlocked() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let b = local_backend(tmp.path(), "app");
        let engine = FakeEngine::default();
        engine.add_lock("b".repeat(64), lock(true, "job-pod"));
        let pods = FakePods::new(vec![
            Ok(Some(PodPhase::Running)),
            Ok(Some(PodPhase::Succeeded)),
        ]);
        let opts = LockWaitOptions {
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
        };
        let r = ensure_no_exclusive_lock(&engine, &b, &pods, opts, &CancelToken::new())
            .expect("ensure");
        assert!(matches!(
            r,
            LockResolution::HolderFinished {
                phase: PodPhase::Succeeded,
                ..
            }
        ));
        assert_eq!(pods.polls(), 2);
        assert_eq!(engine.count("unlock"), 1);
    }

    #[test]
    fn running_holder_times_out_after_polling() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let b = local_backend(tmp.path(), "app");
        let engine = FakeEngine::default();
        engine.add_lock("c".repeat(64), lock(true, "busy-pod"));
        let pods = FakePods::new(vec![Ok(Some(PodPhase::Running))]);
        let err = ensure_no_exclusive_lock(&engine, &b, &pods, fast(), &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
        assert!(pods.polls() >= 2, "polled {} times", pods.polls());
        assert_eq!(engine.count("unlock"), 0);
    }

    #[test]
    fn pod_query_error_is_distinct_from_timeout() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let b = local_backend(tmp.path(), "app");
        let engine = FakeEngine::default();
        engine.add_lock("d".repeat(64), lock(true, "pod"));
        let pods = FakePods::new(vec![Err(Error::msg("forbidden"))]);
        let err = ensure_no_exclusive_lock(&engine, &b, &pods, fast(), &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockQuery);
        assert!(err.to_string().contains("forbidden"), "{err}");
        assert_eq!(engine.count("unlock"), 0);
    }

    #[test]
    fn lock_listing_failure_is_a_query_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let b = local_backend(tmp.path(), "app");
        let engine = FakeEngine::default();
        engine.fail_op("list_locks");
        let pods = FakePods::new(vec![]);
        let err = ensure_no_exclusive_lock(&engine, &b, &pods, fast(), &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockQuery);
    }

    #[test]
    fn cancel_interrupts_wait() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let b = local_backend(tmp.path(), "app");
        let engine = FakeEngine::default();
        engine.add_lock("e".repeat(64), lock(true, "busy-pod"));
        let pods = FakePods::new(vec![Ok(Some(PodPhase::Pending))]);
        let token = CancelToken::new();
        token.cancel();
        let opts = LockWaitOptions {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        };
        let err = ensure_no_exclusive_lock(&engine, &b, &pods, opts, &token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn phase_parsing() {
        assert_eq!(PodPhase::parse("Running"), PodPhase::Running);
        assert_eq!(PodPhase::parse(" Failed\n"), PodPhase::Failed);
        assert_eq!(PodPhase::parse("Evicted"), PodPhase::Unknown);
        assert!(!PodPhase::Unknown.is_finished());
    }
}
