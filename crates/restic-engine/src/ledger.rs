use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub const STALE_SNAPSHOTS_FILE: &str = "stale_snapshots_by_repo.json";
pub const PRUNE_ERRORS_FILE: &str = "prune_errors_by_repo.json";
pub const RETENTION_STATUS_FILE: &str = "retention_policy_status_by_repo.json";

/// A snapshot scheduled for removal, tagged with its repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleSnapshot {
    pub repository: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// What the ledger stores per stale snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPhase {
    Applied,
    FailedToApply,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicyStatus {
    #[serde(rename = "ref")]
    pub policy_ref: String,
    pub phase: RetentionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub type StaleSnapshots = BTreeMap<String, Vec<SnapshotRef>>;
pub type PruneErrors = BTreeMap<String, Vec<String>>;
pub type RetentionStatuses = BTreeMap<String, RetentionPolicyStatus>;

/// JSON documents in a directory shared by the successive steps of one job.
///
/// Every mutation reads the whole document, changes it and rewrites it. There
/// is no file locking: callers must run mutations of one directory from a
/// single writer at a time.
#[derive(Debug, Clone)]
pub struct Ledger {
    dir: PathBuf,
}

impl Ledger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Create the file if needed and reset `repo`'s list. Other repositories
    /// keep their entries.
    pub fn init_stale_snapshots_file(&self, repo: &str) -> Result<()> {
        let path = self.path(STALE_SNAPSHOTS_FILE);
        let mut doc: StaleSnapshots = read_doc(&path)?;
        doc.insert(repo.to_string(), Vec::new());
        write_doc(&path, &doc)
    }

    pub fn add_snapshot_list_to_file(&self, snapshots: &[StaleSnapshot]) -> Result<()> {
        let path = self.path(STALE_SNAPSHOTS_FILE);
        let mut doc: StaleSnapshots = read_doc(&path)?;
        for s in snapshots {
            doc.entry(s.repository.clone()).or_default().push(SnapshotRef {
                name: s.name.clone(),
                namespace: s.namespace.clone(),
            });
        }
        debug!(count = snapshots.len(), "recorded stale snapshots");
        write_doc(&path, &doc)
    }

    pub fn read_stale_snapshots(&self) -> Result<StaleSnapshots> {
        read_doc(&self.path(STALE_SNAPSHOTS_FILE))
    }

    /// Append `err` to `repo`'s prune error history. `None` only makes sure
    /// the repository has an entry.
    pub fn write_prune_error_to_file(&self, repo: &str, err: Option<&Error>) -> Result<()> {
        let path = self.path(PRUNE_ERRORS_FILE);
        let mut doc: PruneErrors = read_doc(&path)?;
        let entry = doc.entry(repo.to_string()).or_default();
        if let Some(e) = err {
            entry.push(e.to_string());
        }
        write_doc(&path, &doc)
    }

    pub fn read_prune_errors(&self) -> Result<PruneErrors> {
        read_doc(&self.path(PRUNE_ERRORS_FILE))
    }

    /// Record the outcome of applying `policy_ref` to `repo`. The phase and
    /// ref reflect the latest attempt; a failure's message is appended to the
    /// errors already recorded for `repo`, and a success keeps them.
    pub fn write_retention_policy_status(
        &self,
        repo: &str,
        policy_ref: &str,
        err: Option<&Error>,
    ) -> Result<()> {
        let path = self.path(RETENTION_STATUS_FILE);
        let mut doc: RetentionStatuses = read_doc(&path)?;
        let previous = doc.remove(repo).and_then(|s| s.error);
        let (phase, error) = match err {
            None => (RetentionPhase::Applied, previous),
            Some(e) => {
                let msg = match previous {
                    Some(prev) => format!("{prev}, {e}"),
                    None => e.to_string(),
                };
                (RetentionPhase::FailedToApply, Some(msg))
            }
        };
        doc.insert(
            repo.to_string(),
            RetentionPolicyStatus {
                policy_ref: policy_ref.to_string(),
                phase,
                error,
            },
        );
        write_doc(&path, &doc)
    }

    pub fn read_retention_policy_statuses(&self) -> Result<RetentionStatuses> {
        read_doc(&self.path(RETENTION_STATUS_FILE))
    }
}

/// All prune errors of one repository as a single message.
pub fn joined_errors(errors: &[String]) -> Option<String> {
    (!errors.is_empty()).then(|| errors.join(", "))
}

fn read_doc<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let raw = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => {
            return Err(Error::io(format!("failed to read {}: {e}", path.display())));
        }
    };
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&raw)
        .map_err(|e| Error::parse(format!("failed to parse {}: {e}", path.display())))
}

fn write_doc<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    let mut body = serde_json::to_string_pretty(doc)
        .map_err(|e| Error::msg(format!("failed to encode {}: {e}", path.display())))?;
    body.push('\n');
    atomic_write_text(path, &body)
}

fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::msg(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::io(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::io(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })
}
