pub mod command;
pub mod output;
pub mod wrapper;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backend::BackendConfig;
use crate::error::Result;

pub use output::{LockStats, RepositoryStats, Snapshot, SnapshotStats};
pub use wrapper::{ResticWrapper, SetupOptions};

/// One external command used as a stdin producer or a stdout consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeCommand {
    pub name: String,
    pub args: Vec<String>,
}

impl PipeCommand {
    pub fn new(name: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupOptions {
    pub paths: Vec<String>,
    /// Producer pipeline whose output is stored as a single file. When set,
    /// `paths` is ignored.
    pub stdin_commands: Vec<PipeCommand>,
    pub stdin_file_name: Option<String>,
    pub host: Option<String>,
    pub tags: Vec<String>,
    pub exclude: Vec<String>,
    pub args: Vec<String>,
    pub ignore_inode: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    /// Snapshot id; `latest` when unset.
    pub snapshot: Option<String>,
    pub target: PathBuf,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub host: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpOptions {
    pub snapshot: Option<String>,
    /// File inside the snapshot, e.g. `/stdin` for piped backups.
    pub path: String,
    pub host: Option<String>,
    /// Write the dumped bytes here. Mutually exclusive with `stdout_commands`.
    pub dest_file: Option<PathBuf>,
    /// Consumer pipeline fed with the dumped bytes.
    pub stdout_commands: Vec<PipeCommand>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub keep_hourly: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
    pub keep_tags: Vec<String>,
    pub host: Option<String>,
    pub prune: bool,
    pub dry_run: bool,
}

impl RetentionPolicy {
    pub fn keeps_anything(&self) -> bool {
        [
            self.keep_last,
            self.keep_hourly,
            self.keep_daily,
            self.keep_weekly,
            self.keep_monthly,
            self.keep_yearly,
        ]
        .iter()
        .any(Option::is_some)
            || !self.keep_tags.is_empty()
    }
}

/// `nice -n <adjustment>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NiceSettings {
    pub adjustment: i32,
}

/// `ionice -c <class> [-n <class_data>]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoNiceSettings {
    pub class: u8,
    pub class_data: Option<u8>,
}

/// Operations against one repository. Implemented by [`ResticWrapper`];
/// tests substitute in-memory engines.
pub trait SnapshotEngine: Send + Sync {
    fn initialize_repository(&self, backend: &BackendConfig) -> Result<()>;

    /// `Ok(false)` when the repository has not been initialized yet.
    fn repository_exists(&self, backend: &BackendConfig) -> Result<bool>;

    fn backup(&self, backend: &BackendConfig, opts: &BackupOptions) -> Result<Vec<SnapshotStats>>;

    fn restore(&self, backend: &BackendConfig, opts: &RestoreOptions) -> Result<()>;

    fn dump(&self, backend: &BackendConfig, opts: &DumpOptions) -> Result<()>;

    fn verify_repository_integrity(&self, backend: &BackendConfig) -> Result<RepositoryStats>;

    fn list_snapshots(&self, backend: &BackendConfig, tags: &[String]) -> Result<Vec<Snapshot>>;

    fn delete_snapshots(&self, backend: &BackendConfig, ids: &[String]) -> Result<()>;

    /// Returns the snapshots the policy removed (or would remove on a dry run).
    fn apply_retention_policy(
        &self,
        backend: &BackendConfig,
        policy: &RetentionPolicy,
    ) -> Result<Vec<Snapshot>>;

    fn list_locks(&self, backend: &BackendConfig) -> Result<Vec<String>>;

    /// `None` when the lock file is gone, e.g. released after listing.
    fn lock_stats(&self, backend: &BackendConfig, lock_id: &str) -> Result<Option<LockStats>>;

    fn unlock(&self, backend: &BackendConfig) -> Result<()>;
}
