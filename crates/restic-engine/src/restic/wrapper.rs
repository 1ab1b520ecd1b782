use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::command::{self, CmdOutput, Invocation, StdoutSink};
use super::output::{self, LockStats, RepositoryStats, Snapshot, SnapshotStats};
use super::{
    BackupOptions, DumpOptions, IoNiceSettings, NiceSettings, RestoreOptions, RetentionPolicy,
    SnapshotEngine,
};
use crate::backend::BackendConfig;
use crate::backend::env::{self, EnvOptions};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};

const LATEST: &str = "latest";

/// Session-wide settings shared by every copy of a wrapper.
#[derive(Debug, Clone)]
pub struct SetupOptions {
    pub scratch_dir: PathBuf,
    pub restic_bin: String,
    pub enable_cache: bool,
    pub cache_dir: Option<PathBuf>,
    pub nice: Option<NiceSettings>,
    pub ionice: Option<IoNiceSettings>,
    /// Per-invocation limit; the process group is killed when it expires.
    pub timeout: Option<Duration>,
    pub verbose: bool,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
            restic_bin: "restic".into(),
            enable_cache: false,
            cache_dir: None,
            nice: None,
            ionice: None,
            timeout: None,
            verbose: false,
        }
    }
}

/// Drives the restic CLI. One wrapper runs at most one restic process at a
/// time; use [`ResticWrapper::copy`] to get an independent session for
/// concurrent work.
pub struct ResticWrapper {
    setup: Arc<SetupOptions>,
    cancel: CancelToken,
    session: Mutex<()>,
    // Snapshots removed by the last retention run, by backend name.
    removed: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl ResticWrapper {
    pub fn new(setup: SetupOptions) -> Self {
        Self {
            setup: Arc::new(setup),
            cancel: CancelToken::new(),
            session: Mutex::new(()),
            removed: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Independent session sharing this wrapper's settings.
    pub fn copy(&self) -> Self {
        Self {
            setup: Arc::clone(&self.setup),
            cancel: self.cancel.clone(),
            session: Mutex::new(()),
            removed: Arc::clone(&self.removed),
        }
    }

    pub fn setup(&self) -> &SetupOptions {
        &self.setup
    }

    fn invocation(&self, b: &BackendConfig, mut args: Vec<String>) -> Result<Invocation> {
        let env = env::build_env(
            b,
            EnvOptions {
                enable_cache: self.setup.enable_cache,
                cache_dir: self.setup.cache_dir.as_deref(),
            },
        )?;
        args.extend(env.global_args);
        let mut inv = Invocation::new(self.setup.restic_bin.clone(), args);
        inv.env = env.vars;
        inv.nice = self.setup.nice;
        inv.ionice = self.setup.ionice;
        inv.verbose = self.setup.verbose;
        Ok(inv)
    }

    fn token(&self) -> CancelToken {
        match self.setup.timeout {
            Some(t) => self.cancel.child_with_timeout(t),
            None => self.cancel.clone(),
        }
    }

    fn exec(&self, b: &BackendConfig, inv: &Invocation) -> Result<CmdOutput> {
        let _guard = self.session.lock().unwrap_or_else(|p| p.into_inner());
        command::run(inv, &self.token()).map_err(|e| e.context(format!("backend '{}'", b.name)))
    }

    fn exec_unchecked(&self, b: &BackendConfig, inv: &Invocation) -> Result<CmdOutput> {
        let _guard = self.session.lock().unwrap_or_else(|p| p.into_inner());
        command::run_unchecked(inv, &self.token())
            .map_err(|e| e.context(format!("backend '{}'", b.name)))
    }

    fn run_args(&self, b: &BackendConfig, args: Vec<String>) -> Result<CmdOutput> {
        let inv = self.invocation(b, args)?;
        self.exec(b, &inv)
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: Option<&str>) {
    if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
        args.push(flag.to_string());
        args.push(v.to_string());
    }
}

fn push_each(args: &mut Vec<String>, flag: &str, values: &[String]) {
    for v in values {
        push_flag(args, flag, Some(v));
    }
}

fn snapshot_or_latest(s: Option<&str>) -> String {
    s.map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(LATEST)
        .to_string()
}

pub(crate) fn backup_args(opts: &BackupOptions) -> Result<Vec<String>> {
    let mut a = args(&["backup"]);
    if !opts.stdin_commands.is_empty() {
        a.push("--stdin".into());
        push_flag(&mut a, "--stdin-filename", opts.stdin_file_name.as_deref());
    } else {
        let paths: Vec<&String> = opts.paths.iter().filter(|p| !p.trim().is_empty()).collect();
        if paths.is_empty() {
            return Err(Error::config("backup needs paths or stdin commands"));
        }
        a.extend(paths.into_iter().cloned());
    }
    push_flag(&mut a, "--host", opts.host.as_deref());
    push_each(&mut a, "--tag", &opts.tags);
    push_each(&mut a, "--exclude", &opts.exclude);
    if opts.ignore_inode {
        a.push("--ignore-inode".into());
    }
    a.extend(opts.args.iter().cloned());
    a.push("--json".into());
    Ok(a)
}

pub(crate) fn retention_args(policy: &RetentionPolicy) -> Result<Vec<String>> {
    if !policy.keeps_anything() {
        return Err(Error::config(
            "retention policy keeps nothing; set at least one keep rule",
        ));
    }
    let mut a = args(&["forget", "--json"]);
    let keeps = [
        ("--keep-last", policy.keep_last),
        ("--keep-hourly", policy.keep_hourly),
        ("--keep-daily", policy.keep_daily),
        ("--keep-weekly", policy.keep_weekly),
        ("--keep-monthly", policy.keep_monthly),
        ("--keep-yearly", policy.keep_yearly),
    ];
    for (flag, n) in keeps {
        if let Some(n) = n {
            a.push(flag.into());
            a.push(n.to_string());
        }
    }
    push_each(&mut a, "--keep-tag", &policy.keep_tags);
    push_flag(&mut a, "--host", policy.host.as_deref());
    if policy.prune {
        a.push("--prune".into());
    }
    if policy.dry_run {
        a.push("--dry-run".into());
    }
    Ok(a)
}

impl SnapshotEngine for ResticWrapper {
    fn initialize_repository(&self, b: &BackendConfig) -> Result<()> {
        info!(backend = %b.name, "initializing repository");
        self.run_args(b, args(&["init"]))?;
        Ok(())
    }

    fn repository_exists(&self, b: &BackendConfig) -> Result<bool> {
        let inv = self.invocation(b, args(&["cat", "config", "--no-lock"]))?;
        let out = self.exec_unchecked(b, &inv)?;
        if out.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if output::is_missing_repository(out.status.code(), &stderr) {
            debug!(backend = %b.name, "repository not initialized");
            return Ok(false);
        }
        Err(Error::process(format!(
            "backend '{}': failed to probe repository: {}",
            b.name,
            out.summary()
        )))
    }

    fn backup(&self, b: &BackendConfig, opts: &BackupOptions) -> Result<Vec<SnapshotStats>> {
        let mut inv = self.invocation(b, backup_args(opts)?)?;
        inv.stdin = opts.stdin_commands.clone();
        info!(backend = %b.name, stdin = !inv.stdin.is_empty(), "running backup");
        let out = self.exec(b, &inv)?;
        let parsed = output::parse_backup_output(&out.stdout);
        for e in &parsed.decode_errors {
            warn!(backend = %b.name, error = %e, "skipping undecodable backup output line");
        }
        if parsed.stats.is_empty() {
            return Err(Error::parse(format!(
                "backend '{}': backup output had no summary record",
                b.name
            )));
        }
        Ok(parsed.stats)
    }

    fn restore(&self, b: &BackendConfig, opts: &RestoreOptions) -> Result<()> {
        if opts.target.as_os_str().is_empty() {
            return Err(Error::config("restore needs a target directory"));
        }
        std::fs::create_dir_all(&opts.target).map_err(|e| {
            Error::process(format!("failed to create {}: {e}", opts.target.display()))
        })?;
        let mut a = args(&["restore"]);
        a.push(snapshot_or_latest(opts.snapshot.as_deref()));
        a.push("--target".into());
        a.push(opts.target.to_string_lossy().to_string());
        push_each(&mut a, "--include", &opts.include);
        push_each(&mut a, "--exclude", &opts.exclude);
        push_flag(&mut a, "--host", opts.host.as_deref());
        a.extend(opts.args.iter().cloned());
        info!(backend = %b.name, target = %opts.target.display(), "restoring snapshot");
        self.run_args(b, a)?;
        Ok(())
    }

    fn dump(&self, b: &BackendConfig, opts: &DumpOptions) -> Result<()> {
        let sink = match (&opts.dest_file, opts.stdout_commands.is_empty()) {
            (Some(_), false) => {
                return Err(Error::config(
                    "dump takes either a destination file or stdout commands, not both",
                ));
            }
            (Some(f), true) => StdoutSink::File(f.clone()),
            (None, false) => StdoutSink::Pipe(opts.stdout_commands.clone()),
            (None, true) => {
                return Err(Error::config(
                    "dump needs a destination file or stdout commands",
                ));
            }
        };
        if opts.path.trim().is_empty() {
            return Err(Error::config("dump needs a path inside the snapshot"));
        }
        let mut a = args(&["dump"]);
        a.push(snapshot_or_latest(opts.snapshot.as_deref()));
        a.push(opts.path.clone());
        push_flag(&mut a, "--host", opts.host.as_deref());
        let mut inv = self.invocation(b, a)?;
        inv.stdout = sink;
        info!(backend = %b.name, path = %opts.path, "dumping file from snapshot");
        self.exec(b, &inv)?;
        Ok(())
    }

    fn verify_repository_integrity(&self, b: &BackendConfig) -> Result<RepositoryStats> {
        info!(backend = %b.name, "checking repository integrity");
        let inv = self.invocation(b, args(&["check"]))?;
        let out = self.exec_unchecked(b, &inv)?;
        let summary = out.summary();
        if !out.success() && !summary.contains("repository contains errors") {
            return Err(Error::process(format!(
                "backend '{}': restic check failed: {summary}",
                b.name
            )));
        }
        let integrity = out.success() && output::parse_check_output(&out.stdout);
        if !integrity {
            warn!(backend = %b.name, "repository integrity check reported problems");
        }

        let stats = self.run_args(b, args(&["stats", "--json", "--mode", "raw-data"]))?;
        let size = output::parse_stats_output(&stats.stdout)
            .map_err(|e| e.context(format!("backend '{}'", b.name)))?;
        let snapshot_count = self.list_snapshots(b, &[])?.len();
        let removed = self
            .removed
            .lock()
            .map(|m| m.get(&b.name).copied().unwrap_or(0))
            .unwrap_or(0);
        Ok(RepositoryStats {
            integrity,
            size,
            snapshot_count,
            snapshots_removed_by_last_clean_up: removed,
        })
    }

    fn list_snapshots(&self, b: &BackendConfig, tags: &[String]) -> Result<Vec<Snapshot>> {
        let mut a = args(&["snapshots", "--json"]);
        push_each(&mut a, "--tag", tags);
        let out = self.run_args(b, a)?;
        output::parse_snapshot_list(&out.stdout)
            .map_err(|e| e.context(format!("backend '{}'", b.name)))
    }

    fn delete_snapshots(&self, b: &BackendConfig, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut a = args(&["forget"]);
        a.extend(ids.iter().cloned());
        a.push("--prune".into());
        info!(backend = %b.name, count = ids.len(), "deleting snapshots");
        self.run_args(b, a)?;
        Ok(())
    }

    fn apply_retention_policy(
        &self,
        b: &BackendConfig,
        policy: &RetentionPolicy,
    ) -> Result<Vec<Snapshot>> {
        let out = self.run_args(b, retention_args(policy)?)?;
        let removed = output::parse_forget_output(&out.stdout)
            .map_err(|e| e.context(format!("backend '{}'", b.name)))?;
        info!(
            backend = %b.name,
            removed = removed.len(),
            dry_run = policy.dry_run,
            "applied retention policy"
        );
        if !policy.dry_run
            && let Ok(mut m) = self.removed.lock()
        {
            m.insert(b.name.clone(), removed.len());
        }
        Ok(removed)
    }

    fn list_locks(&self, b: &BackendConfig) -> Result<Vec<String>> {
        let out = self.run_args(b, args(&["list", "locks", "--no-lock"]))?;
        Ok(output::parse_lock_ids(&out.stdout))
    }

    fn lock_stats(&self, b: &BackendConfig, lock_id: &str) -> Result<Option<LockStats>> {
        let inv = self.invocation(b, args(&["cat", "lock", lock_id, "--no-lock"]))?;
        let out = self.exec_unchecked(b, &inv)?;
        if !out.success() {
            if output::is_missing_file(&String::from_utf8_lossy(&out.stderr)) {
                return Ok(None);
            }
            return Err(Error::process(format!(
                "backend '{}': restic cat lock {lock_id} failed: {}",
                b.name,
                out.summary()
            )));
        }
        output::parse_lock_stats(&out.stdout)
            .map(Some)
            .map_err(|e| e.context(format!("backend '{}' lock {lock_id}", b.name)))
    }

    fn unlock(&self, b: &BackendConfig) -> Result<()> {
        info!(backend = %b.name, "removing repository locks");
        self.run_args(b, args(&["unlock", "--remove-all"]))?;
        Ok(())
    }
}
