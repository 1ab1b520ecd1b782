use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use restic_engine::backend::{self, env::EnvOptions};
use restic_engine::cancel::CancelToken;
use restic_engine::config::{self, ConfigDoc, RepositoryDef, SessionConfig};
use restic_engine::kube::KubectlPodLookup;
use restic_engine::ledger::{Ledger, joined_errors};
use restic_engine::lock;
use restic_engine::pool::PoolOptions;
use restic_engine::restic::{ResticWrapper, SnapshotEngine};
use restic_engine::runner::{
    self, BackupTarget, Collaborators, RestoreAction, RestoreTarget, RetentionTarget, RunOptions,
    TargetOutcome,
};
use restic_engine::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, clap::Args)]
struct Select {
    /// Path to a run definition TOML
    config: PathBuf,
    /// Repository to act on (repeatable; default: all that apply)
    #[arg(long = "repo")]
    repos: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Back up repositories that define a `backup` table
    Backup {
        #[command(flatten)]
        select: Select,
        /// Max number of repositories to process concurrently (0 = use CPU count)
        #[arg(long)]
        max_parallel: Option<usize>,
    },
    /// Restore (or dump) repositories that define a `restore` or `dump` table
    Restore {
        #[command(flatten)]
        select: Select,
        /// Max number of repositories to process concurrently (0 = use CPU count)
        #[arg(long)]
        max_parallel: Option<usize>,
    },
    /// Verify repository integrity and report size and snapshot count
    Check {
        #[command(flatten)]
        select: Select,
        /// Max number of repositories to process concurrently (0 = use CPU count)
        #[arg(long)]
        max_parallel: Option<usize>,
    },
    /// Apply retention policies and record the results in the ledger
    Retention {
        #[command(flatten)]
        select: Select,
    },
    /// Clear exclusive locks whose holder is gone
    Unlock {
        #[command(flatten)]
        select: Select,
        /// Remove all locks without checking the holder
        #[arg(long)]
        force: bool,
    },
    /// Print the ledger documents
    Ledger {
        /// Path to a run definition TOML
        config: PathBuf,
    },
    /// Print the resolved backend of each repository (no secret values)
    Resolve {
        #[command(flatten)]
        select: Select,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);
    match run(args.cmd) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(kind = %e.kind(), "{e}");
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

/// `Ok(false)` when at least one repository failed.
fn run(cmd: Command) -> Result<bool> {
    match cmd {
        Command::Backup {
            select,
            max_parallel,
        } => cmd_backup(&select, max_parallel),
        Command::Restore {
            select,
            max_parallel,
        } => cmd_restore(&select, max_parallel),
        Command::Check {
            select,
            max_parallel,
        } => cmd_check(&select, max_parallel),
        Command::Retention { select } => cmd_retention(&select),
        Command::Unlock { select, force } => cmd_unlock(&select, force),
        Command::Ledger { config } => cmd_ledger(&config),
        Command::Resolve { select } => cmd_resolve(&select),
    }
}

struct App {
    doc: Arc<ConfigDoc>,
    session: SessionConfig,
    cancel: CancelToken,
}

impl App {
    fn load(path: &Path) -> Result<Self> {
        let doc = config::load(path)?;
        let session = doc.session()?;
        Ok(Self {
            doc: Arc::new(doc),
            session,
            cancel: CancelToken::new(),
        })
    }

    fn wrapper(&self) -> ResticWrapper {
        ResticWrapper::new(self.session.setup_options()).with_cancel(self.cancel.clone())
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            storages: self.doc.clone(),
            secrets: self.doc.clone(),
            pods: Arc::new(
                KubectlPodLookup::new(self.session.kubectl.clone())
                    .with_cancel(self.cancel.clone()),
            ),
            engines: Arc::new(self.wrapper()),
        }
    }

    fn run_options(&self, max_parallel: Option<usize>) -> Result<RunOptions> {
        let requested = max_parallel.unwrap_or(self.session.max_parallel);
        let concurrency = if requested == 0 {
            num_cpus::get().max(1)
        } else {
            requested
        };
        let mut pool = PoolOptions::default().concurrency(concurrency);
        if let Some(secs) = self.session.pool_timeout_secs {
            pool = pool.timeout(Duration::from_secs(secs));
        }
        Ok(RunOptions {
            scratch_dir: self.session.scratch_dir.clone(),
            pool,
            lock_wait: self.doc.lock_wait()?,
            init_missing: self.session.init_missing,
            fail_fast: self.session.fail_fast,
        })
    }

    fn ledger(&self) -> Result<Ledger> {
        let dir = self
            .doc
            .ledger_dir()?
            .unwrap_or_else(|| self.session.scratch_dir.join("ledger"));
        Ok(Ledger::new(dir))
    }

    /// Named repositories, or every repository when none are named.
    fn selected(&self, names: &[String]) -> Result<Vec<(String, RepositoryDef)>> {
        if names.is_empty() {
            return Ok(self.doc.repositories()?.into_iter().collect());
        }
        names
            .iter()
            .map(|n| Ok((n.clone(), self.doc.repository(n)?)))
            .collect()
    }
}

fn print_outcomes<T: Serialize>(outcomes: &[TargetOutcome<T>]) -> Result<bool> {
    println!("{}", serde_json::to_string_pretty(outcomes)?);
    Ok(outcomes.iter().all(TargetOutcome::is_ok))
}

fn cmd_backup(select: &Select, max_parallel: Option<usize>) -> Result<bool> {
    let app = App::load(&select.config)?;
    let explicit = !select.repos.is_empty();
    let mut targets = Vec::new();
    for (name, def) in app.selected(&select.repos)? {
        match def.backup.clone() {
            Some(opts) => targets.push(BackupTarget {
                repo: def.to_ref(&name),
                opts,
            }),
            None if explicit => {
                return Err(Error::config(format!(
                    "repository '{name}' has no backup table"
                )));
            }
            None => {}
        }
    }
    let outcomes = runner::run_backup_targets(
        &app.collaborators(),
        targets,
        &app.run_options(max_parallel)?,
        &app.cancel,
    );
    print_outcomes(&outcomes)
}

fn cmd_restore(select: &Select, max_parallel: Option<usize>) -> Result<bool> {
    let app = App::load(&select.config)?;
    let explicit = !select.repos.is_empty();
    let mut targets = Vec::new();
    for (name, def) in app.selected(&select.repos)? {
        let action = match (def.restore.clone(), def.dump.clone()) {
            (Some(r), _) => RestoreAction::Restore(r),
            (None, Some(d)) => RestoreAction::Dump(d),
            (None, None) if explicit => {
                return Err(Error::config(format!(
                    "repository '{name}' has no restore or dump table"
                )));
            }
            (None, None) => continue,
        };
        targets.push(RestoreTarget {
            repo: def.to_ref(&name),
            action,
        });
    }
    let outcomes = runner::run_restore_targets(
        &app.collaborators(),
        targets,
        &app.run_options(max_parallel)?,
        &app.cancel,
    );
    print_outcomes(&outcomes)
}

fn cmd_check(select: &Select, max_parallel: Option<usize>) -> Result<bool> {
    let app = App::load(&select.config)?;
    let repos = app
        .selected(&select.repos)?
        .into_iter()
        .map(|(name, def)| def.to_ref(&name))
        .collect();
    let outcomes = runner::run_integrity_checks(
        &app.collaborators(),
        repos,
        &app.run_options(max_parallel)?,
        &app.cancel,
    );
    print_outcomes(&outcomes)
}

fn cmd_retention(select: &Select) -> Result<bool> {
    let app = App::load(&select.config)?;
    let mut targets = Vec::new();
    for (name, def) in app.selected(&select.repos)? {
        let Some(policy_ref) = def.retention.clone() else {
            continue;
        };
        targets.push(RetentionTarget {
            repo: def.to_ref(&name),
            policy: app.doc.retention_policy(&policy_ref)?,
            policy_ref,
        });
    }
    let outcomes = runner::apply_retention_policies(
        &app.collaborators(),
        &targets,
        &app.ledger()?,
        &app.run_options(None)?,
        &app.cancel,
    );
    print_outcomes(&outcomes)
}

fn cmd_unlock(select: &Select, force: bool) -> Result<bool> {
    let app = App::load(&select.config)?;
    let c = app.collaborators();
    let wrapper = app.wrapper();
    let opts = app.run_options(None)?;
    let mut outcomes = Vec::new();
    for (name, def) in app.selected(&select.repos)? {
        let r = backend::resolve(
            &def.to_ref(&name),
            &*app.doc,
            &*app.doc,
            &opts.scratch_dir,
        )
        .and_then(|b| {
            if force {
                wrapper.unlock(&b).map(|()| "unlocked".to_string())
            } else {
                lock::ensure_no_exclusive_lock(
                    &wrapper,
                    &b,
                    c.pods.as_ref(),
                    opts.lock_wait,
                    &app.cancel,
                )
                .map(|r| format!("{r:?}"))
            }
        });
        outcomes.push(TargetOutcome::from_result(&name, r));
    }
    print_outcomes(&outcomes)
}

fn cmd_ledger(path: &Path) -> Result<bool> {
    let app = App::load(path)?;
    let ledger = app.ledger()?;
    let prune_errors: BTreeMap<String, Option<String>> = ledger
        .read_prune_errors()?
        .iter()
        .map(|(repo, errs)| (repo.clone(), joined_errors(errs)))
        .collect();
    let doc = serde_json::json!({
        "dir": ledger.dir(),
        "stale_snapshots": ledger.read_stale_snapshots()?,
        "prune_errors": prune_errors,
        "retention_policy_status": ledger.read_retention_policy_statuses()?,
    });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(true)
}

fn cmd_resolve(select: &Select) -> Result<bool> {
    let app = App::load(&select.config)?;
    let setup = app.session.setup_options();
    let mut out = Vec::new();
    for (name, def) in app.selected(&select.repos)? {
        let b = backend::resolve(
            &def.to_ref(&name),
            &*app.doc,
            &*app.doc,
            &setup.scratch_dir,
        )?;
        let env = backend::env::build_env(
            &b,
            EnvOptions {
                enable_cache: setup.enable_cache,
                cache_dir: setup.cache_dir.as_deref(),
            },
        )?;
        out.push(serde_json::json!({
            "repository": name,
            "provider": b.kind.provider(),
            "url": env.vars.get(backend::env::RESTIC_REPOSITORY),
            "env": env.vars.keys().collect::<Vec<_>>(),
            "global_args": env.global_args,
        }));
    }
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(true)
}
