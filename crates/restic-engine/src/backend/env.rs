use std::collections::BTreeMap;
use std::path::Path;

use crate::backend::secrets::{self, Secret};
use crate::backend::{BackendConfig, BackendKind};
use crate::error::Result;

pub const RESTIC_REPOSITORY: &str = "RESTIC_REPOSITORY";
pub const RESTIC_PASSWORD: &str = "RESTIC_PASSWORD";
pub const RESTIC_PROGRESS_FPS: &str = "RESTIC_PROGRESS_FPS";
pub const RESTIC_CACHE_DIR: &str = "RESTIC_CACHE_DIR";
pub const TMPDIR: &str = "TMPDIR";
pub const AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
pub const GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub const AZURE_ACCOUNT_NAME: &str = "AZURE_ACCOUNT_NAME";

// One progress line per minute keeps long-running logs readable.
const PROGRESS_FPS: &str = "0.016666";
const DEFAULT_S3_ENDPOINT: &str = "s3.amazonaws.com";

/// Process state needed to point restic at one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResticEnv {
    pub vars: BTreeMap<String, String>,
    /// Global flags appended to every subcommand for this backend.
    pub global_args: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvOptions<'a> {
    pub enable_cache: bool,
    pub cache_dir: Option<&'a Path>,
}

fn join_remote(parts: &[Option<&str>]) -> String {
    parts
        .iter()
        .flatten()
        .map(|p| p.trim().trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Provider-specific `RESTIC_REPOSITORY` value.
pub fn repository_url(b: &BackendConfig) -> String {
    let dir = Some(b.directory.as_str());
    match &b.kind {
        BackendKind::Local { path } => {
            let base = path.to_string_lossy();
            let base = base.trim_end_matches('/');
            if b.directory.is_empty() {
                base.to_string()
            } else {
                format!("{base}/{}", b.directory)
            }
        }
        BackendKind::S3 {
            bucket,
            prefix,
            endpoint,
            ..
        } => {
            let endpoint = endpoint
                .as_deref()
                .map(|e| e.trim_end_matches('/'))
                .filter(|e| !e.is_empty())
                .unwrap_or(DEFAULT_S3_ENDPOINT);
            format!(
                "s3:{endpoint}/{}",
                join_remote(&[Some(bucket.as_str()), prefix.as_deref(), dir])
            )
        }
        BackendKind::Gcs { bucket, prefix } => {
            format!("gs:{bucket}:/{}", join_remote(&[prefix.as_deref(), dir]))
        }
        BackendKind::Azure {
            container, prefix, ..
        } => {
            format!(
                "azure:{container}:/{}",
                join_remote(&[prefix.as_deref(), dir])
            )
        }
        BackendKind::B2 { bucket, prefix } => {
            format!("b2:{bucket}:{}", join_remote(&[prefix.as_deref(), dir]))
        }
    }
}

fn copy_key(vars: &mut BTreeMap<String, String>, secret: &Secret, key: &str) -> Result<()> {
    if let Some(v) = secret.get_string(key)? {
        vars.insert(key.to_string(), v);
    }
    Ok(())
}

/// Build environment and global flags for `b`.
pub fn build_env(b: &BackendConfig, opts: EnvOptions<'_>) -> Result<ResticEnv> {
    let mut vars = BTreeMap::<String, String>::new();
    vars.insert(RESTIC_REPOSITORY.into(), repository_url(b));
    if let Some(pw) = b.secret.get_string(secrets::RESTIC_PASSWORD)? {
        vars.insert(RESTIC_PASSWORD.into(), pw);
    }
    vars.insert(RESTIC_PROGRESS_FPS.into(), PROGRESS_FPS.into());
    vars.insert(TMPDIR.into(), b.scratch_dir().to_string_lossy().to_string());
    if opts.enable_cache
        && let Some(dir) = opts.cache_dir
    {
        vars.insert(RESTIC_CACHE_DIR.into(), dir.to_string_lossy().to_string());
    }

    match &b.kind {
        BackendKind::Local { .. } => {}
        BackendKind::S3 { region, .. } => {
            copy_key(&mut vars, &b.secret, secrets::AWS_ACCESS_KEY_ID)?;
            copy_key(&mut vars, &b.secret, secrets::AWS_SECRET_ACCESS_KEY)?;
            if let Some(r) = region {
                vars.insert(AWS_DEFAULT_REGION.into(), r.clone());
            }
        }
        BackendKind::Gcs { .. } => {
            copy_key(&mut vars, &b.secret, secrets::GOOGLE_PROJECT_ID)?;
            copy_key(&mut vars, &b.secret, secrets::GOOGLE_SERVICE_ACCOUNT_JSON_KEY)?;
            if let Some(p) = b.google_credentials_path.as_ref() {
                vars.insert(
                    GOOGLE_APPLICATION_CREDENTIALS.into(),
                    p.to_string_lossy().to_string(),
                );
            }
        }
        BackendKind::Azure {
            storage_account, ..
        } => {
            vars.insert(AZURE_ACCOUNT_NAME.into(), storage_account.clone());
            copy_key(&mut vars, &b.secret, secrets::AZURE_ACCOUNT_KEY)?;
        }
        BackendKind::B2 { .. } => {
            copy_key(&mut vars, &b.secret, secrets::B2_ACCOUNT_ID)?;
            copy_key(&mut vars, &b.secret, secrets::B2_ACCOUNT_KEY)?;
        }
    }

    Ok(ResticEnv {
        vars,
        global_args: global_args(b, opts.enable_cache),
    })
}

fn connections_option(b: &BackendConfig) -> Option<String> {
    let n = b.max_connections.filter(|n| *n > 0)?;
    let key = match b.kind {
        BackendKind::Gcs { .. } => "gs.connections",
        BackendKind::Azure { .. } => "azure.connections",
        BackendKind::B2 { .. } => "b2.connections",
        BackendKind::S3 { .. } | BackendKind::Local { .. } => return None,
    };
    Some(format!("{key}={n}"))
}

fn global_args(b: &BackendConfig, enable_cache: bool) -> Vec<String> {
    let mut args = Vec::new();
    if !enable_cache {
        args.push("--no-cache".to_string());
    }
    if b.insecure_tls {
        args.push("--insecure-tls".to_string());
    }
    if let Some(ca) = b.ca_cert_path.as_ref() {
        args.push("--cacert".to_string());
        args.push(ca.to_string_lossy().to_string());
    }
    if let Some(opt) = connections_option(b) {
        args.push("--option".to_string());
        args.push(opt);
    }
    args
}
