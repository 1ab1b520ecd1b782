pub mod env;
pub mod secrets;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
pub use secrets::{DirSecretStore, Secret, SecretStore};

fn default_namespace() -> String {
    "default".into()
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct S3Spec {
    pub bucket: String,
    pub prefix: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub secret: Option<String>,
    pub insecure_tls: bool,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GcsSpec {
    pub bucket: String,
    pub prefix: Option<String>,
    pub secret: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AzureSpec {
    pub container: String,
    pub prefix: Option<String>,
    pub storage_account: String,
    pub secret: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct B2Spec {
    pub bucket: String,
    pub prefix: Option<String>,
    pub secret: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LocalSpec {
    pub mount_path: String,
    pub sub_path: Option<String>,
    pub secret: Option<String>,
}

/// A storage object as the control plane describes it: at most one provider
/// block is expected to be populated.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct StorageSpec {
    pub s3: Option<S3Spec>,
    pub gcs: Option<GcsSpec>,
    pub azure: Option<AzureSpec>,
    pub b2: Option<B2Spec>,
    pub local: Option<LocalSpec>,
}

/// One repository inside a storage: which storage, which directory, which
/// encryption secret.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RepositoryRef {
    pub name: String,
    pub storage: String,
    pub directory: String,
    pub encryption_secret: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Storage-reference lookup, supplied by whoever owns the storage objects.
pub trait StorageLookup: Send + Sync {
    fn storage(&self, name: &str) -> Result<StorageSpec>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    S3 {
        bucket: String,
        prefix: Option<String>,
        endpoint: Option<String>,
        region: Option<String>,
    },
    Gcs {
        bucket: String,
        prefix: Option<String>,
    },
    Azure {
        container: String,
        prefix: Option<String>,
        storage_account: String,
    },
    B2 {
        bucket: String,
        prefix: Option<String>,
    },
    Local {
        path: PathBuf,
    },
}

impl BackendKind {
    pub fn provider(&self) -> &'static str {
        match self {
            BackendKind::S3 { .. } => "s3",
            BackendKind::Gcs { .. } => "gcs",
            BackendKind::Azure { .. } => "azure",
            BackendKind::B2 { .. } => "b2",
            BackendKind::Local { .. } => "local",
        }
    }
}

/// Fully resolved destination for one repository. Immutable once built; each
/// concurrent task resolves its own.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub namespace: String,
    pub kind: BackendKind,
    pub directory: String,
    pub insecure_tls: bool,
    pub max_connections: Option<u32>,
    pub encryption_secret: String,
    pub storage_secret: Option<String>,
    /// Encryption secret merged with the storage secret (storage keys win).
    pub secret: Secret,
    pub ca_cert_path: Option<PathBuf>,
    pub google_credentials_path: Option<PathBuf>,
    scratch: Arc<tempfile::TempDir>,
}

impl BackendConfig {
    /// Private working directory for this backend (TMPDIR, credential files).
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }
}

fn non_empty(v: Option<&str>) -> Option<String> {
    v.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

fn required_field(storage: &str, field: &str, value: &str) -> Result<String> {
    let v = value.trim();
    if v.is_empty() {
        return Err(Error::config(format!("storage '{storage}' has empty {field}")));
    }
    Ok(v.to_string())
}

fn connections(n: u32) -> Option<u32> {
    (n > 0).then_some(n)
}

struct Selected {
    kind: BackendKind,
    secret: Option<String>,
    secret_required: bool,
    required_keys: &'static [&'static str],
    insecure_tls: bool,
    max_connections: Option<u32>,
}

fn select_provider(storage_name: &str, spec: &StorageSpec) -> Result<Selected> {
    let mut set = Vec::new();
    if spec.s3.is_some() {
        set.push("s3");
    }
    if spec.gcs.is_some() {
        set.push("gcs");
    }
    if spec.azure.is_some() {
        set.push("azure");
    }
    if spec.b2.is_some() {
        set.push("b2");
    }
    if spec.local.is_some() {
        set.push("local");
    }
    if set.is_empty() {
        return Err(Error::config(format!(
            "storage '{storage_name}' has no provider configured; expected one of s3/gcs/azure/b2/local"
        )));
    }
    if set.len() > 1 {
        return Err(Error::config(format!(
            "storage '{storage_name}' configures multiple providers ({}); exactly one is allowed",
            set.join(", ")
        )));
    }

    if let Some(s3) = spec.s3.as_ref() {
        return Ok(Selected {
            kind: BackendKind::S3 {
                bucket: required_field(storage_name, "s3.bucket", &s3.bucket)?,
                prefix: non_empty(s3.prefix.as_deref()),
                endpoint: non_empty(s3.endpoint.as_deref()),
                region: non_empty(s3.region.as_deref()),
            },
            secret: non_empty(s3.secret.as_deref()),
            secret_required: false,
            required_keys: &[secrets::AWS_ACCESS_KEY_ID, secrets::AWS_SECRET_ACCESS_KEY],
            insecure_tls: s3.insecure_tls,
            max_connections: connections(s3.max_connections),
        });
    }
    if let Some(gcs) = spec.gcs.as_ref() {
        return Ok(Selected {
            kind: BackendKind::Gcs {
                bucket: required_field(storage_name, "gcs.bucket", &gcs.bucket)?,
                prefix: non_empty(gcs.prefix.as_deref()),
            },
            secret: non_empty(gcs.secret.as_deref()),
            secret_required: true,
            required_keys: &[secrets::GOOGLE_SERVICE_ACCOUNT_JSON_KEY],
            insecure_tls: false,
            max_connections: connections(gcs.max_connections),
        });
    }
    if let Some(az) = spec.azure.as_ref() {
        return Ok(Selected {
            kind: BackendKind::Azure {
                container: required_field(storage_name, "azure.container", &az.container)?,
                prefix: non_empty(az.prefix.as_deref()),
                storage_account: required_field(
                    storage_name,
                    "azure.storage_account",
                    &az.storage_account,
                )?,
            },
            secret: non_empty(az.secret.as_deref()),
            secret_required: true,
            required_keys: &[secrets::AZURE_ACCOUNT_KEY],
            insecure_tls: false,
            max_connections: connections(az.max_connections),
        });
    }
    if let Some(b2) = spec.b2.as_ref() {
        return Ok(Selected {
            kind: BackendKind::B2 {
                bucket: required_field(storage_name, "b2.bucket", &b2.bucket)?,
                prefix: non_empty(b2.prefix.as_deref()),
            },
            secret: non_empty(b2.secret.as_deref()),
            secret_required: true,
            required_keys: &[secrets::B2_ACCOUNT_ID, secrets::B2_ACCOUNT_KEY],
            insecure_tls: false,
            max_connections: connections(b2.max_connections),
        });
    }

    let Some(local) = spec.local.as_ref() else {
        return Err(Error::config(format!(
            "storage '{storage_name}' has no provider configured"
        )));
    };
    if non_empty(local.secret.as_deref()).is_some() {
        return Err(Error::config(format!(
            "storage '{storage_name}' is a local volume and must not reference a secret"
        )));
    }
    let mount = required_field(storage_name, "local.mount_path", &local.mount_path)?;
    let mut path = PathBuf::from(mount);
    if let Some(sub) = non_empty(local.sub_path.as_deref()) {
        path = path.join(sub.trim_start_matches('/'));
    }
    Ok(Selected {
        kind: BackendKind::Local { path },
        secret: None,
        secret_required: false,
        required_keys: &[],
        insecure_tls: false,
        max_connections: None,
    })
}

/// Resolve a repository reference into a backend config.
///
/// Looks up the storage object, validates exactly one provider, fetches and
/// checks secrets, and writes credential files into a fresh directory under
/// `scratch_dir`. Fails before any subprocess is started.
pub fn resolve(
    repo: &RepositoryRef,
    storages: &dyn StorageLookup,
    secret_store: &dyn SecretStore,
    scratch_dir: &Path,
) -> Result<BackendConfig> {
    let repo_name = repo.name.trim();
    if repo_name.is_empty() {
        return Err(Error::config("repository name is empty"));
    }
    let storage_name = repo.storage.trim();
    if storage_name.is_empty() {
        return Err(Error::config(format!(
            "repository '{repo_name}' does not reference a storage"
        )));
    }
    let spec = storages.storage(storage_name)?;
    let selected = select_provider(storage_name, &spec)?;

    let encryption_name = repo.encryption_secret.trim();
    if encryption_name.is_empty() {
        return Err(Error::config(format!(
            "repository '{repo_name}' has no encryption secret"
        )));
    }
    let encryption = secret_store.secret(encryption_name)?;
    encryption.require(secrets::RESTIC_PASSWORD)?;

    let storage_secret = match selected.secret.as_deref() {
        Some(name) => {
            let s = secret_store.secret(name)?;
            s.require_all(selected.required_keys)?;
            Some(s)
        }
        None if selected.secret_required => {
            return Err(Error::config(format!(
                "storage '{}' ({}) requires a credentials secret",
                storage_name,
                selected.kind.provider()
            )));
        }
        None => None,
    };
    let merged = match storage_secret.as_ref() {
        Some(s) => encryption.merged(s),
        None => encryption.clone(),
    };

    if let BackendKind::Local { path } = &selected.kind {
        fs::create_dir_all(path).map_err(|e| {
            Error::config(format!(
                "failed to create local mount path {}: {e}",
                path.display()
            ))
        })?;
    }

    fs::create_dir_all(scratch_dir).map_err(|e| {
        Error::config(format!(
            "failed to create scratch dir {}: {e}",
            scratch_dir.display()
        ))
    })?;
    let scratch = tempfile::Builder::new()
        .prefix(&format!("{}-", sanitize_component(repo_name)))
        .tempdir_in(scratch_dir)
        .map_err(|e| {
            Error::config(format!(
                "failed to create backend dir under {}: {e}",
                scratch_dir.display()
            ))
        })?;

    let ca_cert_path = match merged.get(secrets::CA_CERT_DATA) {
        Some(data) => {
            let p = scratch.path().join("ca.crt");
            write_private(&p, data)?;
            Some(p)
        }
        None => None,
    };
    let gcs_key = merged.get(secrets::GOOGLE_SERVICE_ACCOUNT_JSON_KEY);
    let google_credentials_path = match (&selected.kind, gcs_key) {
        (BackendKind::Gcs { .. }, Some(data)) => {
            let p = scratch.path().join("gcs-sa.json");
            write_private(&p, data)?;
            Some(p)
        }
        _ => None,
    };

    debug!(
        repo = repo_name,
        storage = storage_name,
        provider = selected.kind.provider(),
        "resolved backend"
    );

    Ok(BackendConfig {
        name: repo_name.to_string(),
        namespace: repo.namespace.trim().to_string(),
        kind: selected.kind,
        directory: repo.directory.trim().trim_matches('/').to_string(),
        insecure_tls: selected.insecure_tls,
        max_connections: selected.max_connections,
        encryption_secret: encryption_name.to_string(),
        storage_secret: selected.secret,
        secret: merged,
        ca_cert_path,
        google_credentials_path,
        scratch: Arc::new(scratch),
    })
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data)
        .map_err(|e| Error::config(format!("failed to write {}: {e}", path.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::config(format!("failed to chmod {}: {e}", path.display())))?;
    }
    Ok(())
}

fn sanitize_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "repo".into() } else { out }
}
