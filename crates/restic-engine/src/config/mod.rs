use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine as _;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;
use toml::value::Table;

use crate::backend::{
    DirSecretStore, RepositoryRef, Secret, SecretStore, StorageLookup, StorageSpec,
};
use crate::error::{Error, Result};
use crate::lock::LockWaitOptions;
use crate::restic::{
    BackupOptions, DumpOptions, IoNiceSettings, NiceSettings, RestoreOptions, RetentionPolicy,
    SetupOptions,
};

/// A run definition with its `include`d entries folded in.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub scratch_dir: PathBuf,
    pub restic_bin: String,
    pub kubectl: String,
    pub enable_cache: bool,
    pub cache_dir: Option<PathBuf>,
    /// Per restic invocation; the process group is killed when it expires.
    pub timeout_secs: Option<u64>,
    pub verbose: bool,
    /// 0 uses the CPU count.
    pub max_parallel: usize,
    /// Limit for a whole fan-out batch.
    pub pool_timeout_secs: Option<u64>,
    /// Stop the batch on the first failing target.
    pub fail_fast: bool,
    /// Run `restic init` for repositories that do not exist yet.
    pub init_missing: bool,
    pub nice: Option<NiceSettings>,
    pub ionice: Option<IoNiceSettings>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("restic-engine"),
            restic_bin: "restic".into(),
            kubectl: "kubectl".into(),
            enable_cache: false,
            cache_dir: None,
            timeout_secs: None,
            verbose: false,
            max_parallel: 1,
            pool_timeout_secs: None,
            fail_fast: false,
            init_missing: true,
            nice: None,
            ionice: None,
        }
    }
}

impl SessionConfig {
    pub fn setup_options(&self) -> SetupOptions {
        SetupOptions {
            scratch_dir: self.scratch_dir.clone(),
            restic_bin: self.restic_bin.clone(),
            enable_cache: self.enable_cache,
            cache_dir: self.cache_dir.clone(),
            nice: self.nice,
            ionice: self.ionice,
            timeout: self.timeout_secs.map(Duration::from_secs),
            verbose: self.verbose,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        let d = LockWaitOptions::default();
        Self {
            interval_secs: d.interval.as_secs(),
            timeout_secs: d.timeout.as_secs(),
        }
    }
}

impl From<LockConfig> for LockWaitOptions {
    fn from(c: LockConfig) -> Self {
        Self {
            interval: Duration::from_secs(c.interval_secs.max(1)),
            timeout: Duration::from_secs(c.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub dir: Option<PathBuf>,
}

/// `[repositories.<name>]`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RepositoryDef {
    pub storage: String,
    pub directory: String,
    pub encryption_secret: String,
    pub namespace: Option<String>,
    pub backup: Option<BackupOptions>,
    pub restore: Option<RestoreOptions>,
    pub dump: Option<DumpOptions>,
    /// Name of a `[retention.<name>]` policy.
    pub retention: Option<String>,
}

impl RepositoryDef {
    pub fn to_ref(&self, name: &str) -> RepositoryRef {
        RepositoryRef {
            name: name.to_string(),
            storage: self.storage.clone(),
            directory: if self.directory.trim().is_empty() {
                name.to_string()
            } else {
                self.directory.clone()
            },
            encryption_secret: self.encryption_secret.clone(),
            namespace: self
                .namespace
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "default".into()),
        }
    }
}

/// `[secrets.<name>]`: `string_data` is taken verbatim, `data` is base64.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct InlineSecret {
    string_data: BTreeMap<String, String>,
    data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SecretsDirConfig {
    path: Option<PathBuf>,
}

impl ConfigDoc {
    pub fn parse(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let path = path.into();
        let value: Value = toml::from_str(raw)
            .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;
        Ok(Self { path, value })
    }

    pub fn section(&self, key: &str) -> Option<&Table> {
        self.value.as_table().and_then(|t| t.get(key)?.as_table())
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let mut cur = &self.value;
        for seg in path.split('.').filter(|s| !s.is_empty()) {
            match cur.as_table().and_then(|t| t.get(seg)) {
                Some(v) => cur = v,
                None => return Ok(None),
            }
        }
        cur.clone()
            .try_into()
            .map(Some)
            .map_err(|e| Error::config(format!("invalid config at '{path}': {e}")))
    }

    // Entry names may contain dots, so they are not split like paths.
    fn entry<T: DeserializeOwned>(&self, section: &str, name: &str) -> Result<Option<T>> {
        let Some(v) = self.section(section).and_then(|t| t.get(name)) else {
            return Ok(None);
        };
        v.clone()
            .try_into()
            .map(Some)
            .map_err(|e| Error::config(format!("invalid config at '{section}.{name}': {e}")))
    }

    pub fn session(&self) -> Result<SessionConfig> {
        Ok(self.deserialize_path("session")?.unwrap_or_default())
    }

    pub fn lock_wait(&self) -> Result<LockWaitOptions> {
        let c: LockConfig = self.deserialize_path("lock")?.unwrap_or_default();
        Ok(c.into())
    }

    pub fn ledger_dir(&self) -> Result<Option<PathBuf>> {
        let c: LedgerConfig = self.deserialize_path("ledger")?.unwrap_or_default();
        Ok(c.dir)
    }

    pub fn repositories(&self) -> Result<BTreeMap<String, RepositoryDef>> {
        let mut out = BTreeMap::new();
        if let Some(tbl) = self.section("repositories") {
            for name in tbl.keys() {
                if let Some(def) = self.entry("repositories", name)? {
                    out.insert(name.clone(), def);
                }
            }
        }
        Ok(out)
    }

    pub fn repository(&self, name: &str) -> Result<RepositoryDef> {
        self.entry("repositories", name)?
            .ok_or_else(|| Error::config(format!("unknown repository '{name}'")))
    }

    pub fn retention_policy(&self, name: &str) -> Result<RetentionPolicy> {
        self.entry("retention", name)?
            .ok_or_else(|| Error::config(format!("unknown retention policy '{name}'")))
    }

    pub fn secrets_dir(&self) -> Result<Option<DirSecretStore>> {
        let c: SecretsDirConfig = self.deserialize_path("secrets_dir")?.unwrap_or_default();
        Ok(c.path.map(DirSecretStore::new))
    }
}

impl StorageLookup for ConfigDoc {
    fn storage(&self, name: &str) -> Result<StorageSpec> {
        self.entry("storages", name)?
            .ok_or_else(|| Error::config(format!("unknown storage '{name}'")))
    }
}

impl SecretStore for ConfigDoc {
    fn secret(&self, name: &str) -> Result<Secret> {
        if let Some(inline) = self.entry::<InlineSecret>("secrets", name)? {
            let mut s = Secret::new(name);
            for (k, v) in inline.string_data {
                s.data.insert(k, v.into_bytes());
            }
            for (k, v) in inline.data {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(v.trim())
                    .map_err(|e| {
                        Error::config(format!("secret '{name}' key '{k}' is not valid base64: {e}"))
                    })?;
                s.data.insert(k, bytes);
            }
            return Ok(s);
        }
        match self.secrets_dir()? {
            Some(dir) => dir.secret(name),
            None => Err(Error::config(format!("secret '{name}' not found"))),
        }
    }
}

/// Top-level tables of named entries. Only these can come from included files.
const SHARED_SECTIONS: [&str; 4] = ["storages", "secrets", "repositories", "retention"];

fn read_table(path: &Path) -> Result<Table> {
    let raw = fs::read_to_string(path).map_err(|e| {
        Error::config(format!("failed to read run definition {}: {e}", path.display()))
    })?;
    toml::from_str(&raw)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))
}

fn include_list(path: &Path, root: &mut Table) -> Result<Vec<PathBuf>> {
    let Some(v) = root.remove("include") else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = v else {
        return Err(Error::config(format!(
            "`include` in {} must be an array of paths",
            path.display()
        )));
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    items
        .into_iter()
        .map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Ok(dir.join(s.trim())),
            other => Err(Error::config(format!(
                "invalid include entry {other} in {}",
                path.display()
            ))),
        })
        .collect()
}

/// Named entries contributed by the included files, per section.
fn shared_entries(includes: &[PathBuf]) -> Result<BTreeMap<String, Table>> {
    let mut shared = BTreeMap::<String, Table>::new();
    for inc in includes {
        let tbl = read_table(inc)?;
        if tbl.contains_key("include") {
            return Err(Error::config(format!(
                "{} is an included file and cannot include others",
                inc.display()
            )));
        }
        for (section, v) in tbl {
            if !SHARED_SECTIONS.contains(&section.as_str()) {
                return Err(Error::config(format!(
                    "{}: [{section}] cannot be shared; included files may only define {}",
                    inc.display(),
                    SHARED_SECTIONS.join(", ")
                )));
            }
            let Value::Table(entries) = v else {
                return Err(Error::config(format!(
                    "{}: [{section}] must be a table",
                    inc.display()
                )));
            };
            let slot = shared.entry(section.clone()).or_default();
            for (name, entry) in entries {
                if slot.contains_key(&name) {
                    return Err(Error::config(format!(
                        "{section}.{name} is defined by more than one included file (again in {})",
                        inc.display()
                    )));
                }
                slot.insert(name, entry);
            }
        }
    }
    Ok(shared)
}

/// Load a run definition. Files listed in its top-level `include` array
/// (relative to the run definition) contribute storages, secrets,
/// repositories and retention policies. An entry defined in the run
/// definition itself replaces an included entry of the same name as a whole.
pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut root = read_table(path)?;
    let includes = include_list(path, &mut root)?;
    for (section, mut entries) in shared_entries(&includes)? {
        match root.remove(&section) {
            Some(Value::Table(own)) => {
                for (name, entry) in own {
                    entries.insert(name, entry);
                }
            }
            Some(_) => {
                return Err(Error::config(format!(
                    "[{section}] in {} must be a table",
                    path.display()
                )));
            }
            None => {}
        }
        root.insert(section, Value::Table(entries));
    }
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value: Value::Table(root),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::secrets;

    const DOC: &str = r#"
[session]
restic_bin = "/usr/local/bin/restic"
max_parallel = 4
timeout_secs = 3600
nice = { adjustment = 10 }

[lock]
interval_secs = 2
timeout_secs = 30

[storages."minio.local".s3]
bucket = "backups"
endpoint = "minio.local:9000"
secret = "minio-creds"

[secrets.minio-creds.string_data]
AWS_ACCESS_KEY_ID = "AK"
AWS_SECRET_ACCESS_KEY = "SK"

[secrets.enc]
string_data = { RESTIC_PASSWORD = "pw" }
data = { CA_CERT_DATA = "LS0tLS1CRUdJTg==" }

[repositories.app]
storage = "minio.local"
encryption_secret = "enc"
namespace = "demo"
retention = "short"
backup = { paths = ["/data"], tags = ["nightly"] }

[retention.short]
keep_last = 3
prune = true
"#;

    #[test]
    fn typed_sections() {
        let doc = ConfigDoc::parse("run.toml", DOC).expect("parse");
        let s = doc.session().expect("session");
        assert_eq!(s.max_parallel, 4);
        assert_eq!(s.setup_options().timeout, Some(Duration::from_secs(3600)));
        assert_eq!(s.setup_options().nice, Some(NiceSettings { adjustment: 10 }));
        assert!(s.init_missing);

        let lw = doc.lock_wait().expect("lock");
        assert_eq!(lw.interval, Duration::from_secs(2));
        assert_eq!(lw.timeout, Duration::from_secs(30));

        let repo = doc.repository("app").expect("repo");
        let r = repo.to_ref("app");
        assert_eq!(r.directory, "app");
        assert_eq!(r.namespace, "demo");
        assert_eq!(repo.backup.expect("backup").tags, vec!["nightly".to_string()]);
        let policy = doc
            .retention_policy(repo.retention.as_deref().expect("retention"))
            .expect("policy");
        assert_eq!(policy.keep_last, Some(3));
        assert!(policy.prune);
        assert!(doc.repository("missing").is_err());
    }

    #[test]
    fn storages_and_inline_secrets() {
        let doc = ConfigDoc::parse("run.toml", DOC).expect("parse");
        let st = doc.storage("minio.local").expect("storage");
        assert_eq!(st.s3.expect("s3").bucket, "backups");

        let enc = doc.secret("enc").expect("enc");
        assert_eq!(enc.get(secrets::CA_CERT_DATA), Some(&b"-----BEGIN"[..]));
        assert_eq!(
            doc.secret("minio-creds")
                .expect("creds")
                .get_string(secrets::AWS_ACCESS_KEY_ID)
                .expect("utf8")
                .as_deref(),
            Some("AK")
        );
        assert!(doc.secret("nope").is_err());
    }

    #[test]
    fn secrets_dir_fallback() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("mounted")).expect("mkdir");
        fs::write(tmp.path().join("mounted").join("RESTIC_PASSWORD"), "pw").expect("write");
        let raw = format!("[secrets_dir]\npath = {:?}\n", tmp.path().display().to_string());
        let doc = ConfigDoc::parse("run.toml", &raw).expect("parse");
        assert!(doc.secret("mounted").expect("mounted").contains("RESTIC_PASSWORD"));
    }

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).expect("write");
    }

    #[test]
    fn included_entries_and_local_overrides() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write(
            tmp.path(),
            "shared.toml",
            "[storages.vol.local]\nmount_path = \"/mnt/backups\"\n\
             [storages.old.local]\nmount_path = \"/mnt/old\"\n\
             [retention.short]\nkeep_last = 3\n",
        );
        write(
            tmp.path(),
            "run.toml",
            "include = [\"shared.toml\"]\n\
             [session]\nmax_parallel = 8\n\
             [storages.old.local]\nmount_path = \"/mnt/new\"\n",
        );

        let doc = load(&tmp.path().join("run.toml")).expect("load");
        assert_eq!(doc.session().expect("session").max_parallel, 8);
        let mount = |name: &str| {
            doc.storage(name)
                .expect("storage")
                .local
                .expect("local")
                .mount_path
        };
        assert_eq!(mount("vol"), "/mnt/backups");
        assert_eq!(mount("old"), "/mnt/new");
        assert_eq!(doc.retention_policy("short").expect("policy").keep_last, Some(3));
        assert!(doc.section("include").is_none());
    }

    #[test]
    fn included_files_are_limited_to_named_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write(tmp.path(), "run.toml", "include = [\"a.toml\", \"b.toml\"]\n");

        write(tmp.path(), "a.toml", "[session]\nmax_parallel = 2\n");
        write(tmp.path(), "b.toml", "");
        let err = load(&tmp.path().join("run.toml")).unwrap_err();
        assert!(err.to_string().contains("[session] cannot be shared"), "{err}");

        write(tmp.path(), "a.toml", "[secrets.enc.string_data]\nRESTIC_PASSWORD = \"a\"\n");
        write(tmp.path(), "b.toml", "[secrets.enc.string_data]\nRESTIC_PASSWORD = \"b\"\n");
        let err = load(&tmp.path().join("run.toml")).unwrap_err();
        assert!(err.to_string().contains("secrets.enc is defined by more than one"), "{err}");

        write(tmp.path(), "a.toml", "include = [\"b.toml\"]\n");
        let err = load(&tmp.path().join("run.toml")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
        assert!(err.to_string().contains("cannot include others"), "{err}");
    }
}
