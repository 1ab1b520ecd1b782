use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const RESTIC_PASSWORD: &str = "RESTIC_PASSWORD";
pub const CA_CERT_DATA: &str = "CA_CERT_DATA";
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const GOOGLE_PROJECT_ID: &str = "GOOGLE_PROJECT_ID";
pub const GOOGLE_SERVICE_ACCOUNT_JSON_KEY: &str = "GOOGLE_SERVICE_ACCOUNT_JSON_KEY";
pub const AZURE_ACCOUNT_KEY: &str = "AZURE_ACCOUNT_KEY";
pub const B2_ACCOUNT_ID: &str = "B2_ACCOUNT_ID";
pub const B2_ACCOUNT_KEY: &str = "B2_ACCOUNT_KEY";

/// Key/value secret material. Values are raw bytes, as mounted secrets are.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

// Never print values.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Secret {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn require(&self, key: &str) -> Result<&[u8]> {
        self.get(key).ok_or_else(|| {
            Error::config(format!("secret '{}' is missing key '{}'", self.name, key))
        })
    }

    pub fn require_all(&self, keys: &[&str]) -> Result<()> {
        for k in keys {
            self.require(k)?;
        }
        Ok(())
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        let s = String::from_utf8(raw.to_vec()).map_err(|_| {
            Error::config(format!(
                "secret '{}' key '{}' is not valid UTF-8",
                self.name, key
            ))
        })?;
        Ok(Some(s.trim_end_matches(['\n', '\r']).to_string()))
    }

    /// Merge two secrets; keys from `overlay` win on conflict.
    pub fn merged(&self, overlay: &Secret) -> Secret {
        let mut data = self.data.clone();
        for (k, v) in &overlay.data {
            data.insert(k.clone(), v.clone());
        }
        Secret {
            name: format!("{}+{}", self.name, overlay.name),
            data,
        }
    }
}

/// Fetch secrets by name.
pub trait SecretStore: Send + Sync {
    fn secret(&self, name: &str) -> Result<Secret>;
}

/// Secrets mounted as a directory tree: `<root>/<secret>/<key>`.
#[derive(Debug, Clone)]
pub struct DirSecretStore {
    root: PathBuf,
}

impl DirSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SecretStore for DirSecretStore {
    fn secret(&self, name: &str) -> Result<Secret> {
        let name = name.trim();
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(Error::config(format!("invalid secret name '{name}'")));
        }
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Err(Error::config(format!(
                "secret '{}' not found under {}",
                name,
                self.root.display()
            )));
        }
        let entries = fs::read_dir(&dir)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", dir.display())))?;
        let mut secret = Secret::new(name);
        for entry in entries {
            let entry = entry?;
            let key = entry.file_name().to_string_lossy().to_string();
            // Kubernetes projects keys through `..data` symlinks; skip the plumbing.
            if key.starts_with('.') || !entry.path().is_file() {
                continue;
            }
            let value = fs::read(entry.path()).map_err(|e| {
                Error::config(format!("failed to read {}: {e}", entry.path().display()))
            })?;
            secret.data.insert(key, value);
        }
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_names_secret_and_key() {
        let s = Secret::new("aws-creds").with(AWS_ACCESS_KEY_ID, "AK");
        let err = s
            .require_all(&[AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY])
            .unwrap_err()
            .to_string();
        assert!(err.contains("aws-creds"), "{err}");
        assert!(err.contains(AWS_SECRET_ACCESS_KEY), "{err}");
    }

    #[test]
    fn overlay_keys_win() {
        let enc = Secret::new("enc")
            .with(RESTIC_PASSWORD, "pw")
            .with("SHARED", "enc");
        let storage = Secret::new("storage").with("SHARED", "storage");
        let m = enc.merged(&storage);
        assert_eq!(m.get("SHARED"), Some(&b"storage"[..]));
        assert_eq!(m.get(RESTIC_PASSWORD), Some(&b"pw"[..]));
    }

    #[test]
    fn debug_hides_values() {
        let s = Secret::new("enc").with(RESTIC_PASSWORD, "hunter2");
        assert!(!format!("{s:?}").contains("hunter2"));
    }

    #[test]
    fn dir_store_reads_mounted_keys() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("enc");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join(RESTIC_PASSWORD), "pw\n").expect("write");
        fs::write(dir.join("..data"), "ignored").expect("write");

        let store = DirSecretStore::new(tmp.path());
        let s = store.secret("enc").expect("secret");
        assert_eq!(s.get_string(RESTIC_PASSWORD).expect("utf8"), Some("pw".into()));
        assert!(!s.contains("..data"));
        assert!(store.secret("absent").is_err());
    }
}
