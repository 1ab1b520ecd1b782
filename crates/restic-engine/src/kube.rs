use serde::Deserialize;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::lock::{PodPhase, PodStatusLookup};
use crate::restic::command::{self, Invocation};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct PodDoc {
    status: PodStatus,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct PodStatus {
    phase: String,
}

/// Pod lookups through `kubectl get pod -o json`.
#[derive(Debug, Clone)]
pub struct KubectlPodLookup {
    kubectl: String,
    cancel: CancelToken,
}

impl Default for KubectlPodLookup {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl KubectlPodLookup {
    pub fn new(kubectl: impl Into<String>) -> Self {
        Self {
            kubectl: kubectl.into(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// kubectl's answer for a pod that no longer exists. Anything else on a
/// failed lookup (RBAC, connectivity, a missing namespace) is a query error.
pub(crate) fn is_pod_not_found(stderr: &str, name: &str) -> bool {
    let tail = format!("pods \"{name}\" not found");
    stderr
        .lines()
        .map(str::trim)
        .any(|l| l.starts_with("Error from server (NotFound):") && l.ends_with(&tail))
}

pub(crate) fn parse_pod_phase(raw: &[u8]) -> Result<PodPhase> {
    let doc: PodDoc = serde_json::from_slice(raw)
        .map_err(|e| Error::parse(format!("failed to decode pod: {e}")))?;
    Ok(PodPhase::parse(&doc.status.phase))
}

impl PodStatusLookup for KubectlPodLookup {
    fn pod_phase(&self, namespace: &str, name: &str) -> Result<Option<PodPhase>> {
        if name.trim().is_empty() {
            return Err(Error::lock_query("lock holder has no hostname"));
        }
        let mut args = vec!["get".to_string(), "pod".to_string(), name.to_string()];
        if !namespace.trim().is_empty() {
            args.extend(["-n".to_string(), namespace.to_string()]);
        }
        args.extend(["-o".to_string(), "json".to_string()]);
        let inv = Invocation::new(self.kubectl.clone(), args);
        let out = command::run_unchecked(&inv, &self.cancel)?;
        if !out.success() {
            if is_pod_not_found(&String::from_utf8_lossy(&out.stderr), name) {
                return Ok(None);
            }
            return Err(Error::lock_query(format!(
                "kubectl get pod {name} failed: {}",
                out.summary()
            )));
        }
        parse_pod_phase(&out.stdout).map(Some)
    }
}
