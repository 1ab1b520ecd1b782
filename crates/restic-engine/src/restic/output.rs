use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CHECK_OK_LINE: &str = "no errors were found";

/// restic >= 0.17 exits with this code when the repository has no config.
const EXIT_REPOSITORY_MISSING: i32 = 10;

static LOCK_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{64}$").unwrap_or_else(|e| panic!("invalid lock id regex: {e}"))
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub total: u64,
    pub new: u64,
    pub modified: u64,
    pub unmodified: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub snapshot_id: String,
    pub file_stats: FileStats,
    pub uploaded: String,
    pub total_size: String,
    pub processing_time: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedBackupOutput {
    pub stats: Vec<SnapshotStats>,
    /// Lines that looked like JSON but did not decode. Kept for diagnostics.
    pub decode_errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub integrity: bool,
    pub size: String,
    pub snapshot_count: usize,
    pub snapshots_removed_by_last_clean_up: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct BackupSummary {
    message_type: String,
    files_new: u64,
    files_changed: u64,
    files_unmodified: u64,
    data_added: u64,
    total_files_processed: u64,
    total_bytes_processed: u64,
    total_duration: f64,
    snapshot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatsDoc {
    total_size: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ForgetGroup {
    remove: Option<Vec<Snapshot>>,
}

/// Decode `restic backup --json` output, keeping only summary records.
pub fn parse_backup_output(out: &[u8]) -> ParsedBackupOutput {
    let text = String::from_utf8_lossy(out);
    let mut parsed = ParsedBackupOutput::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let summary = match serde_json::from_str::<BackupSummary>(line) {
            Ok(v) => v,
            Err(e) => {
                parsed.decode_errors.push(format!("{e}: {}", truncate(line, 200)));
                continue;
            }
        };
        if summary.message_type != "summary" {
            continue;
        }
        parsed.stats.push(SnapshotStats {
            snapshot_id: summary.snapshot_id.unwrap_or_default(),
            file_stats: FileStats {
                total: summary.total_files_processed,
                new: summary.files_new,
                modified: summary.files_changed,
                unmodified: summary.files_unmodified,
            },
            uploaded: format_bytes(summary.data_added),
            total_size: format_bytes(summary.total_bytes_processed),
            processing_time: format_duration_secs(summary.total_duration),
        });
    }
    parsed
}

pub fn parse_check_output(out: &[u8]) -> bool {
    String::from_utf8_lossy(out)
        .lines()
        .any(|l| l.trim() == CHECK_OK_LINE)
}

/// `restic stats --json` -> human readable repository size.
pub fn parse_stats_output(out: &[u8]) -> Result<String> {
    let doc: StatsDoc = serde_json::from_slice(trim_ascii(out))
        .map_err(|e| Error::parse(format!("failed to decode stats output: {e}")))?;
    Ok(format_bytes(doc.total_size))
}

pub fn parse_lock_stats(out: &[u8]) -> Result<LockStats> {
    serde_json::from_slice(trim_ascii(out))
        .map_err(|e| Error::parse(format!("failed to decode lock metadata: {e}")))
}

/// Whether a failed `restic cat config` means the repository was never
/// initialized, as opposed to a password, network or permission failure.
pub fn is_missing_repository(code: Option<i32>, stderr: &str) -> bool {
    code == Some(EXIT_REPOSITORY_MISSING)
        || stderr.lines().any(|l| {
            let l = l.trim();
            l == "Is there a repository at the following location?"
                || l.starts_with("Fatal: repository does not exist")
        })
}

/// Whether a failed `restic cat <type> <id>` means the file itself is gone.
/// Only restic's `Fatal:` line is consulted.
pub fn is_missing_file(stderr: &str) -> bool {
    stderr
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("Fatal:"))
        .any(|l| {
            l.ends_with(": no such file or directory")
                || l.ends_with(" does not exist")
                || l.contains("The specified key does not exist.")
        })
}

/// Lock ids from `restic list locks`; anything that is not an id is ignored.
pub fn parse_lock_ids(out: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(out)
        .lines()
        .map(str::trim)
        .filter(|l| LOCK_ID_RE.is_match(l))
        .map(ToOwned::to_owned)
        .collect()
}

pub fn parse_snapshot_list(out: &[u8]) -> Result<Vec<Snapshot>> {
    let body = trim_ascii(out);
    if body.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice::<Option<Vec<Snapshot>>>(body)
        .map(Option::unwrap_or_default)
        .map_err(|e| Error::parse(format!("failed to decode snapshot list: {e}")))
}

/// Snapshots removed by `restic forget --json`. With `--prune` restic prints
/// plain-text prune progress after the JSON document, so only the first line
/// that opens an array is decoded.
pub fn parse_forget_output(out: &[u8]) -> Result<Vec<Snapshot>> {
    let text = String::from_utf8_lossy(out);
    let Some(line) = text.lines().map(str::trim).find(|l| l.starts_with('[')) else {
        return Ok(Vec::new());
    };
    let groups: Vec<ForgetGroup> = serde_json::from_str(line)
        .map_err(|e| Error::parse(format!("failed to decode forget output: {e}")))?;
    Ok(groups
        .into_iter()
        .flat_map(|g| g.remove.unwrap_or_default())
        .collect())
}

/// Binary-prefixed size, e.g. `1.500 KiB`. Values up to 1 KiB print as bytes.
pub fn format_bytes(c: u64) -> String {
    const KIB: u64 = 1 << 10;
    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;
    const TIB: u64 = 1 << 40;
    let b = c as f64;
    if c > TIB {
        format!("{:.3} TiB", b / TIB as f64)
    } else if c > GIB {
        format!("{:.3} GiB", b / GIB as f64)
    } else if c > MIB {
        format!("{:.3} MiB", b / MIB as f64)
    } else if c > KIB {
        format!("{:.3} KiB", b / KIB as f64)
    } else {
        format!("{c} B")
    }
}

/// `1h2m3s`, `4m5s`, `6s`. Fractions are rounded to whole seconds.
pub fn format_duration_secs(secs: f64) -> String {
    let total = if secs.is_finite() && secs > 0.0 {
        secs.round() as u64
    } else {
        0
    };
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn trim_ascii(b: &[u8]) -> &[u8] {
    b.trim_ascii()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
