//! Evidence retention sweeper (§4.3).
//!
//! The Evidence Store never expires anything on its own; retention is an
//! out-of-band policy applied by a background sweeper over already-sealed
//! attempt directories. An attempt without a `.sealed` marker is still open
//! and is never touched regardless of policy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::fs;
use tracing::{info, warn};

const SEALED_MARKER: &str = ".sealed";
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    NeverExpire,
    CompressAfterDays(u32),
    DeleteAfterDays(u32),
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::DeleteAfterDays(30)
    }
}

impl RetentionPolicy {
    /// Parses the three forms §4.3 names: `never-expire`,
    /// `compress-after-N-days`, `delete-after-N-days`.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw == "never-expire" {
            return Some(RetentionPolicy::NeverExpire);
        }
        if let Some(n) = raw.strip_prefix("compress-after-").and_then(|s| s.strip_suffix("-days")) {
            return n.parse().ok().map(RetentionPolicy::CompressAfterDays);
        }
        if let Some(n) = raw.strip_prefix("delete-after-").and_then(|s| s.strip_suffix("-days")) {
            return n.parse().ok().map(RetentionPolicy::DeleteAfterDays);
        }
        None
    }
}

/// Sweeps every sealed attempt directory under `evidence_root` against
/// `policy`. Idempotent: a directory already deleted stays deleted, a file
/// already compressed is left alone (checked via its `.gz` sibling).
pub async fn sweep(evidence_root: &Path, policy: RetentionPolicy) -> std::io::Result<()> {
    if policy == RetentionPolicy::NeverExpire {
        return Ok(());
    }
    if !evidence_root.exists() {
        return Ok(());
    }

    let mut task_dirs = fs::read_dir(evidence_root).await?;
    while let Some(task_entry) = task_dirs.next_entry().await? {
        if !task_entry.file_type().await?.is_dir() {
            continue;
        }
        let mut attempt_dirs = fs::read_dir(task_entry.path()).await?;
        while let Some(attempt_entry) = attempt_dirs.next_entry().await? {
            if !attempt_entry.file_type().await?.is_dir() {
                continue;
            }
            if let Err(err) = sweep_attempt(&attempt_entry.path(), policy).await {
                warn!(dir = %attempt_entry.path().display(), error = %err, "failed to sweep attempt directory");
            }
        }
    }
    Ok(())
}

async fn sweep_attempt(attempt_dir: &Path, policy: RetentionPolicy) -> std::io::Result<()> {
    let sealed_marker = attempt_dir.join(SEALED_MARKER);
    let Ok(metadata) = fs::metadata(&sealed_marker).await else {
        return Ok(());
    };
    let age = metadata.modified()?.elapsed().unwrap_or_default();

    match policy {
        RetentionPolicy::NeverExpire => Ok(()),
        RetentionPolicy::DeleteAfterDays(days) => {
            if age >= Duration::from_secs(u64::from(days) * 86_400) {
                fs::remove_dir_all(attempt_dir).await?;
                info!(dir = %attempt_dir.display(), "deleted expired attempt evidence");
            }
            Ok(())
        }
        RetentionPolicy::CompressAfterDays(days) => {
            if age >= Duration::from_secs(u64::from(days) * 86_400) {
                compress_attempt(attempt_dir).await?;
            }
            Ok(())
        }
    }
}

async fn compress_attempt(attempt_dir: &Path) -> std::io::Result<()> {
    let mut entries = fs::read_dir(attempt_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) == Some("gz") {
            continue;
        }
        let gz_path = append_gz_suffix(&path);
        if fs::metadata(&gz_path).await.is_ok() {
            continue;
        }
        gzip_in_place(&path, &gz_path).await?;
        fs::remove_file(&path).await?;
    }
    Ok(())
}

fn append_gz_suffix(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".gz");
    PathBuf::from(s)
}

async fn gzip_in_place(source: &Path, dest: &Path) -> std::io::Result<()> {
    let content = fs::read(source).await?;
    let dest = dest.to_owned();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = std::fs::File::create(&dest)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        std::io::Write::write_all(&mut encoder, &content)?;
        encoder.finish()?;
        Ok(())
    })
    .await
    .unwrap_or_else(|err| Err(std::io::Error::other(err)))
}

/// Drives `sweep` on a fixed interval forever. Intended to be spawned
/// alongside the Sprint Controller and aborted when the sprint run ends.
pub async fn run_sweep_loop(evidence_root: PathBuf, policy: RetentionPolicy, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(err) = sweep(&evidence_root, policy).await {
            warn!(error = %err, "evidence retention sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse_cases() -> Vec<(&'static str, Option<RetentionPolicy>)> {
        vec![
            ("never-expire", Some(RetentionPolicy::NeverExpire)),
            ("compress-after-14-days", Some(RetentionPolicy::CompressAfterDays(14))),
            ("delete-after-30-days", Some(RetentionPolicy::DeleteAfterDays(30))),
            ("whatever", None),
        ]
    }

    #[test]
    fn parses_all_three_documented_policy_forms() {
        for (raw, expected) in parse_cases() {
            assert_eq!(RetentionPolicy::parse(raw), expected, "parsing {raw}");
        }
    }

    #[test]
    fn default_policy_matches_the_old_thirty_day_default() {
        assert_eq!(RetentionPolicy::default(), RetentionPolicy::DeleteAfterDays(30));
    }

    async fn seal(dir: &Path) {
        fs::create_dir_all(dir).await.unwrap();
        fs::write(dir.join(SEALED_MARKER), b"").await.unwrap();
    }

    #[tokio::test]
    async fn sweep_never_expire_leaves_everything_untouched() {
        let root = TempDir::new().unwrap();
        let attempt = root.path().join("T001").join("attempt-1");
        seal(&attempt).await;
        fs::write(attempt.join("attempt-log.txt"), b"log").await.unwrap();

        sweep(root.path(), RetentionPolicy::NeverExpire).await.unwrap();

        assert!(attempt.join("attempt-log.txt").exists());
    }

    #[tokio::test]
    async fn sweep_deletes_attempts_older_than_zero_days() {
        let root = TempDir::new().unwrap();
        let attempt = root.path().join("T001").join("attempt-1");
        seal(&attempt).await;

        sweep(root.path(), RetentionPolicy::DeleteAfterDays(0)).await.unwrap();

        assert!(!attempt.exists());
    }

    #[tokio::test]
    async fn sweep_never_touches_an_attempt_without_a_sealed_marker() {
        let root = TempDir::new().unwrap();
        let attempt = root.path().join("T001").join("attempt-1");
        fs::create_dir_all(&attempt).await.unwrap();
        fs::write(attempt.join("attempt-log.txt"), b"log").await.unwrap();

        sweep(root.path(), RetentionPolicy::DeleteAfterDays(0)).await.unwrap();

        assert!(attempt.exists());
    }

    #[tokio::test]
    async fn sweep_compresses_files_in_place_and_is_idempotent() {
        let root = TempDir::new().unwrap();
        let attempt = root.path().join("T001").join("attempt-1");
        seal(&attempt).await;
        fs::write(attempt.join("attempt-log.txt"), b"some log output").await.unwrap();

        sweep(root.path(), RetentionPolicy::CompressAfterDays(0)).await.unwrap();
        assert!(!attempt.join("attempt-log.txt").exists());
        assert!(attempt.join("attempt-log.txt.gz").exists());

        // Running again must not fail or double-compress the .gz sibling.
        sweep(root.path(), RetentionPolicy::CompressAfterDays(0)).await.unwrap();
        assert!(attempt.join("attempt-log.txt.gz").exists());
    }
}
