//! Evidence Store (§4.3).
//!
//! Persists per-attempt artifacts under `<evidence-root>/<task-id>/attempt-<n>/`.
//! Every artifact is written alongside a sidecar authenticity header
//! (producer identity, platform, pid, timestamp, digest) so that evidence
//! can be verified without re-running anything. Closed attempts are
//! immutable: re-opening or writing to one is a hard error.

use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::protocol::{AuthenticityHeader, ExecutionReport};

#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    #[error("attempt {task_id}/attempt-{attempt_number} is already closed")]
    AlreadyClosed { task_id: String, attempt_number: u32 },

    #[error("attempt {task_id}/attempt-{attempt_number} is already open on disk")]
    AlreadyOpen { task_id: String, attempt_number: u32 },

    #[error("evidence I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("evidence serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

const SEALED_MARKER: &str = ".sealed";

pub struct EvidenceStore {
    root: PathBuf,
}

/// A handle to one open attempt directory. Dropping it without calling
/// [`EvidenceStore::close_attempt`] leaves the attempt open — the store
/// does not implicitly seal on drop, since a crash mid-attempt should be
/// visible as an unsealed directory, not silently finalized.
pub struct AttemptHandle {
    pub task_id: String,
    pub attempt_number: u32,
    dir: PathBuf,
}

impl EvidenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn attempt_dir(&self, task_id: &str, attempt_number: u32) -> PathBuf {
        self.root.join(task_id).join(format!("attempt-{attempt_number}"))
    }

    pub async fn open_attempt(&self, task_id: &str, attempt_number: u32) -> Result<AttemptHandle, EvidenceError> {
        let dir = self.attempt_dir(task_id, attempt_number);
        if dir.join(SEALED_MARKER).exists() {
            return Err(EvidenceError::AlreadyClosed {
                task_id: task_id.to_string(),
                attempt_number,
            });
        }
        if dir.exists() {
            return Err(EvidenceError::AlreadyOpen {
                task_id: task_id.to_string(),
                attempt_number,
            });
        }
        fs::create_dir_all(&dir).await?;
        Ok(AttemptHandle {
            task_id: task_id.to_string(),
            attempt_number,
            dir,
        })
    }

    pub async fn write_artifact(
        &self,
        handle: &AttemptHandle,
        name: &str,
        content: &[u8],
    ) -> Result<AuthenticityHeader, EvidenceError> {
        if handle.dir.join(SEALED_MARKER).exists() {
            return Err(EvidenceError::AlreadyClosed {
                task_id: handle.task_id.clone(),
                attempt_number: handle.attempt_number,
            });
        }

        let artifact_path = handle.dir.join(name);
        fs::write(&artifact_path, content).await?;

        let header = authenticity_header(content);
        let header_path = handle.dir.join(format!("{name}.header.json"));
        fs::write(&header_path, serde_json::to_vec_pretty(&header)?).await?;

        Ok(header)
    }

    /// Closes an attempt, writing the legacy `attempt-summary.json`/
    /// `attempt-log.txt` pair plus the consolidated `execution-report.json`
    /// (§6) carrying its own authenticity header over the report body.
    pub async fn close_attempt(
        &self,
        handle: AttemptHandle,
        summary: &serde_json::Value,
        log: &str,
        mut report: ExecutionReport,
    ) -> Result<(), EvidenceError> {
        if handle.dir.join(SEALED_MARKER).exists() {
            return Err(EvidenceError::AlreadyClosed {
                task_id: handle.task_id.clone(),
                attempt_number: handle.attempt_number,
            });
        }

        fs::write(handle.dir.join("attempt-summary.json"), serde_json::to_vec_pretty(summary)?).await?;
        fs::write(handle.dir.join("attempt-log.txt"), log).await?;

        let payload = serde_json::to_vec(&report)?;
        report.authenticity = authenticity_header(&payload);
        fs::write(handle.dir.join("execution-report.json"), serde_json::to_vec_pretty(&report)?).await?;

        fs::write(handle.dir.join(SEALED_MARKER), b"").await?;
        Ok(())
    }

    /// Re-hashes every artifact under an attempt and compares against its
    /// sidecar header. Used by the immutability property test (§8.2).
    pub async fn verify_digests(&self, task_id: &str, attempt_number: u32) -> Result<bool, EvidenceError> {
        let dir = self.attempt_dir(task_id, attempt_number);
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") && path.to_string_lossy().ends_with(".header.json") {
                continue;
            }
            let header_path = append_header_suffix(&path);
            if !header_path.exists() {
                continue;
            }
            let content = fs::read(&path).await?;
            let header: AuthenticityHeader = serde_json::from_slice(&fs::read(&header_path).await?)?;
            if header.digest != digest_hex(&content) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn append_header_suffix(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".header.json");
    PathBuf::from(s)
}

fn digest_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

fn authenticity_header(content: &[u8]) -> AuthenticityHeader {
    AuthenticityHeader {
        producer: env!("CARGO_PKG_NAME").to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        platform: std::env::consts::OS.to_string(),
        pid: std::process::id(),
        timestamp: Utc::now(),
        digest: digest_hex(content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CompletionEvaluation, ExecutionSummary, TestPlanBody, TestPlanDocument};
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_report() -> ExecutionReport {
        ExecutionReport {
            report_version: crate::protocol::REPORT_VERSION.to_string(),
            generated_at: Utc::now(),
            test_specification: TestPlanDocument {
                task_id: "T001".into(),
                title: "t".into(),
                description: None,
                test_plan: TestPlanBody {
                    schema_version: "1.0".into(),
                    setup: vec![],
                    tests: vec![],
                    teardown: vec![],
                    coverage: None,
                },
            },
            execution_summary: ExecutionSummary {
                total_actions: 0,
                passed: 0,
                blocking_failures: 0,
                non_blocking_warnings: 0,
                duration_ms: 0,
            },
            setup_results: vec![],
            test_results: vec![],
            teardown_results: vec![],
            validation_evaluation: vec![],
            completion_evaluation: CompletionEvaluation {
                all_steps_passed: true,
                minimum_pass_rate_met: true,
                required_evidence_present: true,
                sealed: true,
            },
            authenticity: AuthenticityHeader {
                producer: String::new(),
                producer_version: String::new(),
                platform: String::new(),
                pid: 0,
                timestamp: Utc::now(),
                digest: String::new(),
            },
        }
    }

    #[tokio::test]
    async fn open_write_close_round_trips_digest() {
        let dir = TempDir::new().unwrap();
        let store = EvidenceStore::new(dir.path());
        let handle = store.open_attempt("T001", 1).await.unwrap();
        store.write_artifact(&handle, "setup-1-stdout.txt", b"installed ok").await.unwrap();
        store
            .close_attempt(handle, &json!({"status": "passed"}), "setup-1: ok\n", sample_report())
            .await
            .unwrap();

        assert!(store.verify_digests("T001", 1).await.unwrap());
    }

    #[tokio::test]
    async fn reopening_a_closed_attempt_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = EvidenceStore::new(dir.path());
        let handle = store.open_attempt("T001", 1).await.unwrap();
        store.close_attempt(handle, &json!({}), "", sample_report()).await.unwrap();

        let result = store.open_attempt("T001", 1).await;
        assert!(matches!(result, Err(EvidenceError::AlreadyClosed { .. })));
    }

    #[tokio::test]
    async fn writing_after_close_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = EvidenceStore::new(dir.path());
        let handle = store.open_attempt("T001", 1).await.unwrap();
        let dir_path = dir.path().join("T001").join("attempt-1");
        store.close_attempt(handle, &json!({}), "", sample_report()).await.unwrap();

        let stale_handle = AttemptHandle {
            task_id: "T001".to_string(),
            attempt_number: 1,
            dir: dir_path,
        };
        let result = store.write_artifact(&stale_handle, "late.txt", b"too late").await;
        assert!(matches!(result, Err(EvidenceError::AlreadyClosed { .. })));
    }

    #[tokio::test]
    async fn digest_mismatch_is_detected() {
        let dir = TempDir::new().unwrap();
        let store = EvidenceStore::new(dir.path());
        let handle = store.open_attempt("T001", 1).await.unwrap();
        store.write_artifact(&handle, "setup-1-stdout.txt", b"original").await.unwrap();

        // Tamper with the artifact after the header was written.
        fs::write(dir.path().join("T001/attempt-1/setup-1-stdout.txt"), b"tampered")
            .await
            .unwrap();
        store.close_attempt(handle, &json!({}), "", sample_report()).await.unwrap();

        assert!(!store.verify_digests("T001", 1).await.unwrap());
    }

    #[tokio::test]
    async fn close_attempt_writes_an_execution_report_with_a_real_digest() {
        let dir = TempDir::new().unwrap();
        let store = EvidenceStore::new(dir.path());
        let handle = store.open_attempt("T001", 1).await.unwrap();
        store.close_attempt(handle, &json!({}), "", sample_report()).await.unwrap();

        let report_path = dir.path().join("T001/attempt-1/execution-report.json");
        let raw = fs::read_to_string(&report_path).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value.get("reportVersion").is_some());
        assert!(value.get("authenticity").is_some());
        assert_ne!(value["authenticity"]["digest"].as_str().unwrap(), "");
    }
}
