//! `file-check` action type (§4.1).
//!
//! Verifies file existence, optional content substring match, optional
//! byte-size bounds, optional hash match. Success only if every declared
//! sub-check passes; each sub-check's result is enumerated into the
//! captured "stdout" so the classifier and evidence trail can show which
//! one failed.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::classifier::RawActionResult;
use crate::protocol::{Action, ActionBody, FileCheckSpec};

use super::{ActionExecutor, ExecutionEnvironment};

#[derive(Default)]
pub struct FileCheckExecutor;

#[async_trait]
impl ActionExecutor for FileCheckExecutor {
    fn can_handle(&self, action: &Action) -> bool {
        matches!(action.body, ActionBody::FileCheck { .. })
    }

    #[instrument(skip(self, env), fields(action_id = %action.id))]
    async fn execute(&self, action: &Action, env: &ExecutionEnvironment) -> RawActionResult {
        let spec = match &action.body {
            ActionBody::FileCheck { file } => file,
            _ => unreachable!("can_handle guarantees FileCheck"),
        };

        let path = env.workspace_root.join(&spec.path);
        let mut report = Vec::new();

        let content = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                report.push(format!("exists: {}", path.display()));
                bytes
            }
            Err(err) => {
                return RawActionResult {
                    exit_code: Some(1),
                    stdout: format!("exists: false ({err})"),
                    ..Default::default()
                }
            }
        };

        let mut all_passed = true;

        if let Some(expected_substring) = &spec.contains {
            let text = String::from_utf8_lossy(&content);
            let found = text.contains(expected_substring.as_str());
            report.push(format!("contains \"{expected_substring}\": {found}"));
            all_passed &= found;
        }

        if let Some(min) = spec.min_bytes {
            let ok = content.len() as u64 >= min;
            report.push(format!("min_bytes {min}: {ok} (actual {})", content.len()));
            all_passed &= ok;
        }

        if let Some(max) = spec.max_bytes {
            let ok = content.len() as u64 <= max;
            report.push(format!("max_bytes {max}: {ok} (actual {})", content.len()));
            all_passed &= ok;
        }

        if let Some(expected_hash) = &spec.sha256 {
            let mut hasher = Sha256::new();
            hasher.update(&content);
            let actual_hash = format!("{:x}", hasher.finalize());
            let ok = &actual_hash == expected_hash;
            report.push(format!("sha256 {expected_hash}: {ok} (actual {actual_hash})"));
            all_passed &= ok;
        }

        RawActionResult {
            exit_code: Some(if all_passed { 0 } else { 1 }),
            stdout: report.join("\n"),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn action(spec: FileCheckSpec) -> Action {
        Action {
            id: "check-1".into(),
            name: "check-1".into(),
            body: ActionBody::FileCheck { file: spec },
            expected_exit_code: 0,
            timeout: None,
            strict_warnings: false,
        }
    }

    fn env(root: &std::path::Path) -> ExecutionEnvironment {
        ExecutionEnvironment {
            workspace_root: root.to_path_buf(),
            default_timeout_secs: 30,
        }
    }

    #[tokio::test]
    async fn missing_file_fails_existence_check() {
        let dir = tempfile::tempdir().unwrap();
        let executor = FileCheckExecutor::default();
        let spec = FileCheckSpec {
            path: "missing.txt".into(),
            contains: None,
            min_bytes: None,
            max_bytes: None,
            sha256: None,
        };
        let result = executor.execute(&action(spec), &env(dir.path())).await;
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn all_sub_checks_must_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"build succeeded").unwrap();

        let executor = FileCheckExecutor::default();
        let spec = FileCheckSpec {
            path: "out.txt".into(),
            contains: Some("succeeded".into()),
            min_bytes: Some(1),
            max_bytes: Some(1000),
            sha256: None,
        };
        let result = executor.execute(&action(spec), &env(dir.path())).await;
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn one_failing_sub_check_fails_the_whole_action() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, b"short").unwrap();

        let executor = FileCheckExecutor::default();
        let spec = FileCheckSpec {
            path: "out.txt".into(),
            contains: None,
            min_bytes: Some(100),
            max_bytes: None,
            sha256: None,
        };
        let result = executor.execute(&action(spec), &env(dir.path())).await;
        assert_eq!(result.exit_code, Some(1));
    }
}
