//! Commit & Tag Emitter (§4.9, commit message format in §6).
//!
//! Drives git through plain porcelain subprocesses — stage, commit, tag —
//! the same `std::process::Command` shape used for git invocations across
//! the retrieval pack; no `git2` anywhere in it.

use std::process::Command;

use crate::protocol::{ActionOutcome, Attempt};

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {subcommand} failed: {stderr}")]
    GitFailed { subcommand: String, stderr: String },
}

pub struct CommitEmitter {
    workspace_root: std::path::PathBuf,
}

impl CommitEmitter {
    pub fn new(workspace_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, CommitError> {
        let output = Command::new("git").args(args).current_dir(&self.workspace_root).output()?;
        if !output.status.success() {
            return Err(CommitError::GitFailed {
                subcommand: args.first().unwrap_or(&"").to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Stages the worktree, commits with the conventional-commit message
    /// format of §6, and applies the lightweight tag `task/<task-id>`.
    /// Returns the new commit hash.
    pub fn seal(&self, task_id: &str, title: &str, attempt: &Attempt, evidence_root: &str) -> Result<String, CommitError> {
        self.run(&["add", "-A"])?;

        let message = build_commit_message(task_id, title, attempt, evidence_root);
        self.run(&["commit", "-m", &message])?;

        let hash = self.run(&["rev-parse", "HEAD"])?;

        let tag = format!("task/{task_id}");
        self.run(&["tag", "-f", &tag])?;

        Ok(hash)
    }
}

fn build_commit_message(task_id: &str, title: &str, attempt: &Attempt, evidence_root: &str) -> String {
    let mut body = String::new();
    for outcome in &attempt.outcomes {
        body.push_str(&format!("- {}{}\n", outcome.action_name, pass_marker(outcome)));
    }

    if let Some(coverage_line) = coverage_percentage(&attempt.outcomes) {
        body.push_str(&format!("coverage: {coverage_line}\n"));
    }

    body.push_str(&format!("evidence: {evidence_root}\n"));
    body.push_str(&format!("attempt: {}\n", attempt.attempt_number));

    let duration_secs = attempt
        .ended_at
        .map(|end| (end - attempt.started_at).num_seconds().max(0))
        .unwrap_or(0);
    body.push_str(&format!("duration: {duration_secs}s\n"));

    format!(
        "feat({task_id}): {title}\n\n{body}\nCo-authored-by: CODOR <automation>\n",
    )
}

fn pass_marker(outcome: &ActionOutcome) -> &'static str {
    if outcome.is_blocking() {
        " [FAILED]"
    } else {
        " [passed]"
    }
}

fn coverage_percentage(outcomes: &[ActionOutcome]) -> Option<String> {
    use once_cell::sync::Lazy;
    use regex::Regex;
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)coverage[:=]\s*(\d+(?:\.\d+)?)%").expect("static regex"));

    outcomes.iter().find_map(|outcome| {
        RE.captures(&outcome.stdout_excerpt).map(|caps| format!("{}%", &caps[1]))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classification, ClassificationKind, Severity};
    use chrono::Utc;

    fn sample_attempt() -> Attempt {
        Attempt {
            task_id: "T001".into(),
            attempt_number: 1,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            status: crate::protocol::AttemptStatus::Passed,
            outcomes: vec![ActionOutcome {
                action_id: "test-1".into(),
                action_name: "run unit tests".into(),
                exit_code: Some(0),
                http_status: None,
                duration_ms: 1200,
                stdout_excerpt: "coverage: 87.5%".into(),
                stderr_excerpt: String::new(),
                killed: false,
                classification: Classification {
                    kind: ClassificationKind::Success,
                    blocking: false,
                    severity: Severity::None,
                    reason: "ok".into(),
                },
            }],
            evidence_dir: ".codor/evidence/T001/attempt-1".into(),
        }
    }

    #[test]
    fn commit_message_has_conventional_subject_and_structured_body() {
        let message = build_commit_message("T001", "Add login form", &sample_attempt(), ".codor/evidence/T001/attempt-1");
        assert!(message.starts_with("feat(T001): Add login form\n\n"));
        assert!(message.contains("run unit tests [passed]"));
        assert!(message.contains("coverage: 87.5%"));
        assert!(message.contains("evidence: .codor/evidence/T001/attempt-1"));
        assert!(message.contains("attempt: 1"));
        assert!(message.contains("Co-authored-by: CODOR <automation>"));
    }

    #[test]
    fn commit_message_marks_blocking_outcomes_as_failed() {
        let mut attempt = sample_attempt();
        attempt.outcomes[0].classification.blocking = true;
        let message = build_commit_message("T001", "title", &attempt, "evidence");
        assert!(message.contains("run unit tests [FAILED]"));
    }
}
