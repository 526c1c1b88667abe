//! SQL row shapes, kept distinct from the `protocol` wire types (§4.5) so a
//! wire-format change never silently breaks a query's column list.

use chrono::{DateTime, Utc};

use super::StoreError;
use crate::protocol::{AttemptStatus, SprintStatus, TaskStatus};

#[derive(Debug, sqlx::FromRow)]
pub struct SprintRow {
    pub id: String,
    pub status: String,
}

#[derive(Debug, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub sprint_id: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub depends_on: String,
    pub sequence: i64,
    pub commit_hash: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct TestPlanRow {
    pub task_id: String,
    pub version: i64,
    pub archived: bool,
    pub document: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct AttemptRow {
    pub task_id: String,
    pub attempt_number: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: String,
    pub outcomes: String,
    pub evidence_dir: String,
}

#[derive(Debug, sqlx::FromRow)]
pub struct FlakyFlagRow {
    pub task_id: String,
    pub test_name: String,
    pub failures_before_pass: i64,
}

pub fn sprint_status_to_str(status: SprintStatus) -> &'static str {
    match status {
        SprintStatus::Planning => "planning",
        SprintStatus::Running => "running",
        SprintStatus::Paused => "paused",
        SprintStatus::Completed => "completed",
        SprintStatus::Aborted => "aborted",
    }
}

pub fn sprint_status_from_str(raw: &str) -> Result<SprintStatus, StoreError> {
    match raw {
        "planning" => Ok(SprintStatus::Planning),
        "running" => Ok(SprintStatus::Running),
        "paused" => Ok(SprintStatus::Paused),
        "completed" => Ok(SprintStatus::Completed),
        "aborted" => Ok(SprintStatus::Aborted),
        other => Err(StoreError::CorruptRow {
            detail: format!("unknown sprint status '{other}'"),
        }),
    }
}

pub fn task_status_to_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in-progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Verified => "verified",
        TaskStatus::Skipped => "skipped",
        TaskStatus::Failed => "failed",
        TaskStatus::Blocked => "blocked",
    }
}

pub fn task_status_from_str(raw: &str) -> Result<TaskStatus, StoreError> {
    match raw {
        "pending" => Ok(TaskStatus::Pending),
        "in-progress" => Ok(TaskStatus::InProgress),
        "completed" => Ok(TaskStatus::Completed),
        "verified" => Ok(TaskStatus::Verified),
        "skipped" => Ok(TaskStatus::Skipped),
        "failed" => Ok(TaskStatus::Failed),
        "blocked" => Ok(TaskStatus::Blocked),
        other => Err(StoreError::CorruptRow {
            detail: format!("unknown task status '{other}'"),
        }),
    }
}

pub fn attempt_status_to_str(status: AttemptStatus) -> &'static str {
    match status {
        AttemptStatus::Running => "running",
        AttemptStatus::Passed => "passed",
        AttemptStatus::Failed => "failed",
        AttemptStatus::TimedOut => "timed-out",
    }
}

pub fn attempt_status_from_str(raw: &str) -> Result<AttemptStatus, StoreError> {
    match raw {
        "running" => Ok(AttemptStatus::Running),
        "passed" => Ok(AttemptStatus::Passed),
        "failed" => Ok(AttemptStatus::Failed),
        "timed-out" => Ok(AttemptStatus::TimedOut),
        other => Err(StoreError::CorruptRow {
            detail: format!("unknown attempt status '{other}'"),
        }),
    }
}
