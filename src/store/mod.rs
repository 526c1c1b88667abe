//! Task Store (§4.5).
//!
//! Embedded relational store for the runtime entities of §3: sprints,
//! tasks, versioned test plans, attempts, flaky flags. Single-writer (the
//! Sprint Controller), many-reader. Every mutating method commits an
//! explicit transaction atomically; reads use a plain pooled connection.

pub mod rows;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::protocol::{Attempt, FlakyFlag, Sprint, SprintStatus, Task, TaskStatus, TestPlan, ValidationPolicyDocument};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("store row serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store row is corrupt: {detail}")]
    CorruptRow { detail: String },

    #[error("sprint '{0}' not found")]
    SprintNotFound(String),

    #[error("task '{0}' not found")]
    TaskNotFound(String),
}

pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Opens (creating if absent) the sqlite file at `database_path` and
    /// runs embedded migrations. Per §6's Persistent State Layout this is
    /// normally `<workspace>/.codor/tasks.db`.
    pub async fn connect(database_path: &std::path::Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().filename(database_path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn create_sprint(&self, sprint: &Sprint) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO sprints (id, status) VALUES (?, ?)")
            .bind(&sprint.id)
            .bind(rows::sprint_status_to_str(sprint.status))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_sprint_status(&self, sprint_id: &str, status: SprintStatus) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query("UPDATE sprints SET status = ? WHERE id = ?")
            .bind(rows::sprint_status_to_str(status))
            .bind(sprint_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::SprintNotFound(sprint_id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn find_sprint(&self, sprint_id: &str) -> Result<Option<Sprint>, StoreError> {
        let row: Option<rows::SprintRow> = sqlx::query_as("SELECT id, status FROM sprints WHERE id = ?")
            .bind(sprint_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };

        let task_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM tasks WHERE sprint_id = ? ORDER BY sequence")
            .bind(sprint_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(Some(Sprint {
            id: row.id,
            task_ids,
            status: rows::sprint_status_from_str(&row.status)?,
        }))
    }

    pub async fn find_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let row: Option<rows::TaskRow> = sqlx::query_as(
            "SELECT id, sprint_id, title, description, status, depends_on, sequence, commit_hash
             FROM tasks WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_task).transpose()
    }

    /// Sets the sprint-wide Validation Policy (§4.2 rule 4 / §6). A task
    /// without its own override falls back to whatever is stored here.
    pub async fn set_sprint_validation_policy(
        &self,
        sprint_id: &str,
        policy: &ValidationPolicyDocument,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query("UPDATE sprints SET validation_policy = ? WHERE id = ?")
            .bind(serde_json::to_string(policy)?)
            .bind(sprint_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::SprintNotFound(sprint_id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn sprint_validation_policy(&self, sprint_id: &str) -> Result<ValidationPolicyDocument, StoreError> {
        let row: Option<(Option<String>,)> = sqlx::query_as("SELECT validation_policy FROM sprints WHERE id = ?")
            .bind(sprint_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some((raw,)) = row else {
            return Err(StoreError::SprintNotFound(sprint_id.to_string()));
        };
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(ValidationPolicyDocument::default()),
        }
    }

    /// Sets a task-level Validation Policy override (§4.5 policy attachment),
    /// taking precedence over the sprint-wide policy for that task only.
    pub async fn set_task_validation_policy_override(
        &self,
        task_id: &str,
        policy: &ValidationPolicyDocument,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query("UPDATE tasks SET validation_policy_override = ? WHERE id = ?")
            .bind(serde_json::to_string(policy)?)
            .bind(task_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn task_validation_policy_override(
        &self,
        task_id: &str,
    ) -> Result<Option<ValidationPolicyDocument>, StoreError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT validation_policy_override FROM tasks WHERE id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((raw,)) = row else {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        };
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from)).transpose()
    }

    /// The policy that actually governs a task's validation-tool actions:
    /// its own override if set, otherwise the sprint's policy.
    pub async fn effective_validation_policy(
        &self,
        task_id: &str,
        sprint_id: &str,
    ) -> Result<ValidationPolicyDocument, StoreError> {
        if let Some(policy) = self.task_validation_policy_override(task_id).await? {
            return Ok(policy);
        }
        self.sprint_validation_policy(sprint_id).await
    }

    pub async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO tasks (id, sprint_id, title, description, status, depends_on, sequence, commit_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.sprint_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(rows::task_status_to_str(task.status))
        .bind(serde_json::to_string(&task.depends_on)?)
        .bind(task.sequence as i64)
        .bind(&task.commit_hash)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn tasks_for_sprint(&self, sprint_id: &str) -> Result<Vec<Task>, StoreError> {
        let task_rows: Vec<rows::TaskRow> = sqlx::query_as(
            "SELECT id, sprint_id, title, description, status, depends_on, sequence, commit_hash
             FROM tasks WHERE sprint_id = ? ORDER BY sequence",
        )
        .bind(sprint_id)
        .fetch_all(&self.pool)
        .await?;

        task_rows.into_iter().map(row_to_task).collect()
    }

    pub async fn verified_task_ids(&self, sprint_id: &str) -> Result<Vec<String>, StoreError> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM tasks WHERE sprint_id = ? AND status = 'verified' ORDER BY sequence",
        )
        .bind(sprint_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn transition_task_status(&self, task_id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query("UPDATE tasks SET status = ? WHERE id = ?")
            .bind(rows::task_status_to_str(status))
            .bind(task_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_commit_hash(&self, task_id: &str, commit_hash: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE tasks SET commit_hash = ? WHERE id = ?")
            .bind(commit_hash)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Stores `plan` as the task's new active version, archiving whatever
    /// version was previously active (§4.4's plan-versioning rule).
    pub async fn attach_test_plan(&self, plan: &TestPlan) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE test_plans SET archived = 1 WHERE task_id = ? AND archived = 0")
            .bind(&plan.task_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO test_plans (task_id, version, archived, document, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&plan.task_id)
        .bind(plan.version as i64)
        .bind(plan.archived)
        .bind(serde_json::to_string(&plan.document)?)
        .bind(plan.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn active_test_plan(&self, task_id: &str) -> Result<Option<TestPlan>, StoreError> {
        let row: Option<rows::TestPlanRow> = sqlx::query_as(
            "SELECT task_id, version, archived, document, created_at
             FROM test_plans WHERE task_id = ? AND archived = 0
             ORDER BY version DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_test_plan).transpose()
    }

    /// Re-activates a previously archived plan version (§4.4 rollback).
    pub async fn reactivate_test_plan_version(&self, task_id: &str, version: u32) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE test_plans SET archived = 1 WHERE task_id = ? AND archived = 0")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        let affected = sqlx::query("UPDATE test_plans SET archived = 0 WHERE task_id = ? AND version = ?")
            .bind(task_id)
            .bind(version as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::CorruptRow {
                detail: format!("no plan version {version} recorded for task {task_id}"),
            });
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn append_attempt(&self, attempt: &Attempt) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO attempts (task_id, attempt_number, started_at, ended_at, status, outcomes, evidence_dir)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (task_id, attempt_number) DO UPDATE SET
                ended_at = excluded.ended_at, status = excluded.status, outcomes = excluded.outcomes",
        )
        .bind(&attempt.task_id)
        .bind(attempt.attempt_number as i64)
        .bind(attempt.started_at)
        .bind(attempt.ended_at)
        .bind(rows::attempt_status_to_str(attempt.status))
        .bind(serde_json::to_string(&attempt.outcomes)?)
        .bind(&attempt.evidence_dir)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn latest_attempt(&self, task_id: &str) -> Result<Option<Attempt>, StoreError> {
        let row: Option<rows::AttemptRow> = sqlx::query_as(
            "SELECT task_id, attempt_number, started_at, ended_at, status, outcomes, evidence_dir
             FROM attempts WHERE task_id = ? ORDER BY attempt_number DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_attempt).transpose()
    }

    pub async fn attempt_count(&self, task_id: &str) -> Result<u32, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attempts WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u32)
    }

    pub async fn record_flaky_flag(&self, flag: &FlakyFlag) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO flaky_flags (task_id, test_name, failures_before_pass) VALUES (?, ?, ?)
             ON CONFLICT (task_id, test_name) DO UPDATE SET failures_before_pass = excluded.failures_before_pass",
        )
        .bind(&flag.task_id)
        .bind(&flag.test_name)
        .bind(flag.failures_before_pass as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn flaky_flags_for_task(&self, task_id: &str) -> Result<Vec<FlakyFlag>, StoreError> {
        let rows: Vec<rows::FlakyFlagRow> =
            sqlx::query_as("SELECT task_id, test_name, failures_before_pass FROM flaky_flags WHERE task_id = ?")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|r| FlakyFlag {
                task_id: r.task_id,
                test_name: r.test_name,
                failures_before_pass: r.failures_before_pass as u32,
            })
            .collect())
    }
}

fn row_to_task(row: rows::TaskRow) -> Result<Task, StoreError> {
    Ok(Task {
        id: row.id,
        sprint_id: row.sprint_id,
        title: row.title,
        description: row.description,
        status: rows::task_status_from_str(&row.status)?,
        depends_on: serde_json::from_str(&row.depends_on)?,
        sequence: row.sequence as u32,
        commit_hash: row.commit_hash,
    })
}

fn row_to_test_plan(row: rows::TestPlanRow) -> Result<TestPlan, StoreError> {
    Ok(TestPlan {
        task_id: row.task_id,
        version: row.version as u32,
        archived: row.archived,
        document: serde_json::from_str(&row.document)?,
        created_at: row.created_at,
    })
}

fn row_to_attempt(row: rows::AttemptRow) -> Result<Attempt, StoreError> {
    Ok(Attempt {
        task_id: row.task_id,
        attempt_number: row.attempt_number as u32,
        started_at: row.started_at,
        ended_at: row.ended_at,
        status: rows::attempt_status_from_str(&row.status)?,
        outcomes: serde_json::from_str(&row.outcomes)?,
        evidence_dir: row.evidence_dir,
    })
}
