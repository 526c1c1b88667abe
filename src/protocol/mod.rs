//! Document and entity shapes shared across the core.
//!
//! This module owns the *shape* of data, not its storage or validation.
//! Wire documents (Test-Plan, Validation Policy, execution report) live
//! alongside the runtime entities (Sprint, Task, Attempt, ...) because
//! both are plain serde-derived values with no behavior of their own —
//! validation lives in [`crate::engine`], persistence in [`crate::store`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classifier::{Classification, Severity};

// ---------------------------------------------------------------------
// Test-Plan Document Format (external interface, §6)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestPlanDocument {
    pub task_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub test_plan: TestPlanBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestPlanBody {
    pub schema_version: String,
    #[serde(default)]
    pub setup: Vec<Action>,
    #[serde(default)]
    pub tests: Vec<Action>,
    #[serde(default)]
    pub teardown: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageConfig {
    pub enabled: bool,
    pub threshold: u32,
    #[serde(default)]
    pub paths: Vec<String>,
}

fn default_expected_exit_code() -> i32 {
    0
}

/// One leaf entry of a plan's setup/tests/teardown list.
///
/// `id`, `name`, `expected_exit_code`, `timeout`, and `strict_warnings`
/// are common to every action type; `body` is the closed, tagged variant
/// per type (§9: avoid open polymorphism).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub body: ActionBody,
    #[serde(default = "default_expected_exit_code")]
    pub expected_exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub strict_warnings: bool,
}

impl Action {
    pub fn type_name(&self) -> &'static str {
        match &self.body {
            ActionBody::TerminalCommand { .. } => "terminal-command",
            ActionBody::FileCheck { .. } => "file-check",
            ActionBody::HttpRequest { .. } => "http-request",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ActionBody {
    TerminalCommand {
        command: String,
    },
    FileCheck {
        file: FileCheckSpec,
    },
    HttpRequest {
        url: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileCheckSpec {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

// ---------------------------------------------------------------------
// Validation Policy Format (external interface, §6)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationStrategy {
    BlockAlways,
    BlockOnErrors,
    BlockOnErrorsAndWarnings,
    WarnOnly,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOverride {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_on: Option<ValidationStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_warnings: Option<u32>,
    #[serde(default)]
    pub ignored_rules: Vec<String>,
    #[serde(default)]
    pub error_on_rules: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolClassPolicy {
    pub strategy: ValidationStrategy,
    #[serde(default)]
    pub tools: HashMap<String, ToolOverride>,
}

/// The nested validation-policy document attached at sprint level and
/// overridable per task. Defaults by tool class per §6: type checker and
/// compilation block-always, linter block-on-errors, formatter warn-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationPolicyDocument {
    #[serde(default = "ValidationPolicyDocument::default_linting")]
    pub linting: ToolClassPolicy,
    #[serde(default = "ValidationPolicyDocument::default_type_checking")]
    pub type_checking: ToolClassPolicy,
    #[serde(default = "ValidationPolicyDocument::default_compilation")]
    pub compilation: ToolClassPolicy,
}

impl ValidationPolicyDocument {
    fn default_linting() -> ToolClassPolicy {
        ToolClassPolicy {
            strategy: ValidationStrategy::BlockOnErrors,
            tools: HashMap::new(),
        }
    }

    fn default_type_checking() -> ToolClassPolicy {
        ToolClassPolicy {
            strategy: ValidationStrategy::BlockAlways,
            tools: HashMap::new(),
        }
    }

    fn default_compilation() -> ToolClassPolicy {
        ToolClassPolicy {
            strategy: ValidationStrategy::BlockAlways,
            tools: HashMap::new(),
        }
    }
}

impl Default for ValidationPolicyDocument {
    fn default() -> Self {
        Self {
            linting: Self::default_linting(),
            type_checking: Self::default_type_checking(),
            compilation: Self::default_compilation(),
        }
    }
}

impl ValidationPolicyDocument {
    /// Maps `classifier::detect_validation_tool`'s command-signature class
    /// onto the policy that governs it.
    pub fn for_tool_class(&self, class: &str) -> Option<&ToolClassPolicy> {
        match class {
            "linting" => Some(&self.linting),
            "type-checking" => Some(&self.type_checking),
            "compilation" => Some(&self.compilation),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------
// Runtime entities (§3)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SprintStatus {
    Planning,
    Running,
    Paused,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sprint {
    pub id: String,
    pub task_ids: Vec<String>,
    pub status: SprintStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Verified,
    Skipped,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub sprint_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub sequence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

impl Task {
    /// A task may enter `in-progress` only once every dependency is
    /// `verified`. Independent of the owning sprint's own status, which
    /// the Sprint Controller checks separately.
    pub fn dependencies_satisfied(&self, verified: &[String]) -> bool {
        self.depends_on.iter().all(|dep| verified.iter().any(|v| v == dep))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestPlan {
    pub task_id: String,
    pub version: u32,
    pub archived: bool,
    pub document: TestPlanDocument,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptStatus {
    Running,
    Passed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attempt {
    pub task_id: String,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub outcomes: Vec<ActionOutcome>,
    pub evidence_dir: String,
}

impl Attempt {
    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionOutcome {
    pub action_id: String,
    pub action_name: String,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub duration_ms: u64,
    pub stdout_excerpt: String,
    pub stderr_excerpt: String,
    pub killed: bool,
    pub classification: Classification,
}

impl ActionOutcome {
    pub fn is_blocking(&self) -> bool {
        self.classification.blocking
    }

    pub fn severity(&self) -> Severity {
        self.classification.severity
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlakyFlag {
    pub task_id: String,
    pub test_name: String,
    pub failures_before_pass: u32,
}

// ---------------------------------------------------------------------
// Evidence Layout: execution-report.json (§6)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticityHeader {
    pub producer: String,
    pub producer_version: String,
    pub platform: String,
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    pub digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub total_actions: u32,
    pub passed: u32,
    pub blocking_failures: u32,
    pub non_blocking_warnings: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvaluation {
    pub all_steps_passed: bool,
    pub minimum_pass_rate_met: bool,
    pub required_evidence_present: bool,
    pub sealed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub report_version: String,
    pub generated_at: DateTime<Utc>,
    pub test_specification: TestPlanDocument,
    pub execution_summary: ExecutionSummary,
    pub setup_results: Vec<ActionOutcome>,
    pub test_results: Vec<ActionOutcome>,
    pub teardown_results: Vec<ActionOutcome>,
    pub validation_evaluation: Vec<ActionOutcome>,
    pub completion_evaluation: CompletionEvaluation,
    pub authenticity: AuthenticityHeader,
}

pub const REPORT_VERSION: &str = "1.0";
