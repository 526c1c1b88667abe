//! Test-Plan Engine (§4.4).
//!
//! Validates a structured test-plan document against a fixed schema and
//! executes its setup/tests/teardown blocks as a straight sequential,
//! fail-fast loop. There is no DAG or parallel scheduling here — a
//! deliberate departure from the teacher's `planner::DagPlanner`, which
//! has no counterpart in this engine (see DESIGN.md).

use std::collections::HashSet;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::classifier::{self, ActionPhase, Classification, ClassificationKind, RawActionResult, Severity};
use crate::context;
use crate::executors::{ActionExecutor, ExecutionEnvironment};
use crate::protocol::{Action, ActionOutcome, CoverageConfig, TestPlanDocument, ToolClassPolicy};

/// Schema versions this engine knows how to execute. Plural: "the engine
/// accepts any plan whose declared schema version it knows" (§6).
pub const SUPPORTED_SCHEMA_VERSIONS: &[&str] = &["1.0"];

/// Default budget for the embedded specification excerpt, derived from
/// the Context Manager's stable token target (§4.6).
pub const DEFAULT_MAX_SPEC_EXCERPT_TOKENS: usize = 40_000;

#[derive(Debug, Error)]
pub enum PlanValidationError {
    #[error("plan for task {task_id} has no setup, tests, or teardown actions")]
    EmptyPlan { task_id: String },

    #[error("plan schema_version '{version}' is not supported; supported: {supported:?}")]
    UnsupportedSchemaVersion { version: String, supported: Vec<String> },

    #[error("an action in this plan has an empty id")]
    EmptyActionId,

    #[error("duplicate action id '{action_id}' within a single plan")]
    DuplicateActionId { action_id: String },

    #[error("action '{action_id}' declares expected_exit_code {code}, which is out of range")]
    InvalidExpectedExitCode { action_id: String, code: i32 },

    #[error(
        "test-plan specification excerpt for task {task_id} is ~{estimated_tokens} tokens, \
         exceeding the {max_tokens}-token budget"
    )]
    SpecificationExcerptTooLarge {
        task_id: String,
        estimated_tokens: usize,
        max_tokens: usize,
    },
}

/// Validates a test-plan document's schema before it is stored as a
/// task's active plan. `max_spec_excerpt_tokens` is the Open Question
/// resolution from §4.6/§9: a specification too large to fit the
/// Context Manager's budget is rejected here, at load time, not later
/// at prompt-assembly time.
pub fn validate_plan(doc: &TestPlanDocument, max_spec_excerpt_tokens: usize) -> Result<(), PlanValidationError> {
    if !SUPPORTED_SCHEMA_VERSIONS.contains(&doc.test_plan.schema_version.as_str()) {
        return Err(PlanValidationError::UnsupportedSchemaVersion {
            version: doc.test_plan.schema_version.clone(),
            supported: SUPPORTED_SCHEMA_VERSIONS.iter().map(|s| s.to_string()).collect(),
        });
    }

    if doc.test_plan.setup.is_empty() && doc.test_plan.tests.is_empty() && doc.test_plan.teardown.is_empty() {
        return Err(PlanValidationError::EmptyPlan { task_id: doc.task_id.clone() });
    }

    let mut seen_ids = HashSet::new();
    for action in doc
        .test_plan
        .setup
        .iter()
        .chain(doc.test_plan.tests.iter())
        .chain(doc.test_plan.teardown.iter())
    {
        if action.id.trim().is_empty() {
            return Err(PlanValidationError::EmptyActionId);
        }
        if !seen_ids.insert(action.id.as_str()) {
            return Err(PlanValidationError::DuplicateActionId { action_id: action.id.clone() });
        }
        if !(0..=255).contains(&action.expected_exit_code) {
            return Err(PlanValidationError::InvalidExpectedExitCode {
                action_id: action.id.clone(),
                code: action.expected_exit_code,
            });
        }
    }

    if let Some(description) = &doc.description {
        let estimated = context::estimate_tokens(description);
        if estimated > max_spec_excerpt_tokens {
            return Err(PlanValidationError::SpecificationExcerptTooLarge {
                task_id: doc.task_id.clone(),
                estimated_tokens: estimated,
                max_tokens: max_spec_excerpt_tokens,
            });
        }
    }

    Ok(())
}

/// Result of running one plan's setup/tests/teardown blocks once.
#[derive(Debug, Default)]
pub struct PlanExecutionOutcome {
    pub setup_results: Vec<ActionOutcome>,
    pub test_results: Vec<ActionOutcome>,
    pub teardown_results: Vec<ActionOutcome>,
    /// True if a blocking setup failure skipped the tests block entirely.
    pub setup_aborted: bool,
}

impl PlanExecutionOutcome {
    pub fn all_blocking_failures(&self) -> Vec<&ActionOutcome> {
        self.setup_results
            .iter()
            .chain(self.test_results.iter())
            .chain(self.teardown_results.iter())
            .filter(|o| o.is_blocking())
            .collect()
    }
}

async fn run_one(
    action: &Action,
    phase: ActionPhase,
    executors: &[Box<dyn ActionExecutor + Send + Sync>],
    env: &ExecutionEnvironment,
    policy: Option<&ToolClassPolicy>,
    is_test_action: bool,
    tdd_red_phase: bool,
) -> ActionOutcome {
    let started = Instant::now();
    let raw = match executors.iter().find(|e| e.can_handle(action)) {
        Some(executor) => executor.execute(action, env).await,
        None => RawActionResult {
            spawn_error: true,
            stderr: format!("no executor registered for action type '{}'", action.type_name()),
            ..Default::default()
        },
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    // Diagnostics can only be parsed once the action has actually run, so
    // they're computed here rather than threaded in alongside the policy.
    let validation = policy
        .filter(|_| classifier::detect_validation_tool(action).is_some())
        .map(|p| (p, classifier::parse_tool_diagnostics(&raw.stdout, &raw.stderr)));

    let classification = classifier::classify(action, phase, &raw, validation, is_test_action, tdd_red_phase);

    ActionOutcome {
        action_id: action.id.clone(),
        action_name: action.name.clone(),
        exit_code: raw.exit_code,
        http_status: raw.http_status,
        duration_ms,
        stdout_excerpt: raw.stdout,
        stderr_excerpt: raw.stderr,
        killed: raw.timed_out,
        classification,
    }
}

/// Runs one plan once: every setup action in order (abort remaining setup
/// and skip tests on the first blocking failure), then tests in order
/// fail-fast, then every teardown action regardless of earlier outcome.
/// `validation_policy_for` looks up the policy applicable to an action
/// that is itself a validation-tool invocation, if any; the diagnostics
/// it is evaluated against are only knowable once that action has run, so
/// `run_one` parses them from the action's own output afterwards.
pub async fn execute_plan<F>(
    doc: &TestPlanDocument,
    executors: &[Box<dyn ActionExecutor + Send + Sync>],
    env: &ExecutionEnvironment,
    tdd_red_phase: bool,
    validation_policy_for: F,
) -> PlanExecutionOutcome
where
    F: Fn(&Action) -> Option<ToolClassPolicy>,
{
    let mut outcome = PlanExecutionOutcome::default();

    for action in &doc.test_plan.setup {
        let policy = validation_policy_for(action);
        let result = run_one(action, ActionPhase::Setup, executors, env, policy.as_ref(), false, tdd_red_phase).await;
        let blocking = result.is_blocking();
        outcome.setup_results.push(result);
        if blocking {
            outcome.setup_aborted = true;
            break;
        }
    }

    if !outcome.setup_aborted {
        for action in &doc.test_plan.tests {
            let policy = validation_policy_for(action);
            let result = run_one(action, ActionPhase::Test, executors, env, policy.as_ref(), true, tdd_red_phase).await;
            let blocking = result.is_blocking();
            outcome.test_results.push(result);
            if blocking {
                break;
            }
        }
    }

    for action in &doc.test_plan.teardown {
        let policy = validation_policy_for(action);
        let result = run_one(action, ActionPhase::Teardown, executors, env, policy.as_ref(), false, tdd_red_phase).await;
        outcome.teardown_results.push(result);
    }

    outcome
}

static COVERAGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)coverage[:=]\s*(\d+(?:\.\d+)?)%").expect("static regex"));

/// Evaluates the optional coverage sub-section (§4.4) against the parsed
/// output of the distinguished coverage-measurement action. A fixed
/// block-on-errors policy: short of threshold, or unparseable, blocks.
pub fn evaluate_coverage(coverage: &CoverageConfig, stdout: &str) -> Option<Classification> {
    if !coverage.enabled {
        return None;
    }

    match COVERAGE_RE.captures(stdout).and_then(|c| c[1].parse::<f64>().ok()) {
        Some(measured) if measured >= coverage.threshold as f64 => None,
        Some(measured) => Some(Classification {
            kind: ClassificationKind::ValidationFailure,
            blocking: true,
            severity: Severity::High,
            reason: format!("coverage {measured:.1}% is below the {}% threshold", coverage.threshold),
        }),
        None => Some(Classification {
            kind: ClassificationKind::ValidationFailure,
            blocking: true,
            severity: Severity::Medium,
            reason: "coverage measurement could not be parsed from the action's output".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Action, ActionBody, TestPlanBody};

    fn action(id: &str) -> Action {
        Action {
            id: id.to_string(),
            name: id.to_string(),
            body: ActionBody::TerminalCommand {
                command: "true".to_string(),
            },
            expected_exit_code: 0,
            timeout: None,
            strict_warnings: false,
        }
    }

    fn document(setup: Vec<Action>, tests: Vec<Action>, teardown: Vec<Action>) -> TestPlanDocument {
        TestPlanDocument {
            task_id: "T001".into(),
            title: "Add endpoint".into(),
            description: None,
            test_plan: TestPlanBody {
                schema_version: "1.0".into(),
                setup,
                tests,
                teardown,
                coverage: None,
            },
        }
    }

    #[test]
    fn rejects_unsupported_schema_version() {
        let mut doc = document(vec![action("setup-1")], vec![], vec![]);
        doc.test_plan.schema_version = "9.9".into();
        let result = validate_plan(&doc, DEFAULT_MAX_SPEC_EXCERPT_TOKENS);
        assert!(matches!(result, Err(PlanValidationError::UnsupportedSchemaVersion { .. })));
    }

    #[test]
    fn rejects_plan_with_no_actions_at_all() {
        let doc = document(vec![], vec![], vec![]);
        let result = validate_plan(&doc, DEFAULT_MAX_SPEC_EXCERPT_TOKENS);
        assert!(matches!(result, Err(PlanValidationError::EmptyPlan { .. })));
    }

    #[test]
    fn rejects_duplicate_action_ids_across_lists() {
        let doc = document(vec![action("dup")], vec![action("dup")], vec![]);
        let result = validate_plan(&doc, DEFAULT_MAX_SPEC_EXCERPT_TOKENS);
        assert!(matches!(result, Err(PlanValidationError::DuplicateActionId { .. })));
    }

    #[test]
    fn rejects_oversized_specification_excerpt() {
        let mut doc = document(vec![action("setup-1")], vec![], vec![]);
        doc.description = Some("x".repeat(10_000));
        let result = validate_plan(&doc, 100);
        assert!(matches!(result, Err(PlanValidationError::SpecificationExcerptTooLarge { .. })));
    }

    #[test]
    fn accepts_a_well_formed_plan() {
        let doc = document(vec![action("setup-1")], vec![action("test-1")], vec![action("teardown-1")]);
        assert!(validate_plan(&doc, DEFAULT_MAX_SPEC_EXCERPT_TOKENS).is_ok());
    }

    #[tokio::test]
    async fn sequential_execution_runs_every_block_on_success() {
        let doc = document(vec![action("setup-1")], vec![action("test-1")], vec![action("teardown-1")]);
        let executors = crate::executors::default_executors();
        let env = ExecutionEnvironment {
            workspace_root: std::env::temp_dir(),
            default_timeout_secs: 30,
        };

        let outcome = execute_plan(&doc, &executors, &env, false, |_| None).await;
        assert_eq!(outcome.setup_results.len(), 1);
        assert_eq!(outcome.test_results.len(), 1);
        assert_eq!(outcome.teardown_results.len(), 1);
        assert!(!outcome.setup_aborted);
        assert!(outcome.all_blocking_failures().is_empty());
    }

    #[tokio::test]
    async fn blocking_setup_failure_skips_tests_but_still_runs_teardown() {
        let mut failing_setup = action("setup-1");
        failing_setup.body = ActionBody::TerminalCommand {
            command: "exit 1".to_string(),
        };

        let doc = document(vec![failing_setup], vec![action("test-1")], vec![action("teardown-1")]);
        let executors = crate::executors::default_executors();
        let env = ExecutionEnvironment {
            workspace_root: std::env::temp_dir(),
            default_timeout_secs: 30,
        };

        let outcome = execute_plan(&doc, &executors, &env, false, |_| None).await;
        assert!(outcome.setup_aborted);
        assert!(outcome.test_results.is_empty());
        assert_eq!(outcome.teardown_results.len(), 1);
    }

    #[tokio::test]
    async fn fail_fast_stops_remaining_tests_after_first_blocking_failure() {
        let mut failing_test = action("test-1");
        failing_test.body = ActionBody::TerminalCommand {
            command: "exit 1".to_string(),
        };

        let doc = document(vec![], vec![failing_test, action("test-2")], vec![]);
        let executors = crate::executors::default_executors();
        let env = ExecutionEnvironment {
            workspace_root: std::env::temp_dir(),
            default_timeout_secs: 30,
        };

        let outcome = execute_plan(&doc, &executors, &env, false, |_| None).await;
        assert_eq!(outcome.test_results.len(), 1);
    }

    #[test]
    fn coverage_below_threshold_is_blocking() {
        let coverage = CoverageConfig {
            enabled: true,
            threshold: 80,
            paths: vec![],
        };
        let classification = evaluate_coverage(&coverage, "coverage: 55.5%").unwrap();
        assert!(classification.blocking);
        assert_eq!(classification.kind, ClassificationKind::ValidationFailure);
    }

    #[test]
    fn coverage_meeting_threshold_passes_silently() {
        let coverage = CoverageConfig {
            enabled: true,
            threshold: 80,
            paths: vec![],
        };
        assert!(evaluate_coverage(&coverage, "coverage=92%").is_none());
    }

    #[test]
    fn disabled_coverage_is_never_evaluated() {
        let coverage = CoverageConfig {
            enabled: false,
            threshold: 80,
            paths: vec![],
        };
        assert!(evaluate_coverage(&coverage, "coverage=0%").is_none());
    }
}
