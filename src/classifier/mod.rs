//! Failure Classifier (§4.2).
//!
//! A pure function mapping an action, its raw execution result, and the
//! validation policy applicable to it (if any) onto exactly one of seven
//! result kinds. No I/O, no mutation — this module is the one place in
//! the core where the same inputs are guaranteed to always produce the
//! same output (testable property 5).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::protocol::{Action, ToolClassPolicy, ValidationStrategy};

/// The closed set of seven outcome kinds. Order here matches the order
/// classification rules are checked in, not priority for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassificationKind {
    Success,
    TestFailure,
    ExecutionError,
    ValidationFailure,
    Timeout,
    PrerequisiteFailure,
    SpecificationError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ClassificationKind,
    pub blocking: bool,
    pub severity: Severity,
    pub reason: String,
}

/// Which list within the plan the action being classified belongs to.
/// Prerequisite-failure only ever applies to `Setup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    Setup,
    Test,
    Teardown,
}

/// Raw, not-yet-classified result of running one action. Produced by the
/// Action Executor, consumed here and nowhere else.
#[derive(Debug, Clone, Default)]
pub struct RawActionResult {
    pub exit_code: Option<i32>,
    pub http_status: Option<u16>,
    pub timed_out: bool,
    pub spawn_error: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Parsed error/warning counts for a validation-tool action (linter, type
/// checker, formatter). `None` when the action is not a validation-tool
/// action at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolDiagnostics {
    pub errors: u32,
    pub warnings: u32,
}

static TEST_REPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"failed=(\d+)\s*,\s*passed=(\d+)").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestReportSummary {
    pub failed: u32,
    pub passed: u32,
}

/// Looks for the lightweight `failed=N,passed=M` marker test harnesses in
/// this engine's own evidence fixtures emit. A richer host could swap
/// this for a JUnit/TAP parser without changing the classifier's contract.
pub fn parse_test_report(stdout: &str) -> Option<TestReportSummary> {
    let caps = TEST_REPORT_RE.captures(stdout)?;
    Some(TestReportSummary {
        failed: caps[1].parse().ok()?,
        passed: caps[2].parse().ok()?,
    })
}

static ERROR_COUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d+)\s*errors?\b").expect("static regex"));
static WARNING_COUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d+)\s*warnings?\b").expect("static regex"));

/// Parses the trailing `N error(s)` / `N warning(s)` summary most
/// validation tools (eslint, tsc, cargo) print at the end of a run, out of
/// a validation-tool action's combined stdout/stderr. Takes the last match
/// of each so an "0 errors" restated mid-output doesn't win over the real
/// final tally.
pub fn parse_tool_diagnostics(stdout: &str, stderr: &str) -> ToolDiagnostics {
    let combined = format!("{stdout}\n{stderr}");
    let errors = ERROR_COUNT_RE
        .captures_iter(&combined)
        .filter_map(|c| c[1].parse::<u32>().ok())
        .last()
        .unwrap_or(0);
    let warnings = WARNING_COUNT_RE
        .captures_iter(&combined)
        .filter_map(|c| c[1].parse::<u32>().ok())
        .last()
        .unwrap_or(0);
    ToolDiagnostics { errors, warnings }
}

/// Command-signature detection for "this is a validation-tool action",
/// per §4.2 rule 4 ("detected by command signature").
pub fn detect_validation_tool(action: &Action) -> Option<&'static str> {
    let command = match &action.body {
        crate::protocol::ActionBody::TerminalCommand { command } => command,
        _ => return None,
    };
    let lower = command.to_lowercase();
    if lower.contains("eslint") || lower.contains("lint") {
        Some("linting")
    } else if lower.contains("tsc") || lower.contains("typecheck") || lower.contains("type-check") {
        Some("type-checking")
    } else if lower.contains("build") || lower.contains("compile") {
        Some("compilation")
    } else {
        None
    }
}

fn policy_outcome(strategy: ValidationStrategy, errors: u32, warnings: u32, max_warnings: Option<u32>) -> (bool, Severity) {
    let warnings_over_threshold = match max_warnings {
        Some(max) => warnings > max,
        None => false,
    };

    match strategy {
        ValidationStrategy::BlockAlways => {
            if errors > 0 {
                (true, Severity::Critical)
            } else if warnings > 0 && warnings_over_threshold {
                (true, Severity::High)
            } else if warnings > 0 {
                (true, Severity::Medium)
            } else {
                (false, Severity::None)
            }
        }
        ValidationStrategy::BlockOnErrors => {
            if errors > 0 {
                (true, Severity::High)
            } else if warnings > 0 && warnings_over_threshold {
                (true, Severity::High)
            } else if warnings > 0 {
                (false, Severity::Medium)
            } else {
                (false, Severity::None)
            }
        }
        ValidationStrategy::BlockOnErrorsAndWarnings => {
            if errors > 0 || warnings > 0 {
                (true, Severity::High)
            } else {
                (false, Severity::None)
            }
        }
        ValidationStrategy::WarnOnly => {
            if errors > 0 || warnings > 0 {
                (false, Severity::Low)
            } else {
                (false, Severity::None)
            }
        }
        ValidationStrategy::Never => (false, Severity::None),
    }
}

/// Classifies one action outcome. `is_test_action` distinguishes the
/// `tests` list (where a non-zero exit with a parseable report is a
/// `test-failure`) from everything else. `tdd_red_phase` implements the
/// carve-out in rule 5 ("blocking unless the task is marked TDD-red-phase").
pub fn classify(
    action: &Action,
    phase: ActionPhase,
    outcome: &RawActionResult,
    validation: Option<(&ToolClassPolicy, ToolDiagnostics)>,
    is_test_action: bool,
    tdd_red_phase: bool,
) -> Classification {
    // Rule 1: executor-flagged internal error on a prerequisite (setup) action.
    if outcome.spawn_error && phase == ActionPhase::Setup {
        return Classification {
            kind: ClassificationKind::PrerequisiteFailure,
            blocking: true,
            severity: Severity::Critical,
            reason: "setup action could not run".to_string(),
        };
    }

    // Rule 2: killed by timeout.
    if outcome.timed_out {
        return Classification {
            kind: ClassificationKind::Timeout,
            blocking: true,
            severity: Severity::High,
            reason: "action exceeded its configured timeout".to_string(),
        };
    }

    // Rule 3: could not run at all (non-prerequisite).
    if outcome.spawn_error {
        return Classification {
            kind: ClassificationKind::ExecutionError,
            blocking: true,
            severity: Severity::High,
            reason: "action could not be executed".to_string(),
        };
    }

    // Rule 4: validation-tool actions go through the policy table.
    if let Some((policy, diagnostics)) = validation {
        let max_warnings = policy.tools.get(action.id.as_str()).and_then(|t| t.max_warnings);
        let (blocking, severity) = policy_outcome(policy.strategy, diagnostics.errors, diagnostics.warnings, max_warnings);
        return Classification {
            kind: ClassificationKind::ValidationFailure,
            blocking,
            severity,
            reason: format!(
                "{} errors, {} warnings under strategy {:?}",
                diagnostics.errors, diagnostics.warnings, policy.strategy
            ),
        };
    }

    let exit_ok = outcome.exit_code.map(|c| c == action.expected_exit_code).unwrap_or(false);

    // Rule 5: declared test actions.
    if is_test_action && !exit_ok {
        if let Some(report) = parse_test_report(&outcome.stdout) {
            if report.failed > 0 {
                return Classification {
                    kind: ClassificationKind::TestFailure,
                    blocking: !tdd_red_phase,
                    severity: if tdd_red_phase { Severity::Low } else { Severity::High },
                    reason: format!("{} test(s) failed, {} passed", report.failed, report.passed),
                };
            }
        }
    }

    // Rule 6: any other non-zero exit.
    if !exit_ok {
        return Classification {
            kind: ClassificationKind::ExecutionError,
            blocking: true,
            severity: Severity::High,
            reason: format!(
                "exit code {:?} did not match expected {}",
                outcome.exit_code, action.expected_exit_code
            ),
        };
    }

    // Rule 7: clean success.
    Classification {
        kind: ClassificationKind::Success,
        blocking: false,
        severity: Severity::None,
        reason: "completed with expected exit code".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ActionBody, ToolOverride};
    use std::collections::HashMap;

    fn command_action(id: &str, command: &str) -> Action {
        Action {
            id: id.to_string(),
            name: id.to_string(),
            body: ActionBody::TerminalCommand {
                command: command.to_string(),
            },
            expected_exit_code: 0,
            timeout: None,
            strict_warnings: false,
        }
    }

    #[test]
    fn classifies_clean_exit_as_success() {
        let action = command_action("test-1", "npm test");
        let outcome = RawActionResult {
            exit_code: Some(0),
            ..Default::default()
        };
        let result = classify(&action, ActionPhase::Test, &outcome, None, true, false);
        assert_eq!(result.kind, ClassificationKind::Success);
        assert!(!result.blocking);
    }

    #[test]
    fn classifies_killed_timeout_before_anything_else() {
        let action = command_action("test-1", "sleep 10");
        let outcome = RawActionResult {
            exit_code: None,
            timed_out: true,
            spawn_error: true, // a timeout may also set the internal error flag
            ..Default::default()
        };
        let result = classify(&action, ActionPhase::Setup, &outcome, None, false, false);
        assert_eq!(result.kind, ClassificationKind::Timeout);
        assert!(result.blocking);
    }

    #[test]
    fn setup_spawn_error_is_prerequisite_failure() {
        let action = command_action("setup-1", "npm ci");
        let outcome = RawActionResult {
            spawn_error: true,
            ..Default::default()
        };
        let result = classify(&action, ActionPhase::Setup, &outcome, None, false, false);
        assert_eq!(result.kind, ClassificationKind::PrerequisiteFailure);
        assert!(result.blocking);
    }

    #[test]
    fn non_setup_spawn_error_is_execution_error() {
        let action = command_action("teardown-1", "npm run db:reset");
        let outcome = RawActionResult {
            spawn_error: true,
            ..Default::default()
        };
        let result = classify(&action, ActionPhase::Teardown, &outcome, None, false, false);
        assert_eq!(result.kind, ClassificationKind::ExecutionError);
    }

    #[test]
    fn declared_test_action_with_parsed_report_is_test_failure() {
        let action = command_action("test-1", "npm test -- suite.spec.js");
        let outcome = RawActionResult {
            exit_code: Some(1),
            stdout: "ran 4 tests\nfailed=1,passed=3".to_string(),
            ..Default::default()
        };
        let result = classify(&action, ActionPhase::Test, &outcome, None, true, false);
        assert_eq!(result.kind, ClassificationKind::TestFailure);
        assert!(result.blocking);
    }

    #[test]
    fn tdd_red_phase_makes_test_failure_non_blocking() {
        let action = command_action("test-1", "npm test");
        let outcome = RawActionResult {
            exit_code: Some(1),
            stdout: "failed=1,passed=0".to_string(),
            ..Default::default()
        };
        let result = classify(&action, ActionPhase::Test, &outcome, None, true, true);
        assert_eq!(result.kind, ClassificationKind::TestFailure);
        assert!(!result.blocking);
    }

    #[test]
    fn non_zero_exit_without_report_is_execution_error() {
        let action = command_action("test-1", "npm test");
        let outcome = RawActionResult {
            exit_code: Some(1),
            stdout: "some crash".to_string(),
            ..Default::default()
        };
        let result = classify(&action, ActionPhase::Test, &outcome, None, true, false);
        assert_eq!(result.kind, ClassificationKind::ExecutionError);
    }

    // Policy-table coverage (testable property 6): one case per cell.
    #[test]
    fn policy_table_block_always() {
        assert_eq!(policy_outcome(ValidationStrategy::BlockAlways, 1, 0, None), (true, Severity::Critical));
        assert_eq!(policy_outcome(ValidationStrategy::BlockAlways, 0, 2, Some(5)), (true, Severity::Medium));
        assert_eq!(policy_outcome(ValidationStrategy::BlockAlways, 0, 6, Some(5)), (true, Severity::High));
    }

    #[test]
    fn policy_table_block_on_errors() {
        assert_eq!(policy_outcome(ValidationStrategy::BlockOnErrors, 1, 0, None), (true, Severity::High));
        assert_eq!(policy_outcome(ValidationStrategy::BlockOnErrors, 0, 2, Some(5)), (false, Severity::Medium));
        assert_eq!(policy_outcome(ValidationStrategy::BlockOnErrors, 0, 8, Some(5)), (true, Severity::High));
    }

    #[test]
    fn policy_table_block_on_errors_and_warnings() {
        assert_eq!(policy_outcome(ValidationStrategy::BlockOnErrorsAndWarnings, 1, 0, None), (true, Severity::High));
        assert_eq!(policy_outcome(ValidationStrategy::BlockOnErrorsAndWarnings, 0, 1, None), (true, Severity::High));
        assert_eq!(policy_outcome(ValidationStrategy::BlockOnErrorsAndWarnings, 0, 9, Some(5)), (true, Severity::High));
    }

    #[test]
    fn policy_table_warn_only_and_never() {
        assert_eq!(policy_outcome(ValidationStrategy::WarnOnly, 3, 9, Some(5)), (false, Severity::Low));
        assert_eq!(policy_outcome(ValidationStrategy::Never, 3, 9, Some(5)), (false, Severity::None));
    }

    #[test]
    fn scenario_s4_validation_policy_without_and_with_max_warnings() {
        let action = command_action("lint-1", "eslint .");
        let outcome = RawActionResult {
            exit_code: Some(0),
            ..Default::default()
        };

        let mut tools = HashMap::new();
        let policy_no_max = ToolClassPolicy {
            strategy: ValidationStrategy::BlockOnErrors,
            tools: tools.clone(),
        };
        let diag = ToolDiagnostics { errors: 0, warnings: 8 };
        let result = classify(&action, ActionPhase::Test, &outcome, Some((&policy_no_max, diag)), false, false);
        assert!(!result.blocking);

        tools.insert(
            "lint-1".to_string(),
            ToolOverride {
                enabled: true,
                block_on: None,
                max_warnings: Some(5),
                ignored_rules: vec![],
                error_on_rules: vec![],
            },
        );
        let policy_with_max = ToolClassPolicy {
            strategy: ValidationStrategy::BlockOnErrors,
            tools,
        };
        let result = classify(&action, ActionPhase::Test, &outcome, Some((&policy_with_max, diag)), false, false);
        assert!(result.blocking);
    }

    #[test]
    fn classification_is_deterministic_across_identical_inputs() {
        let action = command_action("test-1", "npm test");
        let outcome = RawActionResult {
            exit_code: Some(1),
            stdout: "failed=2,passed=1".to_string(),
            ..Default::default()
        };
        let a = classify(&action, ActionPhase::Test, &outcome, None, true, false);
        let b = classify(&action, ActionPhase::Test, &outcome, None, true, false);
        assert_eq!(a, b);
    }

    #[test]
    fn detects_validation_tool_by_command_signature() {
        assert_eq!(detect_validation_tool(&command_action("a", "eslint src/")), Some("linting"));
        assert_eq!(detect_validation_tool(&command_action("a", "tsc --noEmit")), Some("type-checking"));
        assert_eq!(detect_validation_tool(&command_action("a", "cargo build")), Some("compilation"));
        assert_eq!(detect_validation_tool(&command_action("a", "npm test")), None);
    }

    #[test]
    fn parses_trailing_error_and_warning_counts_from_combined_output() {
        let diag = parse_tool_diagnostics("src/a.ts(3,1): error TS1\nsrc/b.ts(9,4): error TS2\n", "Found 2 errors and 1 warning.\n");
        assert_eq!(diag.errors, 2);
        assert_eq!(diag.warnings, 1);
    }

    #[test]
    fn missing_diagnostic_summary_parses_as_zero() {
        let diag = parse_tool_diagnostics("all good\n", "");
        assert_eq!(diag.errors, 0);
        assert_eq!(diag.warnings, 0);
    }

    #[test]
    fn parses_lightweight_test_report_marker() {
        let report = parse_test_report("running suite\nfailed=3,passed=7\ndone").unwrap();
        assert_eq!(report.failed, 3);
        assert_eq!(report.passed, 7);
        assert!(parse_test_report("no marker here").is_none());
    }
}
