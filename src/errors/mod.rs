//! Structured error codes shared across the core.
//!
//! Every leaf error in the crate resolves to a four-digit `ErrorCode`
//! grouped by category, independent of the seven action-outcome
//! classification kinds in [`crate::classifier`] (those describe *why an
//! action failed*; this module describes *why the engine itself could not
//! proceed*).
//!
//! | Range | Category              |
//! |-------|------------------------|
//! | E1xxx | Test-Plan validation   |
//! | E2xxx | Action execution       |
//! | E3xxx | Classification         |
//! | E4xxx | Store / evidence       |
//! | E5xxx | Internal               |

use std::fmt;

/// A four-digit error code: first digit is the category, remaining three
/// identify the specific error within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // E1xxx: Test-Plan validation. The fault is in the plan document itself.
    pub const EMPTY_PLAN: Self = Self(1001);
    pub const UNSUPPORTED_SCHEMA_VERSION: Self = Self(1002);
    pub const UNKNOWN_ACTION_TYPE: Self = Self(1003);
    pub const MISSING_PARAM: Self = Self(1004);
    pub const UNKNOWN_DEPENDENCY: Self = Self(1005);
    pub const CIRCULAR_DEPENDENCY: Self = Self(1006);
    pub const DUPLICATE_ACTION_ID: Self = Self(1007);
    pub const EMPTY_ACTION_ID: Self = Self(1008);
    pub const INVALID_PLAN_FORMAT: Self = Self(1009);
    pub const SPECIFICATION_EXCERPT_TOO_LARGE: Self = Self(1010);

    // E2xxx: Action Executor. The action itself could not run.
    pub const SPAWN_FAILED: Self = Self(2001);
    pub const SUBPROCESS_TIMEOUT: Self = Self(2002);
    pub const HTTP_CONNECTION_ERROR: Self = Self(2003);
    pub const HTTP_TIMEOUT: Self = Self(2004);
    pub const FILE_UNREADABLE: Self = Self(2005);

    // E3xxx: Failure Classifier. Policy or captured output could not be interpreted.
    pub const MALFORMED_VALIDATION_POLICY: Self = Self(3001);
    pub const UNPARSEABLE_TOOL_OUTPUT: Self = Self(3002);

    // E4xxx: Task Store / Evidence Store.
    pub const STORE_MIGRATION_FAILED: Self = Self(4001);
    pub const ATTEMPT_ALREADY_CLOSED: Self = Self(4002);
    pub const DIGEST_MISMATCH: Self = Self(4003);
    pub const EVIDENCE_ROOT_UNWRITABLE: Self = Self(4004);

    // E5xxx: Internal. Should not surface in ordinary operation.
    pub const INTERNAL_ERROR: Self = Self(5001);
    pub const WORKSPACE_LOCK_CONTENTION: Self = Self(5002);
    pub const CHANNEL_DISCONNECTED: Self = Self(5003);

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::PlanValidation,
            2 => ErrorCategory::ActionExecution,
            3 => ErrorCategory::Classification,
            4 => ErrorCategory::Store,
            5 => ErrorCategory::Internal,
            _ => ErrorCategory::Unknown,
        }
    }

    pub fn description(&self) -> &'static str {
        match self.0 {
            1001 => "test plan has no setup, tests, or teardown actions",
            1002 => "test plan declares an unsupported schema version",
            1003 => "action type is not one of terminal-command, file-check, http-request",
            1004 => "a required action parameter is missing",
            1005 => "an action or task references an unknown dependency",
            1006 => "a circular dependency was detected",
            1007 => "two actions in the same plan share an id",
            1008 => "an action id is empty",
            1009 => "the plan document could not be parsed",
            1010 => "the embedded specification excerpt exceeds the context budget",
            2001 => "the action's subprocess could not be spawned",
            2002 => "the action's subprocess exceeded its timeout and was killed",
            2003 => "the HTTP request could not connect",
            2004 => "the HTTP request exceeded its timeout",
            2005 => "a file-check target could not be read",
            3001 => "the validation policy document is malformed",
            3002 => "captured tool output could not be parsed for errors/warnings",
            4001 => "the task store's embedded migrations failed to apply",
            4002 => "a write was attempted against an already-closed attempt",
            4003 => "an evidence artifact's digest did not match its recorded header",
            4004 => "the evidence root directory could not be created or written",
            5001 => "an unexpected internal error occurred",
            5002 => "the per-workspace advisory lock is held by another process",
            5003 => "an internal channel disconnected unexpectedly",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    PlanValidation,
    ActionExecution,
    Classification,
    Store,
    Internal,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlanValidation => write!(f, "plan validation"),
            Self::ActionExecution => write!(f, "action execution"),
            Self::Classification => write!(f, "classification"),
            Self::Store => write!(f, "store"),
            Self::Internal => write!(f, "internal"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// An error carrying a stable code plus enough context to act on without
/// re-parsing a message string.
#[derive(Debug)]
pub struct StructuredError {
    pub code: ErrorCode,
    pub message: String,
    pub context: Option<ErrorContext>,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub task_id: Option<String>,
    pub action_id: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl StructuredError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        let ctx = self.context.get_or_insert_with(ErrorContext::default);
        ctx.task_id = Some(task_id.into());
        self
    }

    pub fn with_action_id(mut self, action_id: impl Into<String>) -> Self {
        let ctx = self.context.get_or_insert_with(ErrorContext::default);
        ctx.action_id = Some(action_id.into());
        self
    }

    pub fn user_message(&self) -> String {
        let mut msg = format!("[{}] {}", self.code, self.message);

        if let Some(ctx) = &self.context {
            if let Some(task_id) = &ctx.task_id {
                msg.push_str(&format!(" (task: {})", task_id));
            }
            if let Some(action_id) = &ctx.action_id {
                msg.push_str(&format!(" (action: {})", action_id));
            }
            if let (Some(expected), Some(actual)) = (&ctx.expected, &ctx.actual) {
                msg.push_str(&format!(" [expected: {}, actual: {}]", expected, actual));
            }
        }

        msg
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for StructuredError {}

/// Top-level error type the Sprint Controller and CLI boundary deal in.
/// Leaf module errors convert into this via `#[from]`.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Plan(#[from] crate::engine::PlanValidationError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Evidence(#[from] crate::evidence::EvidenceError),

    #[error("{0}")]
    Structured(#[from] StructuredError),

    #[error("workspace lock held by another process (pid {0})")]
    WorkspaceLocked(u32),

    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_formats_with_leading_e_and_four_digits() {
        assert_eq!(ErrorCode::EMPTY_PLAN.formatted(), "E1001");
        assert_eq!(ErrorCode::HTTP_TIMEOUT.formatted(), "E2004");
        assert_eq!(ErrorCode::INTERNAL_ERROR.formatted(), "E5001");
    }

    #[test]
    fn error_code_category_matches_leading_digit() {
        assert_eq!(ErrorCode::EMPTY_PLAN.category(), ErrorCategory::PlanValidation);
        assert_eq!(ErrorCode::SPAWN_FAILED.category(), ErrorCategory::ActionExecution);
        assert_eq!(
            ErrorCode::MALFORMED_VALIDATION_POLICY.category(),
            ErrorCategory::Classification
        );
        assert_eq!(ErrorCode::DIGEST_MISMATCH.category(), ErrorCategory::Store);
        assert_eq!(ErrorCode::INTERNAL_ERROR.category(), ErrorCategory::Internal);
    }

    #[test]
    fn structured_error_user_message_includes_task_and_action() {
        let err = StructuredError::new(ErrorCode::UNKNOWN_DEPENDENCY, "task references unknown dependency")
            .with_task_id("T003")
            .with_action_id("setup-1");

        let msg = err.user_message();
        assert!(msg.contains("E1005"));
        assert!(msg.contains("T003"));
        assert!(msg.contains("setup-1"));
    }

    #[test]
    fn structured_error_with_expected_actual() {
        let err = StructuredError::new(ErrorCode::DIGEST_MISMATCH, "artifact digest mismatch").with_context(
            ErrorContext {
                expected: Some("abc123".into()),
                actual: Some("def456".into()),
                ..Default::default()
            },
        );

        let msg = err.user_message();
        assert!(msg.contains("expected: abc123"));
        assert!(msg.contains("actual: def456"));
    }
}
