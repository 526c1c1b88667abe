//! Sprint Controller (§4.9).
//!
//! Owns handles to every other component and drives the per-task state
//! machine: assembling a prompt, awaiting a test plan, running the
//! assistant, verifying its attempt, sealing a commit, or escalating to a
//! developer. Retry/escalation bookkeeping is generalized from the
//! teacher's per-action backoff retry (`retry::RetryExecutor`,
//! `main.rs::execute_step_with_retry`) to a flat per-task bounded-retry-
//! then-escalate model — there is no backoff concept in this spec, just a
//! `max_retries` ceiling.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::channel::{ChannelSignal, ChatChannel};
use crate::classifier::{self, ClassificationKind, Severity};
use crate::commit::CommitEmitter;
use crate::config::CoreConfig;
use crate::context::{ContextManager, TaskContext};
use crate::engine::{self, PlanExecutionOutcome};
use crate::errors::CoreError;
use crate::evidence::EvidenceStore;
use crate::executors::{ActionExecutor, ExecutionEnvironment};
use crate::idle::IdleMonitor;
use crate::protocol::{
    Attempt, AttemptStatus, AuthenticityHeader, CompletionEvaluation, ExecutionReport, ExecutionSummary, FlakyFlag,
    SprintStatus, Task, TaskStatus, TestPlan, ValidationPolicyDocument, REPORT_VERSION,
};
use crate::store::TaskStore;

const NUDGE_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Assembling,
    AwaitingPlan,
    Running,
    Verifying,
    Sealing,
    Escalated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SprintExit {
    Completed,
    Stopped,
    Escalated,
}

impl SprintExit {
    /// Exit codes of §6: 0 clean completion, 2 developer stop, 3 unresolved escalation.
    pub fn exit_code(self) -> i32 {
        match self {
            SprintExit::Completed => 0,
            SprintExit::Stopped => 2,
            SprintExit::Escalated => 3,
        }
    }
}

/// What the developer chose at an `escalated` checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationResolution {
    Retry,
    Skip,
    Abort,
}

pub struct SprintController<C: ChatChannel> {
    pub store: Arc<TaskStore>,
    pub evidence: Arc<EvidenceStore>,
    pub channel: Arc<C>,
    pub idle: IdleMonitor,
    pub commit: CommitEmitter,
    pub executors: Vec<Box<dyn ActionExecutor + Send + Sync>>,
    pub context_manager: ContextManager,
    pub config: CoreConfig,
}

impl<C: ChatChannel + 'static> SprintController<C> {
    fn execution_environment(&self) -> ExecutionEnvironment {
        ExecutionEnvironment {
            workspace_root: self.config.workspace_root.clone(),
            default_timeout_secs: 30,
        }
    }

    /// Drives every task in the sprint, in `sequence` order, to `verified`,
    /// `skipped`, or an unresolved `escalated` halt.
    pub async fn run_sprint(&self, sprint_id: &str) -> Result<SprintExit, CoreError> {
        loop {
            let tasks = self.store.tasks_for_sprint(sprint_id).await?;
            let verified_ids = self.store.verified_task_ids(sprint_id).await?;

            let Some(task) = tasks
                .into_iter()
                .find(|t| t.status == TaskStatus::Pending && t.dependencies_satisfied(&verified_ids))
            else {
                return Ok(SprintExit::Completed);
            };

            match self.drive_task(&task, sprint_id).await? {
                TaskOutcome::Advanced => continue,
                TaskOutcome::Stopped => return Ok(SprintExit::Stopped),
                TaskOutcome::EscalatedUnresolved => return Ok(SprintExit::Escalated),
            }
        }
    }

    async fn drive_task(&self, task: &Task, sprint_id: &str) -> Result<TaskOutcome, CoreError> {
        self.store.transition_task_status(&task.id, TaskStatus::InProgress).await?;
        let mut state = TaskState::Assembling;
        let verified_ids = self.store.verified_task_ids(sprint_id).await?;

        loop {
            state = match state {
                TaskState::Assembling => self.assemble(task, &verified_ids).await?,
                TaskState::AwaitingPlan => self.await_plan(task).await?,
                TaskState::Running => match self.run_task(task).await? {
                    std::ops::ControlFlow::Continue(next) => next,
                    std::ops::ControlFlow::Break(DeveloperOverride::Stop) => return Ok(TaskOutcome::Stopped),
                    std::ops::ControlFlow::Break(DeveloperOverride::Skip) => {
                        self.store.transition_task_status(&task.id, TaskStatus::Skipped).await?;
                        return Ok(TaskOutcome::Advanced);
                    }
                },
                TaskState::Verifying => self.verify(task).await?,
                TaskState::Sealing => {
                    self.seal(task).await?;
                    return Ok(TaskOutcome::Advanced);
                }
                TaskState::Escalated => {
                    self.store.update_sprint_status(sprint_id, SprintStatus::Paused).await?;
                    match self.escalate(task).await? {
                        EscalationResolution::Retry => {
                            self.store.update_sprint_status(sprint_id, SprintStatus::Running).await?;
                            TaskState::Running
                        }
                        EscalationResolution::Skip => {
                            self.store.update_sprint_status(sprint_id, SprintStatus::Running).await?;
                            self.store.transition_task_status(&task.id, TaskStatus::Skipped).await?;
                            return Ok(TaskOutcome::Advanced);
                        }
                        EscalationResolution::Abort => return Ok(TaskOutcome::EscalatedUnresolved),
                    }
                }
                TaskState::Idle => TaskState::Assembling,
            };
        }
    }

    async fn assemble(&self, task: &Task, verified_ids: &[String]) -> Result<TaskState, CoreError> {
        let mut verified_contexts = Vec::with_capacity(verified_ids.len());
        for id in verified_ids {
            verified_contexts.push(self.hydrate_context(id).await?);
        }

        let current_context = self.hydrate_context(&task.id).await?;

        let last_message = self.channel.history().await.last().map(|m| m.text.clone());
        let prompt = self
            .context_manager
            .assemble(&verified_contexts, &current_context, last_message.as_deref());

        self.channel.send(&prompt.text).await.ok();

        match self.store.active_test_plan(&task.id).await? {
            Some(_) => Ok(TaskState::Running),
            None => {
                self.channel
                    .send(&format!("No test plan is attached to {}. Please respond with one.", task.id))
                    .await
                    .ok();
                Ok(TaskState::AwaitingPlan)
            }
        }
    }

    /// Hydrates a full `TaskContext` (§4.6) from the store: identifier,
    /// title, embedded spec excerpt, active test plan summary, and the
    /// most recent attempt's evidence summary, if any exist yet.
    async fn hydrate_context(&self, task_id: &str) -> Result<TaskContext, CoreError> {
        let task = self
            .store
            .find_task(task_id)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("no task recorded for {task_id}")))?;

        let test_plan_summary = self
            .store
            .active_test_plan(task_id)
            .await?
            .map(|plan| summarize_test_plan(&plan.document));

        let latest_evidence_summary = self.store.latest_attempt(task_id).await?.map(|attempt| summarize_attempt(&attempt));

        Ok(TaskContext {
            task_id: task.id,
            title: task.title,
            spec_excerpt: task.description,
            test_plan_summary,
            latest_evidence_summary,
        })
    }

    async fn await_plan(&self, task: &Task) -> Result<TaskState, CoreError> {
        while let Some(message) = self.channel.recv().await {
            if !message.from_assistant {
                continue;
            }
            match serde_json::from_str::<crate::protocol::TestPlanDocument>(&message.text) {
                Ok(doc) => match engine::validate_plan(&doc, self.config.max_spec_excerpt_tokens) {
                    Ok(()) => {
                        let plan_version = match self.store.active_test_plan(&task.id).await? {
                            Some(existing) => existing.version + 1,
                            None => 1,
                        };
                        self.store
                            .attach_test_plan(&TestPlan {
                                task_id: task.id.clone(),
                                version: plan_version,
                                archived: false,
                                document: doc,
                                created_at: Utc::now(),
                            })
                            .await?;
                        return Ok(TaskState::Running);
                    }
                    Err(err) => {
                        warn!(task_id = %task.id, error = %err, "rejected schema-invalid test plan");
                        self.channel.send(&format!("That test plan was rejected: {err}. Please resend a corrected one.")).await.ok();
                    }
                },
                Err(_) => {
                    self.channel.send("That message was not a valid test-plan document. Please resend.").await.ok();
                }
            }
        }
        Ok(TaskState::AwaitingPlan)
    }

    /// Runs the `running` state: waits for a completion marker, a blocker
    /// declaration, an idle nudge acceptance, or a developer override.
    /// `Stop`/`Skip` short-circuit the whole task via `ControlFlow::Break`;
    /// everything else resolves to the next `TaskState` to enter.
    async fn run_task(&self, task: &Task) -> Result<std::ops::ControlFlow<DeveloperOverride, TaskState>, CoreError> {
        use std::ops::ControlFlow;

        self.idle.record_activity().await;

        // Nudges must fire during a genuinely idle window, not just right
        // after a message arrives, so the idle timer is driven by its own
        // background loop rather than polled inline in the recv loop below.
        let nudge_idle = self.idle.clone();
        let nudge_channel = self.channel.clone();
        let nudge_handle = tokio::spawn(async move {
            nudge_idle
                .run_nudge_loop(NUDGE_POLL_INTERVAL, || {
                    let channel = nudge_channel.clone();
                    async move {
                        let _ = channel.send("Still working on this task? Reply with @codor done when finished.").await;
                    }
                })
                .await;
        });

        let result = loop {
            let Some(message) = self.channel.recv().await else {
                break Ok(ControlFlow::Continue(TaskState::Verifying));
            };
            self.idle.record_activity().await;
            if let Some(signal) = crate::channel::markers::detect_with_prefix(&message.text, &self.config.chat_marker_prefix) {
                match signal {
                    ChannelSignal::Done => break Ok(ControlFlow::Continue(TaskState::Verifying)),
                    ChannelSignal::Blocker(_detail) => break Ok(ControlFlow::Continue(TaskState::Escalated)),
                    ChannelSignal::Status => {
                        self.channel.send(&format!("{} is in-progress", task.id)).await.ok();
                    }
                    ChannelSignal::Stop => break Ok(ControlFlow::Break(DeveloperOverride::Stop)),
                    ChannelSignal::Skip => break Ok(ControlFlow::Break(DeveloperOverride::Skip)),
                    ChannelSignal::Retry => break Ok(ControlFlow::Continue(TaskState::Verifying)),
                }
            }
        };

        nudge_handle.abort();
        result
    }

    async fn verify(&self, task: &Task) -> Result<TaskState, CoreError> {
        let plan = self
            .store
            .active_test_plan(&task.id)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("no active test plan for {}", task.id)))?;

        let attempt_number = self.store.attempt_count(&task.id).await? + 1;
        if attempt_number > self.config.max_retries {
            return Ok(TaskState::Escalated);
        }

        let started_at = Utc::now();
        let handle = self.evidence.open_attempt(&task.id, attempt_number).await?;
        let env = self.execution_environment();

        let validation_policy: ValidationPolicyDocument =
            self.store.effective_validation_policy(&task.id, &task.sprint_id).await?;

        let outcome: PlanExecutionOutcome = engine::execute_plan(&plan.document, &self.executors, &env, false, |action| {
            let class = classifier::detect_validation_tool(action)?;
            validation_policy.for_tool_class(class).cloned()
        })
        .await;

        let all_outcomes: Vec<_> = outcome
            .setup_results
            .iter()
            .chain(outcome.test_results.iter())
            .chain(outcome.teardown_results.iter())
            .cloned()
            .collect();

        for (idx, result) in all_outcomes.iter().enumerate() {
            let artifact = serde_json::to_vec_pretty(result).unwrap_or_default();
            self.evidence
                .write_artifact(&handle, &format!("{}-outcome-{idx}.json", result.action_id), &artifact)
                .await?;
        }

        let blocking_failures = outcome.all_blocking_failures();
        let completion = CompletionEvaluation {
            all_steps_passed: blocking_failures.is_empty(),
            minimum_pass_rate_met: blocking_failures.is_empty(),
            required_evidence_present: true,
            sealed: blocking_failures.is_empty(),
        };

        let attempt_status = if blocking_failures.is_empty() {
            AttemptStatus::Passed
        } else if blocking_failures.iter().any(|f| f.classification.severity == Severity::Critical) {
            AttemptStatus::TimedOut
        } else {
            AttemptStatus::Failed
        };

        let attempt = Attempt {
            task_id: task.id.clone(),
            attempt_number,
            started_at,
            ended_at: Some(Utc::now()),
            status: attempt_status,
            outcomes: all_outcomes.clone(),
            evidence_dir: format!(".codor/evidence/{}/attempt-{attempt_number}", task.id),
        };

        let validation_ids: std::collections::HashSet<&str> = plan
            .document
            .test_plan
            .setup
            .iter()
            .chain(plan.document.test_plan.tests.iter())
            .chain(plan.document.test_plan.teardown.iter())
            .filter(|a| classifier::detect_validation_tool(a).is_some())
            .map(|a| a.id.as_str())
            .collect();
        let validation_evaluation: Vec<_> = all_outcomes
            .iter()
            .filter(|o| validation_ids.contains(o.action_id.as_str()))
            .cloned()
            .collect();

        let execution_summary = ExecutionSummary {
            total_actions: all_outcomes.len() as u32,
            passed: all_outcomes.iter().filter(|o| o.classification.kind == ClassificationKind::Success).count() as u32,
            blocking_failures: blocking_failures.len() as u32,
            non_blocking_warnings: all_outcomes.iter().filter(|o| !o.is_blocking() && o.severity() > Severity::None).count()
                as u32,
            duration_ms: all_outcomes.iter().map(|o| o.duration_ms).sum(),
        };

        let report = ExecutionReport {
            report_version: REPORT_VERSION.to_string(),
            generated_at: Utc::now(),
            test_specification: plan.document.clone(),
            execution_summary,
            setup_results: outcome.setup_results.clone(),
            test_results: outcome.test_results.clone(),
            teardown_results: outcome.teardown_results.clone(),
            validation_evaluation,
            completion_evaluation: completion.clone(),
            authenticity: AuthenticityHeader {
                producer: String::new(),
                producer_version: String::new(),
                platform: String::new(),
                pid: 0,
                timestamp: Utc::now(),
                digest: String::new(),
            },
        };

        let sealed = completion.sealed;
        self.evidence
            .close_attempt(handle, &serde_json::json!({ "completion": completion }), "", report)
            .await?;
        self.store.append_attempt(&attempt).await?;

        if sealed {
            Ok(TaskState::Sealing)
        } else if attempt_number >= self.config.max_retries {
            Ok(TaskState::Escalated)
        } else {
            let reasons: Vec<String> = blocking_failures
                .iter()
                .map(|f| format!("- {}: {}", f.action_name, f.classification.reason))
                .collect();
            self.channel
                .send(&format!("Attempt {attempt_number} had blocking failures:\n{}", reasons.join("\n")))
                .await
                .ok();
            Ok(TaskState::Running)
        }
    }

    /// Records a flaky flag as pure annotation: it never changes the retry
    /// count already recorded, never changes any classification already
    /// stored (§9's flaky-test policy decision).
    pub async fn record_flaky(&self, task_id: &str, test_name: &str, failures_before_pass: u32) -> Result<(), CoreError> {
        self.store
            .record_flaky_flag(&FlakyFlag {
                task_id: task_id.to_string(),
                test_name: test_name.to_string(),
                failures_before_pass,
            })
            .await?;
        Ok(())
    }

    async fn seal(&self, task: &Task) -> Result<(), CoreError> {
        let attempt = self
            .store
            .latest_attempt(&task.id)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("no attempt recorded for {}", task.id)))?;

        let hash = self
            .commit
            .seal(&task.id, &task.title, &attempt, &attempt.evidence_dir)
            .map_err(|err| CoreError::Internal(err.to_string()))?;

        self.store.set_commit_hash(&task.id, &hash).await?;
        self.store.transition_task_status(&task.id, TaskStatus::Verified).await?;
        info!(task_id = %task.id, commit = %hash, "sealed task");
        Ok(())
    }

    /// Surfaces `{stop, skip, retry, manual-fix}` to the channel and waits
    /// for a developer-override marker. `manual-fix` is treated the same
    /// as `retry` once the developer signals they've intervened.
    async fn escalate(&self, task: &Task) -> Result<EscalationResolution, CoreError> {
        self.channel
            .send(&format!(
                "{} is escalated after exhausting retries. Reply with @codor stop, @codor skip, or @codor retry.",
                task.id
            ))
            .await
            .ok();

        while let Some(message) = self.channel.recv().await {
            if let Some(signal) = crate::channel::markers::detect_with_prefix(&message.text, &self.config.chat_marker_prefix) {
                match signal {
                    ChannelSignal::Stop => return Ok(EscalationResolution::Abort),
                    ChannelSignal::Skip => return Ok(EscalationResolution::Skip),
                    ChannelSignal::Retry => return Ok(EscalationResolution::Retry),
                    _ => continue,
                }
            }
        }
        Ok(EscalationResolution::Abort)
    }
}

fn summarize_test_plan(doc: &crate::protocol::TestPlanDocument) -> String {
    format!(
        "{} setup, {} tests, {} teardown actions (schema {})",
        doc.test_plan.setup.len(),
        doc.test_plan.tests.len(),
        doc.test_plan.teardown.len(),
        doc.test_plan.schema_version
    )
}

fn summarize_attempt(attempt: &Attempt) -> String {
    format!(
        "attempt {} ({:?}): {} action(s), {} blocking failure(s)",
        attempt.attempt_number,
        attempt.status,
        attempt.outcomes.len(),
        attempt.outcomes.iter().filter(|o| o.is_blocking()).count()
    )
}

enum TaskOutcome {
    Advanced,
    Stopped,
    EscalatedUnresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeveloperOverride {
    Stop,
    Skip,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sprint_exit_codes_match_the_external_interface_contract() {
        assert_eq!(SprintExit::Completed.exit_code(), 0);
        assert_eq!(SprintExit::Stopped.exit_code(), 2);
        assert_eq!(SprintExit::Escalated.exit_code(), 3);
    }
}
