//! Context Manager (§4.6).
//!
//! Assembles the prompt sent to the assistant for the task about to begin:
//! full context for recently-verified tasks in the foundation phase, a
//! one-line summary per older task plus the last two in full once the
//! sprint is in steady state, and an on-demand splice-in when the most
//! recent channel message references a task that got summarized away.
//! Token accounting is a pure approximation — this engine has no real
//! tokenizer dependency, by design (§4.6, §9 non-goals).

use once_cell::sync::Lazy;
use regex::Regex;

/// Once a sprint has more than this many verified tasks, the manager
/// switches from "full context for everything" to summarize-plus-recent.
pub const FOUNDATION_PHASE_THRESHOLD: usize = 3;

/// Hard ceiling past which the manager starts degrading the prompt shape
/// rather than let the estimate grow unbounded.
pub const HARD_TOKEN_CEILING: usize = 128_000;

const CHARS_PER_TOKEN: usize = 4;

/// Deterministic characters-per-token approximation. Matches the non-goal
/// against a heavyweight tokenizer dependency while keeping the budget
/// ladder below fully unit-testable without network or model access.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    (chars + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}

static TASK_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bT(\d{3,})\b").expect("static regex"));
static NATURAL_REF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\btask\s*#?\s*(\d+)\b").expect("static regex"));

/// Finds a task identifier referenced in free text, normalizing both the
/// strict `T007` form and natural-language variants (`task 7`, `task #7`)
/// onto the same `T<NNN>` shape.
pub fn extract_task_reference(text: &str) -> Option<String> {
    if let Some(caps) = TASK_ID_RE.captures(text) {
        return Some(format!("T{:0>3}", &caps[1]));
    }
    if let Some(caps) = NATURAL_REF_RE.captures(text) {
        return Some(format!("T{:0>3}", &caps[1]));
    }
    None
}

/// Everything the manager needs to know about one task to render either
/// its full context or its one-line summary.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskContext {
    pub task_id: String,
    pub title: String,
    pub spec_excerpt: String,
    pub test_plan_summary: Option<String>,
    pub latest_evidence_summary: Option<String>,
}

impl TaskContext {
    fn full_text(&self) -> String {
        let mut out = format!("## {} — {}\n\n{}\n", self.task_id, self.title, self.spec_excerpt);
        if let Some(plan) = &self.test_plan_summary {
            out.push_str("\nActive test plan:\n");
            out.push_str(plan);
            out.push('\n');
        }
        if let Some(evidence) = &self.latest_evidence_summary {
            out.push_str("\nLatest evidence: ");
            out.push_str(evidence);
            out.push('\n');
        }
        out
    }

    fn summary_line(&self) -> String {
        format!("- {} ({}): completed and verified.\n", self.task_id, self.title)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub text: String,
    pub estimated_tokens: usize,
    pub on_demand_injected: Option<String>,
}

/// Owns the budget configuration; stateless otherwise — every call is a
/// pure function of its arguments.
pub struct ContextManager {
    pub hard_token_ceiling: usize,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self {
            hard_token_ceiling: HARD_TOKEN_CEILING,
        }
    }
}

impl ContextManager {
    /// `verified` must already be in sprint order. `last_channel_message`
    /// is the most recent assistant message, if any, used for step 4's
    /// on-demand retrieval.
    pub fn assemble(
        &self,
        verified: &[TaskContext],
        current: &TaskContext,
        last_channel_message: Option<&str>,
    ) -> AssembledPrompt {
        let on_demand_id = last_channel_message.and_then(extract_task_reference);

        let foundation_phase = verified.len() <= FOUNDATION_PHASE_THRESHOLD;
        let (mut full, mut summarized): (Vec<TaskContext>, Vec<TaskContext>) = if foundation_phase {
            (verified.to_vec(), Vec::new())
        } else {
            let split = verified.len() - 2;
            (verified[split..].to_vec(), verified[..split].to_vec())
        };

        let mut on_demand = on_demand_id
            .as_deref()
            .and_then(|id| summarized.iter().find(|t| t.task_id == id).cloned());

        let mut in_steady_state_shape = !foundation_phase;

        loop {
            let text = render(&full, &summarized, current, on_demand.as_ref());
            let tokens = estimate_tokens(&text);
            if tokens <= self.hard_token_ceiling {
                return AssembledPrompt {
                    text,
                    estimated_tokens: tokens,
                    on_demand_injected: on_demand.as_ref().map(|t| t.task_id.clone()),
                };
            }

            // Step 2 -> step 3: collapse the foundation-phase "everyone in
            // full" shape down to "summarize all but the last two" before
            // touching anything else.
            if !in_steady_state_shape {
                in_steady_state_shape = true;
                let split = full.len().saturating_sub(2);
                let newly_summarized: Vec<TaskContext> = full.drain(..split).collect();
                summarized.splice(0..0, newly_summarized);
                continue;
            }

            // Then drop older full-context entries one at a time.
            if !full.is_empty() {
                let dropped = full.remove(0);
                summarized.push(dropped);
                continue;
            }

            // Finally, drop the on-demand injection.
            if on_demand.is_some() {
                on_demand = None;
                continue;
            }

            return AssembledPrompt {
                text,
                estimated_tokens: tokens,
                on_demand_injected: None,
            };
        }
    }
}

fn render(full: &[TaskContext], summarized: &[TaskContext], current: &TaskContext, on_demand: Option<&TaskContext>) -> String {
    let mut out = String::new();
    for task in summarized {
        out.push_str(&task.summary_line());
    }
    if let Some(task) = on_demand {
        out.push_str("\n[on-demand retrieval]\n");
        out.push_str(&task.full_text());
    }
    for task in full {
        out.push('\n');
        out.push_str(&task.full_text());
    }
    out.push('\n');
    out.push_str(&current.full_text());
    out
}
