//! Prompt rendering for the planning and editing agents.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::plan::Step;
use crate::core::types::{CheckKind, DiffSnapshot};
use crate::io::process::{head, tail};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const EDITOR_TEMPLATE: &str = include_str!("prompts/editor.md");
const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");

#[derive(Debug, Clone, Serialize)]
struct FileLine {
    code: char,
    path: String,
}

#[derive(Debug, Clone, Serialize)]
struct StepContext {
    id: u32,
    title: String,
    instructions: String,
}

impl StepContext {
    fn from_step(step: &Step) -> Self {
        Self {
            id: step.id,
            title: step.display_title(),
            instructions: step.instructions.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct FailureContext {
    kind: &'static str,
    command: String,
    output: String,
}

/// Inputs for the planning prompt.
#[derive(Debug, Clone)]
pub struct PlanPromptInput<'a> {
    pub base: &'a str,
    pub head: &'a str,
    pub change: &'a DiffSnapshot,
    pub stat: &'a str,
    pub plan_path: &'a Path,
}

/// Inputs for the initial editing prompt of a step.
#[derive(Debug, Clone)]
pub struct EditPromptInput<'a> {
    pub step: &'a Step,
    pub total: usize,
    pub branch: &'a str,
    pub merge_base: &'a str,
    pub original_head: &'a str,
    pub owned_files: &'a [String],
    pub format_cmd: Option<String>,
}

/// The command whose failure triggered a fix attempt.
#[derive(Debug, Clone)]
pub struct FailedCheck<'a> {
    /// `None` when the editing agent itself failed or timed out.
    pub kind: Option<CheckKind>,
    pub command: String,
    pub output: &'a str,
}

/// Inputs for a fix prompt.
#[derive(Debug, Clone)]
pub struct FixPromptInput<'a> {
    pub step: &'a Step,
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub max_attempts: u32,
    pub failure: Option<FailedCheck<'a>>,
    pub reverted: &'a [String],
    pub check_cmds: Vec<String>,
}

/// Renders prompts within byte budgets.
pub struct PromptBuilder {
    env: Environment<'static>,
    diff_budget_bytes: usize,
    failure_tail_bytes: usize,
}

impl PromptBuilder {
    pub fn new(diff_budget_bytes: usize, failure_tail_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .expect("planner template should be valid");
        env.add_template("editor", EDITOR_TEMPLATE)
            .expect("editor template should be valid");
        env.add_template("fix", FIX_TEMPLATE)
            .expect("fix template should be valid");
        Self {
            env,
            diff_budget_bytes,
            failure_tail_bytes,
        }
    }

    pub fn build_planner(&self, input: &PlanPromptInput<'_>) -> Result<String> {
        let files: Vec<FileLine> = input
            .change
            .files
            .iter()
            .map(|(path, change)| FileLine {
                code: change.code(),
                path: path.clone(),
            })
            .collect();
        let diff = head(&input.change.patch, self.diff_budget_bytes);
        let mut diff = diff.to_string();
        let dropped = input.change.patch.len() - diff.len();
        if dropped > 0 {
            debug!(bytes_dropped = dropped, "truncated diff for prompt budget");
            diff.push_str(&format!(
                "\n[diff truncated: {dropped} more bytes; use `git diff {}...{}` to read the rest]",
                input.base, input.head
            ));
        }
        let template = self.env.get_template("planner")?;
        template
            .render(context! {
                base => input.base,
                head => input.head,
                files => files,
                stat => input.stat.trim(),
                diff => diff,
                plan_path => input.plan_path.display().to_string(),
            })
            .context("render planner prompt")
    }

    pub fn build_editor(&self, input: &EditPromptInput<'_>) -> Result<String> {
        let template = self.env.get_template("editor")?;
        template
            .render(context! {
                step => StepContext::from_step(input.step),
                total => input.total,
                branch => input.branch,
                merge_base => input.merge_base,
                original_head => input.original_head,
                patterns => input.step.patterns(),
                owned_files => input.owned_files,
                format_cmd => input.format_cmd.as_deref(),
            })
            .context("render editor prompt")
    }

    pub fn build_fix(&self, input: &FixPromptInput<'_>) -> Result<String> {
        let failure = input.failure.as_ref().map(|failed| FailureContext {
            kind: failed.kind.map_or("agent", CheckKind::as_str),
            command: failed.command.clone(),
            output: tail(failed.output.trim_end(), self.failure_tail_bytes).to_string(),
        });
        let template = self.env.get_template("fix")?;
        template
            .render(context! {
                step => StepContext::from_step(input.step),
                attempt => input.attempt,
                max_attempts => input.max_attempts,
                patterns => input.step.patterns(),
                reverted => input.reverted,
                failure => failure,
                check_cmds => input.check_cmds,
            })
            .context("render fix prompt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FileChange;
    use crate::test_support::plan_step;

    fn change(patch: &str) -> DiffSnapshot {
        DiffSnapshot {
            files: [
                ("lib/a.ex".to_string(), FileChange::Modified),
                ("lib/b.ex".to_string(), FileChange::Added),
            ]
            .into_iter()
            .collect(),
            patch: patch.to_string(),
        }
    }

    #[test]
    fn planner_prompt_lists_files_and_plan_path() {
        let change = change("diff --git a/lib/a.ex b/lib/a.ex\n+x\n");
        let prompt = PromptBuilder::new(10_000, 100)
            .build_planner(&PlanPromptInput {
                base: "main",
                head: "feature",
                change: &change,
                stat: " 2 files changed",
                plan_path: Path::new("/tmp/plan.yaml"),
            })
            .expect("render");
        assert!(prompt.contains("- M lib/a.ex"));
        assert!(prompt.contains("- A lib/b.ex"));
        assert!(prompt.contains("/tmp/plan.yaml"));
        assert!(prompt.contains("Changed files (2)"));
        assert!(!prompt.contains("diff truncated"));
    }

    #[test]
    fn planner_prompt_truncates_diff_to_budget() {
        let change = change(&"+line\n".repeat(1_000));
        let prompt = PromptBuilder::new(60, 100)
            .build_planner(&PlanPromptInput {
                base: "main",
                head: "feature",
                change: &change,
                stat: "",
                plan_path: Path::new("plan.yaml"),
            })
            .expect("render");
        assert!(prompt.contains("[diff truncated: 5940 more bytes"));
        assert!(prompt.matches("+line").count() == 10);
        assert!(!prompt.contains("<stat>"));
    }

    #[test]
    fn editor_prompt_carries_step_and_allowlist() {
        let mut step = plan_step(2, &["lib/**"]);
        step.shared_allow = vec!["config/config.exs".to_string()];
        let owned = vec!["lib/a.ex".to_string()];
        let prompt = PromptBuilder::new(1_000, 100)
            .build_editor(&EditPromptInput {
                step: &step,
                total: 3,
                branch: "feature-step-2",
                merge_base: "abc123",
                original_head: "def456",
                owned_files: &owned,
                format_cmd: Some("mix format".to_string()),
            })
            .expect("render");
        assert!(prompt.contains("step 2 of 3"));
        assert!(prompt.contains("`feature-step-2`"));
        assert!(prompt.contains("- lib/**"));
        assert!(prompt.contains("- config/config.exs"));
        assert!(prompt.contains("git diff abc123 def456 -- <path>"));
        assert!(prompt.contains("- lib/a.ex"));
        assert!(prompt.contains("`mix format`"));
    }

    #[test]
    fn fix_prompt_keeps_only_the_failure_tail() {
        let step = plan_step(1, &["a.txt"]);
        let output = format!("{}THE-END", "x".repeat(500));
        let reverted = vec!["b.txt".to_string()];
        let prompt = PromptBuilder::new(1_000, 20)
            .build_fix(&FixPromptInput {
                step: &step,
                attempt: 2,
                max_attempts: 5,
                failure: Some(FailedCheck {
                    kind: Some(CheckKind::Test),
                    command: "mix test".to_string(),
                    output: &output,
                }),
                reverted: &reverted,
                check_cmds: vec!["mix test".to_string()],
            })
            .expect("render");
        assert!(prompt.contains("attempt 2 of 5"));
        assert!(prompt.contains("<failure command=\"test\">"));
        assert!(prompt.contains("THE-END"));
        assert!(!prompt.contains(&"x".repeat(30)));
        assert!(prompt.contains("- b.txt"));
    }

    #[test]
    fn fix_prompt_without_failure_omits_section() {
        let step = plan_step(1, &["a.txt"]);
        let prompt = PromptBuilder::new(1_000, 20)
            .build_fix(&FixPromptInput {
                step: &step,
                attempt: 1,
                max_attempts: 3,
                failure: None,
                reverted: &[],
                check_cmds: Vec::new(),
            })
            .expect("render");
        assert!(!prompt.contains("<failure"));
        assert!(!prompt.contains("<reverted>"));
    }
}
