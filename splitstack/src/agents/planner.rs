//! Planning agent: proposes a stack plan for a change.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, warn};

use crate::core::plan::Plan;
use crate::core::types::DiffSnapshot;
use crate::errors::StackError;
use crate::io::attempt_log::StatePaths;
use crate::io::config::Config;
use crate::io::executor::{AgentRole, ExecRequest, Executor};
use crate::io::plan_store::{parse_plan, write_plan};
use crate::io::prompt::{PlanPromptInput, PromptBuilder};

use super::{READ_TOOLS, denied_git, tools};

static YAML_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```ya?ml\s*\n(.*?)```").expect("static regex"));

/// The change the planner is asked to split.
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub base: &'a str,
    pub head: &'a str,
    pub change: &'a DiffSnapshot,
    pub stat: &'a str,
}

/// A plan produced by the agent and saved under the state directory.
#[derive(Debug, Clone)]
pub struct GeneratedPlan {
    pub plan: Plan,
    pub path: PathBuf,
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PlannerAgent {
    timeout: Duration,
    max_turns: u32,
    output_limit_bytes: usize,
    prompt_budget_bytes: usize,
}

impl PlannerAgent {
    pub fn new(config: &Config) -> Self {
        Self {
            timeout: Duration::from_secs(config.agent.plan_timeout_secs),
            max_turns: config.agent.plan_max_turns,
            output_limit_bytes: config.output_limit_bytes,
            prompt_budget_bytes: config.agent.prompt_budget_bytes,
        }
    }

    /// Ask the agent for a plan.
    ///
    /// The agent writes YAML to the plan path; a fenced YAML block in its final
    /// message is accepted as a fallback. Anything unparseable is
    /// [`StackError::PlanParse`].
    pub fn request_plan<E: Executor>(
        &self,
        executor: &E,
        root: &Path,
        state: &StatePaths,
        request: &PlanRequest<'_>,
    ) -> Result<GeneratedPlan> {
        let plan_path = state.plan_path(request.head);
        if plan_path.exists() {
            fs::remove_file(&plan_path)
                .with_context(|| format!("remove stale plan {}", plan_path.display()))?;
        }
        let prompt = PromptBuilder::new(self.prompt_budget_bytes, 0).build_planner(
            &PlanPromptInput {
                base: request.base,
                head: request.head,
                change: request.change,
                stat: request.stat,
                plan_path: &plan_path,
            },
        )?;

        let mut allowed = tools(READ_TOOLS);
        allowed.push("Write".to_string());
        let session_dir = state.planner_dir(request.head);
        info!(files = request.change.files.len(), "requesting plan");
        let output = executor.exec(&ExecRequest {
            role: AgentRole::Planner,
            workdir: root.to_path_buf(),
            prompt,
            system_prompt: None,
            allowed_tools: allowed,
            disallowed_tools: denied_git(),
            resume_session: None,
            max_turns: Some(self.max_turns),
            output_path: Some(plan_path.clone()),
            stream_path: session_dir.join("agent.jsonl"),
            log_path: session_dir.join("agent.log"),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        })?;
        if output.is_error {
            warn!(result = %output.result, "planner reported an error");
        }

        let text = if plan_path.is_file() {
            fs::read_to_string(&plan_path)
                .with_context(|| format!("read plan {}", plan_path.display()))?
        } else if let Some(block) = fenced_yaml(&output.result) {
            warn!("planner did not write the plan file; using the YAML in its reply");
            block.to_string()
        } else {
            return Err(StackError::PlanParse {
                message: format!("agent wrote no plan to {}", plan_path.display()),
            }
            .into());
        };
        let plan = parse_plan(&text)?;
        write_plan(&plan_path, &plan)?;
        Ok(GeneratedPlan {
            plan,
            path: plan_path,
            cost_usd: output.cost_usd,
        })
    }
}

fn fenced_yaml(text: &str) -> Option<&str> {
    YAML_BLOCK_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FileChange;
    use crate::io::executor::ExecOutput;
    use crate::test_support::ScriptedExecutor;

    fn change() -> DiffSnapshot {
        DiffSnapshot {
            files: [("a.txt".to_string(), FileChange::Added)].into_iter().collect(),
            patch: "diff --git a/a.txt b/a.txt\n+a\n".to_string(),
        }
    }

    fn request<'a>(change: &'a DiffSnapshot) -> PlanRequest<'a> {
        PlanRequest {
            base: "main",
            head: "feature",
            change,
            stat: "",
        }
    }

    #[test]
    fn reads_plan_written_by_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = StatePaths::new(&temp.path().join(".git"));
        let executor = ScriptedExecutor::new().then(|req| {
            let path = req.output_path.as_ref().expect("plan path");
            fs::create_dir_all(path.parent().expect("parent"))?;
            fs::write(path, "stack:\n  - id: 1\n    title: All\n    allow: [a.txt]\n")?;
            Ok(ExecOutput {
                cost_usd: Some(0.5),
                ..ExecOutput::default()
            })
        });
        let change = change();
        let generated = PlannerAgent::new(&Config::default())
            .request_plan(&executor, temp.path(), &state, &request(&change))
            .expect("plan");
        assert_eq!(generated.plan.len(), 1);
        assert_eq!(generated.path, state.plan_path("feature"));
        assert_eq!(generated.cost_usd, Some(0.5));

        let requests = executor.requests();
        assert_eq!(requests[0].role, AgentRole::Planner);
        assert!(requests[0].allowed_tools.contains(&"Write".to_string()));
        assert!(!requests[0].allowed_tools.contains(&"Edit".to_string()));
        assert!(
            requests[0]
                .disallowed_tools
                .contains(&"Bash(git commit:*)".to_string())
        );
        executor.assert_drained();
    }

    #[test]
    fn falls_back_to_fenced_yaml_in_reply() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = StatePaths::new(&temp.path().join(".git"));
        let executor = ScriptedExecutor::new().then(|_| {
            Ok(ExecOutput {
                result: "Here:\n```yaml\nstack:\n  - id: 1\n    allow: [a.txt]\n```\n".to_string(),
                ..ExecOutput::default()
            })
        });
        let change = change();
        let generated = PlannerAgent::new(&Config::default())
            .request_plan(&executor, temp.path(), &state, &request(&change))
            .expect("plan");
        assert_eq!(generated.plan.steps[0].allow, vec!["a.txt"]);
        assert!(generated.path.is_file());
    }

    #[test]
    fn no_plan_at_all_is_plan_parse() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = StatePaths::new(&temp.path().join(".git"));
        let executor = ScriptedExecutor::new().then(|_| Ok(ExecOutput::default()));
        let change = change();
        let err = PlannerAgent::new(&Config::default())
            .request_plan(&executor, temp.path(), &state, &request(&change))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StackError>(),
            Some(StackError::PlanParse { .. })
        ));
    }
}
