//! Editing agent: implements one step on its branch, then fixes failures.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::core::plan::Step;
use crate::io::attempt_log::AttemptPaths;
use crate::io::checks::command_line;
use crate::io::config::Config;
use crate::io::executor::{AgentRole, ExecOutput, ExecRequest, Executor};
use crate::io::prompt::{EditPromptInput, FailedCheck, FixPromptInput, PromptBuilder};

use super::{READ_TOOLS, bash_grant, denied_git, tools};

const SYSTEM_PROMPT: &str = "You are rebuilding an existing change one slice at a time. \
Stay inside the allowlist you are given, move files toward their final state in the reference \
commit, and keep edits minimal. Never commit or change branches.";

/// Where a step sits in the stack.
#[derive(Debug, Clone, Copy)]
pub struct EditContext<'a> {
    pub step: &'a Step,
    pub total: usize,
    pub branch: &'a str,
    pub merge_base: &'a str,
    pub original_head: &'a str,
    /// Changed files this step owns in the original change.
    pub owned_files: &'a [String],
}

/// Why the previous attempt failed.
#[derive(Debug, Clone)]
pub struct FixContext<'a> {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub max_attempts: u32,
    pub failure: Option<FailedCheck<'a>>,
    pub reverted: &'a [String],
}

pub struct EditorAgent {
    prompts: PromptBuilder,
    timeout: Duration,
    output_limit_bytes: usize,
    format_cmd: Option<String>,
    verify_cmds: Vec<String>,
}

impl EditorAgent {
    pub fn new(config: &Config) -> Self {
        let verify_cmds = [&config.check_cmd, &config.test_cmd]
            .into_iter()
            .flatten()
            .map(|argv| command_line(argv))
            .collect();
        Self {
            prompts: PromptBuilder::new(
                config.agent.prompt_budget_bytes,
                config.agent.failure_tail_bytes,
            ),
            timeout: Duration::from_secs(config.agent.edit_timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            format_cmd: config.format_cmd.as_deref().map(command_line),
            verify_cmds,
        }
    }

    /// First invocation for a step, in a fresh session.
    pub fn request_edit<E: Executor>(
        &self,
        executor: &E,
        root: &Path,
        ctx: &EditContext<'_>,
        paths: &AttemptPaths,
    ) -> Result<ExecOutput> {
        let prompt = self.prompts.build_editor(&EditPromptInput {
            step: ctx.step,
            total: ctx.total,
            branch: ctx.branch,
            merge_base: ctx.merge_base,
            original_head: ctx.original_head,
            owned_files: ctx.owned_files,
            format_cmd: self.format_cmd.clone(),
        })?;
        info!(step = ctx.step.id, branch = ctx.branch, "requesting edit");
        executor.exec(&self.request(root, prompt, self.edit_tools(ctx), None, paths))
    }

    /// Fix invocation, resuming `session` when the agent reported one.
    ///
    /// Fix sessions may also run the check and test commands.
    pub fn request_fix<E: Executor>(
        &self,
        executor: &E,
        root: &Path,
        ctx: &EditContext<'_>,
        fix: &FixContext<'_>,
        session: Option<&str>,
        paths: &AttemptPaths,
    ) -> Result<ExecOutput> {
        let prompt = self.prompts.build_fix(&FixPromptInput {
            step: ctx.step,
            attempt: fix.attempt,
            max_attempts: fix.max_attempts,
            failure: fix.failure.clone(),
            reverted: fix.reverted,
            check_cmds: self.verify_cmds.clone(),
        })?;
        let mut allowed = self.edit_tools(ctx);
        allowed.extend(self.verify_cmds.iter().map(|cmd| bash_grant(cmd)));
        info!(
            step = ctx.step.id,
            attempt = fix.attempt,
            resume = session.is_some(),
            "requesting fix"
        );
        executor.exec(&self.request(
            root,
            prompt,
            allowed,
            session.map(str::to_string),
            paths,
        ))
    }

    fn edit_tools(&self, ctx: &EditContext<'_>) -> Vec<String> {
        let mut allowed = tools(READ_TOOLS);
        allowed.extend(tools(&["Write", "Edit", "MultiEdit"]));
        allowed.push(bash_grant(&format!(
            "git checkout {} --",
            ctx.original_head
        )));
        if let Some(format_cmd) = &self.format_cmd {
            allowed.push(bash_grant(format_cmd));
        }
        allowed
    }

    fn request(
        &self,
        root: &Path,
        prompt: String,
        allowed_tools: Vec<String>,
        resume_session: Option<String>,
        paths: &AttemptPaths,
    ) -> ExecRequest {
        ExecRequest {
            role: AgentRole::Editor,
            workdir: root.to_path_buf(),
            prompt,
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            allowed_tools,
            disallowed_tools: denied_git(),
            resume_session,
            max_turns: None,
            output_path: None,
            stream_path: paths.agent_stream.clone(),
            log_path: paths.agent_log.clone(),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}
