//! Per-step state machine: branch, edit, enforce, validate, fix, commit.
//!
//! ```text
//! pending -> branch_created -> agent_invoked -> validating -> tests_passed -> committed
//!                                                  |  ^
//!                           format/check/test fail |  | fix agent re-invoked
//!                                                  v  |
//!                                               fixing(n)      (attempts exhausted -> failed)
//! ```
//!
//! Allowlist enforcement runs at the start of every validation round, after
//! a passing round (re-running the gates once if they wrote out of scope) and
//! once more just before the commit. Out-of-scope paths are restored to the step's
//! parent commit; that never consumes a fix attempt.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::agents::editor::{EditContext, EditorAgent, FixContext};
use crate::core::allowlist::{OverlapPolicy, ScopeCheck, check_scope};
use crate::core::branch::step_branch_name;
use crate::core::commit_message::format_commit_message;
use crate::core::plan::Step;
use crate::core::types::{CheckKind, CheckOutcome, StepStatus};
use crate::errors::StackError;
use crate::io::attempt_log::{AttemptMeta, AttemptPaths, StatePaths, write_attempt_meta};
use crate::io::checks::{CheckRequest, CheckResult, CheckRunner, command_line};
use crate::io::config::Config;
use crate::io::executor::{ExecOutput, Executor};
use crate::io::git::Git;
use crate::io::process::tail;
use crate::io::prompt::FailedCheck;
use crate::run::Run;

/// How a step is entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEntry {
    /// Create the step branch at `from` and run the editing agent.
    Fresh { from: String },
    /// The step branch is already checked out with the agent's earlier edits
    /// (`--continue`); go straight to validation.
    Resume,
}

/// Collaborators shared by every step of a run.
pub struct StepEnv<'a, E: Executor, C: CheckRunner> {
    pub root: &'a Path,
    pub git: &'a Git,
    pub config: &'a Config,
    pub state: &'a StatePaths,
    pub executor: &'a E,
    pub checks: &'a C,
}

/// Result of one validation round.
struct Round {
    format: CheckOutcome,
    check: CheckOutcome,
    test: CheckOutcome,
    failure: Option<RoundFailure>,
}

/// What failed a round. `kind` is `None` when the agent call itself failed.
struct RoundFailure {
    kind: Option<CheckKind>,
    command: String,
    output: String,
}

impl Round {
    fn skipped(failure: Option<RoundFailure>) -> Self {
        Self {
            format: CheckOutcome::Skipped,
            check: CheckOutcome::Skipped,
            test: CheckOutcome::Skipped,
            failure,
        }
    }

    fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Run step `index` of `run` to a terminal state.
///
/// On success the step is committed and the branch stays checked out. On
/// failure the step is marked failed, its branch stays checked out with the
/// last attempt's edits uncommitted, and the error is returned.
#[instrument(skip_all, fields(step = index + 1))]
pub fn execute_step<E: Executor, C: CheckRunner>(
    env: &StepEnv<'_, E, C>,
    run: &mut Run,
    index: usize,
    entry: StepEntry,
) -> Result<()> {
    let result = drive_step(env, run, index, entry);
    if let Err(err) = &result {
        run.set_status(index, StepStatus::Failed);
        run.record_mut(index).failure = Some(format!("{err:#}"));
    }
    result
}

fn drive_step<E: Executor, C: CheckRunner>(
    env: &StepEnv<'_, E, C>,
    run: &mut Run,
    index: usize,
    entry: StepEntry,
) -> Result<()> {
    let step = run.plan.steps[index].clone();
    let branch = step_branch_name(&run.head, step.id);
    let max_attempts = env.config.max_fix_attempts;
    run.begin_step(index);
    let resumed = entry == StepEntry::Resume;

    match entry {
        StepEntry::Fresh { from } => env.git.checkout_new_branch_from(&branch, &from)?,
        StepEntry::Resume => {
            let current = env.git.current_branch()?;
            if current != branch {
                return Err(anyhow!(
                    "expected '{branch}' to be checked out, found '{current}'"
                ));
            }
        }
    }
    run.set_status(index, StepStatus::BranchCreated);
    let parent = env.git.rev_parse("HEAD")?;

    let owned: Vec<String> = run.validation.files_for_step(step.id).into_iter().collect();
    let earlier = run.validation.files_before_step(step.id);
    let merge_base = run.merge_base.clone();
    let original_head = run.original_head().to_string();
    let ctx = EditContext {
        step: &step,
        total: run.plan.len(),
        branch: &branch,
        merge_base: &merge_base,
        original_head: &original_head,
        owned_files: &owned,
    };
    let editor = EditorAgent::new(env.config);

    let mut session = None;
    let mut agent_error = None;
    if !resumed {
        let paths = env.state.attempt(&run.head, step.id, 1);
        let outcome = editor.request_edit(env.executor, env.root, &ctx, &paths);
        agent_error = absorb_agent_outcome(run, index, outcome, &mut session)?;
        run.set_status(index, StepStatus::AgentInvoked);
    }

    let mut last_failure = String::new();
    for attempt in 1..=max_attempts {
        let started = Instant::now();
        let paths = env.state.attempt(&run.head, step.id, attempt);
        run.record_mut(index).attempts = attempt;
        run.set_status(index, StepStatus::Validating);

        let scope = enforce_allowlist(env, &step, &parent, &earlier)?;
        let mut reverted = scope.to_revert(env.config.overlap_policy);
        run.note_scope(index, &reverted, &scope.overlapping);

        let agent_message = agent_error.take();
        let mut round = match &agent_message {
            // A failed or timed-out agent call is a failed attempt, whatever it left behind.
            Some(message) => {
                warn!(attempt, error = %message, "agent call failed");
                Round::skipped(Some(RoundFailure {
                    kind: None,
                    command: "editing agent".to_string(),
                    output: format!("agent error: {message}"),
                }))
            }
            None => run_checks(env, &paths)?,
        };

        if round.passed() {
            // The gates themselves may have written outside the allowlist.
            let late = enforce_allowlist(env, &step, &parent, &earlier)?;
            let late_reverted = late.to_revert(env.config.overlap_policy);
            if !late_reverted.is_empty() {
                warn!(paths = ?late_reverted, "checks left out-of-scope edits; validating again");
                run.note_scope(index, &late_reverted, &late.overlapping);
                reverted.extend(late_reverted);
                reverted.sort();
                reverted.dedup();
                round = run_checks(env, &paths)?;
            }
        }

        let status = if round.passed() {
            StepStatus::TestsPassed
        } else if attempt == max_attempts {
            StepStatus::Failed
        } else {
            StepStatus::Fixing(run.fix_attempts + 1)
        };
        write_attempt_meta(
            &paths,
            &AttemptMeta {
                step: step.id,
                branch: branch.clone(),
                attempt,
                status,
                format: round.format,
                check: round.check,
                test: round.test,
                reverted: reverted.clone(),
                overlapping: scope.overlapping.clone(),
                agent_error: agent_message,
                session_id: session.clone(),
                cost_usd: run.records[index].cost_usd,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        )?;

        let Some(failure) = round.failure else {
            run.set_status(index, StepStatus::TestsPassed);
            commit_step(env, run, index, &step, &parent, &earlier)?;
            return Ok(());
        };

        info!(
            attempt,
            max_attempts,
            check = failure.kind.map_or("agent", CheckKind::as_str),
            "validation failed"
        );
        last_failure = failure.output;
        if attempt == max_attempts {
            break;
        }

        run.fix_attempts += 1;
        run.set_status(index, StepStatus::Fixing(run.fix_attempts));
        let fix = FixContext {
            attempt,
            max_attempts,
            failure: Some(FailedCheck {
                kind: failure.kind,
                command: failure.command,
                output: &last_failure,
            }),
            reverted: &reverted,
        };
        let next_paths = env.state.attempt(&run.head, step.id, attempt + 1);
        let outcome = editor.request_fix(
            env.executor,
            env.root,
            &ctx,
            &fix,
            session.as_deref(),
            &next_paths,
        );
        agent_error = absorb_agent_outcome(run, index, outcome, &mut session)?;
        run.set_status(index, StepStatus::AgentInvoked);
    }

    warn!(step = step.id, branch = %branch, "fix attempts exhausted");
    Err(StackError::FixAttemptsExhausted {
        step: step.id,
        branch,
        attempts: max_attempts,
        last_output: tail(&last_failure, env.config.agent.failure_tail_bytes).to_string(),
    }
    .into())
}

/// Fold an agent call into the run.
///
/// Timeouts and agent-reported errors become a failed attempt (returned as
/// `Some(message)`); an unavailable agent is fatal for the step.
fn absorb_agent_outcome(
    run: &mut Run,
    index: usize,
    outcome: Result<ExecOutput>,
    session: &mut Option<String>,
) -> Result<Option<String>> {
    match outcome {
        Ok(output) => {
            run.add_cost(index, output.cost_usd);
            if output.session_id.is_some() {
                session.clone_from(&output.session_id);
            }
            if output.is_error {
                return Ok(Some(output.result));
            }
            Ok(None)
        }
        Err(err) => {
            if matches!(
                err.downcast_ref::<StackError>(),
                Some(StackError::AgentTimeout { .. })
            ) {
                return Ok(Some(err.to_string()));
            }
            Err(err)
        }
    }
}

/// Restore out-of-scope paths to `parent` and report the partition.
#[instrument(skip_all, fields(step = step.id))]
fn enforce_allowlist<E: Executor, C: CheckRunner>(
    env: &StepEnv<'_, E, C>,
    step: &Step,
    parent: &str,
    earlier: &BTreeSet<String>,
) -> Result<ScopeCheck> {
    let touched = env.git.touched_since(parent)?;
    let scope = check_scope(&touched, &step.patterns(), earlier);
    if !scope.overlapping.is_empty() && env.config.overlap_policy == OverlapPolicy::Warn {
        warn!(paths = ?scope.overlapping, "step edited files owned by an earlier step");
    }
    let Some(violation) = scope.violation(step.id, env.config.overlap_policy) else {
        debug!(touched = touched.len(), "all edits within allowlist");
        return Ok(scope);
    };

    warn!(paths = ?violation.paths, "reverting edits outside the allowlist");
    for path in &violation.paths {
        env.git.restore_path(parent, path)?;
    }
    let remaining: BTreeSet<String> = env.git.touched_since(parent)?.into_iter().collect();
    let stuck: Vec<&String> = violation
        .paths
        .iter()
        .filter(|path| remaining.contains(*path))
        .collect();
    if !stuck.is_empty() {
        return Err(anyhow!("could not revert out-of-scope paths: {stuck:?}"));
    }
    Ok(scope)
}

/// Format, then check, then test. A failing gate skips the ones after it.
fn run_checks<E: Executor, C: CheckRunner>(
    env: &StepEnv<'_, E, C>,
    paths: &AttemptPaths,
) -> Result<Round> {
    let mut round = Round::skipped(None);
    let gates = [
        (CheckKind::Format, &env.config.format_cmd, &paths.format_log),
        (CheckKind::Check, &env.config.check_cmd, &paths.check_log),
        (CheckKind::Test, &env.config.test_cmd, &paths.test_log),
    ];
    for (kind, command, log_path) in gates {
        let Some(command) = command else {
            if kind == CheckKind::Test {
                warn!("no test command configured; tests are not gating this step");
            }
            continue;
        };
        let result: CheckResult = env.checks.run(&CheckRequest {
            kind,
            command: command.clone(),
            workdir: env.root.to_path_buf(),
            log_path: log_path.clone(),
            timeout: env.config.command_timeout(),
            output_limit_bytes: env.config.output_limit_bytes,
        })?;
        match kind {
            CheckKind::Format => round.format = result.outcome,
            CheckKind::Check => round.check = result.outcome,
            CheckKind::Test => round.test = result.outcome,
        }
        if !result.passed() {
            round.failure = Some(RoundFailure {
                kind: Some(kind),
                command: command_line(command),
                output: result.output,
            });
            break;
        }
    }
    Ok(round)
}

/// Final enforcement, then a commit carrying the step metadata.
fn commit_step<E: Executor, C: CheckRunner>(
    env: &StepEnv<'_, E, C>,
    run: &mut Run,
    index: usize,
    step: &Step,
    parent: &str,
    earlier: &BTreeSet<String>,
) -> Result<()> {
    let scope = enforce_allowlist(env, step, parent, earlier)?;
    let reverted = scope.to_revert(env.config.overlap_policy);
    if !reverted.is_empty() {
        // Regenerated by the second gate round; they never reach the commit.
        warn!(paths = ?reverted, "checks keep writing outside the allowlist");
    }
    run.note_scope(index, &reverted, &scope.overlapping);

    if env.git.touched_since(parent)?.is_empty() {
        warn!(step = step.id, "step produced no changes; committing empty");
    }
    let topic = step.topic_for(&run.head);
    let relative = run.relative_topic(index);
    let message = format_commit_message(
        step.id,
        &step.display_title(),
        &run.head,
        &topic,
        relative.as_deref(),
    );
    let sha = env.git.commit_all(&message, true)?;
    info!(step = step.id, commit = %sha, "step committed");
    run.record_mut(index).commit = Some(sha);
    run.set_status(index, StepStatus::Committed);
    Ok(())
}
