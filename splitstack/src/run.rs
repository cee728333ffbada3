//! Whole-run orchestration: inspect, plan, validate, confirm, execute, verify.
//!
//! A fresh run and `--continue` share the same step loop. Resuming derives
//! everything from branch names and commit metadata; there is no session file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::agents::planner::{PlanRequest, PlannerAgent};
use crate::core::branch::{StepBranch, parse_step_branch, step_branch_name};
use crate::core::commit_message::parse_commit_message;
use crate::core::drift::DriftReport;
use crate::core::plan::Plan;
use crate::core::types::StepStatus;
use crate::core::validator::{PlanIssue, ValidationReport, validate};
use crate::drift::verify_drift;
use crate::errors::StackError;
use crate::io::attempt_log::StatePaths;
use crate::io::checks::CheckRunner;
use crate::io::config::Config;
use crate::io::executor::Executor;
use crate::io::git::Git;
use crate::io::plan_store::{load_plan, write_plan};
use crate::step::{StepEntry, StepEnv, execute_step};

/// Operator-visible state of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub id: u32,
    pub title: String,
    pub branch: String,
    pub status: StepStatus,
    /// Validation rounds run so far.
    pub attempts: u32,
    /// Out-of-scope paths rolled back, across all rounds.
    pub reverted: Vec<String>,
    /// Paths owned by an earlier step that this step edited and kept.
    pub overlapping: Vec<String>,
    pub commit: Option<String>,
    pub cost_usd: Option<f64>,
    pub failure: Option<String>,
}

/// In-memory state of a run.
#[derive(Debug, Clone)]
pub struct Run {
    pub base: String,
    pub head: String,
    /// Commit id of `head` captured before any branch was created.
    original_head: String,
    pub merge_base: String,
    pub plan: Plan,
    pub validation: ValidationReport,
    pub records: Vec<StepRecord>,
    /// Index of the step currently executing.
    pub active: Option<usize>,
    /// Fix rounds used by the active step; reset when a step begins.
    pub fix_attempts: u32,
}

impl Run {
    pub fn new(
        base: String,
        head: String,
        original_head: String,
        merge_base: String,
        plan: Plan,
        validation: ValidationReport,
    ) -> Self {
        let records = plan
            .steps
            .iter()
            .map(|step| StepRecord {
                id: step.id,
                title: step.display_title(),
                branch: step_branch_name(&head, step.id),
                status: StepStatus::Pending,
                attempts: 0,
                reverted: Vec::new(),
                overlapping: Vec::new(),
                commit: None,
                cost_usd: None,
                failure: None,
            })
            .collect();
        Self {
            base,
            head,
            original_head,
            merge_base,
            plan,
            validation,
            records,
            active: None,
            fix_attempts: 0,
        }
    }

    pub fn original_head(&self) -> &str {
        &self.original_head
    }

    pub fn begin_step(&mut self, index: usize) {
        self.active = Some(index);
        self.fix_attempts = 0;
    }

    pub fn record_mut(&mut self, index: usize) -> &mut StepRecord {
        &mut self.records[index]
    }

    pub fn set_status(&mut self, index: usize, status: StepStatus) {
        let record = &mut self.records[index];
        debug!(step = record.id, from = %record.status, to = %status, "step transition");
        record.status = status;
    }

    /// Merge one enforcement round into the step record.
    pub fn note_scope(&mut self, index: usize, reverted: &[String], overlapping: &[String]) {
        let record = &mut self.records[index];
        for path in reverted {
            if !record.reverted.contains(path) {
                record.reverted.push(path.clone());
            }
        }
        for path in overlapping {
            if !record.overlapping.contains(path) {
                record.overlapping.push(path.clone());
            }
        }
    }

    pub fn add_cost(&mut self, index: usize, cost: Option<f64>) {
        if let Some(cost) = cost {
            let record = &mut self.records[index];
            record.cost_usd = Some(record.cost_usd.unwrap_or(0.0) + cost);
        }
    }

    /// Topic of the step before `index`, for the `Relative:` trailer.
    pub fn relative_topic(&self, index: usize) -> Option<String> {
        let previous = index.checked_sub(1)?;
        Some(self.plan.steps[previous].topic_for(&self.head))
    }
}

/// Command-line inputs of a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub base: Option<String>,
    pub head: Option<String>,
    /// Use this plan instead of asking the planning agent.
    pub plan_path: Option<PathBuf>,
    pub dry_run: bool,
    /// Skip the confirmation prompt.
    pub yes: bool,
    /// `--continue`: re-enter at the checked-out step branch.
    pub resume: bool,
    /// `--skip` (with `--continue`): abandon the checked-out step.
    pub skip: bool,
}

/// Why `run_stack` returned.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStop {
    /// Every step reached a terminal state and drift is acceptable.
    Completed,
    /// `--dry-run`: plan validated, nothing mutated.
    DryRun,
    /// The operator declined the plan.
    Declined,
    /// A step failed; its branch is left checked out.
    StepFailed {
        step: u32,
        branch: String,
        reason: String,
    },
    /// Strict mode and the stack does not reproduce the original change.
    Drift,
}

/// Summary of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub base: String,
    pub head: String,
    pub plan: Plan,
    pub plan_path: PathBuf,
    pub warnings: Vec<PlanIssue>,
    pub steps: Vec<StepRecord>,
    pub drift: Option<DriftReport>,
    pub stop: RunStop,
    /// Total reported agent cost, planner included.
    pub cost_usd: Option<f64>,
}

impl RunReport {
    pub fn skipped(&self) -> Vec<&StepRecord> {
        self.steps
            .iter()
            .filter(|record| record.status == StepStatus::Skipped)
            .collect()
    }
}

/// Drive a run to completion, a step failure, or an operator stop.
///
/// `confirm` is asked once with the validated plan unless `options.yes`;
/// `on_step` observes each step after it reaches a terminal state.
///
/// Stop conditions the operator must act on are returned as
/// [`RunStop`]; repository, plan and validation problems are errors carrying a
/// [`StackError`].
pub fn run_stack<E, C, A, S>(
    root: &Path,
    config: &Config,
    executor: &E,
    checks: &C,
    options: &RunOptions,
    mut confirm: A,
    mut on_step: S,
) -> Result<RunReport>
where
    E: Executor,
    C: CheckRunner,
    A: FnMut(&Plan, &ValidationReport) -> Result<bool>,
    S: FnMut(&StepRecord),
{
    let git = Git::new(root);
    let state = StatePaths::new(&git.git_dir()?);
    let env = StepEnv {
        root,
        git: &git,
        config,
        state: &state,
        executor,
        checks,
    };

    let prepared = if options.resume {
        prepare_resume(&env, options, &mut on_step)?
    } else {
        match prepare_fresh(&env, options, &mut confirm)? {
            Ok(prepared) => prepared,
            Err(report) => return Ok(report),
        }
    };
    let Prepared {
        mut run,
        plan_path,
        plan_cost,
        start,
        entry,
    } = prepared;

    let failed = execute_from(&env, &mut run, start, entry, &mut on_step)?;
    let (drift, stop) = match failed {
        Some(stop) => (None, stop),
        None => finish(&env, &run)?,
    };
    Ok(report(run, plan_path, plan_cost, drift, stop))
}

/// State needed to enter the step loop.
struct Prepared {
    run: Run,
    plan_path: PathBuf,
    plan_cost: Option<f64>,
    start: usize,
    entry: StepEntry,
}

/// Inspect, plan, validate and confirm. `Err(report)` is an early, successful stop.
#[instrument(skip_all)]
fn prepare_fresh<E, C, A>(
    env: &StepEnv<'_, E, C>,
    options: &RunOptions,
    confirm: &mut A,
) -> Result<std::result::Result<Prepared, RunReport>>
where
    E: Executor,
    C: CheckRunner,
    A: FnMut(&Plan, &ValidationReport) -> Result<bool>,
{
    let git = env.git;
    git.ensure_clean()?;
    let (base, head) = git.resolve_branches(options.base.as_deref(), options.head.as_deref())?;
    if let Some(StepBranch { head: parent, .. }) = parse_step_branch(&head) {
        if git.branch_exists(&parent)? {
            return Err(StackError::AmbiguousBranch {
                reason: format!("'{head}' is a step branch of '{parent}'; use --continue"),
            }
            .into());
        }
    }

    let original_head = git.snapshot_head_commit(&head)?;
    let merge_base = git.merge_base(&base, &original_head)?;
    let change = git.diff(&merge_base, &original_head)?;
    if change.is_empty() {
        bail!("'{head}' has no changes relative to '{base}'; nothing to split");
    }
    info!(%base, %head, files = change.files.len(), "inspected repository");

    let (plan, plan_path, plan_cost) = match &options.plan_path {
        Some(path) => {
            let plan = load_plan(path)?;
            (plan, path.clone(), None)
        }
        None => {
            if git.current_branch().ok().as_deref() != Some(head.as_str()) {
                git.checkout_branch(&head)?;
            }
            let stat = git.diff_stat(&merge_base, &original_head)?;
            let generated = PlannerAgent::new(env.config).request_plan(
                env.executor,
                env.root,
                env.state,
                &PlanRequest {
                    base: &base,
                    head: &head,
                    change: &change,
                    stat: &stat,
                },
            )?;
            (generated.plan, generated.path, generated.cost_usd)
        }
    };

    let validation = validate(&plan, &change.paths(), env.config.strict);
    check_validation(&validation)?;
    let run = Run::new(base, head, original_head, merge_base, plan, validation);

    if options.dry_run {
        info!("dry run; no branches created");
        return Ok(Err(report(run, plan_path, plan_cost, None, RunStop::DryRun)));
    }
    for record in &run.records {
        if git.branch_exists(&record.branch)? {
            return Err(StackError::AmbiguousBranch {
                reason: format!(
                    "step branch '{}' already exists; delete it or use --continue",
                    record.branch
                ),
            }
            .into());
        }
    }
    if !options.yes && !confirm(&run.plan, &run.validation)? {
        info!("plan declined");
        return Ok(Err(report(run, plan_path, plan_cost, None, RunStop::Declined)));
    }

    let saved = env.state.plan_path(&run.head);
    if saved != plan_path {
        write_plan(&saved, &run.plan)?;
    }
    let entry = StepEntry::Fresh {
        from: run.merge_base.clone(),
    };
    Ok(Ok(Prepared {
        run,
        plan_path,
        plan_cost,
        start: 0,
        entry,
    }))
}

/// Rebuild the run from the checked-out step branch.
#[instrument(skip_all)]
fn prepare_resume<E, C, S>(
    env: &StepEnv<'_, E, C>,
    options: &RunOptions,
    on_step: &mut S,
) -> Result<Prepared>
where
    E: Executor,
    C: CheckRunner,
    S: FnMut(&StepRecord),
{
    let git = env.git;
    let current = git.current_branch()?;
    let Some(StepBranch { head, ordinal }) = parse_step_branch(&current) else {
        return Err(mismatch(format!("'{current}' is not a step branch")));
    };
    if let Some(expected) = options.head.as_deref() {
        if expected != head {
            return Err(mismatch(format!(
                "'{current}' belongs to '{head}', not '{expected}'"
            )));
        }
    }
    let (base, head) = git.resolve_branches(options.base.as_deref(), Some(head.as_str()))?;
    let original_head = git.snapshot_head_commit(&head)?;
    let merge_base = git.merge_base(&base, &original_head)?;
    let change = git.diff(&merge_base, &original_head)?;

    let plan_path = match &options.plan_path {
        Some(path) => path.clone(),
        None => env.state.plan_path(&head),
    };
    if !plan_path.is_file() {
        return Err(mismatch(format!(
            "no plan at {}; pass --plan",
            plan_path.display()
        )));
    }
    let plan = load_plan(&plan_path)?;
    let validation = validate(&plan, &change.paths(), env.config.strict);
    check_validation(&validation)?;
    if ordinal as usize > plan.len() {
        return Err(mismatch(format!(
            "'{current}' is step {ordinal} but the plan has {} step(s)",
            plan.len()
        )));
    }
    let mut run = Run::new(base, head, original_head, merge_base, plan, validation);

    let mut parent = run.merge_base.clone();
    for index in 0..ordinal as usize - 1 {
        let branch = run.records[index].branch.clone();
        if !git.branch_exists(&branch)? {
            return Err(mismatch(format!("earlier step branch '{branch}' is missing")));
        }
        let tip = git.rev_parse(&branch)?;
        if !git.is_ancestor(&parent, &tip)? {
            return Err(mismatch(format!("'{branch}' is not stacked on its parent")));
        }
        let status = if is_step_commit(git, &tip, index, &run.head)? {
            run.records[index].commit = Some(tip.clone());
            StepStatus::Committed
        } else {
            StepStatus::Skipped
        };
        run.records[index].status = status;
        parent = tip;
    }
    let tip = git.rev_parse("HEAD")?;
    if !git.is_ancestor(&parent, &tip)? {
        return Err(mismatch(format!("'{current}' is not stacked on its parent")));
    }

    let index = ordinal as usize - 1;
    let from = StepEntry::Fresh {
        from: current.clone(),
    };
    let prepared = |run: Run, start: usize, entry: StepEntry| Prepared {
        run,
        plan_path: plan_path.clone(),
        plan_cost: None,
        start,
        entry,
    };

    if tip != parent && is_step_commit(git, &tip, index, &run.head)? {
        if options.skip {
            return Err(mismatch(format!(
                "step {ordinal} is already committed; nothing to skip"
            )));
        }
        info!(step = ordinal, "step already committed; continuing with the next");
        run.records[index].commit = Some(tip);
        run.records[index].status = StepStatus::Committed;
        return Ok(prepared(run, index + 1, from));
    }

    if options.skip {
        let discarded = git.touched_since("HEAD")?;
        if !discarded.is_empty() {
            warn!(step = ordinal, paths = ?discarded, "discarding edits of skipped step");
        }
        git.discard_changes()?;
        run.records[index].status = StepStatus::Skipped;
        on_step(&run.records[index]);
        return Ok(prepared(run, index + 1, from));
    }

    info!(step = ordinal, "resuming validation of checked-out step");
    Ok(prepared(run, index, StepEntry::Resume))
}

/// Run steps `start..` in order. Returns the stop reason if a step failed.
fn execute_from<E, C, S>(
    env: &StepEnv<'_, E, C>,
    run: &mut Run,
    start: usize,
    mut entry: StepEntry,
    on_step: &mut S,
) -> Result<Option<RunStop>>
where
    E: Executor,
    C: CheckRunner,
    S: FnMut(&StepRecord),
{
    for index in start..run.plan.len() {
        let result = execute_step(env, run, index, entry);
        on_step(&run.records[index]);
        if let Err(err) = result {
            let record = &run.records[index];
            let step_fatal = matches!(
                err.downcast_ref::<StackError>(),
                Some(
                    StackError::FixAttemptsExhausted { .. }
                        | StackError::AgentUnavailable { .. }
                        | StackError::AgentTimeout { .. }
                )
            );
            if !step_fatal {
                return Err(err).with_context(|| format!("step {} ({})", record.id, record.branch));
            }
            warn!(step = record.id, branch = %record.branch, "stopping at failed step");
            return Ok(Some(RunStop::StepFailed {
                step: record.id,
                branch: record.branch.clone(),
                reason: err.to_string(),
            }));
        }
        entry = StepEntry::Fresh {
            from: run.records[index].branch.clone(),
        };
    }
    Ok(None)
}

/// Verify the final branch against the original head.
fn finish<E: Executor, C: CheckRunner>(
    env: &StepEnv<'_, E, C>,
    run: &Run,
) -> Result<(Option<DriftReport>, RunStop)> {
    let Some(last) = run.records.last() else {
        return Ok((None, RunStop::Completed));
    };
    let drift = verify_drift(
        env.git,
        &run.merge_base,
        run.original_head(),
        &last.branch,
        env.config.drift_ignore_whitespace,
    )?;
    let skipped = run
        .records
        .iter()
        .any(|record| record.status == StepStatus::Skipped);
    let stop = if drift.has_drift() && env.config.strict && !skipped {
        RunStop::Drift
    } else {
        if drift.has_drift() && skipped {
            info!("drift expected: at least one step was skipped");
        }
        RunStop::Completed
    };
    Ok((Some(drift), stop))
}

fn check_validation(validation: &ValidationReport) -> Result<()> {
    for issue in &validation.warnings {
        warn!(%issue, "plan warning");
    }
    if !validation.is_ok() {
        return Err(StackError::InvalidPlan {
            issues: validation.errors.clone(),
        }
        .into());
    }
    Ok(())
}

/// True if `rev` carries the commit metadata of step `index` of `head`'s stack.
fn is_step_commit(git: &Git, rev: &str, index: usize, head: &str) -> Result<bool> {
    let message = git.commit_message(rev)?;
    Ok(parse_commit_message(&message).is_some_and(|commit| {
        commit.step as usize == index + 1 && commit.head.as_deref() == Some(head)
    }))
}

fn mismatch(reason: String) -> anyhow::Error {
    StackError::ResumeMismatch { reason }.into()
}

fn report(
    run: Run,
    plan_path: PathBuf,
    plan_cost: Option<f64>,
    drift: Option<DriftReport>,
    stop: RunStop,
) -> RunReport {
    let cost_usd = run
        .records
        .iter()
        .filter_map(|record| record.cost_usd)
        .chain(plan_cost)
        .reduce(|a, b| a + b);
    RunReport {
        base: run.base,
        head: run.head,
        warnings: run.validation.warnings,
        plan: run.plan,
        plan_path,
        steps: run.records,
        drift,
        stop,
        cost_usd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::plan_step;

    fn run() -> Run {
        let mut second = plan_step(2, &["b.txt"]);
        second.topic = Some("api".to_string());
        let plan = Plan::new(vec![plan_step(1, &["a.txt"]), second]);
        Run::new(
            "main".to_string(),
            "feature".to_string(),
            "orig".to_string(),
            "base".to_string(),
            plan,
            ValidationReport::default(),
        )
    }

    #[test]
    fn records_start_pending_with_step_branches() {
        let run = run();
        assert_eq!(run.records.len(), 2);
        assert_eq!(run.records[1].branch, "feature-step-2");
        assert!(
            run.records
                .iter()
                .all(|record| record.status == StepStatus::Pending)
        );
    }

    #[test]
    fn begin_step_resets_fix_counter() {
        let mut run = run();
        run.begin_step(0);
        run.fix_attempts = 2;
        run.begin_step(1);
        assert_eq!(run.fix_attempts, 0);
        assert_eq!(run.active, Some(1));
    }

    #[test]
    fn note_scope_accumulates_without_duplicates() {
        let mut run = run();
        run.note_scope(0, &["x.txt".to_string()], &[]);
        run.note_scope(0, &["x.txt".to_string(), "y.txt".to_string()], &[]);
        assert_eq!(run.records[0].reverted, vec!["x.txt", "y.txt"]);
    }

    #[test]
    fn relative_topic_names_previous_step() {
        let run = run();
        assert_eq!(run.relative_topic(0), None);
        assert_eq!(run.relative_topic(1).as_deref(), Some("feature-step-1"));
    }

    #[test]
    fn cost_sums_steps_and_planner() {
        let mut run = run();
        run.add_cost(0, Some(0.25));
        run.add_cost(0, None);
        run.add_cost(1, Some(0.5));
        let report = report(run, PathBuf::from("plan.yaml"), Some(1.0), None, RunStop::Completed);
        assert_eq!(report.cost_usd, Some(1.75));
    }
}
