//! Split one large feature branch into a stack of small, tested branches.
//!
//! Each step of a plan becomes a branch stacked on the previous one. An agent
//! implements the step, edits outside the step's allowlist are rolled back,
//! and the step is committed only once format, check and test commands pass.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Confirm;

use splitstack::core::plan::Plan;
use splitstack::core::types::StepStatus;
use splitstack::core::validator::ValidationReport;
use splitstack::errors::StackError;
use splitstack::exit_codes;
use splitstack::io::checks::CommandCheckRunner;
use splitstack::io::config::{ConfigOverrides, load_config};
use splitstack::io::executor::ClaudeExecutor;
use splitstack::io::plan_store::render_plan;
use splitstack::logging;
use splitstack::run::{RunOptions, RunReport, RunStop, StepRecord, run_stack};

#[derive(Parser)]
#[command(
    name = "splitstack",
    version,
    about = "Split a feature branch into a stack of small, independently tested branches"
)]
struct Cli {
    /// Base branch (default: main, then master).
    #[arg(long)]
    base: Option<String>,
    /// Branch to split (default: the current branch).
    #[arg(long)]
    head: Option<String>,
    /// Treat overlapping ownership and drift as fatal.
    #[arg(long)]
    strict: bool,
    /// Do not ask for confirmation before creating branches.
    #[arg(short, long)]
    yes: bool,
    /// Validate and print the plan without touching any branch.
    #[arg(long)]
    dry_run: bool,
    /// Use this plan file instead of asking the planning agent.
    #[arg(long, value_name = "FILE")]
    plan: Option<PathBuf>,
    /// Re-enter a run at the checked-out step branch.
    #[arg(long = "continue")]
    resume: bool,
    /// Abandon the checked-out step and move on (requires --continue).
    #[arg(long, requires = "resume")]
    skip: bool,
    /// Test command, split shell-style (overrides config and detection).
    #[arg(long, value_name = "CMD")]
    test_cmd: Option<String>,
    /// Compile/lint command run before tests.
    #[arg(long, value_name = "CMD")]
    check_cmd: Option<String>,
    /// Debug logging for splitstack (RUST_LOG wins when set).
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let root = std::env::current_dir().context("resolve working directory")?;
    let mut config = load_config(&root)?;
    config.apply_overrides(&ConfigOverrides {
        test_cmd: cli.test_cmd,
        check_cmd: cli.check_cmd,
        strict: cli.strict,
    })?;

    let executor = ClaudeExecutor::new(config.agent.program.clone());
    let options = RunOptions {
        base: cli.base,
        head: cli.head,
        plan_path: cli.plan,
        dry_run: cli.dry_run,
        yes: cli.yes,
        resume: cli.resume,
        skip: cli.skip,
    };
    let report = run_stack(
        &root,
        &config,
        &executor,
        &CommandCheckRunner,
        &options,
        confirm_plan,
        print_step,
    )?;
    print_report(&report);

    Ok(match &report.stop {
        RunStop::Completed | RunStop::DryRun => exit_codes::OK,
        RunStop::Declined => exit_codes::ABORTED,
        RunStop::StepFailed { .. } => exit_codes::STEP_FAILED,
        RunStop::Drift => exit_codes::DRIFT,
    })
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<StackError>() {
        Some(StackError::Aborted) => exit_codes::ABORTED,
        Some(StackError::DriftDetected { .. }) => exit_codes::DRIFT,
        Some(stack) if stack.is_validation() => exit_codes::INVALID,
        Some(_) => exit_codes::STEP_FAILED,
        None => exit_codes::INVALID,
    }
}

fn confirm_plan(plan: &Plan, validation: &ValidationReport) -> Result<bool> {
    print_plan(plan, validation)?;
    let answer = Confirm::new()
        .with_prompt(format!("Create {} step branch(es)?", plan.len()))
        .default(false)
        .interact()
        .map_err(|_| StackError::Aborted)?;
    Ok(answer)
}

fn print_plan(plan: &Plan, validation: &ValidationReport) -> Result<()> {
    println!("{}", render_plan(plan)?.trim_end());
    for step in &plan.steps {
        let files = validation.files_for_step(step.id);
        println!("step {}: {} ({} file(s))", step.id, step.display_title(), files.len());
    }
    Ok(())
}

fn print_step(record: &StepRecord) {
    match record.status {
        StepStatus::Committed => println!(
            "step {} committed on {} after {} attempt(s)",
            record.id, record.branch, record.attempts
        ),
        StepStatus::Skipped => println!("step {} skipped ({})", record.id, record.branch),
        status => println!("step {} {status} on {}", record.id, record.branch),
    }
}

fn print_report(report: &RunReport) {
    match &report.stop {
        RunStop::DryRun => {
            if let Err(err) = print_plan_from_report(report) {
                eprintln!("error: {err:#}");
            }
            println!("plan: {}", report.plan_path.display());
            println!("dry run: no branches created");
            return;
        }
        RunStop::Declined => {
            println!("aborted: no branches created");
            return;
        }
        _ => {}
    }

    println!("\nstack for {} on {}:", report.head, report.base);
    for record in &report.steps {
        let commit = record.commit.as_deref().map_or("-", |sha| &sha[..sha.len().min(12)]);
        let marker = if record.status == StepStatus::Skipped { " <- SKIPPED" } else { "" };
        println!(
            "  {:<32} {:<12} attempts={} commit={commit}{marker}",
            record.branch,
            record.status.to_string(),
            record.attempts
        );
        if !record.reverted.is_empty() {
            println!("      reverted: {}", record.reverted.join(", "));
        }
        if !record.overlapping.is_empty() {
            println!("      overlapping: {}", record.overlapping.join(", "));
        }
    }

    if let Some(drift) = &report.drift {
        if drift.has_drift() {
            let summary = drift.summary_lines().join("\n");
            if report.stop == RunStop::Drift {
                eprintln!("error: {}", StackError::DriftDetected { summary });
                eprintln!("{}", drift.detail);
            } else {
                println!("drift (advisory):\n{summary}");
            }
        } else {
            println!("drift: none; the stack reproduces {}", report.head);
        }
    }
    if let Some(cost) = report.cost_usd {
        println!("agent cost: ${cost:.2}");
    }
    if let RunStop::StepFailed { step, branch, reason } = &report.stop {
        eprintln!("step {step} failed on {branch}:\n{reason}");
        eprintln!("fix it by hand and rerun with --continue, or abandon it with --continue --skip");
    }
}

fn print_plan_from_report(report: &RunReport) -> Result<()> {
    println!("{}", render_plan(&report.plan)?.trim_end());
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flat_flags() {
        let cli = Cli::parse_from([
            "splitstack",
            "--base",
            "trunk",
            "-y",
            "--test-cmd",
            "cargo test",
        ]);
        assert_eq!(cli.base.as_deref(), Some("trunk"));
        assert!(cli.yes);
        assert_eq!(cli.test_cmd.as_deref(), Some("cargo test"));
        assert!(!cli.resume);
    }

    #[test]
    fn skip_requires_continue() {
        assert!(Cli::try_parse_from(["splitstack", "--skip"]).is_err());
        let cli = Cli::try_parse_from(["splitstack", "--continue", "--skip"]).expect("parse");
        assert!(cli.resume && cli.skip);
    }

    #[test]
    fn typed_errors_map_to_exit_codes() {
        let dirty: anyhow::Error = StackError::DirtyWorkingTree { entries: vec![] }.into();
        assert_eq!(exit_code_for(&dirty), exit_codes::INVALID);
        let exhausted: anyhow::Error = StackError::FixAttemptsExhausted {
            step: 1,
            branch: "f-step-1".to_string(),
            attempts: 5,
            last_output: String::new(),
        }
        .into();
        assert_eq!(exit_code_for(&exhausted), exit_codes::STEP_FAILED);
        assert_eq!(exit_code_for(&StackError::Aborted.into()), exit_codes::ABORTED);
    }
}
