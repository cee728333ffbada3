//! Format, check and test command execution.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::types::{CheckKind, CheckOutcome};
use crate::io::process::{ProcessOptions, run_command, write_text};

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub kind: CheckKind,
    /// argv; the first element is the program.
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub outcome: CheckOutcome,
    /// Combined stdout/stderr, bounded by the request's output limit.
    pub output: String,
    pub timed_out: bool,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.outcome != CheckOutcome::Fail
    }
}

pub trait CheckRunner {
    fn run(&self, request: &CheckRequest) -> Result<CheckResult>;
}

/// Runs the configured argv directly, without a shell.
pub struct CommandCheckRunner;

impl CheckRunner for CommandCheckRunner {
    #[instrument(skip_all, fields(kind = request.kind.as_str()))]
    fn run(&self, request: &CheckRequest) -> Result<CheckResult> {
        let Some((program, args)) = request.command.split_first() else {
            return Ok(CheckResult {
                outcome: CheckOutcome::Skipped,
                output: String::new(),
                timed_out: false,
            });
        };
        let line = command_line(&request.command);
        info!(command = %line, "running check");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let result = match run_command(
            cmd,
            ProcessOptions {
                stdin: None,
                timeout: request.timeout,
                output_limit_bytes: request.output_limit_bytes,
                stdout_tee: None,
            },
        ) {
            Ok(output) => CheckResult {
                outcome: if output.success() {
                    CheckOutcome::Pass
                } else {
                    CheckOutcome::Fail
                },
                output: output.combined_output(request.kind.as_str()),
                timed_out: output.timed_out,
            },
            // An unrunnable command is a failing check, as a shell would report it.
            Err(err) => CheckResult {
                outcome: CheckOutcome::Fail,
                output: format!("failed to run `{line}`: {err:#}\n"),
                timed_out: false,
            },
        };
        if result.outcome == CheckOutcome::Fail {
            warn!(command = %line, timed_out = result.timed_out, "check failed");
        }

        write_text(
            &request.log_path,
            &format!("$ {line}\n{}", result.output),
        )?;
        Ok(result)
    }
}

/// Shell-quoted rendering of an argv for logs and prompts.
pub fn command_line(argv: &[String]) -> String {
    shlex::try_join(argv.iter().map(String::as_str)).unwrap_or_else(|_| argv.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn request(dir: &std::path::Path, command: &[&str]) -> CheckRequest {
        CheckRequest {
            kind: CheckKind::Test,
            command: command.iter().map(|s| s.to_string()).collect(),
            workdir: dir.to_path_buf(),
            log_path: dir.join("logs/test.log"),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn passing_command_passes_and_logs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = CommandCheckRunner
            .run(&request(temp.path(), &["sh", "-c", "echo all good"]))
            .expect("run");
        assert_eq!(result.outcome, CheckOutcome::Pass);
        let log = fs::read_to_string(temp.path().join("logs/test.log")).expect("log");
        assert!(log.starts_with("$ sh -c "));
        assert!(log.contains("all good"));
    }

    #[test]
    fn failing_command_captures_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = CommandCheckRunner
            .run(&request(temp.path(), &["sh", "-c", "echo 1 failure >&2; exit 1"]))
            .expect("run");
        assert_eq!(result.outcome, CheckOutcome::Fail);
        assert!(!result.passed());
        assert!(result.output.contains("1 failure"));
    }

    #[test]
    fn missing_program_is_a_failure_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = CommandCheckRunner
            .run(&request(temp.path(), &["splitstack-no-such-tool"]))
            .expect("run");
        assert_eq!(result.outcome, CheckOutcome::Fail);
        assert!(result.output.contains("failed to run"));
    }

    #[test]
    fn empty_command_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = CommandCheckRunner
            .run(&request(temp.path(), &[]))
            .expect("run");
        assert_eq!(result.outcome, CheckOutcome::Skipped);
        assert!(result.passed());
    }
}
