//! Test-only helpers: scratch repositories and scripted agents and checks.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::plan::Step;
use crate::core::types::{CheckKind, CheckOutcome};
use crate::io::checks::{CheckRequest, CheckResult, CheckRunner};
use crate::io::executor::{ExecOutput, ExecRequest, Executor};
use crate::io::git::Git;

/// Plan step with deterministic title and instructions.
pub fn plan_step(id: u32, allow: &[&str]) -> Step {
    Step {
        id,
        title: format!("Step {id} title"),
        instructions: format!("Do step {id}"),
        allow: allow.iter().map(|pattern| pattern.to_string()).collect(),
        shared_allow: Vec::new(),
        topic: None,
    }
}

/// Scratch git repository on `main` with one commit containing `keep.txt`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let repo = Self { dir };
        repo.git_cmd(&["init", "-q"])?;
        repo.git_cmd(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        repo.git_cmd(&["config", "user.email", "stack@example.com"])?;
        repo.git_cmd(&["config", "user.name", "Stack Test"])?;
        repo.git_cmd(&["config", "commit.gpgsign", "false"])?;
        repo.write_file("keep.txt", "keep\n")?;
        repo.commit_all("initial")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path())
    }

    /// Write `contents` to a repo-relative path, creating parent directories.
    pub fn write_file(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn remove_file(&self, rel: &str) -> Result<()> {
        fs::remove_file(self.path().join(rel)).with_context(|| format!("remove {rel}"))
    }

    pub fn checkout_new(&self, branch: &str) -> Result<()> {
        self.git_cmd(&["checkout", "-q", "-b", branch])
    }

    pub fn checkout(&self, rev: &str) -> Result<()> {
        self.git_cmd(&["checkout", "-q", rev])
    }

    /// Stage everything and commit; returns the new commit id.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        self.git_cmd(&["add", "-A"])?;
        self.git_cmd(&["commit", "-q", "-m", message])?;
        self.git().rev_parse("HEAD")
    }

    fn git_cmd(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {args:?}"))?;
        if !output.status.success() {
            bail!(
                "git {args:?} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

type ExecAction = Box<dyn FnOnce(&ExecRequest) -> Result<ExecOutput>>;

/// Executor that replays queued actions in order and records every request.
#[derive(Default)]
pub struct ScriptedExecutor {
    actions: RefCell<VecDeque<ExecAction>>,
    requests: RefCell<Vec<ExecRequest>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next response.
    pub fn then(self, action: impl FnOnce(&ExecRequest) -> Result<ExecOutput> + 'static) -> Self {
        self.actions.borrow_mut().push_back(Box::new(action));
        self
    }

    /// Queue an agent turn that writes `files` into the working tree.
    pub fn then_write(self, files: &[(&str, &str)]) -> Self {
        let files: Vec<(String, String)> = files
            .iter()
            .map(|(path, contents)| (path.to_string(), contents.to_string()))
            .collect();
        self.then(move |req| {
            for (rel, contents) in &files {
                let path = req.workdir.join(rel);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, contents)?;
            }
            Ok(ExecOutput {
                result: "done".to_string(),
                session_id: Some("session-1".to_string()),
                cost_usd: Some(0.01),
                is_error: false,
            })
        })
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.borrow().clone()
    }

    pub fn assert_drained(&self) {
        let left = self.actions.borrow().len();
        assert_eq!(left, 0, "{left} scripted agent response(s) never used");
    }
}

impl Executor for ScriptedExecutor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        self.requests.borrow_mut().push(request.clone());
        let action = self
            .actions
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("unexpected agent call ({:?})", request.role))?;
        action(request)
    }
}

/// Check runner that answers from a queue keyed by check kind.
///
/// The first queued outcome for the requested kind is used; with none queued
/// the check passes.
#[derive(Default)]
pub struct ScriptedCheckRunner {
    queue: RefCell<Vec<ScriptedCheck>>,
    calls: RefCell<Vec<CheckKind>>,
}

struct ScriptedCheck {
    kind: CheckKind,
    outcome: CheckOutcome,
    output: String,
    /// Files the command writes into the working tree, like a formatter would.
    writes: Vec<(String, String)>,
}

impl ScriptedCheckRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(
        self,
        kind: CheckKind,
        outcome: CheckOutcome,
        output: &str,
        writes: &[(&str, &str)],
    ) -> Self {
        self.queue.borrow_mut().push(ScriptedCheck {
            kind,
            outcome,
            output: output.to_string(),
            writes: writes
                .iter()
                .map(|(path, contents)| (path.to_string(), contents.to_string()))
                .collect(),
        });
        self
    }

    pub fn fail(self, kind: CheckKind, output: &str) -> Self {
        self.push(kind, CheckOutcome::Fail, output, &[])
    }

    pub fn pass(self, kind: CheckKind) -> Self {
        self.push(kind, CheckOutcome::Pass, "", &[])
    }

    /// Queue a passing run that also rewrites `files`.
    pub fn pass_writing(self, kind: CheckKind, files: &[(&str, &str)]) -> Self {
        self.push(kind, CheckOutcome::Pass, "", files)
    }

    pub fn calls(&self) -> Vec<CheckKind> {
        self.calls.borrow().clone()
    }

    pub fn assert_drained(&self) {
        let left = self.queue.borrow().len();
        assert_eq!(left, 0, "{left} scripted check result(s) never used");
    }
}

impl CheckRunner for ScriptedCheckRunner {
    fn run(&self, request: &CheckRequest) -> Result<CheckResult> {
        self.calls.borrow_mut().push(request.kind);
        let mut queue = self.queue.borrow_mut();
        let scripted = match queue.iter().position(|entry| entry.kind == request.kind) {
            Some(index) => queue.remove(index),
            None => ScriptedCheck {
                kind: request.kind,
                outcome: CheckOutcome::Pass,
                output: String::new(),
                writes: Vec::new(),
            },
        };
        for (rel, contents) in &scripted.writes {
            let path = request.workdir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents)?;
        }
        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.log_path, &scripted.output)?;
        Ok(CheckResult {
            outcome: scripted.outcome,
            output: scripted.output,
            timed_out: false,
        })
    }
}
