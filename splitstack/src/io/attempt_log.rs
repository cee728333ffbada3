//! Engine-owned files under `<git-dir>/splitstack/`.
//!
//! Nothing here lives in the working tree, so these files never dirty it and
//! never enter a step commit.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::branch::sanitize_for_path;
use crate::core::types::{CheckOutcome, StepStatus};
use crate::io::process::write_text;

/// Root of the engine's state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(git_dir: &Path) -> Self {
        Self {
            root: git_dir.join("splitstack"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where a generated plan for `head` is saved.
    pub fn plan_path(&self, head: &str) -> PathBuf {
        self.root
            .join("plans")
            .join(format!("{}.yaml", sanitize_for_path(head)))
    }

    pub fn run_dir(&self, head: &str) -> PathBuf {
        self.root.join("runs").join(sanitize_for_path(head))
    }

    /// Scratch directory for the planning agent's session.
    pub fn planner_dir(&self, head: &str) -> PathBuf {
        self.run_dir(head).join("plan")
    }

    pub fn attempt(&self, head: &str, step: u32, attempt: u32) -> AttemptPaths {
        AttemptPaths::new(
            self.run_dir(head)
                .join(format!("step-{step}"))
                .join(format!("attempt-{attempt}")),
        )
    }
}

/// Files written for one validation attempt of one step.
#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub format_log: PathBuf,
    pub check_log: PathBuf,
    pub test_log: PathBuf,
    pub agent_stream: PathBuf,
    pub agent_log: PathBuf,
}

impl AttemptPaths {
    fn new(dir: PathBuf) -> Self {
        Self {
            meta_path: dir.join("meta.json"),
            format_log: dir.join("format.log"),
            check_log: dir.join("check.log"),
            test_log: dir.join("test.log"),
            agent_stream: dir.join("agent.jsonl"),
            agent_log: dir.join("agent.log"),
            dir,
        }
    }
}

/// Summary of one attempt, written as `meta.json`.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub step: u32,
    pub branch: String,
    pub attempt: u32,
    pub status: StepStatus,
    pub format: CheckOutcome,
    pub check: CheckOutcome,
    pub test: CheckOutcome,
    /// Paths reverted by allowlist enforcement.
    pub reverted: Vec<String>,
    /// In-scope paths also owned by an earlier step.
    pub overlapping: Vec<String>,
    pub agent_error: Option<String>,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
}

pub fn write_attempt_meta(paths: &AttemptPaths, meta: &AttemptMeta) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(meta).context("serialize attempt meta")?;
    buf.push('\n');
    write_text(&paths.meta_path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_paths_are_stable() {
        let state = StatePaths::new(Path::new("/repo/.git"));
        let paths = state.attempt("feat/login", 2, 3);
        assert!(
            paths
                .dir
                .ends_with("splitstack/runs/feat-login/step-2/attempt-3")
        );
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.agent_stream.ends_with("agent.jsonl"));
        assert!(
            state
                .plan_path("feat/login")
                .ends_with("splitstack/plans/feat-login.yaml")
        );
    }

    #[test]
    fn writes_meta_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = StatePaths::new(temp.path()).attempt("feature", 1, 1);
        let meta = AttemptMeta {
            step: 1,
            branch: "feature-step-1".to_string(),
            attempt: 1,
            status: StepStatus::Fixing(1),
            format: CheckOutcome::Pass,
            check: CheckOutcome::Skipped,
            test: CheckOutcome::Fail,
            reverted: vec!["config/prod.exs".to_string()],
            overlapping: Vec::new(),
            agent_error: None,
            session_id: Some("s".to_string()),
            cost_usd: None,
            duration_ms: 12,
        };
        write_attempt_meta(&paths, &meta).expect("write");
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.meta_path).expect("read"))
                .expect("json");
        assert_eq!(value["status"]["fixing"], 1);
        assert_eq!(value["test"], "fail");
        assert_eq!(value["reverted"][0], "config/prod.exs");
    }
}
