//! Deterministic step branch naming.
//!
//! Step branches are named `<head>-step-<n>`. The name is the only state
//! `--continue` needs to find its place in a run, so parsing must invert
//! [`step_branch_name`] exactly.

use std::sync::LazyLock;

use regex::Regex;

static STEP_BRANCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)-step-([1-9][0-9]*)$").expect("static regex"));

/// Branch name for step `ordinal` of a stack derived from `head`.
pub fn step_branch_name(head: &str, ordinal: u32) -> String {
    format!("{}-step-{ordinal}", head.replace(' ', "-"))
}

/// A branch name recognised as a step branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepBranch {
    pub head: String,
    pub ordinal: u32,
}

/// Parse `<head>-step-<n>`. Returns `None` for any other branch name.
pub fn parse_step_branch(branch: &str) -> Option<StepBranch> {
    let caps = STEP_BRANCH_RE.captures(branch)?;
    let ordinal = caps.get(2)?.as_str().parse().ok()?;
    Some(StepBranch {
        head: caps.get(1)?.as_str().to_string(),
        ordinal,
    })
}

/// File-system friendly form of a branch name (for state files).
pub fn sanitize_for_path(branch: &str) -> String {
    branch
        .chars()
        .map(|c| if c == '/' || c.is_whitespace() { '-' } else { c })
        .collect()
}
