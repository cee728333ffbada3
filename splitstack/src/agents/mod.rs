//! Planning and editing agents with scoped tool grants.
//!
//! The agents never get a path to commit, push or move between branches:
//! those git subcommands are denied outright, and every other mutation is
//! judged afterwards from the repository diff.

pub mod editor;
pub mod planner;

/// Read-only inspection tools shared by both agents.
const READ_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "Bash(git diff:*)",
    "Bash(git status:*)",
    "Bash(git log:*)",
    "Bash(git show:*)",
];

/// Git subcommands neither agent may run.
const DENIED_GIT: &[&str] = &[
    "Bash(git commit:*)",
    "Bash(git push:*)",
    "Bash(git switch:*)",
    "Bash(git branch:*)",
    "Bash(git checkout -b:*)",
    "Bash(git reset:*)",
    "Bash(git rebase:*)",
    "Bash(git merge:*)",
    "Bash(git stash:*)",
    "Bash(git cherry-pick:*)",
];

fn tools(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn denied_git() -> Vec<String> {
    tools(DENIED_GIT)
}

/// Grant to run `command` with any trailing arguments.
fn bash_grant(command: &str) -> String {
    format!("Bash({command}:*)")
}
