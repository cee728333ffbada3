//! Side-effecting operations: git, child processes, files, agents.

pub mod attempt_log;
pub mod checks;
pub mod config;
pub mod executor;
pub mod git;
pub mod plan_store;
pub mod process;
pub mod prompt;
