//! Stack execution engine.
//!
//! Splits one feature branch into an ordered stack of step branches. Each step
//! is implemented by an editing agent, confined to the step's allowlist,
//! validated by format, check and test commands in a bounded fix loop, and
//! committed on its own branch stacked on the previous step. The crate keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (patterns, plan validation,
//!   allowlist partitioning, branch naming, commit metadata, drift comparison).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (git, child processes, config and
//!   plan files, prompts, the agent process, check commands, attempt logs).
//!   Isolated behind traits to enable scripting in tests.
//!
//! Orchestration modules ([`agents`], [`step`], [`drift`], [`run`]) coordinate
//! core logic with I/O to implement the CLI.

pub mod agents;
pub mod core;
pub mod drift;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
