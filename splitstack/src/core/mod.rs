//! Deterministic core logic for the stack engine. No I/O.

pub mod allowlist;
pub mod branch;
pub mod commit_message;
pub mod detect;
pub mod drift;
pub mod pattern;
pub mod plan;
pub mod types;
pub mod validator;
