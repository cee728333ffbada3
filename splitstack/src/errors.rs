//! Typed stop conditions that callers distinguish by kind.
//!
//! These travel inside `anyhow::Error` and are recovered with
//! `downcast_ref::<StackError>()`.

use std::time::Duration;

use thiserror::Error;

use crate::core::validator::PlanIssue;

#[derive(Debug, Error)]
pub enum StackError {
    #[error("working tree is not clean (refusing to continue):\n{}", .entries.join("\n"))]
    DirtyWorkingTree { entries: Vec<String> },

    #[error("cannot resolve branches: {reason}")]
    AmbiguousBranch { reason: String },

    #[error("malformed plan: {message}")]
    PlanParse { message: String },

    #[error("plan rejected:\n- {}", join_issues(.issues))]
    InvalidPlan { issues: Vec<PlanIssue> },

    #[error("agent `{agent}` unavailable: {message}")]
    AgentUnavailable { agent: String, message: String },

    #[error("agent `{agent}` timed out after {}s", .timeout.as_secs())]
    AgentTimeout { agent: String, timeout: Duration },

    #[error(
        "step {step} ({branch}) failed after {attempts} attempt(s); last failure:\n{last_output}"
    )]
    FixAttemptsExhausted {
        step: u32,
        branch: String,
        attempts: u32,
        last_output: String,
    },

    #[error("stacked result drifted from the original change:\n{summary}")]
    DriftDetected { summary: String },

    #[error("cannot continue: {reason}")]
    ResumeMismatch { reason: String },

    #[error("aborted by operator")]
    Aborted,
}

impl StackError {
    /// True for errors raised before any branch is created.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::DirtyWorkingTree { .. }
                | Self::AmbiguousBranch { .. }
                | Self::PlanParse { .. }
                | Self::InvalidPlan { .. }
                | Self::ResumeMismatch { .. }
        )
    }
}

fn join_issues(issues: &[PlanIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n- ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_plan_lists_every_issue() {
        let err = StackError::InvalidPlan {
            issues: vec![
                PlanIssue::EmptyPlan,
                PlanIssue::UncoveredFile {
                    files: vec!["C".to_string()],
                },
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("plan rejected:\n- "));
        assert_eq!(text.matches("\n- ").count(), 2);
        assert!(err.is_validation());
    }

    #[test]
    fn survives_anyhow_round_trip() {
        let err = anyhow::Error::new(StackError::FixAttemptsExhausted {
            step: 2,
            branch: "feat-step-2".to_string(),
            attempts: 5,
            last_output: "boom".to_string(),
        })
        .context("run stack");
        let typed = err.downcast_ref::<StackError>().expect("typed error");
        assert!(matches!(
            typed,
            StackError::FixAttemptsExhausted { step: 2, .. }
        ));
        assert!(!typed.is_validation());
    }
}
