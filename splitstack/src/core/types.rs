//! Shared deterministic types for the stack engine.
//!
//! These types define stable contracts between core components. They carry no
//! I/O and serialize to stable, human-readable forms for attempt logs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a single step.
///
/// ```text
/// pending -> branch_created -> agent_invoked -> validating -> fixing(n) -> ... -> tests_passed -> committed
///                                                        \-> failed
/// ```
/// `skipped` is only reachable through `--continue --skip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    BranchCreated,
    AgentInvoked,
    Validating,
    /// Fix round `n` (1-based) is in progress.
    Fixing(u32),
    TestsPassed,
    Committed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::BranchCreated => f.write_str("branch_created"),
            Self::AgentInvoked => f.write_str("agent_invoked"),
            Self::Validating => f.write_str("validating"),
            Self::Fixing(n) => write!(f, "fixing({n})"),
            Self::TestsPassed => f.write_str("tests_passed"),
            Self::Committed => f.write_str("committed"),
            Self::Failed => f.write_str("failed"),
            Self::Skipped => f.write_str("skipped"),
        }
    }
}

/// Which externally configured command a check invocation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Format,
    Check,
    Test,
}

impl CheckKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Format => "format",
            Self::Check => "check",
            Self::Test => "test",
        }
    }
}

/// Result classification of a format/check/test command.
///
/// `Fail` also covers commands that timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    Pass,
    Fail,
    /// The command is not configured, or an earlier gate failed.
    Skipped,
}

/// Git change status for one path in a ref-to-ref diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FileChange {
    Added,
    Modified,
    Deleted,
    TypeChanged,
}

impl FileChange {
    /// Map the first letter of a `--name-status` code. Unknown codes count as modified.
    pub fn from_code(code: &str) -> Self {
        match code.chars().next() {
            Some('A') => Self::Added,
            Some('D') => Self::Deleted,
            Some('T') => Self::TypeChanged,
            _ => Self::Modified,
        }
    }

    pub fn code(self) -> char {
        match self {
            Self::Added => 'A',
            Self::Modified => 'M',
            Self::Deleted => 'D',
            Self::TypeChanged => 'T',
        }
    }
}

/// Changed paths plus full unified diff between two refs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSnapshot {
    /// Changed paths keyed in lexicographic order.
    pub files: BTreeMap<String, FileChange>,
    /// Unified diff text (`git diff --no-renames`).
    pub patch: String,
}

impl DiffSnapshot {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixing_status_renders_round_number() {
        assert_eq!(StepStatus::Fixing(2).to_string(), "fixing(2)");
        assert_eq!(StepStatus::BranchCreated.to_string(), "branch_created");
    }

    #[test]
    fn only_final_states_are_terminal() {
        assert!(StepStatus::Committed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Fixing(1).is_terminal());
        assert!(!StepStatus::TestsPassed.is_terminal());
    }

    #[test]
    fn name_status_codes_map_to_changes() {
        assert_eq!(FileChange::from_code("A"), FileChange::Added);
        assert_eq!(FileChange::from_code("D"), FileChange::Deleted);
        assert_eq!(FileChange::from_code("M"), FileChange::Modified);
        assert_eq!(FileChange::from_code("X"), FileChange::Modified);
    }
}
