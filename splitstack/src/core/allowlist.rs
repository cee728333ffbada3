//! Scope checks for paths touched by the editing agent.
//!
//! The touched-path list always comes from the repository diff, never from the
//! agent's own account of what it did.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::pattern::matches_any;

/// What to do when a step edits a file that an earlier step also owns.
///
/// Only reachable in non-strict mode, since strict validation rejects
/// overlapping ownership up front.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Accept silently.
    Accept,
    /// Accept and log.
    #[default]
    Warn,
    /// Treat as an allowlist violation and revert.
    Revert,
}

/// Paths touched by a step's agent that fall outside its allowlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllowlistViolation {
    pub step: u32,
    pub paths: Vec<String>,
}

/// Partition of touched paths for one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeCheck {
    /// In the allowlist and not owned by an earlier step.
    pub authorized: Vec<String>,
    /// In the allowlist but also owned by an earlier step.
    pub overlapping: Vec<String>,
    /// Outside the allowlist.
    pub outside: Vec<String>,
}

impl ScopeCheck {
    /// Paths that must be rolled back under `policy`.
    pub fn to_revert(&self, policy: OverlapPolicy) -> Vec<String> {
        let mut paths = self.outside.clone();
        if policy == OverlapPolicy::Revert {
            paths.extend(self.overlapping.iter().cloned());
        }
        paths.sort();
        paths
    }

    pub fn violation(&self, step: u32, policy: OverlapPolicy) -> Option<AllowlistViolation> {
        let paths = self.to_revert(policy);
        if paths.is_empty() {
            return None;
        }
        Some(AllowlistViolation { step, paths })
    }
}

/// Classify `touched` paths against a step's patterns and earlier owners.
pub fn check_scope<S: AsRef<str>>(
    touched: &[S],
    patterns: &[&str],
    owned_by_earlier: &BTreeSet<String>,
) -> ScopeCheck {
    let mut check = ScopeCheck::default();
    let touched: BTreeSet<&str> = touched.iter().map(AsRef::as_ref).collect();
    for path in touched {
        if !matches_any(path, patterns) {
            check.outside.push(path.to_string());
        } else if owned_by_earlier.contains(path) {
            check.overlapping.push(path.to_string());
        } else {
            check.authorized.push(path.to_string());
        }
    }
    check
}
