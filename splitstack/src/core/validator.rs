//! Plan admissibility rules.
//!
//! Validation is pure: it needs only a plan and the changed-file list, never a
//! repository or an agent. The defining property it enforces is coverage:
//! every changed file is attributed to at least one step.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core::pattern::{expand, validate_patterns};
use crate::core::plan::Plan;

/// One problem found in a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanIssue {
    EmptyPlan,
    /// Step ids must run `1..=n` in plan order.
    NonSequentialStepId { position: usize, id: u32 },
    MissingAllow { step: u32 },
    MissingTitle { step: u32 },
    MissingInstructions { step: u32 },
    InvalidPattern { step: u32, message: String },
    /// A pattern that matches none of the changed files.
    DeadAllowlistPattern { step: u32, pattern: String },
    /// Changed files no step claims.
    UncoveredFile { files: Vec<String> },
    /// A file claimed by several steps.
    OverlappingOwnership { file: String, steps: Vec<u32> },
}

impl fmt::Display for PlanIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyPlan => f.write_str("plan has no steps"),
            Self::NonSequentialStepId { position, id } => write!(
                f,
                "step at position {} has id {id} (ids must be 1..=n in order)",
                position + 1
            ),
            Self::MissingAllow { step } => write!(f, "step {step}: missing 'allow' patterns"),
            Self::MissingTitle { step } => write!(f, "step {step}: missing 'title'"),
            Self::MissingInstructions { step } => {
                write!(f, "step {step}: missing 'instructions'")
            }
            Self::InvalidPattern { step, message } => write!(f, "step {step}: {message}"),
            Self::DeadAllowlistPattern { step, pattern } => write!(
                f,
                "step {step}: pattern '{pattern}' matches no changed file"
            ),
            Self::UncoveredFile { files } => {
                write!(f, "files not covered by any step: {}", files.join(", "))
            }
            Self::OverlappingOwnership { file, steps } => {
                let steps: Vec<String> = steps.iter().map(u32::to_string).collect();
                write!(f, "file '{file}' claimed by steps {}", steps.join(", "))
            }
        }
    }
}

/// Verdict of [`validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Fatal issues. A plan is admissible iff this is empty.
    pub errors: Vec<PlanIssue>,
    /// Non-fatal issues, to be logged.
    pub warnings: Vec<PlanIssue>,
    /// Expanded ownership: changed file -> ids of the steps that claim it.
    pub ownership: BTreeMap<String, Vec<u32>>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Changed files claimed by the given step after expansion.
    pub fn files_for_step(&self, step: u32) -> BTreeSet<String> {
        self.ownership
            .iter()
            .filter(|(_, owners)| owners.contains(&step))
            .map(|(file, _)| file.clone())
            .collect()
    }

    /// Changed files claimed by any step ordered before `step`.
    pub fn files_before_step(&self, step: u32) -> BTreeSet<String> {
        self.ownership
            .iter()
            .filter(|(_, owners)| owners.iter().any(|owner| *owner < step))
            .map(|(file, _)| file.clone())
            .collect()
    }
}

/// Validate `plan` against the changed-file set.
///
/// Overlapping ownership is fatal only when `strict` is set; otherwise it is
/// reported as a warning.
pub fn validate<S: AsRef<str>>(plan: &Plan, changed_files: &[S], strict: bool) -> ValidationReport {
    let mut report = ValidationReport::default();
    if plan.is_empty() {
        report.errors.push(PlanIssue::EmptyPlan);
        return report;
    }

    let changed: Vec<&str> = changed_files.iter().map(AsRef::as_ref).collect();
    let mut ownership: BTreeMap<String, Vec<u32>> = BTreeMap::new();

    for (position, step) in plan.steps.iter().enumerate() {
        if step.id as usize != position + 1 {
            report.errors.push(PlanIssue::NonSequentialStepId {
                position,
                id: step.id,
            });
        }
        if step.allow.is_empty() {
            report.errors.push(PlanIssue::MissingAllow { step: step.id });
            continue;
        }
        if step.title.trim().is_empty() {
            report.warnings.push(PlanIssue::MissingTitle { step: step.id });
        }
        if step.instructions.trim().is_empty() {
            report
                .warnings
                .push(PlanIssue::MissingInstructions { step: step.id });
        }

        let patterns = step.patterns();
        let pattern_errors = validate_patterns(patterns.as_slice());
        if !pattern_errors.is_empty() {
            report
                .errors
                .extend(pattern_errors.into_iter().map(|message| PlanIssue::InvalidPattern {
                    step: step.id,
                    message,
                }));
            continue;
        }

        for pattern in patterns {
            let matched = expand(pattern, changed.as_slice());
            if matched.is_empty() {
                report.errors.push(PlanIssue::DeadAllowlistPattern {
                    step: step.id,
                    pattern: pattern.to_string(),
                });
            }
            for file in matched {
                let owners = ownership.entry(file.to_string()).or_default();
                if !owners.contains(&step.id) {
                    owners.push(step.id);
                }
            }
        }
    }

    let mut uncovered: Vec<String> = changed
        .iter()
        .filter(|file| !ownership.contains_key(**file))
        .map(|file| file.to_string())
        .collect();
    uncovered.sort();
    uncovered.dedup();
    if !uncovered.is_empty() {
        report
            .errors
            .push(PlanIssue::UncoveredFile { files: uncovered });
    }

    for (file, steps) in &ownership {
        if steps.len() > 1 {
            let issue = PlanIssue::OverlappingOwnership {
                file: file.clone(),
                steps: steps.clone(),
            };
            if strict {
                report.errors.push(issue);
            } else {
                report.warnings.push(issue);
            }
        }
    }

    report.ownership = ownership;
    report
}
