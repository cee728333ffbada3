//! Comparison of the recombined stack against the original change.

use std::collections::{BTreeMap, BTreeSet};

use similar::TextDiff;

use crate::core::types::DiffSnapshot;

/// Differences between the original change and the stacked result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    /// Changed in the original but not in the stack.
    pub missing: Vec<String>,
    /// Changed in the stack but not in the original.
    pub unexpected: Vec<String>,
    /// Changed in both, with different content.
    pub altered: Vec<String>,
    /// Diff of the per-file diffs, for operator inspection.
    pub detail: String,
}

impl DriftReport {
    pub fn has_drift(&self) -> bool {
        !self.missing.is_empty() || !self.unexpected.is_empty() || !self.altered.is_empty()
    }

    /// One line per drifting file, prefixed with its kind.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.extend(self.missing.iter().map(|p| format!("missing    {p}")));
        lines.extend(self.unexpected.iter().map(|p| format!("unexpected {p}")));
        lines.extend(self.altered.iter().map(|p| format!("altered    {p}")));
        lines
    }
}

/// Per-file patches from the merge base, original side and stacked side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchPair {
    pub original: String,
    pub stacked: String,
}

/// Paths changed on both sides whose final trees disagree.
///
/// `differing` is the set of paths that differ between the original head and
/// the stacked tip. Only these need their patches compared.
pub fn suspect_paths(
    original: &DiffSnapshot,
    stacked: &DiffSnapshot,
    differing: &BTreeSet<String>,
) -> Vec<String> {
    original
        .files
        .iter()
        .filter(|(path, change)| match stacked.files.get(*path) {
            Some(stacked_change) => stacked_change != *change || differing.contains(*path),
            None => false,
        })
        .map(|(path, _)| path.clone())
        .collect()
}

/// Compare two snapshots taken from the same merge base.
///
/// A path changed on both sides drifts only when its entry in `patches`
/// disagrees; paths without an entry had identical final content. With
/// `ignore_whitespace`, patches are compared after collapsing runs of
/// whitespace inside every line.
pub fn compare_snapshots(
    original: &DiffSnapshot,
    stacked: &DiffSnapshot,
    patches: &BTreeMap<String, PatchPair>,
    ignore_whitespace: bool,
) -> DriftReport {
    let mut report = DriftReport::default();

    for (path, change) in &original.files {
        let Some(stacked_change) = stacked.files.get(path) else {
            report.missing.push(path.clone());
            continue;
        };
        let Some(pair) = patches.get(path) else {
            if stacked_change != change {
                report.altered.push(path.clone());
            }
            continue;
        };
        let before = patch_body(&pair.original);
        let after = patch_body(&pair.stacked);
        if stacked_change != change || !same_patch(&before, &after, ignore_whitespace) {
            report.altered.push(path.clone());
            report.detail.push_str(&diff_of_diffs(path, &before, &after));
        }
    }
    for path in stacked.files.keys() {
        if !original.files.contains_key(path) {
            report.unexpected.push(path.clone());
        }
    }
    report
}

/// Drop `index` lines so identical content compares equal regardless of blob ids.
fn patch_body(patch: &str) -> String {
    let mut body = String::with_capacity(patch.len());
    for line in patch.lines().filter(|line| !line.starts_with("index ")) {
        body.push_str(line);
        body.push('\n');
    }
    body
}

fn same_patch(a: &str, b: &str, ignore_whitespace: bool) -> bool {
    if !ignore_whitespace {
        return a == b;
    }
    normalize_whitespace(a) == normalize_whitespace(b)
}

fn normalize_whitespace(patch: &str) -> Vec<String> {
    patch
        .lines()
        // Hunk headers carry line counts that shift with blank-line edits.
        .filter(|line| !line.starts_with("@@"))
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !matches!(line.as_str(), "" | "+" | "-"))
        .collect()
}

fn diff_of_diffs(path: &str, original: &str, stacked: &str) -> String {
    TextDiff::from_lines(original, stacked)
        .unified_diff()
        .context_radius(3)
        .header(
            &format!("original/{path}.diff"),
            &format!("stacked/{path}.diff"),
        )
        .to_string()
}
