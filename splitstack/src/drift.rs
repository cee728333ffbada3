//! Whole-stack drift verification.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::drift::{DriftReport, PatchPair, compare_snapshots, suspect_paths};
use crate::io::git::Git;

/// Compare `merge_base..original_head` with `merge_base..final_ref`.
///
/// Both sides are diffed from the same merge base, so the result is
/// independent of how the change was split across steps. Per-file patches
/// are fetched only for paths whose final content differs.
#[instrument(skip(git))]
pub fn verify_drift(
    git: &Git,
    merge_base: &str,
    original_head: &str,
    final_ref: &str,
    ignore_whitespace: bool,
) -> Result<DriftReport> {
    let original = git.diff(merge_base, original_head)?;
    let stacked = git.diff(merge_base, final_ref)?;
    let differing = git.changed_paths(original_head, final_ref)?;
    let mut patches = BTreeMap::new();
    for path in suspect_paths(&original, &stacked, &differing) {
        let pair = PatchPair {
            original: git.file_patch(merge_base, original_head, &path)?,
            stacked: git.file_patch(merge_base, final_ref, &path)?,
        };
        patches.insert(path, pair);
    }
    debug!(differing = differing.len(), compared = patches.len(), "per-file patches");
    let report = compare_snapshots(&original, &stacked, &patches, ignore_whitespace);
    if report.has_drift() {
        warn!(
            missing = report.missing.len(),
            unexpected = report.unexpected.len(),
            altered = report.altered.len(),
            "stack drifted from the original change"
        );
    } else {
        info!(files = original.files.len(), "stack matches the original change");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn identical_trees_do_not_drift() {
        let repo = TestRepo::new().expect("repo");
        let base = repo.git().rev_parse("HEAD").expect("base");
        repo.checkout_new("feature").expect("branch");
        repo.write_file("src/a.rs", "fn a() {}\n").expect("write");
        let original = repo.commit_all("feature").expect("commit");

        repo.checkout(&base).expect("checkout");
        repo.checkout_new("stack").expect("branch");
        repo.write_file("src/a.rs", "fn a() {}\n").expect("write");
        let stacked = repo.commit_all("step 1").expect("commit");

        let report = verify_drift(&repo.git(), &base, &original, &stacked, false).expect("drift");
        assert!(!report.has_drift(), "{report:?}");
    }

    #[test]
    fn missing_and_altered_files_are_reported() {
        let repo = TestRepo::new().expect("repo");
        let base = repo.git().rev_parse("HEAD").expect("base");
        repo.checkout_new("feature").expect("branch");
        repo.write_file("a.txt", "one\n").expect("write");
        repo.write_file("b.txt", "two\n").expect("write");
        let original = repo.commit_all("feature").expect("commit");

        repo.checkout(&base).expect("checkout");
        repo.checkout_new("stack").expect("branch");
        repo.write_file("a.txt", "uno\n").expect("write");
        let stacked = repo.commit_all("step 1").expect("commit");

        let report = verify_drift(&repo.git(), &base, &original, &stacked, false).expect("drift");
        assert_eq!(report.missing, vec!["b.txt".to_string()]);
        assert_eq!(report.altered, vec!["a.txt".to_string()]);
        assert!(report.unexpected.is_empty());
    }

    fn altered_content_drifts(path: &str) -> DriftReport {
        let repo = TestRepo::new().expect("repo");
        let base = repo.git().rev_parse("HEAD").expect("base");
        repo.checkout_new("feature").expect("branch");
        repo.write_file(path, "original\n").expect("write");
        let original = repo.commit_all("feature").expect("commit");

        repo.checkout(&base).expect("checkout");
        repo.checkout_new("stack").expect("branch");
        repo.write_file(path, "ALTERED\n").expect("write");
        let stacked = repo.commit_all("step 1").expect("commit");

        verify_drift(&repo.git(), &base, &original, &stacked, false).expect("drift")
    }

    #[test]
    fn altered_file_under_directory_ending_in_b_is_reported() {
        let report = altered_content_drifts("docs b/note.txt");
        assert_eq!(report.altered, vec!["docs b/note.txt".to_string()]);
        assert!(report.detail.contains("+ALTERED"), "{}", report.detail);
    }

    #[test]
    fn altered_file_with_quoted_name_is_reported() {
        let report = altered_content_drifts("say\"hi\".txt");
        assert_eq!(report.altered, vec!["say\"hi\".txt".to_string()]);
        assert!(report.missing.is_empty() && report.unexpected.is_empty());
    }

    #[test]
    fn whitespace_only_edit_is_tolerated_when_asked() {
        let repo = TestRepo::new().expect("repo");
        let base = repo.git().rev_parse("HEAD").expect("base");
        repo.checkout_new("feature").expect("branch");
        repo.write_file("a.rs", "let x = 1;\n").expect("write");
        let original = repo.commit_all("feature").expect("commit");

        repo.checkout(&base).expect("checkout");
        repo.checkout_new("stack").expect("branch");
        repo.write_file("a.rs", "let  x =  1;\n").expect("write");
        let stacked = repo.commit_all("step 1").expect("commit");

        let git = repo.git();
        assert!(verify_drift(&git, &base, &original, &stacked, false).expect("drift").has_drift());
        assert!(!verify_drift(&git, &base, &original, &stacked, true).expect("drift").has_drift());
    }
}
