//! Git adapter for the stack engine.
//!
//! Every call is a synchronous `git` subprocess whose exit status is checked
//! before the next one is issued. Nothing here stashes, merges, rebases or
//! pushes.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::{DiffSnapshot, FileChange};
use crate::errors::StackError;

/// Parsed `git status --porcelain=v1 -z` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file (destination for renames and copies).
    pub path: String,
    /// Source path for renames and copies.
    pub orig_path: Option<String>,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Absolute path of the repository's git directory.
    pub fn git_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--absolute-git-dir"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-z", "-uall"])?;
        parse_status_z(&out)
    }

    /// Fail with [`StackError::DirtyWorkingTree`] on any staged, modified or untracked path.
    #[instrument(skip_all)]
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(dirty_count = entries.len(), "worktree not clean");
        Err(StackError::DirtyWorkingTree {
            entries: entries
                .iter()
                .map(|entry| format!("{} {}", entry.code, entry.path))
                .collect(),
        }
        .into())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Check whether `rev` names a commit.
    pub fn ref_exists(&self, rev: &str) -> Result<bool> {
        let spec = format!("{rev}^{{commit}}");
        Ok(self
            .run(&["rev-parse", "--verify", "--quiet", &spec])?
            .status
            .success())
    }

    /// Resolve `(base, head)`.
    ///
    /// Base defaults to `main`, then `master`; head defaults to the current
    /// branch. Anything that cannot be resolved unambiguously is
    /// [`StackError::AmbiguousBranch`].
    #[instrument(skip_all)]
    pub fn resolve_branches(
        &self,
        base: Option<&str>,
        head: Option<&str>,
    ) -> Result<(String, String)> {
        let base = match base {
            Some(base) => {
                if !self.ref_exists(base)? {
                    return Err(ambiguous(format!("base '{base}' does not exist")));
                }
                base.to_string()
            }
            None => {
                let mut found = None;
                for candidate in ["main", "master"] {
                    if self.branch_exists(candidate)? {
                        found = Some(candidate.to_string());
                        break;
                    }
                }
                found.ok_or_else(|| {
                    ambiguous("no 'main' or 'master' branch; pass --base".to_string())
                })?
            }
        };
        let head = match head {
            Some(head) => {
                if !self.branch_exists(head)? {
                    return Err(ambiguous(format!("head branch '{head}' does not exist")));
                }
                head.to_string()
            }
            None => self
                .current_branch()
                .map_err(|err| ambiguous(format!("{err}; pass --head")))?,
        };
        if base == head {
            return Err(ambiguous(format!("base and head are both '{base}'")));
        }
        debug!(%base, %head, "resolved branches");
        Ok((base, head))
    }

    /// Full commit id for `rev`.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run_capture(&["rev-parse", "--verify", &spec])?;
        Ok(out.trim().to_string())
    }

    /// Immutable commit id for `rev`, captured before anything mutates it.
    pub fn snapshot_head_commit(&self, rev: &str) -> Result<String> {
        self.rev_parse(rev)
    }

    pub fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        let out = self.run_capture(&["merge-base", a, b])?;
        Ok(out.trim().to_string())
    }

    /// True if `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git merge-base --is-ancestor failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    /// Changed paths and unified diff between two commits. Read-only.
    #[instrument(skip_all, fields(from, to))]
    pub fn diff(&self, from: &str, to: &str) -> Result<DiffSnapshot> {
        let names = self.run_capture(&[
            "-c",
            "core.quotepath=off",
            "diff",
            "--no-renames",
            "--name-status",
            "-z",
            from,
            to,
        ])?;
        let patch = self.run_capture(&[
            "-c",
            "core.quotepath=off",
            "diff",
            "--no-renames",
            "--no-color",
            "--no-ext-diff",
            from,
            to,
        ])?;
        let files = parse_name_status_z(&names)?;
        debug!(files = files.len(), patch_bytes = patch.len(), "diff computed");
        Ok(DiffSnapshot {
            files: files.into_iter().collect(),
            patch,
        })
    }

    /// Paths whose content or mode differs between two commits.
    pub fn changed_paths(&self, from: &str, to: &str) -> Result<BTreeSet<String>> {
        let out = self.run_capture(&["diff", "--no-renames", "--name-only", "-z", from, to])?;
        Ok(out
            .split('\0')
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Unified diff of a single path between two commits.
    ///
    /// The path is passed as a literal pathspec, so it is never parsed back
    /// out of diff headers.
    #[instrument(skip_all, fields(from, to, path))]
    pub fn file_patch(&self, from: &str, to: &str, path: &str) -> Result<String> {
        let literal = format!(":(literal){path}");
        self.run_capture(&[
            "diff",
            "--no-renames",
            "--no-color",
            "--no-ext-diff",
            from,
            to,
            "--",
            &literal,
        ])
    }

    /// `git diff --stat` between two commits.
    pub fn diff_stat(&self, from: &str, to: &str) -> Result<String> {
        self.run_capture(&["diff", "--no-renames", "--stat", from, to])
    }

    /// Paths whose working-tree content differs from `rev`, plus untracked files.
    ///
    /// Computed from the repository itself, so the agent's own report never matters.
    pub fn touched_since(&self, rev: &str) -> Result<Vec<String>> {
        let tracked = self.run_capture(&[
            "-c",
            "core.quotepath=off",
            "diff",
            "--no-renames",
            "--name-only",
            "-z",
            rev,
        ])?;
        let untracked =
            self.run_capture(&["ls-files", "--others", "--exclude-standard", "-z"])?;
        let paths: BTreeSet<String> = tracked
            .split('\0')
            .chain(untracked.split('\0'))
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect();
        Ok(paths.into_iter().collect())
    }

    /// Create `branch` at `start` and check it out. Refuses to reuse a branch.
    #[instrument(skip_all, fields(branch, start))]
    pub fn checkout_new_branch_from(&self, branch: &str, start: &str) -> Result<()> {
        if self.branch_exists(branch)? {
            return Err(anyhow!(
                "branch '{branch}' already exists (delete it or use --continue)"
            ));
        }
        debug!(branch, start, "creating and checking out new branch");
        self.run_checked(&["checkout", "-q", "-b", branch, start])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", "-q", branch])?;
        Ok(())
    }

    /// Put `path` back to its content at `rev`, in both index and worktree.
    ///
    /// A path absent at `rev` is removed.
    #[instrument(skip_all, fields(rev, path))]
    pub fn restore_path(&self, rev: &str, path: &str) -> Result<()> {
        let literal = format!(":(literal){path}");
        let blob = format!("{rev}:{path}");
        let exists_at_rev = self.run(&["cat-file", "-e", &blob])?.status.success();
        if exists_at_rev {
            debug!(rev, path, "restoring path");
            self.run_checked(&[
                "restore",
                &format!("--source={rev}"),
                "--staged",
                "--worktree",
                "--",
                &literal,
            ])?;
            return Ok(());
        }
        debug!(rev, path, "removing path absent at rev");
        self.run_checked(&[
            "rm",
            "--cached",
            "-f",
            "-q",
            "--ignore-unmatch",
            "--",
            &literal,
        ])?;
        let on_disk = self.workdir.join(path);
        if on_disk.is_file() || on_disk.is_symlink() {
            fs::remove_file(&on_disk)
                .with_context(|| format!("remove {}", on_disk.display()))?;
        }
        Ok(())
    }

    /// Drop every uncommitted change, tracked or untracked (ignored files survive).
    #[instrument(skip_all)]
    pub fn discard_changes(&self) -> Result<()> {
        self.run_checked(&["reset", "-q", "--hard", "HEAD"])?;
        self.run_checked(&["clean", "-q", "-f", "-d"])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--quiet"])?;
        Ok(!out.status.success())
    }

    /// Stage everything and commit, returning the new commit id.
    ///
    /// With nothing staged this fails unless `allow_empty` is set.
    #[instrument(skip_all, fields(allow_empty))]
    pub fn commit_all(&self, message: &str, allow_empty: bool) -> Result<String> {
        self.add_all()?;
        let mut args = vec!["commit", "-q", "-m", message];
        if !self.has_staged_changes()? {
            if !allow_empty {
                return Err(anyhow!("nothing to commit"));
            }
            args.push("--allow-empty");
        }
        debug!("committing");
        self.run_checked(&args)?;
        self.rev_parse("HEAD")
    }

    /// Full message of the commit at `rev`.
    pub fn commit_message(&self, rev: &str) -> Result<String> {
        self.run_capture(&["log", "-1", "--format=%B", rev])
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn ambiguous(reason: String) -> anyhow::Error {
    StackError::AmbiguousBranch { reason }.into()
}

/// Parse `status --porcelain=v1 -z`. Renames and copies carry their source
/// path as the following NUL-separated field.
fn parse_status_z(out: &str) -> Result<Vec<StatusEntry>> {
    let mut entries = Vec::new();
    let mut fields = out.split('\0').filter(|field| !field.is_empty());
    while let Some(field) = fields.next() {
        if field.len() < 4 {
            return Err(anyhow!("unexpected porcelain entry: '{field}'"));
        }
        let code = field[..2].to_string();
        let path = field[3..].to_string();
        let orig_path = if code.starts_with('R') || code.starts_with('C') {
            fields.next().map(str::to_string)
        } else {
            None
        };
        entries.push(StatusEntry {
            code,
            path,
            orig_path,
        });
    }
    Ok(entries)
}

/// Parse `diff --name-status -z` (no renames): `<code>\0<path>\0` pairs.
fn parse_name_status_z(out: &str) -> Result<Vec<(String, FileChange)>> {
    let mut files = Vec::new();
    let mut fields = out.split('\0').filter(|field| !field.is_empty());
    while let Some(code) = fields.next() {
        let path = fields
            .next()
            .ok_or_else(|| anyhow!("name-status entry '{code}' has no path"))?;
        files.push((path.to_string(), FileChange::from_code(code)));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_and_modified_entries() {
        let entries = parse_status_z("?? foo.txt\0 M src/main.rs\0").expect("parse");
        assert_eq!(
            entries[0],
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string(),
                orig_path: None,
            }
        );
        assert_eq!(entries[1].code, " M");
        assert_eq!(entries[1].path, "src/main.rs");
    }

    #[test]
    fn rename_entry_keeps_both_paths() {
        let entries = parse_status_z("R  new.txt\0old.txt\0").expect("parse");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "new.txt");
        assert_eq!(entries[0].orig_path.as_deref(), Some("old.txt"));
    }

    #[test]
    fn parses_name_status_pairs() {
        let files = parse_name_status_z("M\0a.rs\0A\0dir/b.rs\0D\0c.rs\0").expect("parse");
        assert_eq!(
            files,
            vec![
                ("a.rs".to_string(), FileChange::Modified),
                ("dir/b.rs".to_string(), FileChange::Added),
                ("c.rs".to_string(), FileChange::Deleted),
            ]
        );
    }

    #[test]
    fn dirty_tree_is_a_typed_error() {
        let repo = TestRepo::new().expect("repo");
        repo.write_file("stray.txt", "x").expect("write");
        let err = repo.git().ensure_clean().unwrap_err();
        match err.downcast_ref::<StackError>() {
            Some(StackError::DirtyWorkingTree { entries }) => {
                assert_eq!(entries, &vec!["?? stray.txt".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn resolve_branches_defaults_to_main_and_current() {
        let repo = TestRepo::new().expect("repo");
        repo.checkout_new("feature").expect("branch");
        let (base, head) = repo.git().resolve_branches(None, None).expect("resolve");
        assert_eq!(base, "main");
        assert_eq!(head, "feature");
    }

    #[test]
    fn resolve_branches_rejects_missing_base() {
        let repo = TestRepo::new().expect("repo");
        repo.checkout_new("feature").expect("branch");
        let err = repo
            .git()
            .resolve_branches(Some("trunk"), None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StackError>(),
            Some(StackError::AmbiguousBranch { .. })
        ));
    }

    #[test]
    fn restore_path_reverts_edits_and_removes_new_files() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        repo.write_file("keep.txt", "changed\n").expect("edit");
        repo.write_file("new/extra.txt", "extra\n").expect("add");

        let touched = git.touched_since("HEAD").expect("touched");
        assert_eq!(touched, vec!["keep.txt", "new/extra.txt"]);

        git.restore_path("HEAD", "keep.txt").expect("restore");
        git.restore_path("HEAD", "new/extra.txt").expect("remove");
        assert_eq!(repo.read_file("keep.txt").expect("read"), "keep\n");
        assert!(!repo.path().join("new/extra.txt").exists());
        git.ensure_clean().expect("clean after restore");
    }

    #[test]
    fn diff_reports_files_and_patch() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let before = git.rev_parse("HEAD").expect("head");
        repo.write_file("keep.txt", "keep\nmore\n").expect("edit");
        repo.write_file("b.txt", "b\n").expect("add");
        let after = git.commit_all("change", false).expect("commit");

        let snapshot = git.diff(&before, &after).expect("diff");
        assert_eq!(snapshot.files.get("keep.txt"), Some(&FileChange::Modified));
        assert_eq!(snapshot.files.get("b.txt"), Some(&FileChange::Added));
        assert!(snapshot.patch.contains("+more"));
        assert!(git.is_ancestor(&before, &after).expect("ancestry"));
        assert!(!git.is_ancestor(&after, &before).expect("ancestry"));
    }

    #[test]
    fn commit_all_refuses_empty_unless_allowed() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        assert!(git.commit_all("nothing", false).is_err());
        let sha = git.commit_all("step(1): empty", true).expect("empty commit");
        assert_eq!(sha, git.rev_parse("HEAD").expect("head"));
        assert!(
            git.commit_message("HEAD")
                .expect("message")
                .starts_with("step(1): empty")
        );
    }
}
