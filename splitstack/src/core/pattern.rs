//! Allowlist pattern matching against repository-relative paths.
//!
//! Supported forms:
//! - exact paths: `lib/foo.ex`
//! - directory trees: `lib/auth/**` (the directory itself and everything below it)
//! - anchored globs: `lib/*/helpers.ex`, `src/**/mod.rs` (`*` never crosses `/`)
//! - bare name globs: `*.md` (no `/`), matched against the file name at any depth

use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Patterns that would claim the whole repository.
const TOO_BROAD: [&str; 4] = ["*", "**", "**/*", "**/**"];

/// True if `path` matches `pattern`.
pub fn matches_pattern(path: &str, pattern: &str) -> bool {
    let pattern = normalize(pattern);
    if pattern.is_empty() {
        return false;
    }

    if let Some(prefix) = pattern.strip_suffix("/**")
        && !has_glob_meta(prefix)
    {
        return path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'));
    }

    if !has_glob_meta(pattern) {
        return path == pattern;
    }

    let Ok(compiled) = Pattern::new(pattern) else {
        return false;
    };
    if pattern.contains('/') {
        compiled.matches_with(path, MATCH_OPTIONS)
    } else {
        let name = path.rsplit('/').next().unwrap_or(path);
        compiled.matches_with(name, MATCH_OPTIONS)
    }
}

/// True if `path` matches at least one of `patterns`.
pub fn matches_any<S: AsRef<str>>(path: &str, patterns: &[S]) -> bool {
    patterns
        .iter()
        .any(|pattern| matches_pattern(path, pattern.as_ref()))
}

/// Return the subset of `paths` matched by `pattern`, preserving input order.
pub fn expand<'a, S: AsRef<str>>(pattern: &str, paths: &'a [S]) -> Vec<&'a str> {
    paths
        .iter()
        .map(AsRef::as_ref)
        .filter(|path| matches_pattern(path, pattern))
        .collect()
}

/// Check patterns for structural problems. Returns one message per bad pattern.
pub fn validate_patterns<S: AsRef<str>>(patterns: &[S]) -> Vec<String> {
    let mut errors = Vec::new();
    for raw in patterns {
        let raw = raw.as_ref();
        let pattern = normalize(raw);
        if pattern.is_empty() {
            errors.push("empty pattern not allowed".to_string());
            continue;
        }
        if TOO_BROAD.contains(&pattern) {
            errors.push(format!(
                "pattern '{raw}' is too broad (must have a directory prefix)"
            ));
            continue;
        }
        if raw.starts_with('/') {
            errors.push(format!("pattern '{raw}' must be repository-relative"));
            continue;
        }
        if pattern.split('/').any(|segment| segment == "..") {
            errors.push(format!("pattern '{raw}' must not contain '..'"));
            continue;
        }
        if let Err(err) = Pattern::new(pattern) {
            errors.push(format!("pattern '{raw}' is not a valid glob: {}", err.msg));
        }
    }
    errors
}

fn normalize(pattern: &str) -> &str {
    pattern.trim().trim_start_matches("./")
}

fn has_glob_meta(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_path_matches_only_itself() {
        assert!(matches_pattern("lib/foo.ex", "lib/foo.ex"));
        assert!(!matches_pattern("lib/foo.exs", "lib/foo.ex"));
        assert!(!matches_pattern("other/lib/foo.ex", "lib/foo.ex"));
    }

    #[test]
    fn directory_tree_pattern_matches_nested_files() {
        assert!(matches_pattern("lib/auth/token.ex", "lib/auth/**"));
        assert!(matches_pattern("lib/auth/deep/nested/x.ex", "lib/auth/**"));
        assert!(!matches_pattern("lib/authz/token.ex", "lib/auth/**"));
        assert!(!matches_pattern("lib/other.ex", "lib/auth/**"));
    }

    #[test]
    fn single_star_does_not_cross_directories() {
        assert!(matches_pattern("src/main.rs", "src/*.rs"));
        assert!(!matches_pattern("src/io/git.rs", "src/*.rs"));
        assert!(matches_pattern("lib/users/helpers.ex", "lib/*/helpers.ex"));
    }

    #[test]
    fn recursive_segment_matches_intermediate_directories() {
        assert!(matches_pattern("src/a/b/mod.rs", "src/**/mod.rs"));
        assert!(!matches_pattern("tests/a/mod.rs", "src/**/mod.rs"));
    }

    #[test]
    fn bare_name_glob_matches_at_any_depth() {
        assert!(matches_pattern("README.md", "*.md"));
        assert!(matches_pattern("docs/guide/intro.md", "*.md"));
        assert!(!matches_pattern("docs/intro.txt", "*.md"));
    }

    #[test]
    fn leading_dot_slash_is_ignored() {
        assert!(matches_pattern("lib/foo.ex", "./lib/foo.ex"));
    }

    #[test]
    fn expand_keeps_input_order() {
        let files = vec!["b/x.rs", "a/y.rs", "b/z.rs"];
        assert_eq!(expand("b/**", &files), vec!["b/x.rs", "b/z.rs"]);
        assert!(expand("c/**", &files).is_empty());
    }

    #[test]
    fn validate_rejects_empty_broad_and_escaping_patterns() {
        let errors = validate_patterns(&["", "**", "**/*", "/abs/path", "../up/**", "lib/**"]);
        assert_eq!(errors.len(), 5);
        assert!(errors[0].contains("empty"));
        assert!(errors[1].contains("too broad"));
        assert!(errors[2].contains("too broad"));
        assert!(errors[3].contains("repository-relative"));
        assert!(errors[4].contains(".."));
    }

    #[test]
    fn validate_accepts_reasonable_patterns() {
        assert!(validate_patterns(&["lib/**", "src/*.rs", "*.md", "Cargo.toml"]).is_empty());
    }
}
