//! Marker-file detection of format/test commands.
//!
//! Pure mapping: the caller supplies an existence check for root-level files,
//! so the mapping is testable without touching a filesystem.

/// Commands inferred from marker files at the repository root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedCommands {
    /// Which marker matched, for diagnostics.
    pub ecosystem: &'static str,
    pub test_cmd: Option<Vec<String>>,
    pub format_cmd: Option<Vec<String>>,
}

impl DetectedCommands {
    fn new(ecosystem: &'static str, test: &[&str], format: &[&str]) -> Self {
        Self {
            ecosystem,
            test_cmd: Some(argv(test)),
            format_cmd: Some(argv(format)),
        }
    }

    fn none() -> Self {
        Self {
            ecosystem: "unknown",
            test_cmd: None,
            format_cmd: None,
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

/// Map the first matching marker to its commands.
///
/// Precedence: `mix.exs`, `package.json` (lockfile picks pnpm/yarn/npm),
/// `Cargo.toml`, `pyproject.toml`/`pytest.ini`, `go.mod`.
pub fn detect_commands<F: Fn(&str) -> bool>(exists: F) -> DetectedCommands {
    if exists("mix.exs") {
        return DetectedCommands::new(
            "elixir",
            &["mix", "test", "--max-failures", "1"],
            &["mix", "format"],
        );
    }
    if exists("package.json") {
        if exists("pnpm-lock.yaml") {
            return DetectedCommands::new("pnpm", &["pnpm", "test"], &["pnpm", "run", "format"]);
        }
        if exists("yarn.lock") {
            return DetectedCommands::new("yarn", &["yarn", "test"], &["yarn", "format"]);
        }
        return DetectedCommands::new("npm", &["npm", "test"], &["npm", "run", "format"]);
    }
    if exists("Cargo.toml") {
        return DetectedCommands::new("rust", &["cargo", "test"], &["cargo", "fmt"]);
    }
    if exists("pyproject.toml") || exists("pytest.ini") {
        return DetectedCommands::new("python", &["pytest"], &["ruff", "format", "."]);
    }
    if exists("go.mod") {
        return DetectedCommands::new("go", &["go", "test", "./..."], &["go", "fmt", "./..."]);
    }
    DetectedCommands::none()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with(markers: &'static [&'static str]) -> impl Fn(&str) -> bool {
        move |name| markers.contains(&name)
    }

    #[test]
    fn elixir_wins_over_node() {
        let detected = detect_commands(with(&["mix.exs", "package.json"]));
        assert_eq!(detected.ecosystem, "elixir");
        assert_eq!(
            detected.test_cmd,
            Some(argv(&["mix", "test", "--max-failures", "1"]))
        );
    }

    #[test]
    fn node_lockfile_selects_package_manager() {
        assert_eq!(
            detect_commands(with(&["package.json", "pnpm-lock.yaml"])).ecosystem,
            "pnpm"
        );
        assert_eq!(
            detect_commands(with(&["package.json", "yarn.lock"])).format_cmd,
            Some(argv(&["yarn", "format"]))
        );
        assert_eq!(
            detect_commands(with(&["package.json"])).test_cmd,
            Some(argv(&["npm", "test"]))
        );
    }

    #[test]
    fn python_accepts_either_marker() {
        assert_eq!(detect_commands(with(&["pytest.ini"])).ecosystem, "python");
        assert_eq!(detect_commands(with(&["pyproject.toml"])).ecosystem, "python");
    }

    #[test]
    fn rust_and_go_are_detected() {
        assert_eq!(
            detect_commands(with(&["Cargo.toml"])).format_cmd,
            Some(argv(&["cargo", "fmt"]))
        );
        assert_eq!(
            detect_commands(with(&["go.mod"])).test_cmd,
            Some(argv(&["go", "test", "./..."]))
        );
    }

    #[test]
    fn no_marker_configures_nothing() {
        let detected = detect_commands(with(&[]));
        assert_eq!(detected.test_cmd, None);
        assert_eq!(detected.format_cmd, None);
    }
}
