//! Engine configuration from `.splitstack.toml` at the repository root.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::allowlist::OverlapPolicy;
use crate::core::detect::detect_commands;

pub const CONFIG_FILE: &str = ".splitstack.toml";

/// Engine configuration (TOML).
///
/// Commands are argv arrays. Missing fields take the defaults below; when the
/// file itself is missing, commands come from marker-file detection instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub test_cmd: Option<Vec<String>>,
    pub format_cmd: Option<Vec<String>>,
    /// Compile/lint gate between format and tests.
    pub check_cmd: Option<Vec<String>>,

    /// Validation rounds per step before it is marked failed.
    pub max_fix_attempts: u32,

    /// Reject overlapping ownership and fail the run on drift.
    pub strict: bool,

    pub overlap_policy: OverlapPolicy,

    pub drift_ignore_whitespace: bool,

    /// Per-invocation timeout for format/check/test commands.
    pub command_timeout_secs: u64,

    /// Truncate captured command output beyond this many bytes.
    pub output_limit_bytes: usize,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI to invoke.
    pub program: String,
    pub edit_timeout_secs: u64,
    pub plan_timeout_secs: u64,
    pub plan_max_turns: u32,
    /// Maximum bytes of diff carried in the planning prompt.
    pub prompt_budget_bytes: usize,
    /// Bytes of failing output fed back on a fix attempt.
    pub failure_tail_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            edit_timeout_secs: 30 * 60,
            plan_timeout_secs: 10 * 60,
            plan_max_turns: 20,
            prompt_budget_bytes: 40_000,
            failure_tail_bytes: 3_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            test_cmd: None,
            format_cmd: None,
            check_cmd: None,
            max_fix_attempts: 5,
            strict: false,
            overlap_policy: OverlapPolicy::default(),
            drift_ignore_whitespace: false,
            command_timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            agent: AgentConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_fix_attempts == 0 {
            return Err(anyhow!("max_fix_attempts must be >= 1"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        for (key, cmd) in [
            ("test_cmd", &self.test_cmd),
            ("format_cmd", &self.format_cmd),
            ("check_cmd", &self.check_cmd),
        ] {
            if let Some(argv) = cmd
                && argv.first().is_none_or(|program| program.trim().is_empty())
            {
                return Err(anyhow!("{key} must be a non-empty array"));
            }
        }
        if self.agent.program.trim().is_empty() {
            return Err(anyhow!("agent.program must be non-empty"));
        }
        if self.agent.edit_timeout_secs == 0 || self.agent.plan_timeout_secs == 0 {
            return Err(anyhow!("agent timeouts must be > 0"));
        }
        if self.agent.plan_max_turns == 0 {
            return Err(anyhow!("agent.plan_max_turns must be > 0"));
        }
        if self.agent.prompt_budget_bytes == 0 || self.agent.failure_tail_bytes == 0 {
            return Err(anyhow!("agent byte budgets must be > 0"));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Apply command-line overrides. Command strings are split shell-style.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<()> {
        if let Some(raw) = &overrides.test_cmd {
            self.test_cmd = Some(split_command("--test-cmd", raw)?);
        }
        if let Some(raw) = &overrides.check_cmd {
            self.check_cmd = Some(split_command("--check-cmd", raw)?);
        }
        if overrides.strict {
            self.strict = true;
        }
        self.validate()
    }
}

/// Settings given on the command line; they win over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub test_cmd: Option<String>,
    pub check_cmd: Option<String>,
    pub strict: bool,
}

fn split_command(flag: &str, raw: &str) -> Result<Vec<String>> {
    let argv = shlex::split(raw).ok_or_else(|| anyhow!("{flag}: unbalanced quoting in '{raw}'"))?;
    if argv.is_empty() {
        return Err(anyhow!("{flag} must not be empty"));
    }
    Ok(argv)
}

/// Load `.splitstack.toml` from `root`.
///
/// If the file is missing, commands are detected from marker files and every
/// other field takes its default.
pub fn load_config(root: &Path) -> Result<Config> {
    let path = root.join(CONFIG_FILE);
    if !path.exists() {
        let detected = detect_commands(|name| root.join(name).is_file());
        info!(ecosystem = detected.ecosystem, "no config file, detected commands");
        let cfg = Config {
            test_cmd: detected.test_cmd,
            format_cmd: detected.format_cmd,
            ..Config::default()
        };
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid {}", path.display()))?;
    debug!(path = %path.display(), "loaded config");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_detection() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("go.mod"), "module x\n").expect("marker");
        let cfg = load_config(temp.path()).expect("load");
        assert_eq!(
            cfg.test_cmd,
            Some(vec!["go".to_string(), "test".to_string(), "./...".to_string()])
        );
        assert_eq!(cfg.max_fix_attempts, 5);
        assert_eq!(cfg.agent, AgentConfig::default());
    }

    #[test]
    fn file_values_override_defaults_and_skip_detection() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("Cargo.toml"), "[package]\n").expect("marker");
        fs::write(
            temp.path().join(CONFIG_FILE),
            r#"
test_cmd = ["make", "test"]
max_fix_attempts = 2
strict = true
overlap_policy = "revert"

[agent]
program = "my-agent"
"#,
        )
        .expect("config");
        let cfg = load_config(temp.path()).expect("load");
        assert_eq!(cfg.test_cmd, Some(vec!["make".to_string(), "test".to_string()]));
        assert_eq!(cfg.format_cmd, None);
        assert_eq!(cfg.max_fix_attempts, 2);
        assert!(cfg.strict);
        assert_eq!(cfg.overlap_policy, OverlapPolicy::Revert);
        assert_eq!(cfg.agent.program, "my-agent");
        assert_eq!(cfg.agent.failure_tail_bytes, 3_000);
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join(CONFIG_FILE), "max_fix_attempts = 0\n").expect("config");
        let err = load_config(temp.path()).unwrap_err();
        assert!(format!("{err:#}").contains("max_fix_attempts"));
    }

    #[test]
    fn empty_command_array_is_rejected() {
        let cfg = Config {
            format_cmd: Some(Vec::new()),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_split_shell_style() {
        let mut cfg = Config::default();
        cfg.apply_overrides(&ConfigOverrides {
            test_cmd: Some("mix test --only 'slow tests'".to_string()),
            check_cmd: Some("mix compile --warnings-as-errors".to_string()),
            strict: true,
        })
        .expect("overrides");
        assert_eq!(
            cfg.test_cmd,
            Some(vec![
                "mix".to_string(),
                "test".to_string(),
                "--only".to_string(),
                "slow tests".to_string()
            ])
        );
        assert_eq!(cfg.check_cmd.as_ref().map(Vec::len), Some(3));
        assert!(cfg.strict);
    }

    #[test]
    fn unbalanced_override_is_an_error() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_overrides(&ConfigOverrides {
                test_cmd: Some("pytest 'oops".to_string()),
                ..ConfigOverrides::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("unbalanced"));
    }
}
