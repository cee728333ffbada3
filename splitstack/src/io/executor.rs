//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples the engine from the agent backend
//! (currently the `claude` CLI in headless mode). Tests use scripted executors
//! that edit the working tree directly without spawning processes.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::errors::StackError;
use crate::io::process::{CommandOutput, ProcessOptions, run_command, write_text};

/// Which agent session a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Planner,
    Editor,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Editor => "editor",
        }
    }
}

/// Parameters for an executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub role: AgentRole,
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text, fed on stdin.
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Tool grants, in the agent's permission-rule syntax.
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    /// Continue an earlier session instead of starting a fresh one.
    pub resume_session: Option<String>,
    pub max_turns: Option<u32>,
    /// File the agent is asked to write, if any.
    pub output_path: Option<PathBuf>,
    /// JSONL event stream, written while the agent runs.
    pub stream_path: PathBuf,
    /// Exit status and stderr of the agent process.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Final result reported by the agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    /// Final assistant message.
    pub result: String,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    /// The agent finished but reports its own failure.
    pub is_error: bool,
}

/// Abstraction over agent execution backends.
///
/// Implementations must report a missing or crashing backend as
/// [`StackError::AgentUnavailable`] and a timeout as [`StackError::AgentTimeout`].
pub trait Executor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput>;
}

/// Executor that spawns `claude -p` with streamed JSON output.
#[derive(Debug, Clone)]
pub struct ClaudeExecutor {
    program: String,
}

impl ClaudeExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, request: &ExecRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");
        if !request.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(request.allowed_tools.join(","));
        }
        if !request.disallowed_tools.is_empty() {
            cmd.arg("--disallowedTools")
                .arg(request.disallowed_tools.join(","));
        }
        if let Some(system_prompt) = &request.system_prompt {
            cmd.arg("--append-system-prompt").arg(system_prompt);
        }
        if let Some(session) = &request.resume_session {
            cmd.arg("--resume").arg(session);
        }
        if let Some(turns) = request.max_turns {
            cmd.arg("--max-turns").arg(turns.to_string());
        }
        cmd.current_dir(&request.workdir);
        cmd
    }
}

impl Executor for ClaudeExecutor {
    #[instrument(skip_all, fields(role = request.role.as_str(), timeout_secs = request.timeout.as_secs(), resume = request.resume_session.is_some()))]
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        info!(workdir = %request.workdir.display(), "starting agent");
        if let Some(parent) = request.output_path.as_deref().and_then(Path::parent) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }
        let output = run_command(
            self.command(request),
            ProcessOptions {
                stdin: Some(request.prompt.as_bytes()),
                timeout: request.timeout,
                output_limit_bytes: request.output_limit_bytes,
                stdout_tee: Some(&request.stream_path),
            },
        );
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                let missing = err
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == ErrorKind::NotFound);
                let message = if missing {
                    format!("`{}` not found on PATH", self.program)
                } else {
                    format!("{err:#}")
                };
                return Err(StackError::AgentUnavailable {
                    agent: self.program.clone(),
                    message,
                }
                .into());
            }
        };

        write_agent_log(&request.log_path, &output)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(StackError::AgentTimeout {
                agent: self.program.clone(),
                timeout: request.timeout,
            }
            .into());
        }

        let stream = fs::read_to_string(&request.stream_path)
            .with_context(|| format!("read agent stream {}", request.stream_path.display()))?;
        match parse_result_message(&stream) {
            Some(result) => {
                debug!(is_error = result.is_error, session = ?result.session_id, "agent finished");
                Ok(result)
            }
            None if !output.status.success() => Err(StackError::AgentUnavailable {
                agent: self.program.clone(),
                message: format!(
                    "exited with status {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }
            .into()),
            None => Err(StackError::AgentUnavailable {
                agent: self.program.clone(),
                message: "no result message in agent output".to_string(),
            }
            .into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResultMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default, alias = "cost_usd")]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    is_error: bool,
}

/// Find the last `{"type":"result",...}` line in a stream-json transcript.
pub fn parse_result_message(stream: &str) -> Option<ExecOutput> {
    stream
        .lines()
        .rev()
        .filter(|line| line.trim_start().starts_with('{'))
        .filter_map(|line| serde_json::from_str::<ResultMessage>(line).ok())
        .find(|msg| msg.kind == "result")
        .map(|msg| ExecOutput {
            result: msg.result.unwrap_or_default(),
            session_id: msg.session_id,
            cost_usd: msg.total_cost_usd,
            is_error: msg.is_error,
        })
}

fn write_agent_log(path: &Path, output: &CommandOutput) -> Result<()> {
    let mut buf = format!("exit status: {:?}\n", output.status.code());
    if output.timed_out {
        buf.push_str("[agent timed out]\n");
    }
    buf.push_str("=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.stderr_truncated > 0 {
        buf.push_str(&format!(
            "\n[stderr truncated {} bytes]\n",
            output.stderr_truncated
        ));
    }
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path) -> ExecRequest {
        ExecRequest {
            role: AgentRole::Editor,
            workdir: dir.to_path_buf(),
            prompt: "do the thing".to_string(),
            system_prompt: Some("be careful".to_string()),
            allowed_tools: vec!["Read".to_string(), "Edit".to_string()],
            disallowed_tools: vec!["Bash(git commit:*)".to_string()],
            resume_session: Some("sess-1".to_string()),
            max_turns: Some(7),
            output_path: None,
            stream_path: dir.join("agent.jsonl"),
            log_path: dir.join("agent.log"),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn parses_last_result_line() {
        let stream = concat!(
            "{\"type\":\"system\",\"session_id\":\"s\"}\n",
            "not json\n",
            "{\"type\":\"result\",\"result\":\"done\",\"session_id\":\"s\",\"total_cost_usd\":0.25,\"is_error\":false}\n",
        );
        let output = parse_result_message(stream).expect("result");
        assert_eq!(output.result, "done");
        assert_eq!(output.session_id.as_deref(), Some("s"));
        assert_eq!(output.cost_usd, Some(0.25));
        assert!(!output.is_error);
    }

    #[test]
    fn missing_result_line_is_none() {
        assert!(parse_result_message("{\"type\":\"assistant\"}\n").is_none());
    }

    #[test]
    fn command_carries_scoping_flags() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = ClaudeExecutor::new("claude").command(&request(temp.path()));
        let args: Vec<String> = cmd
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        let joined = args.join(" ");
        assert!(joined.starts_with("-p --output-format stream-json --verbose"));
        assert!(joined.contains("--allowedTools Read,Edit"));
        assert!(joined.contains("--disallowedTools Bash(git commit:*)"));
        assert!(joined.contains("--resume sess-1"));
        assert!(joined.contains("--max-turns 7"));
    }

    #[test]
    fn missing_program_is_agent_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ClaudeExecutor::new("splitstack-no-such-agent");
        let err = executor.exec(&request(temp.path())).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StackError>(),
            Some(StackError::AgentUnavailable { .. })
        ));
    }

    #[test]
    fn fake_agent_script_result_is_parsed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("agent.sh");
        fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\necho '{\"type\":\"result\",\"result\":\"ok\",\"session_id\":\"abc\"}'\n",
        )
        .expect("script");
        let status = Command::new("chmod")
            .arg("+x")
            .arg(&script)
            .status()
            .expect("chmod");
        assert!(status.success());

        let executor = ClaudeExecutor::new(script.display().to_string());
        let output = executor.exec(&request(temp.path())).expect("exec");
        assert_eq!(output.result, "ok");
        assert_eq!(output.session_id.as_deref(), Some("abc"));
        assert!(temp.path().join("agent.log").is_file());
    }

    #[test]
    fn slow_agent_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("slow.sh");
        fs::write(&script, "#!/bin/sh\nexec sleep 5\n").expect("script");
        Command::new("chmod")
            .arg("+x")
            .arg(&script)
            .status()
            .expect("chmod");

        let executor = ClaudeExecutor::new(script.display().to_string());
        let mut req = request(temp.path());
        req.timeout = Duration::from_millis(200);
        let err = executor.exec(&req).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StackError>(),
            Some(StackError::AgentTimeout { .. })
        ));
    }
}
