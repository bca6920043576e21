//! Agent abstraction for iteration invocations.
//!
//! The [`Agent`] trait decouples the cycle driver from the actual agent
//! backend (a line-streaming CLI by default). Tests use scripted agents that
//! write predetermined transcripts without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::transcript::{Transcript, parse_transcript};
use crate::io::config::AgentConfig;
use crate::io::process::run_command;

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text fed to the agent on stdin.
    pub prompt: String,
    /// Where the agent's JSONL transcript must end up.
    pub transcript_path: PathBuf,
    /// Where stdout/stderr of the invocation are logged.
    pub log_path: PathBuf,
    pub timeout: Duration,
    /// Truncate in-memory output and logs beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Agent session to continue, when the backend supports it.
    pub resume: Option<String>,
}

/// Abstraction over agent backends.
pub trait Agent {
    /// Run one iteration. Must leave the transcript at `request.transcript_path`.
    fn invoke(&self, request: &AgentRequest) -> Result<()>;
}

/// Agent that spawns the configured command and streams its stdout as the transcript.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    config: AgentConfig,
}

impl CommandAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &AgentRequest) -> Result<Command> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let (Some(flag), Some(session)) = (&self.config.resume_flag, &request.resume) {
            cmd.arg(flag).arg(session);
        }
        cmd.current_dir(&request.workdir);
        Ok(cmd)
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), resume = request.resume.is_some()))]
    fn invoke(&self, request: &AgentRequest) -> Result<()> {
        info!(workdir = %request.workdir.display(), "starting agent");
        let cmd = self.command(request)?;
        let output = run_command(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            Some(&request.transcript_path),
        )
        .context("run agent")?;

        write_agent_log(
            &request.log_path,
            &output.render_log("agent"),
            request.output_limit_bytes,
        )?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(anyhow!("agent timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(anyhow!(
                "agent failed with status {:?}",
                output.status.code()
            ));
        }
        debug!("agent completed successfully");
        Ok(())
    }
}

/// Invoke the agent and parse the transcript it left behind.
#[instrument(skip_all, fields(transcript = %request.transcript_path.display()))]
pub fn invoke_and_read<A: Agent + ?Sized>(agent: &A, request: &AgentRequest) -> Result<Transcript> {
    agent.invoke(request)?;
    read_transcript(&request.transcript_path)
}

pub fn read_transcript(path: &Path) -> Result<Transcript> {
    if !path.exists() {
        return Err(anyhow!("missing transcript {}", path.display()));
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("read transcript {}", path.display()))?;
    let transcript = parse_transcript(&raw);
    debug!(
        messages = transcript.messages.len(),
        bytes = transcript.bytes,
        "parsed transcript"
    );
    Ok(transcript)
}

fn write_agent_log(path: &Path, log: &str, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    let contents = if log.len() > output_limit {
        let mut cut = output_limit;
        while !log.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}\n[truncated {} bytes]\n", &log[..cut], log.len() - cut)
    } else {
        log.to_string()
    };
    fs::write(path, contents).with_context(|| format!("write agent log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeAgent {
        transcript: Option<&'static str>,
    }

    impl Agent for FakeAgent {
        fn invoke(&self, request: &AgentRequest) -> Result<()> {
            if let Some(raw) = self.transcript {
                fs::write(&request.transcript_path, raw)?;
            }
            Ok(())
        }
    }

    fn request(dir: &Path) -> AgentRequest {
        AgentRequest {
            workdir: dir.to_path_buf(),
            prompt: "prompt".to_string(),
            transcript_path: dir.join("transcript.jsonl"),
            log_path: dir.join("agent.log"),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 1000,
            resume: None,
        }
    }

    #[test]
    fn invoke_and_read_parses_transcript() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fake = FakeAgent {
            transcript: Some(r#"{"role":"assistant","content":"hello"}"#),
        };
        let transcript = invoke_and_read(&fake, &request(temp.path())).expect("read");
        assert_eq!(transcript.last_assistant_text().as_deref(), Some("hello"));
    }

    #[test]
    fn invoke_and_read_errors_on_missing_transcript() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fake = FakeAgent { transcript: None };
        let err = invoke_and_read(&fake, &request(temp.path())).unwrap_err();
        assert!(err.to_string().contains("missing transcript"));
    }

    #[test]
    fn empty_command_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(AgentConfig {
            command: vec![],
            resume_flag: None,
        });
        let err = agent.invoke(&request(temp.path())).unwrap_err();
        assert!(err.to_string().contains("agent command is empty"));
    }

    #[cfg(unix)]
    #[test]
    fn command_agent_tees_stdout_into_transcript() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(AgentConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat >/dev/null; echo '{"role":"assistant","content":"done"}'"#.to_string(),
            ],
            resume_flag: None,
        });
        let req = request(temp.path());
        let transcript = invoke_and_read(&agent, &req).expect("run");
        assert_eq!(transcript.last_assistant_text().as_deref(), Some("done"));
        let log = fs::read_to_string(&req.log_path).expect("log");
        assert!(log.contains("=== stdout ==="));
    }

    #[cfg(unix)]
    #[test]
    fn resume_flag_is_appended() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(AgentConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat >/dev/null; printf '{"role":"assistant","content":"%s %s"}\n' "$0" "$1""#
                    .to_string(),
            ],
            resume_flag: Some("--resume".to_string()),
        });
        let mut req = request(temp.path());
        req.resume = Some("abc".to_string());
        let transcript = invoke_and_read(&agent, &req).expect("run");
        assert_eq!(
            transcript.last_assistant_text().as_deref(),
            Some("--resume abc")
        );
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_reports_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(AgentConfig {
            command: vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            resume_flag: None,
        });
        let err = agent.invoke(&request(temp.path())).unwrap_err();
        assert!(err.to_string().contains("agent failed"));
    }
}
