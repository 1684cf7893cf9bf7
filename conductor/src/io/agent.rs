//! Agent invocation seam.
//!
//! The [`AgentInvoker`] trait decouples step orchestration from the agent
//! backend. The process-backed invoker feeds the prompt on stdin and treats
//! the child's stdout as the station's raw return text. Tests use scripted
//! invokers that return predetermined text without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Environment failures: the run halts for a fix instead of consuming an
/// attempt, so retry budgets are not wasted on broken tooling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MechanicalFailure {
    #[error("agent command timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("agent command could not be spawned: {reason}")]
    Spawn { reason: String },
    #[error("agent command exited with status {code:?}")]
    Exit { code: Option<i32> },
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Working directory; also the staging root the agent writes into.
    pub workdir: PathBuf,
    /// Assembled prompt pack fed on stdin.
    pub prompt: String,
    /// Wall-clock budget for the invocation.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Path for the invocation log (stdout/stderr capture).
    pub log_path: PathBuf,
    /// Advisory model hint passed through to the backend.
    pub model_hint: Option<String>,
}

/// Abstraction over agent backends.
pub trait AgentInvoker {
    /// Run the agent and return its raw return text.
    fn invoke(&self, request: &InvokeRequest) -> Result<String>;
}

/// Invoker that spawns the configured agent command.
pub struct ProcessAgentInvoker {
    command: Vec<String>,
}

impl ProcessAgentInvoker {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl AgentInvoker for ProcessAgentInvoker {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &InvokeRequest) -> Result<String> {
        let program = self
            .command
            .first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        info!(program = %program, workdir = %request.workdir.display(), "invoking agent");

        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..]).current_dir(&request.workdir);
        if let Some(hint) = &request.model_hint {
            cmd.env("CONDUCTOR_MODEL_HINT", hint);
        }

        let output = match run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %err, "agent spawn failed");
                return Err(MechanicalFailure::Spawn {
                    reason: format!("{err:#}"),
                }
                .into());
            }
        };

        write_invocation_log(&request.log_path, &output)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(MechanicalFailure::Timeout {
                secs: request.timeout.as_secs(),
            }
            .into());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent exited nonzero");
            return Err(MechanicalFailure::Exit {
                code: output.status.code(),
            }
            .into());
        }

        debug!("agent invocation completed");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn write_invocation_log(path: &Path, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create invocation log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.truncation_notice("agent"));
    if output.timed_out {
        buf.push_str("\n[agent timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write invocation log {}", path.display()))
}
