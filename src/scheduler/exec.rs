use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{JobError, Result};
use crate::scheduler::probe::exit_code;

/// What to run: a shell string (`sh -c`) or an argument vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobCommand {
    Shell(String),
    Exec(Vec<String>),
}

impl JobCommand {
    pub fn shell(command: impl Into<String>) -> Self {
        JobCommand::Shell(command.into())
    }

    pub fn exec<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        JobCommand::Exec(argv.into_iter().map(Into::into).collect())
    }

    pub fn is_shell(&self) -> bool {
        matches!(self, JobCommand::Shell(_))
    }
}

impl std::fmt::Display for JobCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobCommand::Shell(command) => write!(f, "{}", command),
            JobCommand::Exec(argv) => write!(f, "{}", argv.join(" ")),
        }
    }
}

/// Build a process for `command` with piped output, no stdin and the given
/// environment overrides applied in order.
pub(crate) fn build_command(
    command: &JobCommand,
    working_dir: Option<&Path>,
    env: &[(String, String)],
) -> Result<Command> {
    let mut cmd = match command {
        JobCommand::Shell(line) => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(line);
            cmd
        }
        JobCommand::Exec(argv) => {
            let (program, args) = argv.split_first().ok_or_else(|| {
                JobError::Spawn(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "empty argument vector",
                ))
            })?;
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    };

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    Ok(cmd)
}

/// Result of a command run to completion outside the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `command` to completion and collect its output.
///
/// Takes no locks and bypasses the queue; meant for quick checks whose result
/// the caller needs right away.
pub async fn run_command(
    command: &JobCommand,
    working_dir: Option<&Path>,
    env: &[(String, String)],
) -> Result<CommandOutput> {
    tracing::debug!(command = %command, "Running command");

    let output = build_command(command, working_dir, env)?
        .output()
        .await
        .map_err(JobError::Spawn)?;

    let result = CommandOutput {
        exit_code: exit_code(output.status),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };

    tracing::debug!(
        command = %command,
        exit_code = result.exit_code,
        "Command finished"
    );

    Ok(result)
}
