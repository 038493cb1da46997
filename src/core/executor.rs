use std::fmt;
use std::process::Stdio;

use async_trait::async_trait;
use nix::unistd::Uid;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{FlashError, Result};

/// An external program invocation, optionally fed scripted input lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin_lines: Vec<String>,
}

impl PrivilegedCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin_lines: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Lines written to the program's stdin, each newline-terminated.
    pub fn stdin_lines<I, A>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.stdin_lines = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn stdin_text(&self) -> Option<String> {
        if self.stdin_lines.is_empty() {
            return None;
        }
        Some(self.stdin_lines.iter().map(|l| format!("{l}\n")).collect())
    }
}

impl fmt::Display for PrivilegedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
}

/// Runs external programs with root privileges.
///
/// A non-zero exit status is reported as [`FlashError::CommandFailed`].
/// Implementations are shared by every worker and must be stateless.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &PrivilegedCommand) -> Result<CommandOutput>;
}

/// Runs commands on the host, through `sudo -n` unless already root.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    use_sudo: bool,
}

impl SystemRunner {
    pub fn detect() -> Self {
        let use_sudo = !Uid::effective().is_root();
        if use_sudo {
            debug!("Not running as root, commands will go through sudo");
        }
        Self { use_sudo }
    }

    /// Probe root access by running `sync`. Fails when sudo would need a
    /// password or is not permitted.
    pub async fn ensure_privileges(&self) -> Result<()> {
        self.run(&PrivilegedCommand::new("sync")).await.map(|_| ())
    }

    fn build(&self, command: &PrivilegedCommand) -> Command {
        if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(&command.program).args(&command.args);
            cmd
        } else {
            let mut cmd = Command::new(&command.program);
            cmd.args(&command.args);
            cmd
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &PrivilegedCommand) -> Result<CommandOutput> {
        let stdin = command.stdin_text();
        let mut process = self.build(command);
        process
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        trace!(command = %command, "Spawning");
        let mut child = process.spawn().map_err(|e| FlashError::CommandSpawn {
            command: command.to_string(),
            source: e,
        })?;

        if let (Some(text), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(text.as_bytes())
                .await
                .map_err(|e| FlashError::CommandSpawn {
                    command: command.to_string(),
                    source: e,
                })?;
            // Dropping the pipe closes stdin so interactive tools see EOF
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| FlashError::CommandSpawn {
                command: command.to_string(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(FlashError::CommandFailed {
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}
