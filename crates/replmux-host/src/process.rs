//! Process management utilities

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::{ExitStatus, HostError, HostResult};

/// A tokenized command line: program plus literal arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Split a shell-style string. Quotes and backslash escapes are honored;
    /// nothing is expanded.
    pub fn parse(command: &str) -> HostResult<Self> {
        let argv = shlex::split(command).ok_or_else(|| {
            HostError::InvalidCommand(format!("unbalanced quoting in {:?}", command))
        })?;
        Self::from_argv(argv)
    }

    pub fn from_argv(argv: Vec<String>) -> HostResult<Self> {
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .ok_or_else(|| HostError::InvalidCommand("empty command".into()))?;
        Ok(Self {
            program,
            args: argv.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(&self.program).chain(&self.args);
        for (i, word) in words.enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", shell_escape::unix::escape(Cow::Borrowed(word.as_str())))?;
        }
        Ok(())
    }
}

/// Signal target for a spawned process group.
///
/// Copyable, so the task that reaps the child and the task that decides to
/// stop it do not have to share the [`Child`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    pgid: u32,
}

impl ProcessGroup {
    pub fn id(&self) -> u32 {
        self.pgid
    }

    /// Send SIGTERM to the process group
    pub fn terminate(&self) -> HostResult<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL to the process group
    pub fn kill(&self) -> HostResult<()> {
        self.signal(Signal::SIGKILL)
    }

    fn signal(&self, sig: Signal) -> HostResult<()> {
        let pgid = Pid::from_raw(-(self.pgid as i32)); // Negative for process group

        match signal::kill(pgid, sig) {
            Ok(()) => {
                debug!(pgid = self.pgid, signal = %sig, "Signaled process group");
                Ok(())
            }
            Err(nix::errno::Errno::ESRCH) => {
                // Process already gone
                Ok(())
            }
            Err(e) => Err(HostError::StopFailed(format!(
                "Failed to send {}: {}",
                sig, e
            ))),
        }
    }
}

/// Stdio handles of a spawned process
#[derive(Debug)]
pub struct ProcessStdio {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Managed child process with process group
#[derive(Debug)]
pub struct ManagedProcess {
    child: Child,
    pid: u32,
    group: ProcessGroup,
}

impl ManagedProcess {
    /// Spawn a new process in its own process group with all three stdio
    /// streams piped.
    ///
    /// The child inherits this process's environment, extended by `env`.
    pub fn spawn(
        command: &CommandLine,
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> HostResult<Self> {
        let mut cmd = Command::new(command.program());
        cmd.args(command.args())
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The child becomes the leader of a new process group
            .process_group(0)
            .kill_on_drop(true);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| {
            HostError::SpawnFailed(format!("Failed to spawn {}: {}", command.program(), e))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| HostError::SpawnFailed("process exited before it was observed".into()))?;
        let group = ProcessGroup { pgid: pid }; // process_group(0) makes pid == pgid

        debug!(pid = pid, pgid = pid, command = %command, "Process spawned");

        Ok(Self { child, pid, group })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn group(&self) -> ProcessGroup {
        self.group
    }

    /// Detach the piped stdio handles; callable once
    pub fn take_stdio(&mut self) -> HostResult<ProcessStdio> {
        let missing = || HostError::Internal("stdio already taken".into());
        Ok(ProcessStdio {
            stdin: self.child.stdin.take().ok_or_else(missing)?,
            stdout: self.child.stdout.take().ok_or_else(missing)?,
            stderr: self.child.stderr.take().ok_or_else(missing)?,
        })
    }

    /// Wait for the process to exit and reap it
    pub async fn wait(&mut self) -> HostResult<ExitStatus> {
        self.child
            .wait()
            .await
            .map(ExitStatus::from)
            .map_err(|e| HostError::Internal(format!("Wait failed: {}", e)))
    }
}
