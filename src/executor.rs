/// Command execution through the host shell
use crate::privilege::PrivilegeContext;
use crate::types::{CbroxError, PrivilegeError, Result};
use log::debug;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};

/// How the launched command finished
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited normally with this status code
    Exited(i32),
    /// Killed by this signal
    Signaled(i32),
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }

    /// Status code in shell convention: signals are reported as 128 + signal.
    pub fn code(&self) -> i32 {
        match *self {
            ExitOutcome::Exited(code) => code,
            ExitOutcome::Signaled(signal) => 128 + signal,
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Exited(code),
            (None, Some(signal)) => ExitOutcome::Signaled(signal),
            (None, None) => ExitOutcome::Exited(-1),
        }
    }
}

/// Runs a command line and waits for it to finish
pub trait CommandRunner {
    fn execute(&mut self, command_line: &str) -> Result<ExitOutcome>;
}

/// Hands the command line verbatim to `sh -c`.
///
/// Shell metacharacters are interpreted; the caller owns the string.
#[derive(Clone, Debug)]
pub struct ShellRunner {
    shell: PathBuf,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl ShellRunner {
    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl CommandRunner for ShellRunner {
    fn execute(&mut self, command_line: &str) -> Result<ExitOutcome> {
        debug!("Running command: {}", command_line);
        let status = Command::new(&self.shell)
            .arg("-c")
            .arg(command_line)
            .status()
            .map_err(CbroxError::Spawn)?;
        Ok(ExitOutcome::from(status))
    }
}

/// Run `command_line` only once the process has been demoted.
pub fn execute_demoted<C: CommandRunner>(
    runner: &mut C,
    context: PrivilegeContext,
    command_line: &str,
) -> Result<ExitOutcome> {
    if !context.is_demoted() {
        return Err(PrivilegeError::NotDemoted.into());
    }
    runner.execute(command_line)
}
