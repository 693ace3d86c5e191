/// The `run` pipeline: reserve, limit, enroll, demote, execute
use crate::cgroup::IsolationGroup;
use crate::executor::{self, CommandRunner, ExitOutcome, ShellRunner};
use crate::privilege::{self, AccountDirectory, Demoter, HostIdentity, PrivilegeContext};
use crate::reservation::{HeapReserver, Reserver};
use crate::types::{CbroxError, LaunchConfig, Result};
use log::debug;

/// Launches one command inside the configured isolation group.
pub struct Launcher<R: Reserver, A: AccountDirectory, C: CommandRunner> {
    config: LaunchConfig,
    reserver: R,
    demoter: Demoter<A>,
    runner: C,
}

impl Launcher<HeapReserver, HostIdentity, ShellRunner> {
    /// Launcher backed by the heap, the host passwd database and `/bin/sh`.
    pub fn host(config: LaunchConfig) -> Self {
        Self::new(config, HeapReserver, HostIdentity, ShellRunner::default())
    }
}

impl<R: Reserver, A: AccountDirectory, C: CommandRunner> Launcher<R, A, C> {
    pub fn new(config: LaunchConfig, reserver: R, directory: A, runner: C) -> Self {
        Self {
            config,
            reserver,
            demoter: Demoter::new(directory),
            runner,
        }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn reserver(&self) -> &R {
        &self.reserver
    }

    pub fn runner(&self) -> &C {
        &self.runner
    }

    pub fn directory(&self) -> &A {
        self.demoter.directory()
    }

    pub fn context(&self) -> PrivilegeContext {
        self.demoter.context()
    }

    /// Run `command_line` under a memory limit of `limit_bytes`.
    ///
    /// The reservation is held until this returns, whichever way it returns.
    /// A command that exits non-zero is reported as [`CbroxError::ExecutionFailure`].
    pub fn run(&mut self, command_line: &str, limit_bytes: u64) -> Result<ExitOutcome> {
        privilege::require_elevated(self.demoter.directory())?;

        let _reservation = self.reserver.reserve(limit_bytes)?;

        let group = IsolationGroup::from_config(&self.config);
        debug!(
            "Applying limit of {} bytes through {}",
            limit_bytes,
            group.path().display()
        );
        group.enforce_limit(limit_bytes)?;

        let context = self.demoter.drop_to(&self.config.account)?;

        let outcome = executor::execute_demoted(&mut self.runner, context, command_line)?;
        if !outcome.success() {
            debug!(
                "Command execution failed with exit code {}",
                outcome.code()
            );
            return Err(CbroxError::ExecutionFailure {
                code: outcome.code(),
            });
        }

        Ok(outcome)
    }
}
