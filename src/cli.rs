/// Command line interface: argument validation and subcommand dispatch
use crate::cgroup::{ControllerStatus, IsolationGroup};
use crate::launcher::Launcher;
use crate::privilege::{self, HostIdentity};
use crate::stress;
use crate::types::{megabytes_to_bytes, CbroxError, Flag, LaunchConfig, Result, MIB};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use log::{debug, warn};
use std::ffi::OsString;
use std::path::PathBuf;

const USAGE: &str = "\
cbrox - Run programs with cgroup memory limits and generate memory pressure

Usage: cbrox [OPTIONS] <command> ...

Commands:
  run <program_name> <size_in_megabytes> [automation y/n] [debug y/n]
        Run a program within a memory-limited cgroup as an unprivileged user.
          <program_name>       The command line to run (passed to /bin/sh -c).
          <size_in_megabytes>  Memory limit (in MB) for the program.
          [automation y/n]     Automation flag (default n).
          [debug y/n]          Print diagnostic lines (default n).
  stress <size_in_megabytes> [debug y/n]
        Stress test by allocating memory in 1 MB chunks.
  help  Show this help message.

Options:
  --config <FILE>        JSON configuration file
  --cgroup-path <PATH>   Isolation group directory [env: CBROX_CGROUP_PATH]
  --user <ACCOUNT>       Account to drop privileges to [env: CBROX_USER]

Example usage:
  cbrox run 'stress --vm 1 --vm-bytes 512M --timeout 10s' 100 n y
  cbrox stress 500 y
  cbrox help
";

/// Usage text printed by `help` and after every invalid invocation
pub fn usage() -> &'static str {
    USAGE
}

#[derive(Parser, Debug)]
#[command(name = "cbrox", version)]
#[command(override_help = USAGE, disable_help_subcommand = true)]
pub struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Isolation group directory
    #[arg(long, global = true, env = "CBROX_CGROUP_PATH", value_name = "PATH")]
    pub cgroup_path: Option<PathBuf>,

    /// Account to drop privileges to
    #[arg(long, global = true, env = "CBROX_USER", value_name = "ACCOUNT")]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a program within a memory-limited cgroup
    Run {
        /// Command line handed to the shell
        #[arg(allow_hyphen_values = true)]
        command: String,

        /// Memory limit in MB
        #[arg(value_parser = parse_size_mb)]
        size_mb: u64,

        /// Automation flag (y/n)
        #[arg(value_parser = parse_flag, default_value = "n")]
        automation: Flag,

        /// Debug output (y/n)
        #[arg(value_parser = parse_flag, default_value = "n")]
        debug: Flag,
    },

    /// Stress test by allocating memory in chunks
    Stress {
        /// Total memory to allocate in MB
        #[arg(value_parser = parse_size_mb)]
        size_mb: u64,

        /// Debug output (y/n)
        #[arg(value_parser = parse_flag, default_value = "n")]
        debug: Flag,
    },

    /// Show this help message
    Help,
}

/// Accept a positive megabyte count whose byte value fits in 64 bits.
pub fn parse_size_mb(raw: &str) -> std::result::Result<u64, String> {
    let megabytes: u64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a positive whole number of megabytes", raw))?;
    if megabytes == 0 {
        return Err("Memory size must be greater than zero".to_string());
    }
    if megabytes_to_bytes(megabytes).is_none() {
        return Err(format!("{} MB does not fit in a 64-bit byte count", megabytes));
    }
    Ok(megabytes)
}

pub fn parse_flag(raw: &str) -> std::result::Result<Flag, String> {
    raw.parse()
}

/// A validated request to run a command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunRequest {
    pub command: String,
    pub megabytes: u64,
    pub automation: Flag,
    pub debug: Flag,
}

impl RunRequest {
    pub fn limit_bytes(&self) -> u64 {
        self.megabytes * MIB
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StressRequest {
    pub megabytes: u64,
    pub debug: Flag,
}

impl StressRequest {
    pub fn target_bytes(&self) -> u64 {
        self.megabytes * MIB
    }
}

/// What the user asked for, after validation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Invocation {
    Run(RunRequest),
    Stress(StressRequest),
    Help,
    Version,
}

impl Invocation {
    pub fn debug(&self) -> bool {
        match self {
            Invocation::Run(run) => run.debug.is_set(),
            Invocation::Stress(stress) => stress.debug.is_set(),
            Invocation::Help | Invocation::Version => false,
        }
    }
}

impl Cli {
    pub fn invocation(&self) -> Invocation {
        match &self.command {
            Commands::Run {
                command,
                size_mb,
                automation,
                debug,
            } => Invocation::Run(RunRequest {
                command: command.clone(),
                megabytes: *size_mb,
                automation: *automation,
                debug: *debug,
            }),
            Commands::Stress { size_mb, debug } => Invocation::Stress(StressRequest {
                megabytes: *size_mb,
                debug: *debug,
            }),
            Commands::Help => Invocation::Help,
        }
    }

    /// Defaults, then the config file, then `--cgroup-path` / `--user`.
    pub fn launch_config(&self) -> Result<LaunchConfig> {
        let mut config = match &self.config {
            Some(path) => LaunchConfig::load(path)?,
            None => LaunchConfig::default(),
        };
        if let Some(path) = &self.cgroup_path {
            config.group_path = path.clone();
        }
        if let Some(user) = &self.user {
            config.account = user.clone();
        }
        Ok(config)
    }
}

/// Parse and validate an argument vector (including the program name).
///
/// Nothing is allocated and nothing is written here.
pub fn validate<I, T>(args: I) -> Result<(Invocation, LaunchConfig)>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            return match e.kind() {
                ErrorKind::DisplayHelp => Ok((Invocation::Help, LaunchConfig::default())),
                ErrorKind::DisplayVersion => Ok((Invocation::Version, LaunchConfig::default())),
                ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand | ErrorKind::MissingSubcommand => {
                    Err(CbroxError::InvalidArgument("no command given".to_string()))
                }
                _ => Err(CbroxError::InvalidArgument(clap_reason(&e))),
            };
        }
    };

    let config = cli.launch_config()?;
    Ok((cli.invocation(), config))
}

/// First line of a clap error without its `error: ` prefix.
fn clap_reason(e: &clap::Error) -> String {
    let rendered = e.to_string();
    rendered
        .lines()
        .next()
        .unwrap_or_default()
        .trim_start_matches("error: ")
        .to_string()
}

/// Execute a validated invocation against the host. Returns the process exit code.
pub fn dispatch(invocation: &Invocation, config: &LaunchConfig) -> Result<i32> {
    match invocation {
        Invocation::Help => {
            println!("{}", USAGE);
            Ok(0)
        }
        Invocation::Version => {
            println!("cbrox {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
        Invocation::Run(request) => run(request, config),
        Invocation::Stress(request) => {
            privilege::require_elevated(&HostIdentity)?;
            // Shortfalls are logged by the generator; exhaustion still exits 0
            stress::stress(request.target_bytes(), config);
            Ok(0)
        }
    }
}

fn run(request: &RunRequest, config: &LaunchConfig) -> Result<i32> {
    check_memory_controller(config);
    debug!(
        "Run request: command={:?} size={} MB automation={:?}",
        request.command, request.megabytes, request.automation
    );

    let mut launcher = Launcher::host(config.clone());
    launcher.run(&request.command, request.limit_bytes())?;
    Ok(0)
}

fn check_memory_controller(config: &LaunchConfig) {
    match IsolationGroup::from_config(config).memory_controller() {
        Ok(ControllerStatus::MemoryDelegated) => {
            debug!("memory controller delegated to {}", config.group_path.display());
        }
        Ok(ControllerStatus::NoHierarchy(parent)) => warn!(
            "{} is not a cgroup v2 directory; the memory limit may not be enforced",
            parent.display()
        ),
        Ok(ControllerStatus::MemoryNotDelegated { parent, delegated }) => warn!(
            "memory controller is not enabled in {}/cgroup.subtree_control (enabled: {})",
            parent.display(),
            delegated.join(" ")
        ),
        Err(e) => warn!("Failed to read cgroup controllers: {}", e),
    }
}
