/// Core types and errors for cbrox
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const MIB: u64 = 1024 * 1024;

/// Exit code reported for every launcher fault (-1, seen as 255 by the parent).
pub const FAILURE_EXIT_CODE: i32 = -1;

/// Launcher configuration. Every value the tool would otherwise hardcode lives here.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LaunchConfig {
    /// Directory of the shared isolation group on the cgroup filesystem
    pub group_path: PathBuf,
    /// Name of the memory limit control file inside the group
    pub limit_file: String,
    /// Name of the membership control file inside the group
    pub procs_file: String,
    /// Unprivileged account the launcher demotes to before running the command
    pub account: String,
    /// Size of a single stress allocation in bytes
    pub chunk_size: usize,
    /// Pause between stress allocations in milliseconds
    pub pause_ms: u64,
    /// Minimum spacing between stress progress lines in milliseconds
    pub progress_interval_ms: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            group_path: PathBuf::from("/sys/fs/cgroup/cbrox"),
            limit_file: "memory.max".to_string(),
            procs_file: "cgroup.procs".to_string(),
            account: "nobody".to_string(),
            chunk_size: MIB as usize,
            pause_ms: 50,
            progress_interval_ms: 1000,
        }
    }
}

impl LaunchConfig {
    /// Load a JSON configuration file; absent fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CbroxError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            CbroxError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// A `y`/`n` command line switch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Flag {
    Yes,
    #[default]
    No,
}

impl Flag {
    pub fn is_set(self) -> bool {
        self == Flag::Yes
    }
}

impl FromStr for Flag {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "y" => Ok(Flag::Yes),
            "n" => Ok(Flag::No),
            other => Err(format!("expected 'y' or 'n', got '{}'", other)),
        }
    }
}

/// Failures while preparing the isolation group
#[derive(Error, Debug)]
pub enum IsolationError {
    #[error("Failed to create cgroup directory {path}: {source}")]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write memory limit to {path}: {source}")]
    LimitWriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to add process to cgroup via {path}: {source}")]
    EnrollFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum PrivilegeError {
    #[error("Unknown account '{0}'")]
    UnknownAccount(String),

    #[error("Failed to look up account '{account}': {reason}")]
    LookupFailed { account: String, reason: String },

    #[error("Failed to drop privileges to uid {uid}: {reason}")]
    SwitchFailed { uid: u32, reason: String },

    #[error("Privileges have already been dropped")]
    NotElevated,

    #[error("Refusing to run a command before privileges are dropped")]
    NotDemoted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("Out of memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },

    #[error("Insufficient space in memory block: requested {requested} bytes, available {available} bytes")]
    InsufficientSpace { requested: usize, available: usize },
}

/// Top-level error for every cbrox operation
#[derive(Error, Debug)]
pub enum CbroxError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("This program must be run as root or with sudo privileges")]
    PrivilegeRequired,

    #[error(transparent)]
    Isolation(#[from] IsolationError),

    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("Command execution failed with exit code {code}")]
    ExecutionFailure { code: i32 },

    #[error("Failed to spawn shell: {0}")]
    Spawn(io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CbroxError {
    /// Process exit code for this failure. A failing child's status is mirrored.
    pub fn exit_code(&self) -> i32 {
        match self {
            CbroxError::ExecutionFailure { code } => *code,
            _ => FAILURE_EXIT_CODE,
        }
    }
}

pub type Result<T> = std::result::Result<T, CbroxError>;

/// Convert a megabyte count into the byte limit written to the cgroup.
pub fn megabytes_to_bytes(megabytes: u64) -> Option<u64> {
    megabytes.checked_mul(MIB)
}
