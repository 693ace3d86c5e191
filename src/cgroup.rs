/// Isolation group management on the cgroup v2 filesystem
use crate::types::{IsolationError, LaunchConfig};
use log::debug;
use std::fs::{self, DirBuilder, File};
use std::io::{self, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// A named cgroup shared by every invocation.
///
/// The group is created on demand and never removed: repeated runs reuse the
/// same directory and overwrite its limit.
#[derive(Clone, Debug)]
pub struct IsolationGroup {
    cgroup_path: PathBuf,
    limit_file: String,
    procs_file: String,
}

impl IsolationGroup {
    pub fn new(cgroup_path: impl Into<PathBuf>) -> Self {
        let defaults = LaunchConfig::default();
        Self {
            cgroup_path: cgroup_path.into(),
            limit_file: defaults.limit_file,
            procs_file: defaults.procs_file,
        }
    }

    pub fn from_config(config: &LaunchConfig) -> Self {
        Self {
            cgroup_path: config.group_path.clone(),
            limit_file: config.limit_file.clone(),
            procs_file: config.procs_file.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.cgroup_path
    }

    pub fn limit_file(&self) -> PathBuf {
        self.cgroup_path.join(&self.limit_file)
    }

    pub fn procs_file(&self) -> PathBuf {
        self.cgroup_path.join(&self.procs_file)
    }

    /// Create the group, write the limit, then enroll the current process.
    ///
    /// The limit file is closed before the membership file is opened so the
    /// constraint is in force before this process (and its children) join.
    pub fn enforce_limit(&self, limit_bytes: u64) -> Result<(), IsolationError> {
        self.ensure_exists()?;
        self.write_limit(limit_bytes)?;
        self.enroll(std::process::id())
    }

    /// Create the group directory. An existing directory is not an error.
    pub fn ensure_exists(&self) -> Result<(), IsolationError> {
        match DirBuilder::new().mode(0o755).create(&self.cgroup_path) {
            Ok(()) => {
                debug!("Created cgroup {}", self.cgroup_path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && self.cgroup_path.is_dir() => {
                debug!("Reusing cgroup {}", self.cgroup_path.display());
                Ok(())
            }
            Err(e) => Err(IsolationError::CreateFailed {
                path: self.cgroup_path.clone(),
                source: e,
            }),
        }
    }

    pub fn write_limit(&self, limit_bytes: u64) -> Result<(), IsolationError> {
        let path = self.limit_file();
        write_control_file(&path, &limit_bytes.to_string())
            .map_err(|source| IsolationError::LimitWriteFailed { path, source })?;
        debug!("Memory limit set to {} bytes", limit_bytes);
        Ok(())
    }

    pub fn enroll(&self, pid: u32) -> Result<(), IsolationError> {
        let path = self.procs_file();
        write_control_file(&path, &pid.to_string())
            .map_err(|source| IsolationError::EnrollFailed { path, source })?;
        debug!("Added pid {} to cgroup {}", pid, self.cgroup_path.display());
        Ok(())
    }
}

/// Write `content` with no trailing newline and close the file before returning.
fn write_control_file(path: &Path, content: &str) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    file.flush()
}

/// Create, limit and join the group at `group_path` with the default control file names.
pub fn enforce_limit(group_path: &Path, limit_bytes: u64) -> Result<(), IsolationError> {
    IsolationGroup::new(group_path).enforce_limit(limit_bytes)
}

/// Memory controller availability for the group's parent
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerStatus {
    /// The parent is not a cgroup v2 directory
    NoHierarchy(PathBuf),
    /// The parent delegates these controllers, but not `memory`
    MemoryNotDelegated { parent: PathBuf, delegated: Vec<String> },
    MemoryDelegated,
}

impl IsolationGroup {
    /// Check whether the parent of this group hands the memory controller down
    /// to its children.
    ///
    /// Only `memory` listed in the parent's `cgroup.subtree_control` gives the
    /// group a working limit file.
    pub fn memory_controller(&self) -> io::Result<ControllerStatus> {
        let parent = match self.cgroup_path.parent() {
            Some(parent) if parent.join("cgroup.controllers").is_file() => parent,
            Some(parent) => return Ok(ControllerStatus::NoHierarchy(parent.to_path_buf())),
            None => return Ok(ControllerStatus::NoHierarchy(self.cgroup_path.clone())),
        };

        let delegated = controller_list(&parent.join("cgroup.subtree_control"))?;
        if delegated.iter().any(|c| c == "memory") {
            Ok(ControllerStatus::MemoryDelegated)
        } else {
            Ok(ControllerStatus::MemoryNotDelegated {
                parent: parent.to_path_buf(),
                delegated,
            })
        }
    }
}

fn controller_list(path: &Path) -> io::Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content.split_whitespace().map(str::to_string).collect())
}
