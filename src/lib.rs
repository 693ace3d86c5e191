//! cbrox: run a command under a cgroup memory limit as an unprivileged user,
//! and generate memory pressure to test such limits.

#[cfg(not(unix))]
compile_error!("cbrox requires a Unix-like system with cgroup v2");

pub mod cgroup;
pub mod cli;
pub mod executor;
pub mod launcher;
pub mod logging;
pub mod privilege;
pub mod reservation;
pub mod stress;
pub mod types;
