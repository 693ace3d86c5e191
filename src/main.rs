/// cbrox: run a program inside a memory-limited cgroup as an unprivileged user
///
/// The launcher reserves a block the size of the requested limit, creates (or
/// reuses) the isolation group, writes the limit, joins the group, drops to the
/// unprivileged account and only then hands the command line to `/bin/sh -c`.
///
/// # Usage
/// ```bash
/// sudo cbrox run 'stress --vm 1 --vm-bytes 512M --timeout 10s' 100 n y
/// sudo cbrox stress 500 y
/// cbrox help
/// ```
use anyhow::{Context, Result};
use cbrox::cli::{self, Invocation};
use cbrox::logging;
use cbrox::types::{CbroxError, FAILURE_EXIT_CODE};
use log::error;

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<CbroxError>() {
                Some(CbroxError::InvalidArgument(_)) => {
                    eprintln!("{}", cli::usage());
                    FAILURE_EXIT_CODE
                }
                Some(err) => err.exit_code(),
                None => FAILURE_EXIT_CODE,
            }
        }
    };

    std::process::exit(code);
}

fn run() -> Result<i32> {
    let (invocation, config) = match cli::validate(std::env::args_os()) {
        Ok(parsed) => parsed,
        Err(e) => {
            logging::init(false);
            return Err(e.into());
        }
    };
    logging::init(invocation.debug());

    let context = match &invocation {
        Invocation::Run(request) => format!("run '{}'", request.command),
        Invocation::Stress(request) => format!("stress {} MB", request.megabytes),
        Invocation::Help | Invocation::Version => String::from("help"),
    };

    cli::dispatch(&invocation, &config).with_context(|| format!("cbrox {} failed", context))
}
