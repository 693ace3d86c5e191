/// Logger setup: `[LEVEL] message` lines on stderr
use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;

/// Initialise the global logger once. `debug` raises the default level to debug;
/// `RUST_LOG` still takes precedence when set.
pub fn init(debug: bool) {
    let default_level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let _ = Builder::from_env(Env::default().default_filter_or(default_level.as_str()))
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()))
        .try_init();
}
