//! Logging setup: env-filtered tracing to stderr or the broker's log file.
//!
//! The broker normally runs detached with its stdio nulled, so its default
//! sink is `~/.rcode/logs/ipc.log`. `RCODE_LOG` selects the filter;
//! `RCODE_DEBUG` widens the default from info to debug.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

fn env_filter(debug: bool) -> EnvFilter {
    let default = if debug { "debug" } else { "info" };
    EnvFilter::try_from_env("RCODE_LOG").unwrap_or_else(|_| EnvFilter::new(default))
}

/// Log to stderr (CLI binaries and `--foreground` broker runs).
pub fn init_stderr(debug: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(debug))
        .with_writer(io::stderr)
        .try_init();
}

/// Log to `<log_dir>/ipc.log` without ANSI escapes (detached broker runs).
pub fn init_file(log_dir: &Path, debug: bool) -> io::Result<()> {
    fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("ipc.log"))?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(debug))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(())
}
