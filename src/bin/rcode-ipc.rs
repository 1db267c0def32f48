use std::net::TcpListener;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use rcode::broker::{self, BrokerServer};
use rcode::config::Config;
use rcode::logging;
use rcode::session::SessionRegistry;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (built ",
    env!("RCODE_BUILD_DATE"),
    ", ",
    env!("RCODE_BUILD_TARGET"),
    ", ",
    env!("RCODE_BUILD_PROFILE"),
    ", ",
    env!("RCODE_BUILD_RUSTC"),
    ")"
);

#[derive(Parser, Debug)]
#[command(
    name = "rcode-ipc",
    version,
    long_version = LONG_VERSION,
    about = "Session broker for rssh and rcode."
)]
struct Cli {
    /// Bind host (default from ~/.rcode/config.yml, else 127.0.0.1)
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Bind port (default from ~/.rcode/config.yml, else 7532)
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Stop after this long with zero sessions (e.g. 600s, 10m)
    #[arg(long = "max-idle", value_parser = humantime::parse_duration, value_name = "DURATION")]
    max_idle: Option<Duration>,

    /// Log to stderr instead of ~/.rcode/logs/ipc.log
    #[arg(long)]
    foreground: bool,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("rcode-ipc: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = config.ensure_dirs() {
        eprintln!("rcode-ipc: {e}");
        return ExitCode::from(1);
    }
    if cli.foreground {
        logging::init_stderr(config.debug);
    } else if let Err(e) = logging::init_file(&config.log_dir, config.debug) {
        eprintln!("rcode-ipc: failed to open log file: {e}");
        return ExitCode::from(1);
    }

    let host = cli.host.clone().unwrap_or_else(|| config.broker_host.clone());
    let port = cli.port.unwrap_or(config.broker_port);
    let max_idle = cli.max_idle.unwrap_or(config.max_idle);

    // One broker per host: a second instance on the same port exits early.
    let _lock = match broker::acquire_broker_lock(port) {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("rcode-ipc: {e}");
            return ExitCode::from(1);
        }
    };

    #[cfg(unix)]
    broker::install_signal_handlers();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        built = env!("RCODE_BUILD_DATE"),
        target = env!("RCODE_BUILD_TARGET"),
        rustc = env!("RCODE_BUILD_RUSTC"),
        "rcode-ipc starting"
    );

    let registry = Arc::new(SessionRegistry::new(config.key_files()));
    let server = BrokerServer::new(&config, registry, max_idle);
    let listener = match TcpListener::bind((host.as_str(), port)) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("rcode-ipc: broker bind failed on {host}:{port}: {e}");
            return ExitCode::from(1);
        }
    };
    match server.serve(listener) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rcode-ipc: {e}");
            ExitCode::from(1)
        }
    }
}
