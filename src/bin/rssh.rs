use std::process::ExitCode;

use clap::Parser;

use rcode::bridge;
use rcode::config::Config;
use rcode::errors::exit_code_for_io_error;

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
    name = "rssh",
    version,
    long_version = LONG_VERSION,
    about = "ssh, with a reverse-tunneled rcode control channel attached.",
    override_usage = "rssh [OPTIONS] [SSH-ARG]..."
)]
struct Cli {
    /// Broker host (default from ~/.rcode/config.yml, else 127.0.0.1)
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Broker port (default from ~/.rcode/config.yml, else 7532)
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Arguments handed to ssh: flags, destination, optional remote command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "SSH-ARG")]
    ssh_args: Vec<String>,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("rssh: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = config.ensure_dirs() {
        eprintln!("rssh: {e}");
        return ExitCode::from(1);
    }
    rcode::logging::init_stderr(config.debug);

    let host = cli.host.clone().unwrap_or_else(|| config.broker_host.clone());
    let port = cli.port.unwrap_or(config.broker_port);

    // On success the process image is replaced by ssh and this never returns.
    match bridge::run_bridge(&config, &host, port, &cli.ssh_args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rssh: {e}");
            ExitCode::from(exit_code_for_io_error(&e))
        }
    }
}
