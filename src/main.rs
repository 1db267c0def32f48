use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use rcode::config::Config;
use rcode::ide;

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

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum Ide {
    Code,
    Cursor,
    Windsurf,
}

impl Ide {
    fn as_str(self) -> &'static str {
        match self {
            Ide::Code => "code",
            Ide::Cursor => "cursor",
            Ide::Windsurf => "windsurf",
        }
    }
}

impl std::fmt::Display for Ide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "rcode",
    version,
    long_version = LONG_VERSION,
    about = "Open VS Code, Cursor or Windsurf on a remote path, from either end of an rssh session.",
    override_usage = "rcode [OPTIONS] <HOST> <DIR>   (local)\n       rcode [OPTIONS] <DIR>          (remote)"
)]
struct Cli {
    /// IDE to launch
    #[arg(long, value_enum, default_value_t = Ide::Code)]
    ide: Ide,

    /// Reopen the most recently recorded shortcut
    #[arg(short = 'l', long)]
    latest: bool,

    /// Open a recorded shortcut by name
    #[arg(long = "open-shortcut", value_name = "NAME")]
    open_shortcut: Option<String>,

    /// Shortcut name recorded for this open
    #[arg(long = "name", default_value = "latest", value_name = "NAME")]
    shortcut_name: String,

    /// `<host> <dir>` on the local machine; `<dir>` on a remote one
    #[arg(value_name = "ARG")]
    args: Vec<String>,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("rcode: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = config.ensure_dirs() {
        eprintln!("rcode: {e}");
        return ExitCode::from(1);
    }
    rcode::logging::init_stderr(config.debug);

    let bin = cli.ide.as_str();
    let result = if cli.latest {
        ide::run_latest(&config, bin)
    } else if let Some(name) = &cli.open_shortcut {
        ide::run_shortcut(&config, bin, name)
    } else if ide::is_remote_context() && cli.args.len() == 1 {
        match std::path::absolute(&cli.args[0]) {
            Ok(dir) => ide::run_remote(&config, bin, &dir),
            Err(e) => Err(e.into()),
        }
    } else if cli.args.len() >= 2 {
        ide::run_local(&config, bin, &cli.args[0], &cli.args[1], &cli.shortcut_name)
    } else {
        eprintln!("rcode: expected <host> <dir> on the local machine or <dir> on a remote one; see --help");
        return ExitCode::from(1);
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rcode: failed to run {bin}: {e:#}");
            ExitCode::from(1)
        }
    }
}
