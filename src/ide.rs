/*!
IDE launching: the remote-side tunnel caller, the local open-and-record
flow, and the remote-CLI fallback discovery.

On a remote host the preferred path is the session tunnel: derive the
socket path from the environment, ask the local broker to open the folder.
When no session is present (plain ssh) or the tunnel call fails, fall back
to the IDE's own remote CLI, which needs the freshest live
`vscode-ipc-*.sock` belonging to a running `<bin>-server`.
*/

use std::env;
use std::ffi::OsStr;
use std::fs;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use walkdir::WalkDir;

use crate::broker::remote_uri;
use crate::bridge::tunnel_socket_path;
use crate::client::BrokerClient;
use crate::config::Config;
use crate::errors::{display_for_broker_error, BrokerError};
use crate::protocol::OpenIdeParams;
use crate::shortcuts;
use crate::sshconf::SshConfig;
use crate::util::output_with_timeout;

/// IDE ipc sockets idle longer than this are considered stale.
pub const SOCKET_MAX_IDLE: Duration = Duration::from_secs(4 * 60 * 60);

const LSOF_TIMEOUT: Duration = Duration::from_secs(2);

/// Environment probe: are we inside a bridged remote shell or any ssh
/// session?
pub fn is_remote_context() -> bool {
    session_env().is_some() || env::var("SSH_CLIENT").map(|v| !v.is_empty()).unwrap_or(false)
}

/// Session credentials exported by the bridge, when both are present.
pub fn session_env() -> Option<(String, String)> {
    let sid = env::var("RCODE_SID").ok().filter(|s| !s.is_empty())?;
    let skey = env::var("RCODE_SKEY").ok().filter(|s| !s.is_empty())?;
    Some((sid, skey))
}

/// Ask the local side, through the session tunnel, to open `path`.
#[cfg(unix)]
pub fn open_via_tunnel(sid: &str, skey: &str, bin: &str, path: &str) -> Result<(), BrokerError> {
    let sock = tunnel_socket_path(sid);
    let mut conn = BrokerClient::connect_unix(&sock)?;
    let result = conn.open_ide(&OpenIdeParams {
        sid: sid.to_string(),
        skey: skey.to_string(),
        bin: bin.to_string(),
        path: path.to_string(),
    });
    conn.close();
    result
}

/// Remote flow: tunnel first, remote CLI as fallback.
pub fn run_remote(config: &Config, bin: &str, dir: &Path) -> Result<()> {
    let meta = fs::metadata(dir).with_context(|| format!("cannot open {}", dir.display()))?;
    if !meta.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    if !config.supported_ides.contains(bin) {
        bail!("unsupported ide: {bin}");
    }

    #[cfg(unix)]
    if let Some((sid, skey)) = session_env() {
        match open_via_tunnel(&sid, &skey, bin, &dir.to_string_lossy()) {
            Ok(()) => return Ok(()),
            Err(e) => eprintln!(
                "rcode: tunnel call failed: {}; falling back to the IDE remote cli",
                display_for_broker_error(&e)
            ),
        }
    }

    let cli = locate_remote_cli(config, bin)?;
    let sock = locate_ipc_socket(bin)?;
    let status = Command::new(&cli)
        .arg(dir)
        .arg(&sock)
        .env("VSCODE_IPC_HOOK_CLI", &sock)
        .status()
        .with_context(|| format!("failed to run {}", cli.display()))?;
    if !status.success() {
        bail!("{} exited with {status}", cli.display());
    }
    Ok(())
}

/// Local flow: expand `~/` against the ssh config, record the shortcut,
/// launch the IDE against the remote URI.
pub fn run_local(
    config: &Config,
    bin: &str,
    hostname: &str,
    dir: &str,
    shortcut_name: &str,
) -> Result<()> {
    if !config.supported_ides.contains(bin) {
        bail!("unsupported ide: {bin}");
    }
    let dir = expand_remote_home(config, hostname, dir)?;
    let uri = remote_uri(hostname, &dir);
    url::Url::parse(&uri).with_context(|| format!("invalid folder uri {uri}"))?;
    shortcuts::append(&config.shortcuts_file, shortcut_name, &uri)
        .with_context(|| format!("failed to record shortcut in {}", config.shortcuts_file.display()))?;
    launch(bin, &uri)
}

/// Reopen the most recently recorded location.
pub fn run_latest(config: &Config, bin: &str) -> Result<()> {
    let uri = shortcuts::latest(&config.shortcuts_file)
        .with_context(|| format!("failed to read {}", config.shortcuts_file.display()))?
        .ok_or_else(|| anyhow!("no shortcuts recorded yet"))?;
    launch(bin, &uri)
}

/// Reopen a named shortcut.
pub fn run_shortcut(config: &Config, bin: &str, name: &str) -> Result<()> {
    let uri = shortcuts::named(&config.shortcuts_file, name)
        .with_context(|| format!("failed to read {}", config.shortcuts_file.display()))?
        .ok_or_else(|| anyhow!("shortcut not found: {name}"))?;
    launch(bin, &uri)
}

fn launch(bin: &str, uri: &str) -> Result<()> {
    let status = Command::new(bin)
        .arg("--folder-uri")
        .arg(uri)
        .status()
        .with_context(|| format!("failed to run {bin}"))?;
    if !status.success() {
        bail!("{bin} exited with {status}");
    }
    Ok(())
}

fn expand_remote_home(config: &Config, hostname: &str, dir: &str) -> Result<String> {
    let Some(rest) = dir.strip_prefix("~/") else {
        return Ok(dir.to_string());
    };
    let conf = SshConfig::load(&config.ssh_config_file);
    let block = conf.host(hostname).ok_or_else(|| {
        anyhow!(
            "couldn't expand the remote home directory: {hostname} not found in {}",
            config.ssh_config_file.display()
        )
    })?;
    Ok(format!("/home/{}/{}", block.user_or("root"), rest))
}

fn server_dir_name(bin: &str) -> &str {
    // VS Code installs under .vscode-server; the other IDEs use their own
    // binary name.
    if bin == "code" {
        "vscode"
    } else {
        bin
    }
}

/// Locate the IDE's remote CLI under the home directory, newest server
/// build first.
pub fn locate_remote_cli(config: &Config, bin: &str) -> Result<PathBuf> {
    let server_home = config
        .home
        .join(format!(".{}-server", server_dir_name(bin)));

    let stable = entries_matching(&server_home.join("cli").join("servers"), |name| {
        name.starts_with("Stable-")
    });
    if let Some(newest) = newest_first(stable).into_iter().next() {
        return Ok(newest.join("server").join("bin").join("remote-cli").join(bin));
    }

    let legacy = entries_matching(&server_home.join("bin"), |_| true);
    if let Some(newest) = newest_first(legacy).into_iter().next() {
        return Ok(newest.join("bin").join("remote-cli").join(bin));
    }

    bail!(
        "can't find {} under the home directory; install the {bin} remote server first",
        server_home.display()
    )
}

/// Find the freshest live IDE ipc socket owned by a running `<bin>-server`.
pub fn locate_ipc_socket(bin: &str) -> Result<PathBuf> {
    #[cfg(unix)]
    let dir = PathBuf::from(format!("/run/user/{}", nix::unistd::getuid()));
    #[cfg(not(unix))]
    let dir = PathBuf::from("/run/user/0");

    let sockets = entries_matching(&dir, |name| {
        name.starts_with("vscode-ipc-") && name.ends_with(".sock")
    });
    let now = SystemTime::now();
    for path in newest_first(sockets) {
        let atime = access_time(&path);
        if now
            .duration_since(atime)
            .map(|idle| idle > SOCKET_MAX_IDLE)
            .unwrap_or(false)
        {
            continue;
        }
        if socket_connects(&path) && socket_owner_matches(&path, bin) {
            return Ok(path);
        }
    }
    bail!("no live {bin} ipc socket found under {}", dir.display())
}

fn entries_matching(dir: &Path, pred: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).into_iter().flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if pred(&name) {
            out.push(entry.into_path());
        }
    }
    out
}

fn access_time(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.accessed())
        .unwrap_or(UNIX_EPOCH)
}

fn newest_first(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort_by_key(|p| std::cmp::Reverse(access_time(p)));
    paths
}

fn socket_connects(path: &Path) -> bool {
    #[cfg(unix)]
    {
        UnixStream::connect(path).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}

/// `lsof -t <sock>` then a /proc cmdline check: is the socket held by a
/// `<bin>-server` process?
fn socket_owner_matches(path: &Path, bin: &str) -> bool {
    let output = match output_with_timeout("lsof", [OsStr::new("-t"), path.as_os_str()], LSOF_TIMEOUT)
    {
        Ok(Some(out)) => out,
        _ => return false,
    };
    let keyword = format!("{bin}-server");
    for pid in output.split_whitespace() {
        if let Ok(cmdline) = fs::read_to_string(format!("/proc/{pid}/cmdline")) {
            if cmdline.contains(&keyword) {
                return true;
            }
        }
    }
    false
}
