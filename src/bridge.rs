/*!
Tunnel bridge: turn an ordinary outbound ssh invocation into one that also
carries the reverse-forwarded control channel.

The rewrite preserves the caller's flags and destination, forces a pseudo
terminal, binds a per-session unix socket on the remote side back to the
local broker, and hands the session credentials to the remote shell through
its environment so any later tool in that shell can find the channel. On
success the process image is replaced by ssh and never returns.
*/

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{self, Command};

use once_cell::sync::OnceCell;
use which::which;

use crate::client::{self, BrokerClient};
use crate::config::Config;
use crate::errors::{display_for_broker_error, BrokerError};
use crate::protocol::SessionData;

/// Flags that conflict with the bridge's own reverse forward and its
/// requirement of an interactive remote shell. Their presence aborts.
pub const FORBIDDEN_FLAGS: &[&str] = &["-R", "-T"];

/// Remote-side socket path for a session; the remote caller derives the
/// same path from its environment.
pub fn tunnel_socket_path(sid: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/rcode-ipc-{sid}.sock"))
}

/// The caller's argv, split around the destination host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgePlan {
    /// ssh flags preceding the host, preserved verbatim.
    pub pre: Vec<String>,
    /// First token not starting with `-`: the destination.
    pub hostname: String,
    /// Host and everything after it (including any remote command).
    pub post: Vec<String>,
    /// Caller already passed -t; do not add a second one.
    pub pseudo_tty: bool,
}

/// Validate and split an ssh argument list. Fails on conflicting flags or
/// a missing destination.
pub fn plan_bridge(ssh_args: &[String]) -> Result<BridgePlan, String> {
    let mut pseudo_tty = false;
    for arg in ssh_args {
        if FORBIDDEN_FLAGS.contains(&arg.as_str()) {
            return Err(format!(
                "{arg} is not allowed: rssh manages its own reverse forward and needs an interactive shell"
            ));
        }
        if arg == "-t" {
            pseudo_tty = true;
        }
    }

    let host_pos = ssh_args
        .iter()
        .position(|a| !a.starts_with('-'))
        .ok_or_else(|| "host not found in ssh arguments".to_string())?;

    Ok(BridgePlan {
        pre: ssh_args[..host_pos].to_vec(),
        hostname: ssh_args[host_pos].clone(),
        post: ssh_args[host_pos..].to_vec(),
        pseudo_tty,
    })
}

/// Assemble the final ssh argv: preserved flags, a forced pseudo terminal,
/// the reverse forward, the preserved destination and trailing arguments,
/// and the credential-exporting remote command.
pub fn assemble_ssh_args(
    plan: &BridgePlan,
    session: &SessionData,
    broker_host: &str,
    broker_port: u16,
) -> Vec<String> {
    let mut buf = plan.pre.clone();
    if !plan.pseudo_tty {
        buf.push("-t".to_string());
    }
    let sock = tunnel_socket_path(&session.sid);
    buf.push("-R".to_string());
    buf.push(format!("{}:{}:{}", sock.display(), broker_host, broker_port));
    buf.extend(plan.post.iter().cloned());
    buf.push(format!(
        "export RCODE_SID={}; export RCODE_SKEY={}; exec $SHELL",
        session.sid, session.key
    ));
    buf
}

fn ssh_binary() -> io::Result<&'static PathBuf> {
    static SSH_PATH: OnceCell<PathBuf> = OnceCell::new();
    SSH_PATH.get_or_try_init(|| {
        which("ssh").map_err(|e| {
            io::Error::new(io::ErrorKind::NotFound, format!("ssh not found in PATH: {e}"))
        })
    })
}

/// Mint a session at the local broker (starting it on demand) and replace
/// this process with the rewritten ssh invocation. Returns only on failure.
pub fn run_bridge(
    config: &Config,
    broker_host: &str,
    broker_port: u16,
    ssh_args: &[String],
) -> io::Result<()> {
    let plan = plan_bridge(ssh_args).map_err(|m| io::Error::new(io::ErrorKind::InvalidInput, m))?;

    let mut conn = client::connect_with_retry(broker_host, broker_port, || {
        eprintln!("rssh: starting rcode-ipc broker...");
        client::spawn_broker_daemon(broker_host, broker_port)
    })
    .map_err(broker_to_io)?;

    let session = create_session(config, &mut conn, &plan.hostname).map_err(broker_to_io)?;
    conn.close();

    let args = assemble_ssh_args(&plan, &session, broker_host, broker_port);
    exec_ssh(&args)
}

fn create_session(
    config: &Config,
    conn: &mut BrokerClient,
    hostname: &str,
) -> Result<SessionData, BrokerError> {
    // Read fresh on every call; the file may have been rotated since start.
    let secret = fs::read_to_string(&config.key_file).map_err(|e| {
        BrokerError::Io(io::Error::new(
            e.kind(),
            format!("failed to read {}: {e}", config.key_file.display()),
        ))
    })?;
    conn.new_session(process::id() as i32, hostname, &secret)
}

fn broker_to_io(e: BrokerError) -> io::Error {
    match e {
        BrokerError::Io(ioe) => ioe,
        other => io::Error::other(display_for_broker_error(&other)),
    }
}

/// Replace the current process image with ssh. A successful exec does not
/// return; the returned error is the only outcome visible to the caller.
fn exec_ssh(args: &[String]) -> io::Result<()> {
    let path = ssh_binary()?;
    if !atty::is(atty::Stream::Stdin) {
        eprintln!("rssh: stdin is not a tty; the remote shell is still started with -t");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        Err(Command::new(path).args(args).exec())
    }
    #[cfg(not(unix))]
    {
        // No process-image replacement available: run ssh to completion and
        // surface its exit status instead.
        let status = Command::new(path).args(args).status()?;
        if status.success() {
            process::exit(0);
        }
        process::exit(status.code().unwrap_or(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn session() -> SessionData {
        SessionData {
            sid: "11111111-2222-4333-8444-555555555555".to_string(),
            key: "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee".to_string(),
        }
    }

    #[test]
    fn test_plan_rejects_forbidden_flags() {
        for flag in ["-R", "-T"] {
            let err = plan_bridge(&args(&[flag, "host"])).expect_err("must reject");
            assert!(err.contains(flag), "message should name the flag: {err}");
        }
    }

    #[test]
    fn test_plan_requires_host() {
        assert!(plan_bridge(&args(&["-v", "-t"])).is_err());
        assert!(plan_bridge(&[]).is_err());
    }

    #[test]
    fn test_plan_splits_around_host() {
        let plan = plan_bridge(&args(&["-v", "-t", "box1", "uptime"])).expect("plan");
        assert_eq!(plan.pre, args(&["-v", "-t"]));
        assert_eq!(plan.hostname, "box1");
        assert_eq!(plan.post, args(&["box1", "uptime"]));
        assert!(plan.pseudo_tty);
    }

    #[test]
    fn test_assemble_injects_tty_and_forward() {
        let plan = plan_bridge(&args(&["-v", "box1"])).expect("plan");
        let out = assemble_ssh_args(&plan, &session(), "127.0.0.1", 7532);
        assert_eq!(out[0], "-v");
        assert_eq!(out[1], "-t");
        assert_eq!(out[2], "-R");
        assert_eq!(
            out[3],
            "/tmp/rcode-ipc-11111111-2222-4333-8444-555555555555.sock:127.0.0.1:7532"
        );
        assert_eq!(out[4], "box1");
        let export = "export RCODE_SID=11111111-2222-4333-8444-555555555555; export RCODE_SKEY=aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee; exec $SHELL";
        assert_eq!(out[5], export);
    }

    #[test]
    fn test_assemble_does_not_duplicate_tty_flag() {
        let plan = plan_bridge(&args(&["-t", "box1"])).expect("plan");
        let out = assemble_ssh_args(&plan, &session(), "127.0.0.1", 7532);
        assert_eq!(out.iter().filter(|a| a.as_str() == "-t").count(), 1);
    }

    #[test]
    fn test_assemble_preserves_remote_command() {
        let plan = plan_bridge(&args(&["box1", "tmux", "attach"])).expect("plan");
        let out = assemble_ssh_args(&plan, &session(), "127.0.0.1", 7532);
        let host_pos = out.iter().position(|a| a == "box1").expect("host present");
        assert_eq!(&out[host_pos..host_pos + 3], &args(&["box1", "tmux", "attach"])[..]);
        assert!(out.last().expect("trailing export").starts_with("export RCODE_SID="));
    }

    #[test]
    fn test_tunnel_socket_path_is_session_scoped() {
        let p = tunnel_socket_path("abc");
        assert_eq!(p, PathBuf::from("/tmp/rcode-ipc-abc.sock"));
    }
}
