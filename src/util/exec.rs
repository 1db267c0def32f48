//! Process helpers: session-detached spawning and bounded output capture.

use std::ffi::OsStr;
use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

/// Spawn `program` detached from the current terminal session: stdio nulled
/// and a fresh session id, so the child survives the caller exiting.
pub fn spawn_detached<I, S>(program: impl AsRef<OsStr>, args: I) -> io::Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                let _ = nix::unistd::setsid();
                Ok(())
            });
        }
    }
    cmd.spawn().map(|_| ())
}

/// Run a command and capture its stdout, killing it if it exceeds `timeout`.
/// Returns None on non-zero exit or timeout.
pub fn output_with_timeout<I, S>(
    program: impl AsRef<OsStr>,
    args: I,
    timeout: Duration,
) -> io::Result<Option<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
    };

    if !status.success() {
        return Ok(None);
    }
    let mut out = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout.read_to_string(&mut out)?;
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_with_timeout_captures_stdout() {
        let out = output_with_timeout("echo", ["hello"], Duration::from_secs(5))
            .expect("spawn echo")
            .expect("echo succeeds");
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_output_with_timeout_kills_slow_command() {
        let out = output_with_timeout("sleep", ["5"], Duration::from_millis(100)).expect("spawn");
        assert!(out.is_none(), "slow command should be reported as timed out");
    }

    #[test]
    fn test_output_with_timeout_nonzero_exit() {
        let out = output_with_timeout("false", Vec::<String>::new(), Duration::from_secs(5))
            .expect("spawn false");
        assert!(out.is_none());
    }
}
