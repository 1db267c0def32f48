/*!
Broker client: one framed request and one framed response per connection.

The same client logic serves both sides of the tunnel: locally it dials the
broker's TCP endpoint, remotely it dials the unix socket that ssh exposes
for the session. `connect_with_retry` covers the spawn-on-demand dance:
the broker may not have bound its socket yet right after being started, so
the client retries on a short fixed cadence instead of a readiness
handshake.
*/

use std::env;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use which::which;

use crate::errors::BrokerError;
use crate::protocol::{self, OpenIdeParams, Request, Response, SessionData, SessionParams};
use crate::util::spawn_detached;

pub const CONNECT_RETRIES: u32 = 9;
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Transport behind a client connection.
#[derive(Debug)]
pub enum ClientStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ClientStream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            ClientStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ClientStream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            ClientStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            ClientStream::Unix(s) => s.flush(),
        }
    }
}

#[derive(Debug)]
pub struct BrokerClient {
    stream: ClientStream,
}

impl BrokerClient {
    pub fn connect_tcp(host: &str, port: u16) -> Result<Self, BrokerError> {
        let stream = TcpStream::connect((host, port)).map_err(|e| {
            BrokerError::Connect(format!("failed to connect to broker at {host}:{port}: {e}"))
        })?;
        Ok(BrokerClient {
            stream: ClientStream::Tcp(stream),
        })
    }

    #[cfg(unix)]
    pub fn connect_unix(path: &Path) -> Result<Self, BrokerError> {
        let stream = UnixStream::connect(path).map_err(|e| {
            BrokerError::Connect(format!(
                "failed to connect to broker at {}: {e}",
                path.display()
            ))
        })?;
        Ok(BrokerClient {
            stream: ClientStream::Unix(stream),
        })
    }

    pub fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        protocol::write_frame(&mut self.stream, payload)
    }

    pub fn receive(&mut self) -> io::Result<Vec<u8>> {
        protocol::read_frame(&mut self.stream)
    }

    /// Best-effort close of both directions.
    pub fn close(self) {
        match self.stream {
            ClientStream::Tcp(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
            #[cfg(unix)]
            ClientStream::Unix(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
        }
    }

    /// Send one request and read exactly one response. A connection closed
    /// without a response is a failure.
    pub fn roundtrip(&mut self, req: &Request) -> Result<Response, BrokerError> {
        let bytes = protocol::encode_request(req)
            .map_err(|e| BrokerError::Protocol(format!("encode failed: {e}")))?;
        self.send(&bytes)
            .map_err(|e| BrokerError::Connect(format!("send failed: {e}")))?;
        let raw = self
            .receive()
            .map_err(|e| BrokerError::Decode(format!("receive failed: {e}")))?;
        serde_json::from_slice(&raw)
            .map_err(|e| BrokerError::Decode(format!("malformed response: {e}")))
    }

    /// Issue `new_session` and decode its payload.
    pub fn new_session(
        &mut self,
        pid: i32,
        hostname: &str,
        secret: &str,
    ) -> Result<SessionData, BrokerError> {
        let params = SessionParams {
            pid,
            hostname: hostname.to_string(),
            keyfile: secret.to_string(),
        };
        let req = Request {
            method: "new_session".to_string(),
            params: serde_json::to_value(params)
                .map_err(|e| BrokerError::Protocol(format!("encode failed: {e}")))?,
        };
        let res = self.roundtrip(&req)?;
        if res.code != 0 {
            return Err(BrokerError::Remote(res.message));
        }
        serde_json::from_value(res.data)
            .map_err(|e| BrokerError::Decode(format!("malformed session data: {e}")))
    }

    /// Issue `open_ide`; success carries no payload.
    pub fn open_ide(&mut self, params: &OpenIdeParams) -> Result<(), BrokerError> {
        let req = Request {
            method: "open_ide".to_string(),
            params: serde_json::to_value(params)
                .map_err(|e| BrokerError::Protocol(format!("encode failed: {e}")))?,
        };
        let res = self.roundtrip(&req)?;
        if res.code != 0 {
            return Err(BrokerError::Remote(res.message));
        }
        Ok(())
    }
}

/// Connect to the broker, starting it on demand. On the first refusal the
/// `spawn_broker` action runs once, then connection attempts repeat on a
/// fixed 100ms cadence until one lands or the budget is exhausted.
pub fn connect_with_retry<F>(
    host: &str,
    port: u16,
    spawn_broker: F,
) -> Result<BrokerClient, BrokerError>
where
    F: FnOnce() -> io::Result<()>,
{
    if let Ok(client) = BrokerClient::connect_tcp(host, port) {
        return Ok(client);
    }

    spawn_broker()
        .map_err(|e| BrokerError::Connect(format!("failed to start broker: {e}")))?;
    thread::sleep(CONNECT_RETRY_DELAY);

    let mut last = BrokerError::Connect(format!("broker at {host}:{port} never became reachable"));
    for _ in 0..CONNECT_RETRIES {
        match BrokerClient::connect_tcp(host, port) {
            Ok(client) => return Ok(client),
            Err(e) => {
                last = e;
                thread::sleep(CONNECT_RETRY_DELAY);
            }
        }
    }
    Err(last)
}

/// Locate the broker binary: sibling of the current executable first,
/// then PATH.
pub fn broker_binary() -> io::Result<PathBuf> {
    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join("rcode-ipc");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    which("rcode-ipc").map_err(|e| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("rcode-ipc not found next to the executable or in PATH: {e}"),
        )
    })
}

/// Start the broker daemon bound to the given endpoint, detached.
pub fn spawn_broker_daemon(host: &str, port: u16) -> io::Result<()> {
    let binary = broker_binary()?;
    let port_arg = port.to_string();
    spawn_detached(&binary, ["--host", host, "--port", port_arg.as_str()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_connect_with_retry_waits_for_late_listener() {
        // Reserve a port, release it, and only start listening after a delay
        // to exercise the retry path.
        let probe = TcpListener::bind("127.0.0.1:0").expect("bind probe");
        let port = probe.local_addr().expect("addr").port();
        drop(probe);

        let spawned = Arc::new(AtomicBool::new(false));
        let spawned_cl = spawned.clone();
        let server = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            let listener = TcpListener::bind(("127.0.0.1", port)).expect("late bind");
            let _ = listener.accept();
        });

        let client = connect_with_retry("127.0.0.1", port, move || {
            spawned_cl.store(true, Ordering::SeqCst);
            Ok(())
        })
        .expect("retry should land once the listener is up");
        assert!(spawned.load(Ordering::SeqCst), "spawn action must run");
        client.close();
        let _ = server.join();
    }

    #[test]
    fn test_connect_with_retry_gives_up() {
        let probe = TcpListener::bind("127.0.0.1:0").expect("bind probe");
        let port = probe.local_addr().expect("addr").port();
        drop(probe);

        let err = connect_with_retry("127.0.0.1", port, || Ok(()))
            .expect_err("nothing ever listens");
        assert!(matches!(err, BrokerError::Connect(_)));
    }

    #[test]
    fn test_connect_with_retry_propagates_spawn_failure() {
        let probe = TcpListener::bind("127.0.0.1:0").expect("bind probe");
        let port = probe.local_addr().expect("addr").port();
        drop(probe);

        let err = connect_with_retry("127.0.0.1", port, || {
            Err(io::Error::new(io::ErrorKind::NotFound, "no binary"))
        })
        .expect_err("spawn failure is fatal");
        match err {
            BrokerError::Connect(m) => assert!(m.contains("failed to start broker")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
