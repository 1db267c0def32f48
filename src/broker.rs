/*!
Broker server: accept loop, per-connection dispatch, and the idle sweep.

One thread owns both connection admission and session garbage collection:
the listener is polled with a bounded wait, and every time the ten-second
accept deadline lapses the same thread runs a sweep. Accepted connections
are handed to short-lived handler threads that perform exactly one
decode -> dispatch -> encode -> close cycle. Handler failures are logged
and never take the server down.
*/

use std::collections::BTreeSet;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::{display_for_broker_error, BrokerError};
use crate::protocol::{self, OpenIdeParams, Request, Response, SessionParams};
use crate::session::SessionRegistry;
use crate::util::spawn_detached;

/// Bound on one accept wait; a sweep runs each time it lapses.
pub const ACCEPT_WAIT: Duration = Duration::from_secs(10);

/// Poll spacing for the nonblocking listener.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

// Process-wide stop flag written by the signal handlers.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn handle_stop(_sig: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Route SIGINT/SIGTERM into an orderly accept-loop exit. In-flight
/// handlers finish naturally; only admission stops.
#[cfg(unix)]
pub fn install_signal_handlers() {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let action = SigAction::new(
        SigHandler::Handler(handle_stop),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        let _ = signal::sigaction(Signal::SIGINT, &action);
        let _ = signal::sigaction(Signal::SIGTERM, &action);
    }
}

/// Synthesize the remote-resource URI the IDE is pointed at.
pub fn remote_uri(hostname: &str, path: &str) -> String {
    format!("vscode-remote://ssh-remote+{hostname}{path}")
}

/// Launches the named application; injectable so tests can observe
/// dispatches without spawning real editors.
pub trait IdeLauncher: Send + Sync {
    fn launch(&self, bin: &str, folder_uri: &str) -> io::Result<()>;
}

/// Production launcher: start the IDE detached and do not wait for it.
#[derive(Debug, Default)]
pub struct DetachedIdeLauncher;

impl IdeLauncher for DetachedIdeLauncher {
    fn launch(&self, bin: &str, folder_uri: &str) -> io::Result<()> {
        spawn_detached(bin, ["--folder-uri", folder_uri])
    }
}

/// Per-connection request dispatcher; shared across handler threads.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    supported_ides: BTreeSet<String>,
    launcher: Arc<dyn IdeLauncher>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SessionRegistry>, supported_ides: BTreeSet<String>) -> Self {
        Dispatcher {
            registry,
            supported_ides,
            launcher: Arc::new(DetachedIdeLauncher),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn IdeLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Decode one request payload and execute it.
    pub fn dispatch(&self, payload: &[u8]) -> Result<Value, BrokerError> {
        let request: Request = serde_json::from_slice(payload)
            .map_err(|e| BrokerError::Protocol(format!("malformed request: {e}")))?;
        match request.method.as_str() {
            "new_session" => {
                let params: SessionParams = serde_json::from_value(request.params)
                    .map_err(|e| BrokerError::Protocol(format!("malformed params: {e}")))?;
                let data =
                    self.registry
                        .create(params.pid, &params.hostname, &params.keyfile)?;
                info!(sid = %data.sid, pid = params.pid, hostname = %params.hostname, "session created");
                serde_json::to_value(data)
                    .map_err(|e| BrokerError::Protocol(format!("encode failed: {e}")))
            }
            "open_ide" => {
                let params: OpenIdeParams = serde_json::from_value(request.params)
                    .map_err(|e| BrokerError::Protocol(format!("malformed params: {e}")))?;
                self.open_ide(&params)?;
                Ok(Value::String(String::new()))
            }
            other => Err(BrokerError::Protocol(format!("unknown method: {other}"))),
        }
    }

    /// The bin check runs before the session lookup so an unsupported
    /// identifier is reported as such even with a bogus sid.
    fn open_ide(&self, params: &OpenIdeParams) -> Result<(), BrokerError> {
        if !self.supported_ides.contains(&params.bin) {
            return Err(BrokerError::UnsupportedIde(params.bin.clone()));
        }
        let session = self.registry.lookup(&params.sid)?;
        let uri = remote_uri(&session.hostname, &params.path);
        url::Url::parse(&uri)
            .map_err(|e| BrokerError::Protocol(format!("invalid folder uri {uri}: {e}")))?;
        info!(bin = %params.bin, path = %params.path, hostname = %session.hostname, "open ide");
        self.launcher
            .launch(&params.bin, &uri)
            .map_err(BrokerError::Io)
    }
}

fn handle_connection(mut stream: TcpStream, dispatcher: &Dispatcher) {
    let payload = match protocol::read_frame(&mut stream) {
        Ok(p) => p,
        Err(e) => {
            debug!("dropping connection, no frame: {e}");
            return;
        }
    };
    let response = match dispatcher.dispatch(&payload) {
        Ok(data) => Response::ok(data),
        Err(e) => {
            let message = display_for_broker_error(&e);
            warn!("request failed: {message}");
            Response::err(message)
        }
    };
    match protocol::encode_response(&response) {
        Ok(bytes) => {
            if let Err(e) = protocol::write_frame(&mut stream, &bytes) {
                debug!("response write failed: {e}");
            }
        }
        Err(e) => warn!("response encode failed: {e}"),
    }
    // stream drops here: one request, one response, connection closed
}

pub struct BrokerServer {
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    max_idle: Duration,
    sweep_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl BrokerServer {
    pub fn new(config: &Config, registry: Arc<SessionRegistry>, max_idle: Duration) -> Self {
        let dispatcher = Dispatcher::new(registry.clone(), config.supported_ides.clone());
        BrokerServer {
            registry,
            dispatcher: Arc::new(dispatcher),
            max_idle,
            sweep_interval: ACCEPT_WAIT,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shrink the sweep cadence (tests use millisecond intervals).
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    /// Cooperative stop flag; setting it ends the accept loop.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || SHUTDOWN.load(Ordering::SeqCst)
    }

    /// Run the accept/sweep loop until shutdown or the idle limit.
    pub fn serve(&self, listener: TcpListener) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        info!(%addr, "broker listening");

        let poll = ACCEPT_POLL.min(self.sweep_interval);
        let mut idle = Duration::ZERO;
        loop {
            let deadline = Instant::now() + self.sweep_interval;
            while Instant::now() < deadline {
                if self.stopping() {
                    info!("shutdown requested, broker stopping");
                    return Ok(());
                }
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let _ = stream.set_nonblocking(false);
                        let dispatcher = self.dispatcher.clone();
                        thread::spawn(move || handle_connection(stream, &dispatcher));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(poll),
                    Err(e) => {
                        warn!("accept error: {e}");
                        thread::sleep(poll);
                    }
                }
            }

            // Sweep: evict sessions whose owner is gone, then account idle
            // time. Idle resets whenever at least one session is alive.
            let (alive, dead) = self.registry.partition();
            for sid in &dead {
                info!(%sid, "destroy session");
                self.registry.destroy(sid);
            }
            if alive.is_empty() {
                idle += self.sweep_interval;
            } else {
                idle = Duration::ZERO;
            }
            debug!(
                alive = alive.len(),
                reaped = dead.len(),
                idle_secs = idle.as_secs(),
                "sweep"
            );
            if alive.is_empty() && idle > self.max_idle {
                info!(idle_secs = idle.as_secs(), "no sessions, idle limit reached, broker stopping");
                return Ok(());
            }
        }
    }
}

/// Bind an ephemeral-or-fixed address and serve in a background thread.
/// Returns the bound address, the cooperative stop flag, and the handle.
pub fn broker_start_background(
    server: BrokerServer,
    addr: impl ToSocketAddrs,
) -> io::Result<(SocketAddr, Arc<AtomicBool>, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .map_err(|e| io::Error::new(e.kind(), format!("broker bind failed: {e}")))?;
    let local = listener.local_addr()?;
    let flag = server.shutdown_flag();
    let handle = thread::spawn(move || {
        if let Err(e) = server.serve(listener) {
            warn!("broker loop failed: {e}");
        }
    });
    Ok((local, flag, handle))
}

/// Guard enforcing single-broker-per-host (per port); the lock file is
/// released and removed on drop.
#[derive(Debug)]
pub struct BrokerLock {
    file: File,
    path: PathBuf,
}

impl Drop for BrokerLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

/// Take the exclusive broker lock for `port`, failing fast when another
/// broker already holds it.
pub fn acquire_broker_lock(port: u16) -> io::Result<BrokerLock> {
    let base = env::var("XDG_RUNTIME_DIR")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir);
    let path = base.join(format!("rcode-ipc.{port}.lock"));
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(BrokerLock { file, path }),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(io::Error::other(
            "another rcode-ipc broker is already running (lock held)",
        )),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingLauncher {
        launches: Mutex<Vec<(String, String)>>,
    }

    impl IdeLauncher for RecordingLauncher {
        fn launch(&self, bin: &str, folder_uri: &str) -> io::Result<()> {
            self.launches
                .lock()
                .expect("launch log lock")
                .push((bin.to_string(), folder_uri.to_string()));
            Ok(())
        }
    }

    fn test_dispatcher(secret: &str) -> (tempfile::TempDir, Arc<RecordingLauncher>, Dispatcher) {
        let td = tempfile::tempdir().expect("tmpdir");
        let keyfile = td.path().join("keyfile");
        std::fs::write(&keyfile, secret).expect("write keyfile");
        let registry = Arc::new(SessionRegistry::new(vec![keyfile]));
        let launcher = Arc::new(RecordingLauncher {
            launches: Mutex::new(Vec::new()),
        });
        let supported: BTreeSet<String> =
            crate::config::SUPPORTED_IDES.iter().map(|s| s.to_string()).collect();
        let dispatcher =
            Dispatcher::new(registry, supported).with_launcher(launcher.clone());
        (td, launcher, dispatcher)
    }

    fn dispatch_json(dispatcher: &Dispatcher, payload: Value) -> Result<Value, BrokerError> {
        dispatcher.dispatch(payload.to_string().as_bytes())
    }

    #[test]
    fn test_dispatch_unknown_method() {
        let (_td, _launcher, dispatcher) = test_dispatcher("k");
        let err = dispatch_json(&dispatcher, json!({"method": "ping", "params": {}}))
            .expect_err("unknown method");
        assert_eq!(display_for_broker_error(&err), "unknown method: ping");
    }

    #[test]
    fn test_dispatch_malformed_payload() {
        let (_td, _launcher, dispatcher) = test_dispatcher("k");
        let err = dispatcher.dispatch(b"{not json").expect_err("malformed");
        assert!(matches!(err, BrokerError::Protocol(_)));
    }

    #[test]
    fn test_new_session_then_open_ide() {
        let (_td, launcher, dispatcher) = test_dispatcher("s3cret");
        let data = dispatch_json(
            &dispatcher,
            json!({"method": "new_session", "params": {"pid": std::process::id(), "hostname": "box1", "keyfile": "s3cret"}}),
        )
        .expect("new_session");
        let sid = data["sid"].as_str().expect("sid").to_string();

        let result = dispatch_json(
            &dispatcher,
            json!({"method": "open_ide", "params": {"sid": sid, "bin": "code", "path": "/home/u/project"}}),
        )
        .expect("open_ide");
        assert_eq!(result, Value::String(String::new()));

        let launches = launcher.launches.lock().expect("lock");
        assert_eq!(
            *launches,
            vec![(
                "code".to_string(),
                "vscode-remote://ssh-remote+box1/home/u/project".to_string()
            )]
        );
    }

    #[test]
    fn test_open_ide_unsupported_bin_checked_before_lookup() {
        let (_td, _launcher, dispatcher) = test_dispatcher("k");
        // sid is bogus too; the bin check must win
        let err = dispatch_json(
            &dispatcher,
            json!({"method": "open_ide", "params": {"sid": "nope", "bin": "emacs", "path": "/p"}}),
        )
        .expect_err("unsupported bin");
        assert!(matches!(err, BrokerError::UnsupportedIde(b) if b == "emacs"));
    }

    #[test]
    fn test_open_ide_unknown_sid() {
        let (_td, _launcher, dispatcher) = test_dispatcher("k");
        let err = dispatch_json(
            &dispatcher,
            json!({"method": "open_ide", "params": {"sid": "nope", "bin": "code", "path": "/p"}}),
        )
        .expect_err("unknown sid");
        assert!(matches!(err, BrokerError::NotFound(sid) if sid == "nope"));
    }

    #[test]
    fn test_remote_uri_shape() {
        assert_eq!(
            remote_uri("box1", "/home/u/project"),
            "vscode-remote://ssh-remote+box1/home/u/project"
        );
    }

    #[test]
    fn test_broker_lock_excludes_second_holder() {
        let first = acquire_broker_lock(64999).expect("first lock");
        let second = acquire_broker_lock(64999);
        assert!(second.is_err(), "second lock on same port must fail");
        drop(first);
        let third = acquire_broker_lock(64999).expect("lock after release");
        drop(third);
    }
}
