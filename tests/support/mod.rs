//! Shared helpers for integration tests: a real broker on an ephemeral
//! port, with an injected liveness oracle and a recording IDE launcher.
#![allow(dead_code)]

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rcode::broker::{broker_start_background, BrokerServer, Dispatcher, IdeLauncher};
use rcode::config::Config;
use rcode::session::{ProcessOracle, SessionRegistry};

pub const SECRET: &str = "integration-test-secret";

pub struct RecordingLauncher {
    pub launches: Mutex<Vec<(String, String)>>,
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

/// Liveness oracle with a shared, mutable alive-set so tests can kill a
/// "process" mid-run.
#[derive(Clone, Default)]
pub struct FakeOracle {
    alive: Arc<Mutex<HashSet<i32>>>,
}

impl FakeOracle {
    pub fn set_alive(&self, pid: i32) {
        self.alive.lock().expect("oracle lock").insert(pid);
    }

    pub fn set_dead(&self, pid: i32) {
        self.alive.lock().expect("oracle lock").remove(&pid);
    }
}

impl ProcessOracle for FakeOracle {
    fn is_alive(&self, pid: i32) -> bool {
        self.alive.lock().expect("oracle lock").contains(&pid)
    }
}

pub struct TestBroker {
    pub addr: SocketAddr,
    pub flag: Arc<AtomicBool>,
    pub handle: JoinHandle<()>,
    pub launcher: Arc<RecordingLauncher>,
    pub registry: Arc<SessionRegistry>,
    _home: tempfile::TempDir,
}

impl TestBroker {
    pub fn stop(self) {
        self.flag.store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

pub fn start_broker(
    oracle: Option<Box<dyn ProcessOracle>>,
    max_idle: Duration,
    sweep_interval: Duration,
) -> TestBroker {
    let home = tempfile::tempdir().expect("tmpdir");
    let config = Config::load_from(home.path().to_path_buf()).expect("config");
    config.ensure_dirs().expect("state dirs");
    std::fs::write(&config.key_file, SECRET).expect("write secret");

    let registry = Arc::new(match oracle {
        Some(o) => SessionRegistry::with_oracle(config.key_files(), o),
        None => SessionRegistry::new(config.key_files()),
    });
    let launcher = Arc::new(RecordingLauncher {
        launches: Mutex::new(Vec::new()),
    });
    let dispatcher = Dispatcher::new(registry.clone(), config.supported_ides.clone())
        .with_launcher(launcher.clone());
    let server = BrokerServer::new(&config, registry.clone(), max_idle)
        .with_sweep_interval(sweep_interval)
        .with_dispatcher(dispatcher);
    let (addr, flag, handle) =
        broker_start_background(server, "127.0.0.1:0").expect("start broker");
    TestBroker {
        addr,
        flag,
        handle,
        launcher,
        registry,
        _home: home,
    }
}

/// Speak the wire protocol by hand: send one sentinel-framed payload, read
/// one sentinel-framed response, decode it as JSON.
pub fn roundtrip_raw(addr: SocketAddr, payload: &str) -> serde_json::Value {
    let mut stream = TcpStream::connect(addr).expect("connect to broker");
    let mut bytes = payload.as_bytes().to_vec();
    bytes.push(0x1e);
    stream.write_all(&bytes).expect("write request");

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).expect("read response");
        assert!(n > 0, "connection closed before response delimiter");
        if let Some(idx) = chunk[..n].iter().position(|b| *b == 0x1e) {
            buf.extend_from_slice(&chunk[..idx]);
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    serde_json::from_slice(&buf).expect("json response")
}
