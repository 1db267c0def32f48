/*!
Session registry: the authenticated session table and its sweep input.

The table is shared between concurrently running connection handlers and the
broker's sweep, so every operation takes the registry mutex. Liveness of a
session's owning process goes through a pluggable oracle so the sweep logic
is testable without a real process table.
*/

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::errors::BrokerError;
use crate::protocol::SessionData;
use crate::util::uuid_v4;

/// One authorized remote-to-local control channel.
#[derive(Debug, Clone)]
pub struct Session {
    pub sid: String,
    pub key: String,
    /// Owning process on the local machine, typically the ssh client.
    pub pid: i32,
    /// Host alias the session is bound to; used for the target URI.
    pub hostname: String,
}

/// Process-liveness probe, injectable for tests.
pub trait ProcessOracle: Send + Sync {
    fn is_alive(&self, pid: i32) -> bool;
}

/// Oracle backed by `kill(pid, 0)`. ESRCH is a definite "gone"; any other
/// outcome (including EPERM) counts as alive, so uncertainty never evicts.
#[derive(Debug, Default)]
pub struct SystemProcessOracle;

impl ProcessOracle for SystemProcessOracle {
    fn is_alive(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::kill;
            use nix::unistd::Pid;
            !matches!(kill(Pid::from_raw(pid as libc::pid_t), None), Err(Errno::ESRCH))
        }
        #[cfg(not(unix))]
        {
            true
        }
    }
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    key_files: Vec<PathBuf>,
    oracle: Box<dyn ProcessOracle>,
}

impl SessionRegistry {
    pub fn new(key_files: Vec<PathBuf>) -> Self {
        SessionRegistry::with_oracle(key_files, Box::new(SystemProcessOracle))
    }

    pub fn with_oracle(key_files: Vec<PathBuf>, oracle: Box<dyn ProcessOracle>) -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            key_files,
            oracle,
        }
    }

    /// Validate the presented secret and mint a session. The key files are
    /// read fresh on every call; the first exact match wins.
    pub fn create(
        &self,
        pid: i32,
        hostname: &str,
        presented_secret: &str,
    ) -> Result<SessionData, BrokerError> {
        self.validate_secret(presented_secret)?;

        let sid = uuid_v4();
        let key = uuid_v4();
        let session = Session {
            sid: sid.clone(),
            key: key.clone(),
            pid,
            hostname: hostname.to_string(),
        };
        self.sessions
            .lock()
            .expect("session table lock")
            .insert(sid.clone(), session);
        Ok(SessionData { sid, key })
    }

    fn validate_secret(&self, presented: &str) -> Result<(), BrokerError> {
        for path in &self.key_files {
            if let Ok(contents) = fs::read_to_string(path) {
                if contents == presented {
                    return Ok(());
                }
            }
        }
        Err(BrokerError::Auth)
    }

    pub fn lookup(&self, sid: &str) -> Result<Session, BrokerError> {
        self.sessions
            .lock()
            .expect("session table lock")
            .get(sid)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(sid.to_string()))
    }

    /// Partition all session ids into (alive, dead) by owning-process
    /// liveness. Only the sweep calls this.
    pub fn partition(&self) -> (Vec<String>, Vec<String>) {
        let sessions = self.sessions.lock().expect("session table lock");
        let mut alive = Vec::new();
        let mut dead = Vec::new();
        for (sid, session) in sessions.iter() {
            if self.oracle.is_alive(session.pid) {
                alive.push(sid.clone());
            } else {
                dead.push(sid.clone());
            }
        }
        (alive, dead)
    }

    /// Remove a session; idempotent.
    pub fn destroy(&self, sid: &str) {
        self.sessions
            .lock()
            .expect("session table lock")
            .remove(sid);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session table lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
