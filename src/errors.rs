//! Error mapping guide:
//! - Map io::ErrorKind::NotFound to exit code 127; all others to 1.
//! - Broker-side errors become a response envelope (code=1, human-readable
//!   message) via display_for_broker_error; they never crash the server.
//! - Client-side errors are fatal to the calling command after mapping
//!   through exit_code_for_broker_error.
use std::io;

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (command not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Error taxonomy for the session-broker stack.
#[derive(Debug)]
pub enum BrokerError {
    /// Presented secret matched none of the configured key files.
    Auth,
    /// Unknown session id.
    NotFound(String),
    /// Application identifier outside the supported set.
    UnsupportedIde(String),
    /// Malformed envelope or unknown method.
    Protocol(String),
    /// Transport-level failure to reach the broker.
    Connect(String),
    /// Stream closed or errored before a full frame was read.
    Decode(String),
    /// The broker answered with a non-zero response code.
    Remote(String),
    Io(io::Error),
}

impl From<io::Error> for BrokerError {
    fn from(e: io::Error) -> Self {
        BrokerError::Io(e)
    }
}

/// Render a user-facing string for BrokerError.
pub fn display_for_broker_error(e: &BrokerError) -> String {
    match e {
        BrokerError::Auth => "invalid key".to_string(),
        BrokerError::NotFound(sid) => format!("invalid sid: {sid}"),
        BrokerError::UnsupportedIde(bin) => format!("unsupported ide: {bin}"),
        BrokerError::Protocol(m) | BrokerError::Connect(m) | BrokerError::Decode(m) => m.clone(),
        BrokerError::Remote(m) => m.clone(),
        BrokerError::Io(ioe) => ioe.to_string(),
    }
}

/// Convert BrokerError to an exit code (parity with io::Error mapping).
pub fn exit_code_for_broker_error(e: &BrokerError) -> u8 {
    match e {
        BrokerError::Io(ioe) => exit_code_for_io_error(ioe),
        _ => 1,
    }
}
