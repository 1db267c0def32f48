/*!
Framed wire protocol: JSON envelopes terminated by a single sentinel byte.

There is no length prefix. 0x1E (ASCII record separator) never appears in
JSON produced by a standard encoder, so scanning for it is sufficient to
delimit a frame. Exactly one request and one response travel over each
connection before it is closed.
*/

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame terminator; a non-printable control byte no JSON encoder emits.
pub const DELIMITER: u8 = 0x1e;

/// Read chunk size for frame scanning.
const READ_CHUNK: usize = 1024;

/// Request envelope: `{"method": ..., "params": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Response envelope: `{"code": ..., "data": ..., "message": ...}`.
/// Field order matters for on-the-wire readability only; decoding is by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub code: i32,
    pub data: Value,
    pub message: String,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Response {
            code: 0,
            data,
            message: String::new(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Response {
            code: 1,
            data: Value::Null,
            message: message.into(),
        }
    }
}

/// `new_session` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    pub pid: i32,
    pub hostname: String,
    pub keyfile: String,
}

/// `open_ide` request parameters. The key travels for symmetry with
/// session creation; the broker treats sid possession as the credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenIdeParams {
    pub sid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub skey: String,
    pub bin: String,
    pub path: String,
}

/// `new_session` response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub sid: String,
    pub key: String,
}

/// Serialize a request and terminate it with the sentinel.
pub fn encode_request(req: &Request) -> io::Result<Vec<u8>> {
    let bytes = serde_json::to_vec(req).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(append_delimiter(bytes))
}

/// Serialize a response and terminate it with the sentinel.
pub fn encode_response(res: &Response) -> io::Result<Vec<u8>> {
    let bytes = serde_json::to_vec(res).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(append_delimiter(bytes))
}

fn append_delimiter(mut payload: Vec<u8>) -> Vec<u8> {
    if payload.last() != Some(&DELIMITER) {
        payload.push(DELIMITER);
    }
    payload
}

/// Write a payload, appending the sentinel unless it already trails one.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    w.write_all(payload)?;
    if payload.last() != Some(&DELIMITER) {
        w.write_all(&[DELIMITER])?;
    }
    w.flush()
}

/// Read one frame: accumulate chunks, scanning only the freshly read chunk
/// for the sentinel. Bytes after the sentinel within the same chunk are
/// discarded (one frame per connection). A zero-byte read before the
/// sentinel means the peer closed early and is a decode failure.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = r.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before frame delimiter",
            ));
        }
        let just_read = &chunk[..n];
        if let Some(idx) = just_read.iter().position(|b| *b == DELIMITER) {
            buf.extend_from_slice(&just_read[..idx]);
            return Ok(buf);
        }
        buf.extend_from_slice(just_read);
    }
}
