use std::time::{Duration, SystemTime};

/// Generate a random RFC-4122 v4 identifier from OS randomness.
///
/// Session ids and keys come from here; the id is embedded in the tunnel
/// socket path, so the alphabet must stay shell- and path-safe.
pub fn uuid_v4() -> String {
    let mut bytes = [0u8; 16];
    if getrandom::getrandom(&mut bytes).is_err() {
        // OS randomness unavailable; mix time and pid so ids stay unique
        // within one host even without the entropy source.
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_nanos();
        let pid = std::process::id() as u128;
        let mix = now ^ pid.rotate_left(64);
        bytes.copy_from_slice(&mix.to_le_bytes());
    }
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let mut s = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            s.push('-');
        }
        s.push_str(&format!("{:02x}", b));
    }
    s
}
