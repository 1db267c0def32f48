//! Shortcut history: append-only `name,uri` records under an advisory lock.
//!
//! The file is shared by every rcode invocation on the machine, so appends
//! take an exclusive lock; reads are plain (a torn trailing line is simply
//! skipped by the parsers).

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use fs2::FileExt;

/// Record one opened location. `name` groups replays; the most recent entry
/// always doubles as the `latest` shortcut.
pub fn append(file: &Path, name: &str, uri: &str) -> io::Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(file)?;
    f.lock_exclusive()?;
    let result = writeln!(f, "{name},{uri}");
    let _ = f.unlock();
    result
}

/// URI of the most recently recorded shortcut, if any.
pub fn latest(file: &Path) -> io::Result<Option<String>> {
    let content = fs::read_to_string(file)?;
    for line in content.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(uri) = uri_of(line) {
            return Ok(Some(uri));
        }
    }
    Ok(None)
}

/// URI of the first shortcut recorded under `name`, if any.
pub fn named(file: &Path, name: &str) -> io::Result<Option<String>> {
    let content = fs::read_to_string(file)?;
    for line in content.lines() {
        let mut segs = line.split(',');
        if segs.next().map(str::trim) == Some(name) {
            if let Some(uri) = uri_of(line) {
                return Ok(Some(uri));
            }
        }
    }
    Ok(None)
}

fn uri_of(line: &str) -> Option<String> {
    let uri = line.rsplit(',').next()?.trim();
    if uri.is_empty() {
        None
    } else {
        Some(uri.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_latest() {
        let td = tempfile::tempdir().expect("tmpdir");
        let file = td.path().join("shortcuts");
        append(&file, "latest", "vscode-remote://ssh-remote+a/one").expect("append");
        append(&file, "work", "vscode-remote://ssh-remote+b/two").expect("append");
        assert_eq!(
            latest(&file).expect("latest"),
            Some("vscode-remote://ssh-remote+b/two".to_string())
        );
    }

    #[test]
    fn test_named_returns_first_match() {
        let td = tempfile::tempdir().expect("tmpdir");
        let file = td.path().join("shortcuts");
        append(&file, "work", "vscode-remote://ssh-remote+a/one").expect("append");
        append(&file, "work", "vscode-remote://ssh-remote+a/two").expect("append");
        assert_eq!(
            named(&file, "work").expect("named"),
            Some("vscode-remote://ssh-remote+a/one".to_string())
        );
        assert_eq!(named(&file, "missing").expect("named"), None);
    }

    #[test]
    fn test_latest_skips_blank_lines() {
        let td = tempfile::tempdir().expect("tmpdir");
        let file = td.path().join("shortcuts");
        std::fs::write(&file, "work,uri-one\n\n  \n").expect("write");
        assert_eq!(latest(&file).expect("latest"), Some("uri-one".to_string()));
    }

    #[test]
    fn test_empty_file_has_no_latest() {
        let td = tempfile::tempdir().expect("tmpdir");
        let file = td.path().join("shortcuts");
        std::fs::write(&file, "").expect("write");
        assert_eq!(latest(&file).expect("latest"), None);
    }
}
