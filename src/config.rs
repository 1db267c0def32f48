/*!
Process-wide configuration, resolved once at entry and passed down.

Nothing here is read lazily from deep inside components: binaries build one
Config at startup and hand it (or fields of it) to whatever needs it. The
optional `~/.rcode/config.yml` supplies defaults for the broker endpoint and
idle timeout; command-line flags override it.
*/

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::util::uuid_v4;

pub const DEFAULT_BROKER_HOST: &str = "127.0.0.1";
pub const DEFAULT_BROKER_PORT: u16 = 7532;
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(600);

/// Applications the broker will launch.
pub const SUPPORTED_IDES: &[&str] = &["code", "cursor", "windsurf"];

#[derive(Debug, Clone)]
pub struct Config {
    pub home: PathBuf,
    /// State directory, `~/.rcode`.
    pub rcode_home: PathBuf,
    /// Primary shared secret, `~/.rcode/keyfile`.
    pub key_file: PathBuf,
    /// Companion-tool fallback secret, `~/.rssh/keyfile`.
    pub fallback_key_file: PathBuf,
    /// Append-only shortcut history, `~/.rcode/shortcuts`.
    pub shortcuts_file: PathBuf,
    /// Broker log directory, `~/.rcode/logs`.
    pub log_dir: PathBuf,
    pub ssh_config_file: PathBuf,
    pub supported_ides: BTreeSet<String>,
    pub broker_host: String,
    pub broker_port: u16,
    pub max_idle: Duration,
    /// RCODE_DEBUG: widen the default log filter.
    pub debug: bool,
}

/// Optional `~/.rcode/config.yml` contents.
#[derive(Debug, Default, Deserialize)]
struct FileOverrides {
    host: Option<String>,
    port: Option<u16>,
    /// humantime syntax, e.g. "10m" or "600s".
    max_idle: Option<String>,
}

impl Config {
    pub fn load() -> io::Result<Config> {
        let home = home::home_dir().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "could not determine home directory")
        })?;
        Config::load_from(home)
    }

    /// Build a Config rooted at an explicit home directory (tests use this).
    pub fn load_from(home: PathBuf) -> io::Result<Config> {
        let rcode_home = home.join(".rcode");
        let mut config = Config {
            key_file: rcode_home.join("keyfile"),
            fallback_key_file: home.join(".rssh").join("keyfile"),
            shortcuts_file: rcode_home.join("shortcuts"),
            log_dir: rcode_home.join("logs"),
            ssh_config_file: home.join(".ssh").join("config"),
            supported_ides: SUPPORTED_IDES.iter().map(|s| s.to_string()).collect(),
            broker_host: DEFAULT_BROKER_HOST.to_string(),
            broker_port: DEFAULT_BROKER_PORT,
            max_idle: DEFAULT_MAX_IDLE,
            debug: std::env::var("RCODE_DEBUG").map(|v| !v.is_empty()).unwrap_or(false),
            rcode_home,
            home,
        };

        let overrides_path = config.rcode_home.join("config.yml");
        if let Ok(contents) = fs::read_to_string(&overrides_path) {
            let overrides: FileOverrides = serde_yaml::from_str(&contents).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("malformed {}: {e}", overrides_path.display()),
                )
            })?;
            if let Some(host) = overrides.host {
                config.broker_host = host;
            }
            if let Some(port) = overrides.port {
                config.broker_port = port;
            }
            if let Some(spec) = overrides.max_idle {
                config.max_idle = humantime::parse_duration(spec.trim()).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("malformed max_idle in {}: {e}", overrides_path.display()),
                    )
                })?;
            }
        }

        Ok(config)
    }

    /// Secret files in validation order: primary first, fallback second.
    pub fn key_files(&self) -> Vec<PathBuf> {
        vec![self.key_file.clone(), self.fallback_key_file.clone()]
    }

    /// First-run materialization: state dir, shortcut history, log dir, and
    /// a fresh random keyfile (0600 so the secret stays private to the user).
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.rcode_home)?;
        fs::create_dir_all(&self.log_dir)?;
        if !self.shortcuts_file.exists() {
            fs::File::create(&self.shortcuts_file)?;
        }
        if !self.key_file.exists() {
            let mut f = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&self.key_file)?;
            f.write_all(uuid_v4().as_bytes())?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&self.key_file, fs::Permissions::from_mode(0o600))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_config_file() {
        let td = tempfile::tempdir().expect("tmpdir");
        let config = Config::load_from(td.path().to_path_buf()).expect("load");
        assert_eq!(config.broker_host, DEFAULT_BROKER_HOST);
        assert_eq!(config.broker_port, DEFAULT_BROKER_PORT);
        assert_eq!(config.max_idle, DEFAULT_MAX_IDLE);
        assert_eq!(config.key_file, td.path().join(".rcode").join("keyfile"));
        assert!(config.supported_ides.contains("code"));
        assert!(config.supported_ides.contains("cursor"));
        assert!(config.supported_ides.contains("windsurf"));
        assert_eq!(config.supported_ides.len(), 3);
    }

    #[test]
    fn test_config_file_overrides() {
        let td = tempfile::tempdir().expect("tmpdir");
        let rcode_home = td.path().join(".rcode");
        std::fs::create_dir_all(&rcode_home).expect("mkdir");
        std::fs::write(
            rcode_home.join("config.yml"),
            "host: 0.0.0.0\nport: 9321\nmax_idle: 30m\n",
        )
        .expect("write config");
        let config = Config::load_from(td.path().to_path_buf()).expect("load");
        assert_eq!(config.broker_host, "0.0.0.0");
        assert_eq!(config.broker_port, 9321);
        assert_eq!(config.max_idle, Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_malformed_config_file_rejected() {
        let td = tempfile::tempdir().expect("tmpdir");
        let rcode_home = td.path().join(".rcode");
        std::fs::create_dir_all(&rcode_home).expect("mkdir");
        std::fs::write(rcode_home.join("config.yml"), "port: notanumber\n").expect("write");
        assert!(Config::load_from(td.path().to_path_buf()).is_err());
    }

    #[test]
    fn test_ensure_dirs_creates_keyfile_once() {
        let td = tempfile::tempdir().expect("tmpdir");
        let config = Config::load_from(td.path().to_path_buf()).expect("load");
        config.ensure_dirs().expect("ensure");
        let first = std::fs::read_to_string(&config.key_file).expect("keyfile");
        assert_eq!(first.len(), 36);
        config.ensure_dirs().expect("ensure again");
        let second = std::fs::read_to_string(&config.key_file).expect("keyfile");
        assert_eq!(first, second, "keyfile must not be regenerated");
        assert!(config.shortcuts_file.exists());
        assert!(config.log_dir.is_dir());
    }
}
