//! Minimal ~/.ssh/config reader: just enough to resolve a Host's User.
//!
//! Only `Host` blocks with literal patterns and their `User` directive are
//! understood; everything else is skipped. Parse problems yield an empty
//! config rather than an error, matching how forgiving ssh itself is about
//! unknown content.

use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct HostBlock {
    patterns: Vec<String>,
    user: Option<String>,
}

impl HostBlock {
    pub fn user_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.user.as_deref().unwrap_or(default)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    hosts: Vec<HostBlock>,
}

impl SshConfig {
    pub fn load(path: &Path) -> SshConfig {
        match fs::read_to_string(path) {
            Ok(content) => SshConfig::parse(&content),
            Err(_) => SshConfig::default(),
        }
    }

    pub fn parse(content: &str) -> SshConfig {
        let mut hosts: Vec<HostBlock> = Vec::new();
        for raw in content.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut words = line.split_whitespace();
            let keyword = match words.next() {
                Some(w) => w.to_ascii_lowercase(),
                None => continue,
            };
            match keyword.as_str() {
                "host" => hosts.push(HostBlock {
                    patterns: words.map(str::to_string).collect(),
                    user: None,
                }),
                "user" => {
                    if let (Some(block), Some(user)) = (hosts.last_mut(), words.next()) {
                        if block.user.is_none() {
                            block.user = Some(user.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
        SshConfig { hosts }
    }

    /// First Host block naming `hostname` as a literal pattern.
    pub fn host(&self, hostname: &str) -> Option<&HostBlock> {
        self.hosts
            .iter()
            .find(|b| b.patterns.iter().any(|p| p == hostname))
    }
}
