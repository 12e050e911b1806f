//! OpenSSH known_hosts file support.
//!
//! Each entry line has the format:
//! ```text
//! [@marker] hostnames keytype base64-key [comment]
//! ```
//!
//! Hostnames can be:
//! - Standard: `example.com` or `[example.com]:2222`
//! - Hashed: `|1|salt|hash` (HMAC-SHA1 of the hostname keyed by the salt)
//! - Wildcard: `*.example.com`, `host?.example.com`
//! - Multiple: `host1,host2,host3`
//! - Negated: `*.example.com,!bad.example.com`
//!
//! Lines this module does not use (comments, `@cert-authority` and
//! `@revoked` entries, malformed lines) are kept verbatim so that saving
//! the file never drops them.
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::known_hosts::{HostKeyStatus, KnownHostsFile};
//!
//! let mut known_hosts = KnownHostsFile::new("/tmp/known_hosts");
//! known_hosts.add_host("example.com", 2222, "ssh-ed25519", &[1, 2, 3]);
//!
//! let status = known_hosts.check("example.com", 2222, "ssh-ed25519", &[1, 2, 3]);
//! assert_eq!(status, HostKeyStatus::Known);
//! ```

use std::path::{Path, PathBuf};

use base64::Engine;
use tether_platform::{TetherError, TetherResult};
use tracing::{debug, warn};

/// A single known_hosts entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHost {
    hostname_pattern: String,
    key_type: String,
    key_data: Vec<u8>,
    comment: String,
}

impl KnownHost {
    /// Creates a new known host entry.
    pub fn new(hostname_pattern: String, key_type: String, key_data: Vec<u8>) -> Self {
        Self {
            hostname_pattern,
            key_type,
            key_data,
            comment: String::new(),
        }
    }

    /// Returns the hostname pattern.
    pub fn hostname_pattern(&self) -> &str {
        &self.hostname_pattern
    }

    /// Returns the key type.
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// Returns the public key blob.
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Checks if this entry applies to `hostname` on `port`.
    ///
    /// A matching negated pattern excludes the host regardless of the
    /// position of the pattern in the list.
    pub fn matches(&self, hostname: &str, port: u16) -> TetherResult<bool> {
        let full_host = host_key_name(hostname, port);
        let mut matched = false;

        for pattern in self.hostname_pattern.split(',') {
            let pattern = pattern.trim();
            if let Some(negated) = pattern.strip_prefix('!') {
                if matches_pattern(negated, &full_host)? {
                    return Ok(false);
                }
            } else if !matched && matches_pattern(pattern, &full_host)? {
                matched = true;
            }
        }

        Ok(matched)
    }

    /// Parses an entry line.
    ///
    /// ```rust
    /// use tether_proto::ssh::known_hosts::KnownHost;
    ///
    /// let line = "example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBRanDK33/M2A9M0Lc/TQ/pF5kfd8rplxF34cupZF1gD user@host";
    /// let entry = KnownHost::parse_line(line).unwrap();
    /// assert_eq!(entry.hostname_pattern(), "example.com");
    /// assert_eq!(entry.key_type(), "ssh-ed25519");
    /// ```
    pub fn parse_line(line: &str) -> TetherResult<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Err(TetherError::protocol("Empty or comment line"));
        }
        if line.starts_with('@') {
            return Err(TetherError::NotImplemented(
                "known_hosts markers are not supported".to_string(),
            ));
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(TetherError::protocol(
                "Invalid known_hosts line: too few fields (need at least 3)",
            ));
        }

        let key_data = base64::engine::general_purpose::STANDARD
            .decode(parts[2])
            .map_err(|e| TetherError::Protocol(format!("Invalid base64 key data: {}", e)))?;

        Ok(Self {
            hostname_pattern: parts[0].to_string(),
            key_type: parts[1].to_string(),
            key_data,
            comment: parts[3..].join(" "),
        })
    }

    fn to_line(&self) -> String {
        let key = base64::engine::general_purpose::STANDARD.encode(&self.key_data);
        if self.comment.is_empty() {
            format!("{} {} {}", self.hostname_pattern, self.key_type, key)
        } else {
            format!("{} {} {} {}", self.hostname_pattern, self.key_type, key, self.comment)
        }
    }
}

/// Name under which a host is recorded: `host` on port 22, `[host]:port` otherwise.
pub fn host_key_name(hostname: &str, port: u16) -> String {
    let hostname = hostname.to_ascii_lowercase();
    if port == 22 {
        hostname
    } else {
        format!("[{}]:{}", hostname, port)
    }
}

fn matches_pattern(pattern: &str, hostname: &str) -> TetherResult<bool> {
    if pattern.starts_with("|1|") {
        return verify_hashed_hostname(pattern, hostname);
    }
    let pattern = pattern.to_ascii_lowercase();
    if pattern.contains('*') || pattern.contains('?') {
        return Ok(wildcard_match(pattern.as_bytes(), hostname.as_bytes()));
    }
    Ok(pattern == hostname)
}

/// `|1|salt|hash` where hash = Base64(HMAC-SHA1(salt, hostname)).
fn verify_hashed_hostname(hashed: &str, hostname: &str) -> TetherResult<bool> {
    use hmac::{Hmac, Mac};
    use sha1::Sha1;
    use subtle::ConstantTimeEq;

    let parts: Vec<&str> = hashed.split('|').collect();
    if parts.len() != 4 || !parts[0].is_empty() || parts[1] != "1" {
        return Ok(false);
    }

    let engine = base64::engine::general_purpose::STANDARD;
    let salt = engine
        .decode(parts[2])
        .map_err(|e| TetherError::Protocol(format!("Invalid base64 salt: {}", e)))?;
    let expected = engine
        .decode(parts[3])
        .map_err(|e| TetherError::Protocol(format!("Invalid base64 hash: {}", e)))?;

    let mut mac = Hmac::<Sha1>::new_from_slice(&salt)
        .map_err(|e| TetherError::Protocol(format!("HMAC creation failed: {}", e)))?;
    mac.update(hostname.as_bytes());
    let computed = mac.finalize().into_bytes();

    Ok(computed.as_slice().ct_eq(&expected).into())
}

/// Hashes a hostname the way `ssh-keygen -H` does, with a random salt.
pub fn hash_hostname(hostname: &str) -> TetherResult<String> {
    use hmac::{Hmac, Mac};
    use rand::RngCore;
    use sha1::Sha1;

    let mut salt = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut mac = Hmac::<Sha1>::new_from_slice(&salt)
        .map_err(|e| TetherError::Protocol(format!("HMAC creation failed: {}", e)))?;
    mac.update(hostname.as_bytes());
    let engine = base64::engine::general_purpose::STANDARD;
    Ok(format!(
        "|1|{}|{}",
        engine.encode(salt),
        engine.encode(mac.finalize().into_bytes())
    ))
}

/// Glob match supporting `*` and `?`, iterative with single backtrack point.
fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// Host key verification status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// A matching entry of this key type holds exactly this key.
    Known,
    /// Entries of this key type exist for the host, none holds this key.
    Changed {
        /// Keys currently on record
        recorded: Vec<Vec<u8>>,
    },
    /// No entry of this key type for the host.
    Unknown,
}

#[derive(Debug, Clone)]
enum Line {
    Entry(KnownHost),
    Verbatim(String),
}

/// An OpenSSH known_hosts file held in memory.
#[derive(Debug, Clone)]
pub struct KnownHostsFile {
    lines: Vec<Line>,
    path: PathBuf,
}

impl KnownHostsFile {
    /// Creates an empty file bound to `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            lines: Vec::new(),
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Loads `path`; a missing file is an empty one.
    pub fn from_file<P: AsRef<Path>>(path: P) -> TetherResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new(path));
        }
        let content = std::fs::read_to_string(path)?;
        let mut file = Self::from_string(&content);
        file.path = path.to_path_buf();
        Ok(file)
    }

    /// Parses file content. Lines that are not usable entries are kept verbatim.
    pub fn from_string(content: &str) -> Self {
        let mut lines = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                lines.push(Line::Verbatim(line.to_string()));
                continue;
            }
            match KnownHost::parse_line(trimmed) {
                Ok(entry) => lines.push(Line::Entry(entry)),
                Err(TetherError::NotImplemented(_)) => {
                    debug!(line = line_num + 1, "Skipping marked known_hosts entry");
                    lines.push(Line::Verbatim(line.to_string()));
                }
                Err(e) => {
                    warn!(line = line_num + 1, error = %e, "Failed to parse known_hosts line");
                    lines.push(Line::Verbatim(line.to_string()));
                }
            }
        }
        Self {
            lines,
            path: PathBuf::new(),
        }
    }

    /// Path the file is saved to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Iterates over parsed entries.
    pub fn entries(&self) -> impl Iterator<Item = &KnownHost> {
        self.lines.iter().filter_map(|line| match line {
            Line::Entry(entry) => Some(entry),
            Line::Verbatim(_) => None,
        })
    }

    /// Adds an entry.
    pub fn add_entry(&mut self, entry: KnownHost) {
        self.lines.push(Line::Entry(entry));
    }

    /// Keys of `key_type` recorded for `hostname`/`port`.
    pub fn lookup(&self, hostname: &str, port: u16, key_type: &str) -> Vec<Vec<u8>> {
        self.entries()
            .filter(|entry| entry.key_type() == key_type)
            .filter(|entry| match entry.matches(hostname, port) {
                Ok(matched) => matched,
                Err(e) => {
                    warn!(pattern = entry.hostname_pattern(), error = %e, "Unusable known_hosts pattern");
                    false
                }
            })
            .map(|entry| entry.key_data().to_vec())
            .collect()
    }

    /// Checks a presented key against the entries for its key type.
    pub fn check(&self, hostname: &str, port: u16, key_type: &str, key_data: &[u8]) -> HostKeyStatus {
        let recorded = self.lookup(hostname, port, key_type);
        if recorded.is_empty() {
            HostKeyStatus::Unknown
        } else if recorded.iter().any(|k| k.as_slice() == key_data) {
            HostKeyStatus::Known
        } else {
            HostKeyStatus::Changed { recorded }
        }
    }

    /// Records a host key under `host` or `[host]:port`.
    pub fn add_host(&mut self, hostname: &str, port: u16, key_type: &str, key_data: &[u8]) {
        self.add_entry(KnownHost::new(
            host_key_name(hostname, port),
            key_type.to_string(),
            key_data.to_vec(),
        ));
    }

    /// Records a host key under a hashed hostname.
    pub fn add_host_hashed(&mut self, hostname: &str, port: u16, key_type: &str, key_data: &[u8]) -> TetherResult<()> {
        self.add_entry(KnownHost::new(
            hash_hostname(&host_key_name(hostname, port))?,
            key_type.to_string(),
            key_data.to_vec(),
        ));
        Ok(())
    }

    /// Removes every entry matching the host. Returns the number removed.
    pub fn remove_host(&mut self, hostname: &str, port: u16) -> usize {
        let before = self.lines.len();
        self.lines.retain(|line| match line {
            Line::Entry(entry) => !entry.matches(hostname, port).unwrap_or(false),
            Line::Verbatim(_) => true,
        });
        before - self.lines.len()
    }

    /// Renders the file content.
    pub fn to_string_lossless(&self) -> String {
        let mut content = String::new();
        for line in &self.lines {
            match line {
                Line::Entry(entry) => content.push_str(&entry.to_line()),
                Line::Verbatim(raw) => content.push_str(raw),
            }
            content.push('\n');
        }
        content
    }

    /// Writes the file through a temporary file and an atomic rename.
    pub fn save(&self) -> TetherResult<()> {
        use std::fs;
        use std::io::Write;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(self.to_string_lossless().as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}
