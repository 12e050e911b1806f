//! Session configuration.
//!
//! [`Options`] is built once before a session starts, either with
//! [`Options::builder`] or from OpenSSH-style `Name=value` pairs, and is not
//! changed afterwards. Option names are matched case-insensitively.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tether_proto::ssh::config::Options;
//!
//! let options = Options::from_pairs([
//!     ("ConnectTimeout", "5"),
//!     ("StrictHostKeyChecking", "accept-new"),
//!     ("Ciphers", "aes256-gcm@openssh.com,chacha20-poly1305@openssh.com"),
//! ])
//! .unwrap();
//! assert_eq!(options.connect_timeout, Duration::from_secs(5));
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::ssh::error::{Result, SshError};
use crate::ssh::kex::AlgorithmPreferences;
use crate::ssh::privatekey::home_dir;
use crate::ssh::transport::RekeyLimits;
use crate::ssh::trust::HostKeyChecking;

/// Terminal type used when `TERM` is unset.
pub const DEFAULT_TERM: &str = "xterm-256color";

const LOG_LEVELS: &[&str] = &[
    "quiet", "fatal", "error", "info", "verbose", "debug", "debug1", "debug2", "debug3",
];

/// Client options for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Options {
    /// `ConnectTimeout`: TCP connect plus identification exchange
    pub connect_timeout: Duration,

    /// `StrictHostKeyChecking`
    pub host_key_checking: HostKeyChecking,

    /// `UserKnownHostsFile`
    pub known_hosts: PathBuf,

    /// `HashKnownHosts`: write new known_hosts entries hashed
    pub hash_known_hosts: bool,

    /// `ServerAliveInterval`; zero disables keepalive probes
    pub server_alive_interval: Duration,

    /// `ServerAliveCountMax`
    pub server_alive_count_max: u32,

    /// `RekeyLimit`
    pub rekey: RekeyLimits,

    /// `KexAlgorithms`, `HostKeyAlgorithms`, `Ciphers`, `MACs`, `Compression`
    pub algorithms: AlgorithmPreferences,

    /// `RequestTTY`
    pub request_tty: bool,

    /// Terminal type sent with `pty-req`
    pub term: String,

    /// Terminal width in characters
    pub cols: u32,

    /// Terminal height in rows
    pub rows: u32,

    /// `IdentityFile`, in the order the keys are tried
    pub identity_files: Vec<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            host_key_checking: HostKeyChecking::Strict,
            known_hosts: default_known_hosts(),
            hash_known_hosts: false,
            server_alive_interval: Duration::from_secs(10),
            server_alive_count_max: 3,
            rekey: RekeyLimits::default(),
            algorithms: AlgorithmPreferences::default(),
            request_tty: true,
            term: std::env::var("TERM")
                .ok()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_TERM.to_string()),
            cols: 80,
            rows: 24,
            identity_files: Vec::new(),
        }
    }
}

fn default_known_hosts() -> PathBuf {
    home_dir()
        .map(|home| home.join(".ssh").join("known_hosts"))
        .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"))
}

fn config_error(name: &str, value: &str, why: &str) -> SshError {
    SshError::Config(format!("{}={}: {}", name, value, why))
}

impl Options {
    /// Creates a builder starting from the defaults.
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::new()
    }

    /// Builds options from ordered `(name, value)` pairs on top of the
    /// defaults. Later pairs override earlier ones, except `IdentityFile`
    /// which accumulates.
    pub fn from_pairs<I, N, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Options::default();
        for (name, value) in pairs {
            options.apply(name.as_ref(), value.as_ref())?;
        }
        options.validate()?;
        Ok(options)
    }

    /// Parses one `Name=value` (or `Name value`) argument, as given to
    /// `ssh -o`.
    pub fn parse_pair(arg: &str) -> Result<(String, String)> {
        let arg = arg.trim();
        let split = arg
            .find(|c: char| c == '=' || c.is_whitespace())
            .ok_or_else(|| SshError::Config(format!("'{}' is not Name=value", arg)))?;
        let (name, value) = arg.split_at(split);
        let value = value[1..].trim_start_matches(|c: char| c == '=' || c.is_whitespace());
        Ok((name.to_string(), value.to_string()))
    }

    /// Canonical ordered option set, with OpenSSH names and values.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("ConnectTimeout", self.connect_timeout.as_secs().to_string()),
            (
                "StrictHostKeyChecking",
                self.host_key_checking.as_option_value().to_string(),
            ),
            ("UserKnownHostsFile", self.known_hosts.display().to_string()),
            ("HashKnownHosts", yes_no(self.hash_known_hosts).to_string()),
            (
                "ServerAliveInterval",
                self.server_alive_interval.as_secs().to_string(),
            ),
            (
                "ServerAliveCountMax",
                self.server_alive_count_max.to_string(),
            ),
            (
                "RekeyLimit",
                format!("{} {}", self.rekey.bytes, self.rekey.time.as_secs()),
            ),
            ("KexAlgorithms", self.algorithms.kex.join(",")),
            ("HostKeyAlgorithms", self.algorithms.host_key.join(",")),
            ("Ciphers", self.algorithms.ciphers.join(",")),
            ("MACs", self.algorithms.macs.join(",")),
            ("Compression", "no".to_string()),
            ("RequestTTY", yes_no(self.request_tty).to_string()),
        ];
        for path in &self.identity_files {
            pairs.push(("IdentityFile", path.display().to_string()));
        }
        pairs
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }

    /// Checks that the option set is usable.
    pub fn validate(&self) -> Result<()> {
        self.algorithms.validate()?;
        if self.connect_timeout.is_zero() {
            return Err(SshError::Config("ConnectTimeout must be positive".into()));
        }
        if !self.server_alive_interval.is_zero() && self.server_alive_count_max == 0 {
            return Err(SshError::Config(
                "ServerAliveCountMax must be at least 1 when keepalive is enabled".into(),
            ));
        }
        if self.rekey.bytes < 16 || self.rekey.packets == 0 || self.rekey.time.is_zero() {
            return Err(SshError::Config("RekeyLimit is too small".into()));
        }
        if self.term.is_empty() {
            return Err(SshError::Config("terminal type must not be empty".into()));
        }
        if self.cols == 0 || self.rows == 0 {
            return Err(SshError::Config("terminal size must be non-zero".into()));
        }
        Ok(())
    }

    fn apply(&mut self, name: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match name.to_ascii_lowercase().as_str() {
            "connecttimeout" => {
                self.connect_timeout = parse_time(value).ok_or_else(|| {
                    config_error(name, value, "expected a time such as 10 or 1m30s")
                })?;
            }
            "stricthostkeychecking" => {
                self.host_key_checking = match value.to_ascii_lowercase().as_str() {
                    // No interactive confirmation exists; asking behaves as strict.
                    "ask" => HostKeyChecking::Strict,
                    other => HostKeyChecking::from_option_value(other).ok_or_else(|| {
                        config_error(name, value, "expected yes, accept-new or no")
                    })?,
                };
            }
            "userknownhostsfile" => {
                let first = value
                    .split_whitespace()
                    .next()
                    .ok_or_else(|| config_error(name, value, "expected a path"))?;
                self.known_hosts = expand_tilde(first);
            }
            "hashknownhosts" => self.hash_known_hosts = parse_flag(name, value)?,
            "serveraliveinterval" => {
                self.server_alive_interval = parse_time(value)
                    .ok_or_else(|| config_error(name, value, "expected a time"))?;
            }
            "serveralivecountmax" => {
                self.server_alive_count_max = value
                    .parse()
                    .map_err(|_| config_error(name, value, "expected a number"))?;
            }
            "rekeylimit" => self.rekey = parse_rekey_limit(name, value, self.rekey)?,
            "kexalgorithms" => self.algorithms.kex = apply_list(&self.algorithms.kex, value),
            "hostkeyalgorithms" => {
                self.algorithms.host_key = apply_list(&self.algorithms.host_key, value)
            }
            "ciphers" => self.algorithms.ciphers = apply_list(&self.algorithms.ciphers, value),
            "macs" => self.algorithms.macs = apply_list(&self.algorithms.macs, value),
            "compression" => {
                if parse_flag(name, value)? {
                    return Err(config_error(name, value, "compression is not supported"));
                }
                self.algorithms.compression = vec!["none".to_string()];
            }
            "requesttty" => {
                self.request_tty = match value.to_ascii_lowercase().as_str() {
                    "yes" | "force" | "auto" => true,
                    "no" => false,
                    _ => return Err(config_error(name, value, "expected yes, no, force or auto")),
                };
            }
            "identityfile" => self.identity_files.push(expand_tilde(value)),
            "loglevel" => {
                // Logging is controlled by the tracing subscriber.
                if !LOG_LEVELS.contains(&value.to_ascii_lowercase().as_str()) {
                    return Err(config_error(name, value, "unknown log level"));
                }
                debug!(level = value, "LogLevel option ignored");
            }
            _ => return Err(SshError::Config(format!("unknown option '{}'", name))),
        }
        Ok(())
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" => Ok(true),
        "no" | "false" => Ok(false),
        _ => Err(config_error(name, value, "expected yes or no")),
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => Path::new(path).to_path_buf(),
    }
}

/// Parses an OpenSSH time value: plain seconds, or units such as `1h30m`.
fn parse_time(value: &str) -> Option<Duration> {
    if value.is_empty() {
        return None;
    }
    let mut total = 0u64;
    let mut digits = String::new();
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c.to_ascii_lowercase() {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            'w' => 604_800,
            _ => return None,
        };
        let n: u64 = digits.parse().ok()?;
        total = total.checked_add(n.checked_mul(unit)?)?;
        digits.clear();
    }
    if !digits.is_empty() {
        total = total.checked_add(digits.parse().ok()?)?;
    }
    Some(Duration::from_secs(total))
}

/// Parses a size such as `1G`, `500M` or `4096`.
fn parse_size(value: &str) -> Option<u64> {
    let (digits, multiplier) = match value.chars().last()?.to_ascii_uppercase() {
        'K' => (&value[..value.len() - 1], 1u64 << 10),
        'M' => (&value[..value.len() - 1], 1 << 20),
        'G' => (&value[..value.len() - 1], 1 << 30),
        _ => (value, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

fn parse_rekey_limit(name: &str, value: &str, current: RekeyLimits) -> Result<RekeyLimits> {
    let defaults = RekeyLimits::default();
    let mut parts = value.split_whitespace();
    let mut limits = current;

    let size = parts
        .next()
        .ok_or_else(|| config_error(name, value, "expected a size"))?;
    limits.bytes = if size.eq_ignore_ascii_case("default") {
        defaults.bytes
    } else {
        parse_size(size).ok_or_else(|| config_error(name, value, "invalid size"))?
    };

    if let Some(time) = parts.next() {
        limits.time = match time.to_ascii_lowercase().as_str() {
            "default" => defaults.time,
            "none" => Duration::from_secs(u64::from(u32::MAX)),
            _ => parse_time(time).ok_or_else(|| config_error(name, value, "invalid time"))?,
        };
    }
    if parts.next().is_some() {
        return Err(config_error(name, value, "expected a size and an optional time"));
    }
    Ok(limits)
}

/// Applies an OpenSSH algorithm list: a plain list replaces, `+` appends,
/// `-` removes and `^` puts the named algorithms first.
fn apply_list(current: &[String], value: &str) -> Vec<String> {
    let names = |list: &str| -> Vec<String> {
        list.split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect()
    };
    if let Some(rest) = value.strip_prefix('+') {
        let mut list = current.to_vec();
        for name in names(rest) {
            if !list.contains(&name) {
                list.push(name);
            }
        }
        list
    } else if let Some(rest) = value.strip_prefix('-') {
        let removed = names(rest);
        current
            .iter()
            .filter(|n| !removed.contains(n))
            .cloned()
            .collect()
    } else if let Some(rest) = value.strip_prefix('^') {
        let mut list = names(rest);
        let others: Vec<String> = current
            .iter()
            .filter(|n| !list.contains(n))
            .cloned()
            .collect();
        list.extend(others);
        list
    } else {
        names(value)
    }
}

/// Builder for [`Options`].
#[derive(Debug, Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Starts from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `ConnectTimeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Sets `StrictHostKeyChecking`.
    pub fn with_host_key_checking(mut self, policy: HostKeyChecking) -> Self {
        self.options.host_key_checking = policy;
        self
    }

    /// Sets `UserKnownHostsFile`.
    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.known_hosts = path.into();
        self
    }

    /// Sets `HashKnownHosts`.
    pub fn with_hash_known_hosts(mut self, hash: bool) -> Self {
        self.options.hash_known_hosts = hash;
        self
    }

    /// Sets `ServerAliveInterval` and `ServerAliveCountMax`.
    pub fn with_keepalive(mut self, interval: Duration, count_max: u32) -> Self {
        self.options.server_alive_interval = interval;
        self.options.server_alive_count_max = count_max;
        self
    }

    /// Sets `RekeyLimit`.
    pub fn with_rekey_limits(mut self, limits: RekeyLimits) -> Self {
        self.options.rekey = limits;
        self
    }

    /// Sets all algorithm preference lists.
    pub fn with_algorithms(mut self, algorithms: AlgorithmPreferences) -> Self {
        self.options.algorithms = algorithms;
        self
    }

    /// Sets `RequestTTY`.
    pub fn with_request_tty(mut self, request: bool) -> Self {
        self.options.request_tty = request;
        self
    }

    /// Sets the terminal type and size sent with `pty-req`.
    pub fn with_terminal(mut self, term: impl Into<String>, cols: u32, rows: u32) -> Self {
        self.options.term = term.into();
        self.options.cols = cols;
        self.options.rows = rows;
        self
    }

    /// Adds an `IdentityFile`.
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.identity_files.push(path.into());
        self
    }

    /// Applies one OpenSSH `Name=value` option.
    pub fn with_option(mut self, name: &str, value: &str) -> Result<Self> {
        self.options.apply(name, value)?;
        Ok(self)
    }

    /// Validates and returns the options.
    pub fn build(self) -> Result<Options> {
        self.options.validate()?;
        Ok(self.options)
    }
}
