//! Connection targets (`user@host`, port).

use std::fmt;

use crate::ssh::error::{Result, SshError};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Who to log in as, and where.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Target {
    /// Login name; empty means the local user
    pub user: String,
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Target {
    /// Creates a target.
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }

    /// Parses `user@host` or `host`, splitting at the first `@`. The port
    /// is [`DEFAULT_PORT`].
    pub fn parse(spec: &str) -> Self {
        match spec.split_once('@') {
            Some((user, host)) => Self::new(user, host, DEFAULT_PORT),
            None => Self::new("", spec, DEFAULT_PORT),
        }
    }

    /// Same target on another port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `host:port`, for connecting and logs.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The login name, falling back to `USER` and then `USERNAME` when the
    /// target has none.
    pub fn resolved_user(&self) -> Result<String> {
        if !self.user.is_empty() {
            return Ok(self.user.clone());
        }
        ["USER", "USERNAME"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|name| !name.is_empty())
            .ok_or_else(|| {
                SshError::Config("no user given and USER/USERNAME are not set".to_string())
            })
    }

    /// Checks that there is a host to connect to.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(SshError::Config(format!("'{}' has no host", self)));
        }
        Ok(())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.user.is_empty() {
            write!(f, "{}@", self.user)?;
        }
        write!(f, "{}", self.host)?;
        if self.port != DEFAULT_PORT {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}
