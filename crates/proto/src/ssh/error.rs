//! Error taxonomy for SSH sessions.
//!
//! Codec-level code reports [`TetherError`]; everything from the transport
//! upwards reports [`SshError`], which separates the failure classes a caller
//! has to react to differently:
//!
//! - connect failures and timeouts (nothing was negotiated yet),
//! - negotiation failures, split into "no overlap" and "active rejection",
//! - authentication exhaustion,
//! - protocol and I/O failures, fatal to the transport and every channel on it,
//! - channel-open and channel-request refusals, which only affect that one
//!   channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tether_platform::TetherError;

/// Result type for session-level SSH operations
pub type Result<T> = std::result::Result<T, SshError>;

/// Outcome of a single authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The server rejected the method or key.
    Rejected,
    /// The server accepted the method but requires more methods.
    PartialSuccess,
    /// The attempt was skipped locally (no prompter, prompt declined, key unusable).
    Skipped(String),
}

/// One authentication attempt, as recorded in [`SshError::AuthFailed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAttempt {
    /// Method name (`publickey`, `password`, `keyboard-interactive`, `none`)
    pub method: String,
    /// Key fingerprint for public-key attempts
    pub key: Option<String>,
    /// What happened
    pub outcome: AttemptOutcome,
}

impl fmt::Display for AuthAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{} ({})", self.method, key)?,
            None => write!(f, "{}", self.method)?,
        }
        match &self.outcome {
            AttemptOutcome::Rejected => write!(f, ": rejected"),
            AttemptOutcome::PartialSuccess => write!(f, ": partial success"),
            AttemptOutcome::Skipped(why) => write!(f, ": skipped ({})", why),
        }
    }
}

/// SSH session errors
#[derive(Debug, Clone)]
pub enum SshError {
    /// TCP connect or name resolution failed.
    Connect {
        /// Address that was dialled
        addr: String,
        /// Underlying reason
        reason: String,
    },

    /// A bounded stage did not finish in time.
    Timeout {
        /// Stage that timed out (`connect`, `banner`, `keepalive`)
        stage: &'static str,
        /// Configured limit
        after: Duration,
    },

    /// Client and server share no algorithm in one category.
    NoCommonAlgorithm {
        /// Category name (`kex`, `host key`, `cipher`, ...)
        category: &'static str,
        /// Client preference list
        client: Vec<String>,
        /// Server list
        server: Vec<String>,
    },

    /// The server host key was actively rejected.
    HostKeyRejected {
        /// Host name
        host: String,
        /// Port
        port: u16,
        /// Key type from the host key blob
        key_type: String,
        /// SHA-256 fingerprint of the presented key
        fingerprint: String,
        /// Why the key was rejected
        reason: String,
    },

    /// Every configured authentication method was exhausted.
    AuthFailed {
        /// Attempts in the order they were made
        attempts: Vec<AuthAttempt>,
    },

    /// The peer violated the protocol or sent data that failed verification.
    Protocol(String),

    /// The server refused to open a channel.
    ChannelOpenFailed {
        /// Reason code from SSH_MSG_CHANNEL_OPEN_FAILURE
        reason: u32,
        /// Human readable description
        description: String,
    },

    /// The server answered a channel request with SSH_MSG_CHANNEL_FAILURE.
    RequestFailed {
        /// Request type (`pty-req`, `exec`, ...)
        request: String,
    },

    /// The channel is closed.
    ChannelClosed,

    /// The peer sent SSH_MSG_DISCONNECT.
    Disconnected {
        /// Disconnect reason code
        reason: u32,
        /// Description sent by the peer
        description: String,
    },

    /// Socket failure.
    Io(Arc<std::io::Error>),

    /// Invalid option set, target or credentials.
    Config(String),
}

impl SshError {
    /// Creates a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        SshError::Protocol(msg.into())
    }

    /// Returns `true` if the error tears down the whole transport.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SshError::ChannelOpenFailed { .. }
                | SshError::RequestFailed { .. }
                | SshError::ChannelClosed
        )
    }

    /// Returns `true` for negotiation errors (no overlap or rejected host key).
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            SshError::NoCommonAlgorithm { .. } | SshError::HostKeyRejected { .. }
        )
    }
}

impl fmt::Display for SshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshError::Connect { addr, reason } => {
                write!(f, "Failed to connect to {}: {}", addr, reason)
            }
            SshError::Timeout { stage, after } => {
                write!(f, "Timed out during {} after {:?}", stage, after)
            }
            SshError::NoCommonAlgorithm {
                category,
                client,
                server,
            } => write!(
                f,
                "No common {} algorithm (client: {}; server: {})",
                category,
                client.join(","),
                server.join(",")
            ),
            SshError::HostKeyRejected {
                host,
                port,
                key_type,
                fingerprint,
                reason,
            } => write!(
                f,
                "Host key for {}:{} rejected ({} {}): {}",
                host, port, key_type, fingerprint, reason
            ),
            SshError::AuthFailed { attempts } => {
                write!(f, "Authentication failed")?;
                if !attempts.is_empty() {
                    let tried: Vec<String> = attempts.iter().map(|a| a.to_string()).collect();
                    write!(f, " after: {}", tried.join("; "))?;
                }
                Ok(())
            }
            SshError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SshError::ChannelOpenFailed {
                reason,
                description,
            } => write!(f, "Channel open failed ({}): {}", reason, description),
            SshError::RequestFailed { request } => {
                write!(f, "Channel request {} refused by server", request)
            }
            SshError::ChannelClosed => write!(f, "Channel closed"),
            SshError::Disconnected {
                reason,
                description,
            } => write!(f, "Disconnected by peer ({}): {}", reason, description),
            SshError::Io(e) => write!(f, "I/O error: {}", e),
            SshError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for SshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SshError::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SshError {
    fn from(err: std::io::Error) -> Self {
        SshError::Io(Arc::new(err))
    }
}

impl From<TetherError> for SshError {
    fn from(err: TetherError) -> Self {
        match err {
            TetherError::Io(e) => SshError::Io(Arc::new(e)),
            TetherError::Config(msg) => SshError::Config(msg),
            TetherError::Protocol(msg) => SshError::Protocol(msg),
            TetherError::Security(msg) => SshError::Protocol(msg),
            TetherError::NotImplemented(msg) => SshError::Protocol(msg),
            TetherError::Other(e) => SshError::Protocol(e.to_string()),
        }
    }
}
