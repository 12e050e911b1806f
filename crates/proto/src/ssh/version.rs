//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both sides open the connection by sending an identification line:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines before its identification line; the
//! transport skips them (see [`is_identification_line`]).
//!
//! # Security
//!
//! - Maximum line length: 255 characters
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::version::Version;
//!
//! let version = Version::new("Tether_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-Tether_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_9.6 Debian").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_9.6");
//! assert_eq!(parsed.as_str(), "SSH-2.0-OpenSSH_9.6 Debian");
//! ```

use tether_platform::{TetherError, TetherResult};

/// Maximum length of an identification line, CR LF included.
pub const MAX_VERSION_LENGTH: usize = 255;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version ("2.0" or "1.99")
    proto_version: String,
    /// Software version (e.g. "OpenSSH_9.6")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
    /// Exact line as exchanged, without CR LF (hashed into H)
    line: String,
}

impl Version {
    /// Creates a protocol 2.0 identification string.
    ///
    /// ```rust
    /// use tether_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Tether_0.1.0", Some("client"));
    /// assert_eq!(version.to_string(), "SSH-2.0-Tether_0.1.0 client");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        let mut line = format!("SSH-2.0-{}", software);
        if let Some(c) = comments {
            line.push(' ');
            line.push_str(c);
        }
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
            line,
        }
    }

    /// The identification string this crate sends by default.
    pub fn client_default() -> Self {
        Self::new(&format!("Tether_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line (with or without CR LF).
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Protocol`] if the line is too long, contains a
    /// null byte, does not start with `SSH-`, or names a protocol other than
    /// `2.0` / `1.99`.
    pub fn parse(line: &str) -> TetherResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() + 2 > MAX_VERSION_LENGTH {
            return Err(TetherError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len() + 2,
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(TetherError::protocol("Version string contains null byte"));
        }

        if !line.starts_with("SSH-") {
            return Err(TetherError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 || parts[2].is_empty() {
            return Err(TetherError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(TetherError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let rest = parts[2];
        let (software_version, comments) = match rest.find(' ') {
            Some(space) => (
                rest[..space].to_string(),
                Some(rest[space + 1..].to_string()),
            ),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
            line: line.to_string(),
        })
    }

    /// Returns the protocol version (e.g. "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// The exact identification line without CR LF.
    pub fn as_str(&self) -> &str {
        &self.line
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self.line).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.line)
    }
}

/// Returns `true` if a received line is the peer's identification line
/// rather than a pre-banner text line.
pub fn is_identification_line(line: &[u8]) -> bool {
    line.starts_with(b"SSH-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_new() {
        let version = Version::new("Tether_0.1.0", None);
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "Tether_0.1.0");
        assert_eq!(version.comments(), None);
        assert_eq!(version.as_str(), "SSH-2.0-Tether_0.1.0");
    }

    #[test]
    fn test_client_default() {
        let version = Version::client_default();
        assert!(version.to_string().starts_with("SSH-2.0-Tether_"));
    }

    #[test]
    fn test_version_parse_with_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1").unwrap();
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));
    }

    #[test]
    fn test_version_parse_keeps_exact_line() {
        // Double space must survive; the line feeds the exchange hash.
        let version = Version::parse("SSH-2.0-srv  spaced\r\n").unwrap();
        assert_eq!(version.as_str(), "SSH-2.0-srv  spaced");
    }

    #[test]
    fn test_version_parse_accepts_199() {
        let version = Version::parse("SSH-1.99-OldServer").unwrap();
        assert_eq!(version.proto_version(), "1.99");
    }

    #[test]
    fn test_version_parse_invalid_prefix() {
        let result = Version::parse("INVALID-2.0-Test");
        assert!(matches!(result, Err(TetherError::Protocol(_))));
    }

    #[test]
    fn test_version_parse_unsupported_protocol() {
        match Version::parse("SSH-1.0-OldClient") {
            Err(TetherError::Protocol(msg)) => {
                assert!(msg.contains("Unsupported protocol version"));
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_version_parse_too_long() {
        let long_string = format!("SSH-2.0-{}", "A".repeat(300));
        assert!(Version::parse(&long_string).is_err());
    }

    #[test]
    fn test_version_parse_null_byte() {
        assert!(Version::parse("SSH-2.0-Test\0Bad").is_err());
    }

    #[test]
    fn test_version_wire_format() {
        let version = Version::new("Tether_0.1.0", None);
        assert_eq!(version.to_wire_format(), b"SSH-2.0-Tether_0.1.0\r\n");
    }

    #[test]
    fn test_identification_line_detection() {
        assert!(is_identification_line(b"SSH-2.0-OpenSSH_9.6\r\n"));
        assert!(!is_identification_line(b"Welcome to the jump host\r\n"));
    }
}
