//! SSH authentication protocol messages (RFC 4252, RFC 4256).
//!
//! This module covers the wire format of user authentication:
//! - SSH_MSG_SERVICE_REQUEST / SSH_MSG_SERVICE_ACCEPT
//! - SSH_MSG_USERAUTH_REQUEST for `none`, `publickey`, `password` and
//!   `keyboard-interactive`
//! - SSH_MSG_USERAUTH_FAILURE, SUCCESS, BANNER and PK_OK
//! - keyboard-interactive INFO_REQUEST / INFO_RESPONSE
//!
//! The client flow that strings these together lives in
//! [`crate::ssh::userauth`].
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::auth::{AuthMethod, AuthRequest};
//!
//! let request = AuthRequest::new("alice", "ssh-connection", AuthMethod::None);
//! let bytes = request.to_bytes();
//! assert_eq!(bytes[0], 50);
//! assert_eq!(AuthRequest::from_bytes(&bytes).unwrap(), request);
//! ```

use bytes::BufMut;
use tether_platform::{TetherError, TetherResult};
use zeroize::Zeroizing;

use crate::ssh::message::{MessageType, USERAUTH_INFO_REQUEST};
use crate::ssh::wire::{WireReader, WireWrite};

/// Service requested before authentication.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// Service started once authentication succeeds.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

fn expect_message(r: &mut WireReader<'_>, expected: u8, name: &str) -> TetherResult<()> {
    let msg = r.read_u8()?;
    if msg != expected {
        return Err(TetherError::Protocol(format!(
            "Invalid message type: expected {} ({}), got {}",
            expected, name, msg
        )));
    }
    Ok(())
}

/// SSH_MSG_SERVICE_REQUEST payload.
pub fn service_request(service: &str) -> Vec<u8> {
    let mut buf = vec![MessageType::ServiceRequest as u8];
    buf.put_string(service);
    buf
}

/// SSH_MSG_SERVICE_ACCEPT payload.
pub fn service_accept(service: &str) -> Vec<u8> {
    let mut buf = vec![MessageType::ServiceAccept as u8];
    buf.put_string(service);
    buf
}

/// Parses SSH_MSG_SERVICE_REQUEST or SERVICE_ACCEPT, returning the service name.
pub fn parse_service(payload: &[u8]) -> TetherResult<String> {
    let mut r = WireReader::new(payload);
    let msg = r.read_u8()?;
    if msg != MessageType::ServiceRequest as u8 && msg != MessageType::ServiceAccept as u8 {
        return Err(TetherError::Protocol(format!(
            "Expected service request or accept, got message {}",
            msg
        )));
    }
    // Some servers omit the service name in SERVICE_ACCEPT.
    if r.is_empty() {
        return Ok(String::new());
    }
    r.read_utf8()
}

/// SSH authentication method.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Asks the server which methods it accepts.
    None,
    /// Password authentication.
    Password(Zeroizing<String>),
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature; absent for the acceptability query
        signature: Option<Vec<u8>>,
    },
    /// Keyboard-interactive authentication (RFC 4256).
    KeyboardInteractive {
        /// Submethod hints, usually empty
        submethods: String,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::None => f.write_str("None"),
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMethod::PublicKey {
                algorithm,
                signature,
                ..
            } => f
                .debug_struct("PublicKey")
                .field("algorithm", algorithm)
                .field("signed", &signature.is_some())
                .finish(),
            AuthMethod::KeyboardInteractive { submethods } => f
                .debug_struct("KeyboardInteractive")
                .field("submethods", submethods)
                .finish(),
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the request.
    ///
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.push(MessageType::UserauthRequest as u8);
        buf.put_string(&self.user_name);
        buf.put_string(&self.service_name);
        buf.put_string(self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                buf.put_bool(false);
                buf.put_string(password.as_bytes());
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                buf.put_bool(signature.is_some());
                buf.put_string(algorithm);
                buf.put_string(public_key);
                if let Some(sig) = signature {
                    buf.put_string(sig);
                }
            }
            AuthMethod::KeyboardInteractive { submethods } => {
                // language tag (deprecated)
                buf.put_string("");
                buf.put_string(submethods);
            }
        }
        buf
    }

    /// Parses a request.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::UserauthRequest as u8, "SSH_MSG_USERAUTH_REQUEST")?;
        let user_name = r.read_utf8()?;
        let service_name = r.read_utf8()?;
        let method_name = r.read_utf8()?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                if r.read_bool()? {
                    return Err(TetherError::NotImplemented(
                        "Password change requests are not supported".to_string(),
                    ));
                }
                AuthMethod::Password(Zeroizing::new(r.read_utf8()?))
            }
            "publickey" => {
                let has_signature = r.read_bool()?;
                let algorithm = r.read_utf8()?;
                let public_key = r.read_string()?.to_vec();
                let signature = if has_signature {
                    Some(r.read_string()?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => {
                let _language = r.read_string()?;
                AuthMethod::KeyboardInteractive {
                    submethods: r.read_utf8()?,
                }
            }
            other => {
                return Err(TetherError::Protocol(format!(
                    "Unsupported authentication method: '{}'",
                    other
                )))
            }
        };
        r.finish()?;

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a failure message.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Methods that may continue the authentication.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Whether the request succeeded but more methods are required.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![MessageType::UserauthFailure as u8];
        buf.put_name_list(&self.methods_can_continue);
        buf.put_bool(self.partial_success);
        buf
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::UserauthFailure as u8, "SSH_MSG_USERAUTH_FAILURE")?;
        let methods_can_continue = r.read_name_list()?;
        let partial_success = r.read_bool()?;
        Ok(Self {
            methods_can_continue,
            partial_success,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
    language_tag: String,
}

impl AuthBanner {
    /// Creates a banner.
    pub fn new(message: String) -> Self {
        Self {
            message,
            language_tag: String::new(),
        }
    }

    /// Returns the banner text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![MessageType::UserauthBanner as u8];
        buf.put_string(&self.message);
        buf.put_string(&self.language_tag);
        buf
    }

    /// Parses from bytes. A missing language tag is tolerated.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::UserauthBanner as u8, "SSH_MSG_USERAUTH_BANNER")?;
        let message = r.read_utf8()?;
        let language_tag = if r.is_empty() {
            String::new()
        } else {
            r.read_utf8()?
        };
        Ok(Self {
            message,
            language_tag,
        })
    }
}

/// SSH_MSG_USERAUTH_PK_OK message (RFC 4252 Section 7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates a PK_OK message.
    pub fn new(algorithm: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key,
        }
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![MessageType::UserauthPkOk as u8];
        buf.put_string(&self.algorithm);
        buf.put_string(&self.public_key);
        buf
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::UserauthPkOk as u8, "SSH_MSG_USERAUTH_PK_OK")?;
        let algorithm = r.read_utf8()?;
        let public_key = r.read_string()?.to_vec();
        Ok(Self {
            algorithm,
            public_key,
        })
    }
}

/// One prompt of a keyboard-interactive INFO_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Text shown to the user
    pub text: String,
    /// Whether the answer may be echoed
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Name of the challenge
    pub name: String,
    /// Instructions for the user
    pub instruction: String,
    /// Prompts, possibly none
    pub prompts: Vec<Prompt>,
}

impl InfoRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![USERAUTH_INFO_REQUEST];
        buf.put_string(&self.name);
        buf.put_string(&self.instruction);
        buf.put_string("");
        buf.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            buf.put_string(&prompt.text);
            buf.put_bool(prompt.echo);
        }
        buf
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, USERAUTH_INFO_REQUEST, "SSH_MSG_USERAUTH_INFO_REQUEST")?;
        let name = r.read_utf8()?;
        let instruction = r.read_utf8()?;
        let _language = r.read_string()?;
        let count = r.read_u32()? as usize;
        // Each prompt needs at least five bytes.
        if count > r.remaining() / 5 {
            return Err(TetherError::Protocol(format!(
                "INFO_REQUEST claims {} prompts in {} bytes",
                count,
                r.remaining()
            )));
        }
        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            let text = r.read_utf8()?;
            let echo = r.read_bool()?;
            prompts.push(Prompt { text, echo });
        }
        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256 Section 3.4).
#[derive(Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// One answer per prompt, in order
    pub responses: Vec<Zeroizing<String>>,
}

impl std::fmt::Debug for InfoResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfoResponse")
            .field("responses", &self.responses.len())
            .finish()
    }
}

impl InfoResponse {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = Zeroizing::new(vec![MessageType::UserauthInfoResponse as u8]);
        buf.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            buf.put_string(response.as_bytes());
        }
        buf
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(
            &mut r,
            MessageType::UserauthInfoResponse as u8,
            "SSH_MSG_USERAUTH_INFO_RESPONSE",
        )?;
        let count = r.read_u32()? as usize;
        if count > r.remaining() / 4 {
            return Err(TetherError::Protocol(format!(
                "INFO_RESPONSE claims {} answers in {} bytes",
                count,
                r.remaining()
            )));
        }
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(Zeroizing::new(r.read_utf8()?));
        }
        r.finish()?;
        Ok(Self { responses })
    }
}

/// Data signed for public key authentication (RFC 4252 Section 7).
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(session_id.len() + public_key_blob.len() + 128);
    buf.put_string(session_id);
    buf.push(MessageType::UserauthRequest as u8);
    buf.put_string(user_name);
    buf.put_string(service_name);
    buf.put_string("publickey");
    buf.put_bool(true);
    buf.put_string(algorithm);
    buf.put_string(public_key_blob);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_request_round_trip() {
        let request = AuthRequest::new(
            "alice",
            SERVICE_CONNECTION,
            AuthMethod::Password(Zeroizing::new("secret".to_string())),
        );
        let parsed = AuthRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed.user_name(), "alice");
        assert_eq!(parsed.service_name(), "ssh-connection");
        assert!(matches!(parsed.method(), AuthMethod::Password(p) if p.as_str() == "secret"));
    }

    #[test]
    fn test_publickey_query_has_no_signature() {
        let request = AuthRequest::new(
            "bob",
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: vec![1, 2, 3],
                signature: None,
            },
        );
        let bytes = request.to_bytes();
        let parsed = AuthRequest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, request);

        // Flag byte right after the method name is FALSE.
        let flag_offset = 1 + 4 + 3 + 4 + 14 + 4 + 9;
        assert_eq!(bytes[flag_offset], 0);
    }

    #[test]
    fn test_keyboard_interactive_request() {
        let request = AuthRequest::new(
            "carol",
            SERVICE_CONNECTION,
            AuthMethod::KeyboardInteractive {
                submethods: String::new(),
            },
        );
        assert_eq!(AuthRequest::from_bytes(&request.to_bytes()).unwrap(), request);
    }

    #[test]
    fn test_unknown_method_rejected() {
        let mut buf = vec![50];
        buf.put_string("user");
        buf.put_string(SERVICE_CONNECTION);
        buf.put_string("hostbased");
        assert!(AuthRequest::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_failure_round_trip() {
        let failure = AuthFailure::new(vec!["publickey".to_string(), "password".to_string()], true);
        let parsed = AuthFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.methods_can_continue(), &["publickey", "password"]);
        assert!(parsed.partial_success());

        let empty = AuthFailure::from_bytes(&AuthFailure::new(vec![], false).to_bytes()).unwrap();
        assert!(empty.methods_can_continue().is_empty());
    }

    #[test]
    fn test_banner_without_language_tag() {
        let mut buf = vec![53];
        buf.put_string("Welcome\n");
        assert_eq!(AuthBanner::from_bytes(&buf).unwrap().message(), "Welcome\n");
    }

    #[test]
    fn test_info_request_round_trip() {
        let request = InfoRequest {
            name: "otp".to_string(),
            instruction: "Enter your code".to_string(),
            prompts: vec![
                Prompt {
                    text: "Password: ".to_string(),
                    echo: false,
                },
                Prompt {
                    text: "Code: ".to_string(),
                    echo: true,
                },
            ],
        };
        assert_eq!(InfoRequest::from_bytes(&request.to_bytes()).unwrap(), request);
    }

    #[test]
    fn test_info_request_prompt_count_bounded() {
        let mut buf = vec![60];
        buf.put_string("");
        buf.put_string("");
        buf.put_string("");
        buf.put_u32(1_000_000);
        assert!(InfoRequest::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_info_response_round_trip() {
        let response = InfoResponse {
            responses: vec![Zeroizing::new("hunter2".to_string())],
        };
        let parsed = InfoResponse::from_bytes(&response.to_bytes()).unwrap();
        assert_eq!(parsed.responses[0].as_str(), "hunter2");
        assert!(!format!("{:?}", parsed).contains("hunter2"));
    }

    #[test]
    fn test_service_messages() {
        assert_eq!(parse_service(&service_request(SERVICE_USERAUTH)).unwrap(), "ssh-userauth");
        assert_eq!(parse_service(&service_accept(SERVICE_USERAUTH)).unwrap(), "ssh-userauth");
        assert_eq!(parse_service(&[6]).unwrap(), "");
        assert!(parse_service(&[52]).is_err());
    }

    #[test]
    fn test_signature_data_layout() {
        let data = construct_signature_data(&[9; 32], "alice", SERVICE_CONNECTION, "ssh-ed25519", &[1, 2]);
        assert_eq!(&data[0..4], &[0, 0, 0, 32]);
        assert_eq!(data[36], 50);
        assert!(data.ends_with(&[0, 0, 0, 2, 1, 2]));
    }

    #[test]
    fn test_password_debug_redacted() {
        let method = AuthMethod::Password(Zeroizing::new("secret".to_string()));
        assert!(!format!("{:?}", method).contains("secret"));
    }
}
