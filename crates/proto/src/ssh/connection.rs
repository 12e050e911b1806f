//! SSH connection protocol messages (RFC 4254).
//!
//! Every message with a number from 80 to 100 parses into one
//! [`ConnectionMessage`], which is what the dispatcher routes on:
//! - global requests and their replies
//! - channel open, confirmation and failure
//! - window adjust, data, extended data, EOF and close
//! - channel requests (`pty-req`, `shell`, `exec`, `exit-status`, ...)
//!   and their replies
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::connection::{ChannelRequest, ChannelRequestType, ConnectionMessage};
//!
//! let exec = ChannelRequest::new(0, ChannelRequestType::Exec { command: "uptime".into() }, true);
//! let parsed = ConnectionMessage::parse(&exec.to_bytes()).unwrap();
//! assert_eq!(parsed.recipient(), Some(0));
//! ```

use bytes::BufMut;
use tether_platform::{TetherError, TetherResult};

use crate::ssh::message::MessageType;
use crate::ssh::wire::{WireReader, WireWrite};

/// Receive window advertised for every channel (2 MiB).
pub const CHANNEL_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Largest data packet we accept per channel message.
pub const CHANNEL_MAX_PACKET: u32 = 32 * 1024;

/// Global request used for keepalive probes.
pub const KEEPALIVE_REQUEST: &str = "keepalive@openssh.com";

/// Extended data type for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts a wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Human readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "administratively prohibited",
            Self::ConnectFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type (`session`, `direct-tcpip`, ...)
    pub channel_type: String,
    /// Sender's channel number
    pub sender_channel: u32,
    /// Initial window the sender grants
    pub initial_window_size: u32,
    /// Largest packet the sender accepts
    pub maximum_packet_size: u32,
    /// Type specific data, kept opaque
    pub type_data: Vec<u8>,
}

impl ChannelOpen {
    /// Opens a `session` channel.
    pub fn session(sender_channel: u32, initial_window_size: u32, maximum_packet_size: u32) -> Self {
        Self {
            channel_type: "session".to_string(),
            sender_channel,
            initial_window_size,
            maximum_packet_size,
            type_data: Vec::new(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![MessageType::ChannelOpen as u8];
        buf.put_string(&self.channel_type);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.extend_from_slice(&self.type_data);
        buf
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Our channel number
    pub recipient_channel: u32,
    /// Peer's channel number
    pub sender_channel: u32,
    /// Window the peer grants us
    pub initial_window_size: u32,
    /// Largest data packet the peer accepts
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![MessageType::ChannelOpenConfirmation as u8];
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Channel number of the failed open
    pub recipient_channel: u32,
    /// Reason code; unknown codes are kept as is
    pub reason_code: u32,
    /// Description from the peer
    pub description: String,
}

impl ChannelOpenFailure {
    /// Creates a failure with the standard description for `reason`.
    pub fn new(recipient_channel: u32, reason: ChannelOpenFailureReason) -> Self {
        Self {
            recipient_channel,
            reason_code: reason as u32,
            description: reason.as_str().to_string(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![MessageType::ChannelOpenFailure as u8];
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code);
        buf.put_string(&self.description);
        buf.put_string("");
        buf
    }
}

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Pseudo-terminal allocation
    PtyReq {
        /// Terminal type (e.g., "xterm-256color")
        term: String,
        /// Width in characters
        width_chars: u32,
        /// Height in rows
        height_rows: u32,
        /// Width in pixels
        width_pixels: u32,
        /// Height in pixels
        height_pixels: u32,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Run a command
    Exec {
        /// Command line
        command: String,
    },
    /// Start the user's shell
    Shell,
    /// Terminal size changed
    WindowChange {
        /// Width in characters
        width_chars: u32,
        /// Height in rows
        height_rows: u32,
        /// Width in pixels
        width_pixels: u32,
        /// Height in pixels
        height_pixels: u32,
    },
    /// Remote command exited
    ExitStatus {
        /// Exit code
        exit_status: u32,
    },
    /// Remote command was killed by a signal
    ExitSignal {
        /// Signal name without the "SIG" prefix
        signal_name: String,
        /// Whether a core was dumped
        core_dumped: bool,
        /// Error message
        error_message: String,
    },
    /// Any other request; its data is kept opaque
    Other {
        /// Request name
        name: String,
        /// Request specific data
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Channel number at the receiver
    pub recipient_channel: u32,
    /// What is requested
    pub request_type: ChannelRequestType,
    /// Whether SUCCESS/FAILURE is expected
    pub want_reply: bool,
}

impl ChannelRequest {
    /// Creates a channel request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![MessageType::ChannelRequest as u8];
        buf.put_u32(self.recipient_channel);
        buf.put_string(self.request_type.name());
        buf.put_bool(self.want_reply);

        match &self.request_type {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                buf.put_string(term);
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
                buf.put_string(modes);
            }
            ChannelRequestType::Env { name, value } => {
                buf.put_string(name);
                buf.put_string(value);
            }
            ChannelRequestType::Exec { command } => buf.put_string(command),
            ChannelRequestType::Shell => {}
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
            } => {
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
            }
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
            } => {
                buf.put_string(signal_name);
                buf.put_bool(*core_dumped);
                buf.put_string(error_message);
                buf.put_string("");
            }
            ChannelRequestType::Other { data, .. } => buf.extend_from_slice(data),
        }
        buf
    }

    fn parse_body(r: &mut WireReader<'_>) -> TetherResult<Self> {
        let recipient_channel = r.read_u32()?;
        let name = r.read_utf8()?;
        let want_reply = r.read_bool()?;

        let request_type = match name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: r.read_utf8()?,
                width_chars: r.read_u32()?,
                height_rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
                modes: r.read_string()?.to_vec(),
            },
            "env" => ChannelRequestType::Env {
                name: r.read_utf8()?,
                value: r.read_utf8()?,
            },
            "exec" => ChannelRequestType::Exec {
                command: String::from_utf8_lossy(r.read_string()?).into_owned(),
            },
            "shell" => ChannelRequestType::Shell,
            "window-change" => ChannelRequestType::WindowChange {
                width_chars: r.read_u32()?,
                height_rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: r.read_u32()?,
            },
            "exit-signal" => {
                let signal_name = r.read_utf8()?;
                let core_dumped = r.read_bool()?;
                let error_message = String::from_utf8_lossy(r.read_string()?).into_owned();
                // language tag
                if !r.is_empty() {
                    r.read_string()?;
                }
                ChannelRequestType::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                }
            }
            _ => ChannelRequestType::Other {
                name,
                data: r.rest().to_vec(),
            },
        };
        if !matches!(request_type, ChannelRequestType::Other { .. }) {
            r.finish()?;
        }

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

/// Any connection protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMessage {
    /// SSH_MSG_GLOBAL_REQUEST
    GlobalRequest {
        /// Request name
        name: String,
        /// Whether a reply is expected
        want_reply: bool,
    },
    /// SSH_MSG_REQUEST_SUCCESS
    RequestSuccess,
    /// SSH_MSG_REQUEST_FAILURE
    RequestFailure,
    /// SSH_MSG_CHANNEL_OPEN
    Open(ChannelOpen),
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    OpenConfirmation(ChannelOpenConfirmation),
    /// SSH_MSG_CHANNEL_OPEN_FAILURE
    OpenFailure(ChannelOpenFailure),
    /// SSH_MSG_CHANNEL_WINDOW_ADJUST
    WindowAdjust {
        /// Channel number at the receiver
        recipient: u32,
        /// Bytes added to the window
        bytes_to_add: u32,
    },
    /// SSH_MSG_CHANNEL_DATA
    Data {
        /// Channel number at the receiver
        recipient: u32,
        /// Payload bytes
        data: Vec<u8>,
    },
    /// SSH_MSG_CHANNEL_EXTENDED_DATA
    ExtendedData {
        /// Channel number at the receiver
        recipient: u32,
        /// Data type code (1 = stderr)
        code: u32,
        /// Payload bytes
        data: Vec<u8>,
    },
    /// SSH_MSG_CHANNEL_EOF
    Eof {
        /// Channel number at the receiver
        recipient: u32,
    },
    /// SSH_MSG_CHANNEL_CLOSE
    Close {
        /// Channel number at the receiver
        recipient: u32,
    },
    /// SSH_MSG_CHANNEL_REQUEST
    Request(ChannelRequest),
    /// SSH_MSG_CHANNEL_SUCCESS
    Success {
        /// Channel number at the receiver
        recipient: u32,
    },
    /// SSH_MSG_CHANNEL_FAILURE
    Failure {
        /// Channel number at the receiver
        recipient: u32,
    },
}

impl ConnectionMessage {
    /// Parses a payload with a message number from 80 to 100.
    pub fn parse(payload: &[u8]) -> TetherResult<Self> {
        let mut r = WireReader::new(payload);
        let number = r.read_u8()?;
        let msg_type = MessageType::from_u8(number).ok_or_else(|| {
            TetherError::Protocol(format!("Unknown connection message {}", number))
        })?;

        let message = match msg_type {
            MessageType::GlobalRequest => {
                let name = r.read_utf8()?;
                let want_reply = r.read_bool()?;
                // Request specific data is ignored: we never accept one.
                return Ok(ConnectionMessage::GlobalRequest { name, want_reply });
            }
            // Success may carry request specific data (e.g. a bound port).
            MessageType::RequestSuccess => return Ok(ConnectionMessage::RequestSuccess),
            MessageType::RequestFailure => ConnectionMessage::RequestFailure,
            MessageType::ChannelOpen => {
                let channel_type = r.read_utf8()?;
                let sender_channel = r.read_u32()?;
                let initial_window_size = r.read_u32()?;
                let maximum_packet_size = r.read_u32()?;
                return Ok(ConnectionMessage::Open(ChannelOpen {
                    channel_type,
                    sender_channel,
                    initial_window_size,
                    maximum_packet_size,
                    type_data: r.rest().to_vec(),
                }));
            }
            MessageType::ChannelOpenConfirmation => {
                let confirmation = ChannelOpenConfirmation {
                    recipient_channel: r.read_u32()?,
                    sender_channel: r.read_u32()?,
                    initial_window_size: r.read_u32()?,
                    maximum_packet_size: r.read_u32()?,
                };
                // Type specific data follows for some channel types.
                return Ok(ConnectionMessage::OpenConfirmation(confirmation));
            }
            MessageType::ChannelOpenFailure => {
                let recipient_channel = r.read_u32()?;
                let reason_code = r.read_u32()?;
                let description = String::from_utf8_lossy(r.read_string()?).into_owned();
                if !r.is_empty() {
                    r.read_string()?;
                }
                ConnectionMessage::OpenFailure(ChannelOpenFailure {
                    recipient_channel,
                    reason_code,
                    description,
                })
            }
            MessageType::ChannelWindowAdjust => ConnectionMessage::WindowAdjust {
                recipient: r.read_u32()?,
                bytes_to_add: r.read_u32()?,
            },
            MessageType::ChannelData => ConnectionMessage::Data {
                recipient: r.read_u32()?,
                data: r.read_string()?.to_vec(),
            },
            MessageType::ChannelExtendedData => ConnectionMessage::ExtendedData {
                recipient: r.read_u32()?,
                code: r.read_u32()?,
                data: r.read_string()?.to_vec(),
            },
            MessageType::ChannelEof => ConnectionMessage::Eof {
                recipient: r.read_u32()?,
            },
            MessageType::ChannelClose => ConnectionMessage::Close {
                recipient: r.read_u32()?,
            },
            MessageType::ChannelRequest => {
                return Ok(ConnectionMessage::Request(ChannelRequest::parse_body(&mut r)?))
            }
            MessageType::ChannelSuccess => ConnectionMessage::Success {
                recipient: r.read_u32()?,
            },
            MessageType::ChannelFailure => ConnectionMessage::Failure {
                recipient: r.read_u32()?,
            },
            other => {
                return Err(TetherError::Protocol(format!(
                    "{} is not a connection protocol message",
                    other
                )))
            }
        };
        r.finish()?;
        Ok(message)
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ConnectionMessage::GlobalRequest { name, want_reply } => {
                let mut buf = vec![MessageType::GlobalRequest as u8];
                buf.put_string(name);
                buf.put_bool(*want_reply);
                buf
            }
            ConnectionMessage::RequestSuccess => vec![MessageType::RequestSuccess as u8],
            ConnectionMessage::RequestFailure => vec![MessageType::RequestFailure as u8],
            ConnectionMessage::Open(open) => open.to_bytes(),
            ConnectionMessage::OpenConfirmation(c) => c.to_bytes(),
            ConnectionMessage::OpenFailure(f) => f.to_bytes(),
            ConnectionMessage::WindowAdjust {
                recipient,
                bytes_to_add,
            } => with_recipient(MessageType::ChannelWindowAdjust, *recipient, |buf| {
                buf.put_u32(*bytes_to_add)
            }),
            ConnectionMessage::Data { recipient, data } => {
                with_recipient(MessageType::ChannelData, *recipient, |buf| buf.put_string(data))
            }
            ConnectionMessage::ExtendedData {
                recipient,
                code,
                data,
            } => with_recipient(MessageType::ChannelExtendedData, *recipient, |buf| {
                buf.put_u32(*code);
                buf.put_string(data);
            }),
            ConnectionMessage::Eof { recipient } => {
                with_recipient(MessageType::ChannelEof, *recipient, |_| {})
            }
            ConnectionMessage::Close { recipient } => {
                with_recipient(MessageType::ChannelClose, *recipient, |_| {})
            }
            ConnectionMessage::Request(request) => request.to_bytes(),
            ConnectionMessage::Success { recipient } => {
                with_recipient(MessageType::ChannelSuccess, *recipient, |_| {})
            }
            ConnectionMessage::Failure { recipient } => {
                with_recipient(MessageType::ChannelFailure, *recipient, |_| {})
            }
        }
    }

    /// Channel number this message is addressed to, for channel messages.
    pub fn recipient(&self) -> Option<u32> {
        match self {
            ConnectionMessage::OpenConfirmation(c) => Some(c.recipient_channel),
            ConnectionMessage::OpenFailure(f) => Some(f.recipient_channel),
            ConnectionMessage::WindowAdjust { recipient, .. }
            | ConnectionMessage::Data { recipient, .. }
            | ConnectionMessage::ExtendedData { recipient, .. }
            | ConnectionMessage::Eof { recipient }
            | ConnectionMessage::Close { recipient }
            | ConnectionMessage::Success { recipient }
            | ConnectionMessage::Failure { recipient } => Some(*recipient),
            ConnectionMessage::Request(request) => Some(request.recipient_channel),
            _ => None,
        }
    }
}

fn with_recipient(msg: MessageType, recipient: u32, body: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.put_u8(msg as u8);
    buf.put_u32(recipient);
    body(&mut buf);
    buf
}
