//! SSH protocol message numbers (RFC 4250 Section 4.1).
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication** (50-79): Authentication protocol
//! - **Connection Protocol** (80-127): Global requests and channels
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! assert!(MessageType::is_transport(20));
//! ```

use crate::ssh::wire::WireWrite;

/// SSH message numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to an unknown message number.
    Unimplemented = 3,
    /// Debug message.
    Debug = 4,
    /// Service request (e.g. "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept.
    ServiceAccept = 6,
    /// Extension negotiation (RFC 8308).
    ExtInfo = 7,

    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - switch to the freshly derived keys.
    NewKeys = 21,

    /// DH / ECDH key exchange init (same number for both families).
    KexdhInit = 30,
    /// DH / ECDH key exchange reply.
    KexdhReply = 31,

    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Method-specific reply number 60.
    ///
    /// PK_OK for `publickey`, INFO_REQUEST for `keyboard-interactive`.
    UserauthPkOk = 60,
    /// Keyboard-interactive INFO_RESPONSE.
    UserauthInfoResponse = 61,

    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

/// Keyboard-interactive INFO_REQUEST shares number 60 with PK_OK.
pub const USERAUTH_INFO_REQUEST: u8 = 60;

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// ```rust
    /// use tether_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            7 => Some(MessageType::ExtInfo),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            61 => Some(MessageType::UserauthInfoResponse),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the message type name.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::ExtInfo => "SSH_MSG_EXT_INFO",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEX_ECDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEX_ECDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }

    /// Transport-layer messages, key exchange included (1-49).
    pub fn is_transport(byte: u8) -> bool {
        (1..=49).contains(&byte)
    }

    /// Messages that belong to a key exchange (20-49).
    pub fn is_kex(byte: u8) -> bool {
        (20..=49).contains(&byte)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Returns the message number of a payload, if any.
pub fn message_number(payload: &[u8]) -> Option<u8> {
    payload.first().copied()
}

/// Describes a payload's message number for logs.
pub fn describe(payload: &[u8]) -> String {
    match message_number(payload) {
        Some(n) => match MessageType::from_u8(n) {
            Some(t) => t.to_string(),
            None => format!("UNKNOWN({})", n),
        },
        None => "EMPTY".to_string(),
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// Host not allowed to connect
    HostNotAllowedToConnect = 1,
    /// Protocol error
    ProtocolError = 2,
    /// Key exchange failed
    KeyExchangeFailed = 3,
    /// MAC error
    MacError = 5,
    /// Service not available
    ServiceNotAvailable = 7,
    /// Host key not verifiable
    HostKeyNotVerifiable = 9,
    /// Connection lost
    ConnectionLost = 10,
    /// Disconnect by application
    ByApplication = 11,
    /// No more auth methods available
    NoMoreAuthMethodsAvailable = 14,
}

/// Builds an SSH_MSG_DISCONNECT payload.
pub fn disconnect(reason: DisconnectReason, description: &str) -> Vec<u8> {
    let mut msg = vec![MessageType::Disconnect as u8];
    msg.extend_from_slice(&(reason as u32).to_be_bytes());
    msg.put_string(description.as_bytes());
    msg.put_string(b"en");
    msg
}

/// Builds an SSH_MSG_UNIMPLEMENTED payload for a rejected sequence number.
pub fn unimplemented(sequence: u32) -> Vec<u8> {
    let mut msg = vec![MessageType::Unimplemented as u8];
    msg.extend_from_slice(&sequence.to_be_bytes());
    msg
}

/// Builds an SSH_MSG_IGNORE payload carrying `len` random bytes.
pub fn ignore(len: usize) -> Vec<u8> {
    use rand::RngCore;

    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    let mut msg = vec![MessageType::Ignore as u8];
    msg.put_string(&data);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::wire::WireReader;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(61), Some(MessageType::UserauthInfoResponse));
        assert_eq!(MessageType::from_u8(255), None);
        assert_eq!(USERAUTH_INFO_REQUEST, MessageType::UserauthPkOk as u8);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(format!("{}", MessageType::KexInit), "SSH_MSG_KEXINIT(20)");
        assert_eq!(describe(&[94, 0]), "SSH_MSG_CHANNEL_DATA(94)");
        assert_eq!(describe(&[200]), "UNKNOWN(200)");
        assert_eq!(describe(&[]), "EMPTY");
    }

    #[test]
    fn test_ranges() {
        assert!(MessageType::is_kex(MessageType::KexdhReply as u8));
        assert!(!MessageType::is_kex(MessageType::Ignore as u8));
        assert!(MessageType::is_transport(MessageType::Ignore as u8));
        assert!(!MessageType::is_transport(MessageType::ChannelData as u8));
    }

    #[test]
    fn test_disconnect_payload() {
        let msg = disconnect(DisconnectReason::ByApplication, "bye");
        let mut r = WireReader::new(&msg);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.read_u32().unwrap(), 11);
        assert_eq!(r.read_utf8().unwrap(), "bye");
        assert_eq!(r.read_utf8().unwrap(), "en");
        r.finish().unwrap();
    }

    #[test]
    fn test_ignore_payload_length() {
        let msg = ignore(16);
        let mut r = WireReader::new(&msg);
        assert_eq!(r.read_u8().unwrap(), 2);
        assert_eq!(r.read_string().unwrap().len(), 16);
    }
}
