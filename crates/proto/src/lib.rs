//! Embedded SSH client session engine.
//!
//! Connects to a remote host, negotiates keys, verifies the host key,
//! authenticates and multiplexes channels over a single transport. One
//! interactive session channel is the primary use.
//!
//! # Features
//!
//! - `ssh` (default) - the SSH client
//! - `serde` - `Serialize`/`Deserialize` for options, targets and exit
//!   statuses
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::Packet;
//!
//! // Frame a payload the way it travels before encryption
//! let packet = Packet::new(b"SSH message payload".to_vec()).unwrap();
//! let wire_format = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&wire_format).unwrap();
//! assert_eq!(parsed.payload(), b"SSH message payload");
//! ```
//!
//! # Security
//!
//! - Cryptographic primitives come from vetted libraries (`ring`, `dalek`,
//!   RustCrypto)
//! - Secrets are zeroized on drop with `zeroize`
//! - Packet parsing is fuzzed (`fuzz/`)
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
