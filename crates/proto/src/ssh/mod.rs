//! SSH client session engine (RFC 4251-4254).
//!
//! # Architecture
//!
//! The engine is layered, bottom-up:
//!
//! 1. **Wire and packets** ([`wire`], [`packet`], [`crypto`]) - SSH data
//!    types, binary packet framing, ciphers and MACs
//! 2. **Transport** ([`transport`], [`version`]) - TCP connect, identification
//!    exchange, sequence numbers and rekey accounting
//! 3. **Key exchange** ([`kex`], [`kex_dh`], [`handshake`], [`trust`]) -
//!    algorithm negotiation, Diffie-Hellman, host key verification
//! 4. **Authentication** ([`auth`], [`userauth`], [`privatekey`])
//! 5. **Connection** ([`connection`], [`channel`], [`mux`], [`dispatcher`]) -
//!    channel multiplexing with flow control
//! 6. **Session** ([`session`], [`config`], [`target`]) - the facade that
//!    ties one target to one interactive channel
//!
//! # Security Considerations
//!
//! - **Input Validation**: packet lengths are bounded before allocation
//! - **Constant-Time Operations**: MAC tags are compared in constant time
//! - **Memory Safety**: key material is zeroized on drop using [`zeroize`]
//! - **Host Keys**: strict checking against `known_hosts` by default
//!
//! # Example
//!
//! ```rust,no_run
//! use tether_proto::ssh::{Options, Session, Target};
//!
//! # async fn example() -> tether_proto::ssh::Result<()> {
//! let mut session = Session::new(Target::parse("deploy@build.internal"), Options::default());
//! let mut live = session.connect().await?;
//! let status = live.run_interactive().await?;
//! live.close().await?;
//! std::process::exit(status.code().unwrap_or(255) as i32);
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod hostkey;
pub mod keepalive;
pub mod kex;
pub mod kex_dh;
pub mod known_hosts;
pub mod logging;
pub mod message;
pub mod mux;
pub mod packet;
pub mod privatekey;
pub mod session;
pub mod target;
pub mod transport;
pub mod trust;
pub mod userauth;
pub mod version;
pub mod wire;

// Re-export main types
pub use channel::{Channel, ChannelMsg, ChannelState, ChannelWriter, ExitStatus, TryWriteError};
pub use config::{Options, OptionsBuilder};
pub use connection::{ChannelOpenFailureReason, ChannelRequestType, ConnectionMessage};
pub use crypto::{CipherAlgorithm, MacAlgorithm};
pub use error::{AttemptOutcome, AuthAttempt, Result, SshError};
pub use hostkey::PublicKey;
pub use kex::{negotiate_algorithm, AlgorithmPreferences, KexInit};
pub use message::{DisconnectReason, MessageType};
pub use mux::{Multiplexer, TransportHandle};
pub use packet::Packet;
pub use privatekey::PrivateKey;
pub use session::{LiveSession, Session, SessionState};
pub use target::Target;
pub use transport::RekeyLimits;
pub use trust::{HostKeyChecking, HostKeyStore, KnownHostsStore, MemoryHostKeyStore, TrustDecision};
pub use userauth::{AuthPrompter, Authenticated, Credentials, StaticPrompter};
pub use version::Version;
