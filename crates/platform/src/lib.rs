//! # Tether Platform
//!
//! Shared error and result types for the Tether SSH engine.
//!
//! Codec-level code (packet framing, message parsing, key material,
//! known-hosts parsing) reports failures with [`TetherError`]. Higher layers
//! map these onto their own, richer taxonomies.
//!
//! # Examples
//!
//! ```
//! use tether_platform::{TetherError, TetherResult};
//!
//! fn parse_port(text: &str) -> TetherResult<u16> {
//!     text.parse()
//!         .map_err(|_| TetherError::Config(format!("invalid port: {}", text)))
//! }
//!
//! # fn main() -> TetherResult<()> {
//! assert_eq!(parse_port("2222")?, 2222);
//! assert!(parse_port("ssh").is_err());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{TetherError, TetherResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
