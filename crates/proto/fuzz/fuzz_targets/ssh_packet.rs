//! Fuzz target for the parsers that see untrusted server input.
//!
//! None of them may panic, whatever the bytes:
//! - binary packet framing
//! - KEXINIT and key exchange replies
//! - authentication and connection messages
//! - identification lines
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use tether_proto::ssh::auth::{AuthFailure, AuthRequest, InfoRequest};
use tether_proto::ssh::connection::ConnectionMessage;
use tether_proto::ssh::kex::KexInit;
use tether_proto::ssh::kex_dh::KexReply;
use tether_proto::ssh::{Packet, Version};

fuzz_target!(|data: &[u8]| {
    // A packet that parses must survive re-framing unchanged
    if let Ok(packet) = Packet::from_bytes(data) {
        let serialized = packet.to_bytes();
        let reparsed = Packet::from_bytes(&serialized).expect("Round-trip parsing should never fail");
        assert_eq!(packet.payload(), reparsed.payload());
    }

    let _ = KexInit::from_bytes(data);
    let _ = KexReply::parse(data, false);
    let _ = KexReply::parse(data, true);
    let _ = AuthRequest::from_bytes(data);
    let _ = AuthFailure::from_bytes(data);
    let _ = InfoRequest::from_bytes(data);
    let _ = ConnectionMessage::parse(data);

    if let Ok(line) = std::str::from_utf8(data) {
        let _ = Version::parse(line);
    }
});
