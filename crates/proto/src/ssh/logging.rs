//! Structured logging for SSH sessions
//!
//! Thin wrappers over `tracing` so that every milestone of a session is
//! reported with the same field names, whichever module emits it.
//!
//! # Log Levels
//!
//! - **TRACE**: Individual packets (message name, sequence number, size)
//! - **DEBUG**: Protocol steps (negotiation results, auth methods tried)
//! - **INFO**: Session milestones (connected, authenticated, rekeyed, exit status)
//! - **WARN**: Recoverable anomalies (refused server requests, ignored messages)
//! - **ERROR**: Terminal failures
//!
//! Keys, passwords and shared secrets never reach these helpers.
//!
//! # Example
//!
//! ```no_run
//! use tether_proto::ssh::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("tether_proto::ssh=debug")
//!     .init();
//!
//! logging::log_state_transition("alice@example.com", "Negotiating", "Authenticating");
//! ```

use tracing::{debug, error, info, trace, warn};

/// Log a session state transition
pub fn log_state_transition(peer: &str, from: &str, to: &str) {
    info!(
        peer = peer,
        state_from = from,
        state_to = to,
        "SSH session state transition"
    );
}

/// Log the version exchange result
///
/// # Arguments
///
/// * `peer` - Remote address
/// * `server_version` - Identification line sent by the server
pub fn log_version_exchange(peer: &str, server_version: &str) {
    debug!(
        peer = peer,
        server_version = server_version,
        "SSH version exchange complete"
    );
}

/// Log the algorithms chosen by negotiation
pub fn log_negotiated(kex: &str, host_key: &str, cipher_c2s: &str, cipher_s2c: &str, mac: &str) {
    debug!(
        kex = kex,
        host_key = host_key,
        cipher = cipher_c2s,
        cipher_s2c = cipher_s2c,
        mac = mac,
        "SSH algorithms negotiated"
    );
}

/// Log the host key trust decision
///
/// # Arguments
///
/// * `host` - Host name as given by the caller
/// * `port` - Port
/// * `key_type` - Host key algorithm
/// * `fingerprint` - SHA-256 fingerprint
/// * `decision` - "known", "accepted-new", "insecure" or "rejected"
pub fn log_host_key_decision(host: &str, port: u16, key_type: &str, fingerprint: &str, decision: &str) {
    if decision == "rejected" {
        warn!(
            host = host,
            port = port,
            host_key = key_type,
            fingerprint = fingerprint,
            decision = decision,
            "SSH host key rejected"
        );
    } else {
        info!(
            host = host,
            port = port,
            host_key = key_type,
            fingerprint = fingerprint,
            decision = decision,
            "SSH host key verified"
        );
    }
}

/// Log an authentication attempt and its outcome
pub fn log_auth_attempt(user: &str, method: &str, key: Option<&str>, outcome: &str) {
    debug!(
        user = user,
        method = method,
        fingerprint = key.unwrap_or("-"),
        outcome = outcome,
        "SSH authentication attempt"
    );
}

/// Log successful authentication
pub fn log_authenticated(user: &str, method: &str) {
    info!(user = user, method = method, "SSH user authenticated");
}

/// Log a channel lifecycle event ("open", "eof", "close", ...)
pub fn log_channel_event(channel: u32, event: &str) {
    debug!(channel = channel, event = event, "SSH channel event");
}

/// Log a server request the client refused or ignored
pub fn log_refused_request(kind: &str, name: &str) {
    warn!(kind = kind, request = name, "SSH server request refused");
}

/// Log a single packet
///
/// # Arguments
///
/// * `direction` - "send" or "recv"
/// * `message` - Message name from [`crate::ssh::message::describe`]
/// * `seq` - Sequence number of the packet
/// * `len` - Bytes on the wire
pub fn log_packet(direction: &str, message: &str, seq: u32, len: usize) {
    trace!(
        direction = direction,
        message = message,
        seq_num = seq,
        wire_len = len,
        "SSH packet"
    );
}

/// Log rekey start
///
/// # Arguments
///
/// * `initiator` - "client" or "server"
pub fn log_rekey_start(initiator: &str) {
    info!(initiator = initiator, "SSH key re-exchange started");
}

/// Log completion of a key exchange
pub fn log_kex_complete(kex: &str, rekey: bool, strict: bool) {
    info!(kex = kex, rekey = rekey, strict_kex = strict, "SSH key exchange complete");
}

/// Log the exit status of the remote command
pub fn log_exit_status(channel: u32, status: &str) {
    info!(channel = channel, exit_status = status, "SSH remote command finished");
}

/// Log a disconnect, sent or received
pub fn log_disconnect(peer: &str, reason: u32, description: &str, local: bool) {
    info!(
        peer = peer,
        reason = reason,
        description = description,
        local = local,
        "SSH disconnect"
    );
}

/// Log a terminal transport failure
pub fn log_transport_failed(peer: &str, error: &str) {
    error!(peer = peer, error = error, "SSH transport failed");
}
