//! SSH Transport Layer (RFC 4253).
//!
//! Connection setup, identification exchange and the binary packet
//! protocol. One [`PacketReader`] and one [`PacketWriter`] own the two
//! directions of a socket, so framing and decryption of each direction is
//! never shared between tasks.
//!
//! # Transport States
//!
//! 1. **VersionExchange** - Exchange SSH-2.0 identification lines
//! 2. **KexInit** - SSH_MSG_KEXINIT sent or received
//! 3. **KeyExchange** - ECDH/DH messages in flight
//! 4. **NewKeys** - SSH_MSG_NEWKEYS sent, waiting for the peer's
//! 5. **Encrypted** - Keys in effect; rekeying returns to KexInit
//!
//! # Rekeying
//!
//! [`TrafficCounter`] tracks traffic since the last key exchange and
//! reports when any of the [`RekeyLimits`] is reached.
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::transport::{State, StateTracker};
//!
//! let mut state = StateTracker::new();
//! assert_eq!(state.current(), State::VersionExchange);
//! state.transition(State::KexInit).unwrap();
//! assert!(state.transition(State::Encrypted).is_err());
//! ```

use std::time::Duration;

use tether_platform::{TetherError, TetherResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use crate::ssh::crypto::{PacketOpener, PacketSealer};
use crate::ssh::error::{Result, SshError};
use crate::ssh::logging;
use crate::ssh::message;
use crate::ssh::packet::check_packet_length;
use crate::ssh::version::{is_identification_line, Version, MAX_VERSION_LENGTH};

/// Lines a server may send before its identification line.
const MAX_PRE_BANNER_LINES: usize = 1024;

/// Opens the TCP connection to `host:port` within `timeout`.
pub async fn open(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(SshError::Connect {
                addr,
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(SshError::Timeout {
                stage: "connect",
                after: timeout,
            })
        }
    };
    stream.set_nodelay(true)?;
    debug!(peer = %addr, "TCP connection established");
    Ok(stream)
}

/// Sends our identification line and reads the peer's within `timeout`.
///
/// Lines before the peer's `SSH-` line are skipped.
pub async fn exchange_versions<S>(stream: &mut S, ours: &Version, timeout: Duration) -> Result<Version>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, identify(stream, ours))
        .await
        .map_err(|_| SshError::Timeout {
            stage: "banner",
            after: timeout,
        })?
}

async fn identify<S>(stream: &mut S, ours: &Version) -> Result<Version>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&ours.to_wire_format()).await?;
    stream.flush().await?;

    for _ in 0..MAX_PRE_BANNER_LINES {
        let line = read_line(stream).await?;
        if is_identification_line(&line) {
            let text = std::str::from_utf8(&line)
                .map_err(|_| SshError::protocol("Identification line is not UTF-8"))?;
            return Ok(Version::parse(text)?);
        }
        debug!(line = %String::from_utf8_lossy(&line).trim_end(), "Skipping pre-banner line");
    }
    Err(SshError::protocol("No identification line received"))
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = stream.read_u8().await?;
        line.push(byte);
        if byte == b'\n' {
            return Ok(line);
        }
        if line.len() >= MAX_VERSION_LENGTH {
            return Err(SshError::protocol("Identification line too long"));
        }
    }
}

/// SSH transport layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Identification lines being exchanged.
    VersionExchange,
    /// SSH_MSG_KEXINIT sent or received.
    KexInit,
    /// Key exchange method messages in flight.
    KeyExchange,
    /// Our SSH_MSG_NEWKEYS sent, waiting for the peer's.
    NewKeys,
    /// Keys installed, application traffic flowing.
    Encrypted,
}

/// Validated transport state transitions.
#[derive(Debug, Clone)]
pub struct StateTracker {
    state: State,
}

impl StateTracker {
    /// Starts in [`State::VersionExchange`].
    pub fn new() -> Self {
        Self {
            state: State::VersionExchange,
        }
    }

    /// Current state.
    pub fn current(&self) -> State {
        self.state
    }

    /// Returns `true` once the first key exchange has completed.
    pub fn is_encrypted(&self) -> bool {
        self.state == State::Encrypted
    }

    /// Moves to `next`, rejecting transitions the protocol does not allow.
    pub fn transition(&mut self, next: State) -> TetherResult<()> {
        let valid = matches!(
            (self.state, next),
            (State::VersionExchange, State::KexInit)
                | (State::KexInit, State::KeyExchange)
                | (State::KeyExchange, State::NewKeys)
                | (State::NewKeys, State::Encrypted)
                | (State::Encrypted, State::KexInit)
        ) || self.state == next;

        if !valid {
            return Err(TetherError::Protocol(format!(
                "Invalid state transition: {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A decrypted packet and where it sat in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Message payload
    pub payload: Vec<u8>,
    /// Receive sequence number of this packet
    pub sequence: u32,
    /// Bytes the packet occupied on the wire
    pub wire_len: usize,
}

/// Receiving half of the binary packet protocol.
pub struct PacketReader<R> {
    inner: R,
    opener: PacketOpener,
    sequence: u32,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Wraps the read half of a connection, unencrypted.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            opener: PacketOpener::plain(),
            sequence: 0,
        }
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Installs new inbound keys, optionally resetting the sequence number.
    pub fn install(&mut self, opener: PacketOpener, reset_sequence: bool) {
        self.opener = opener;
        if reset_sequence {
            self.sequence = 0;
        }
    }

    /// Reads, authenticates and decrypts the next packet.
    pub async fn receive(&mut self) -> TetherResult<InboundPacket> {
        let seq = self.sequence;
        let mut first = vec![0u8; self.opener.first_block_len()];
        self.inner.read_exact(&mut first).await?;

        let packet_length = check_packet_length(self.opener.decrypt_length(seq, &mut first)?)?;
        let remaining = self.opener.remaining_len(packet_length)?;

        let mut wire = first;
        let start = wire.len();
        wire.resize(start + remaining, 0);
        self.inner.read_exact(&mut wire[start..]).await?;
        let wire_len = wire.len();

        let payload = self.opener.open(seq, wire)?;
        self.sequence = self.sequence.wrapping_add(1);
        logging::log_packet("recv", &message::describe(&payload), seq, wire_len);

        Ok(InboundPacket {
            payload,
            sequence: seq,
            wire_len,
        })
    }
}

/// Sending half of the binary packet protocol.
pub struct PacketWriter<W> {
    inner: W,
    sealer: PacketSealer,
    sequence: u32,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Wraps the write half of a connection, unencrypted.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            sealer: PacketSealer::plain(),
            sequence: 0,
        }
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Installs new outbound keys, optionally resetting the sequence number.
    pub fn install(&mut self, sealer: PacketSealer, reset_sequence: bool) {
        self.sealer = sealer;
        if reset_sequence {
            self.sequence = 0;
        }
    }

    /// Frames, protects and writes one payload. Returns the bytes written.
    pub async fn send(&mut self, payload: Vec<u8>) -> TetherResult<usize> {
        let seq = self.sequence;
        let name = message::describe(&payload);
        let wire = self.sealer.seal(seq, payload)?;
        self.inner.write_all(&wire).await?;
        self.inner.flush().await?;
        self.sequence = self.sequence.wrapping_add(1);
        logging::log_packet("send", &name, seq, wire.len());
        Ok(wire.len())
    }

    /// Shuts the write half down, ignoring a peer that already went away.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.inner.shutdown().await {
            debug!(error = %e, "Socket shutdown failed");
        }
    }
}

/// Thresholds that trigger a key re-exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RekeyLimits {
    /// Bytes in both directions
    pub bytes: u64,
    /// Time since the last exchange
    pub time: Duration,
    /// Packets in either direction
    pub packets: u64,
}

impl Default for RekeyLimits {
    fn default() -> Self {
        Self {
            bytes: 1 << 30,
            time: Duration::from_secs(3600),
            packets: 1 << 31,
        }
    }
}

/// Traffic since the last key exchange.
#[derive(Debug, Clone)]
pub struct TrafficCounter {
    bytes: u64,
    packets_in: u64,
    packets_out: u64,
    since: Instant,
}

impl TrafficCounter {
    /// Starts counting now.
    pub fn new() -> Self {
        Self {
            bytes: 0,
            packets_in: 0,
            packets_out: 0,
            since: Instant::now(),
        }
    }

    /// Records a received packet.
    pub fn record_inbound(&mut self, wire_len: usize) {
        self.bytes = self.bytes.saturating_add(wire_len as u64);
        self.packets_in += 1;
    }

    /// Records a sent packet.
    pub fn record_outbound(&mut self, wire_len: usize) {
        self.bytes = self.bytes.saturating_add(wire_len as u64);
        self.packets_out += 1;
    }

    /// Bytes counted so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Returns `true` once any limit is reached.
    pub fn needs_rekey(&self, limits: &RekeyLimits) -> bool {
        self.bytes >= limits.bytes
            || self.packets_in >= limits.packets
            || self.packets_out >= limits.packets
            || self.since.elapsed() >= limits.time
    }

    /// When the time limit runs out, if it can be represented.
    pub fn deadline(&self, limits: &RekeyLimits) -> Option<Instant> {
        self.since.checked_add(limits.time)
    }

    /// Restarts counting after a completed exchange.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for TrafficCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, DirectionKeys};

    #[test]
    fn test_state_transition_valid() {
        let mut state = StateTracker::new();
        state.transition(State::KexInit).unwrap();
        state.transition(State::KeyExchange).unwrap();
        state.transition(State::NewKeys).unwrap();
        state.transition(State::Encrypted).unwrap();
        assert!(state.is_encrypted());

        // Rekey: return to KexInit
        state.transition(State::KexInit).unwrap();
        assert_eq!(state.current(), State::KexInit);
    }

    #[test]
    fn test_state_transition_invalid() {
        let mut state = StateTracker::new();
        match state.transition(State::Encrypted) {
            Err(TetherError::Protocol(msg)) => assert!(msg.contains("Invalid state transition")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_rekey_limits() {
        let limits = RekeyLimits {
            bytes: 1000,
            time: Duration::from_secs(3600),
            packets: 10,
        };
        let mut counter = TrafficCounter::new();
        counter.record_outbound(500);
        assert!(!counter.needs_rekey(&limits));
        counter.record_inbound(600);
        assert!(counter.needs_rekey(&limits));

        counter.reset();
        assert_eq!(counter.bytes(), 0);
        for _ in 0..10 {
            counter.record_inbound(1);
        }
        assert!(counter.needs_rekey(&limits));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rekey_after_time_limit() {
        let limits = RekeyLimits {
            time: Duration::from_secs(60),
            ..RekeyLimits::default()
        };
        let counter = TrafficCounter::new();
        assert!(!counter.needs_rekey(&limits));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(counter.needs_rekey(&limits));
    }

    #[tokio::test]
    async fn test_version_exchange_skips_pre_banner_lines() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(async move {
            server
                .write_all(b"Welcome\r\nAuthorized use only\r\nSSH-2.0-TestServer_1.0\r\n")
                .await
                .unwrap();
            let mut buf = vec![0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            buf.truncate(n);
            buf
        });

        let ours = Version::new("Tether_test", None);
        let theirs = exchange_versions(&mut client, &ours, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(theirs.software(), "TestServer_1.0");
        assert_eq!(server_task.await.unwrap(), b"SSH-2.0-Tether_test\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_exchange_times_out() {
        let (mut client, _server) = tokio::io::duplex(1024);
        let ours = Version::new("Tether_test", None);
        let err = exchange_versions(&mut client, &ours, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::Timeout { stage: "banner", .. }));
    }

    #[tokio::test]
    async fn test_open_refused_is_connect_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = open("127.0.0.1", port, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, SshError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_packets_flow_with_sequence_numbers() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = PacketWriter::new(a);
        let mut reader = PacketReader::new(b);

        for i in 0..3u8 {
            writer.send(vec![2, i]).await.unwrap();
        }
        for i in 0..3u8 {
            let packet = reader.receive().await.unwrap();
            assert_eq!(packet.payload, vec![2, i]);
            assert_eq!(packet.sequence, i as u32);
        }
        assert_eq!(writer.sequence(), 3);
    }

    #[tokio::test]
    async fn test_encrypted_packets_after_install() {
        let keys = DirectionKeys::new(
            CipherAlgorithm::Aes256Gcm,
            None,
            vec![1u8; 12],
            vec![2u8; 32],
            Vec::new(),
        );
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = PacketWriter::new(a);
        let mut reader = PacketReader::new(b);

        writer.send(vec![21]).await.unwrap();
        assert_eq!(reader.receive().await.unwrap().payload, vec![21]);

        writer.install(PacketSealer::new(&keys).unwrap(), false);
        reader.install(PacketOpener::new(&keys).unwrap(), false);

        let big = vec![94u8; 20_000];
        writer.send(big.clone()).await.unwrap();
        let packet = reader.receive().await.unwrap();
        assert_eq!(packet.payload, big);
        assert_eq!(packet.sequence, 1);
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = PacketReader::new(b);
        a.write_all(&[0, 1, 0, 0, 4]).await.unwrap();
        assert!(matches!(
            reader.receive().await,
            Err(TetherError::Protocol(_))
        ));
    }
}
