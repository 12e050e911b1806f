//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac or AEAD tag
//! ```
//!
//! This module only deals with the cleartext framing. Encryption and
//! integrity are applied on top by [`crate::ssh::crypto`].
//!
//! # Constraints
//!
//! - Padding is between 4 and 255 bytes of random data, its length
//!   randomized in whole blocks
//! - The padded packet is a multiple of the cipher block size (8 without a cipher).
//!   AEAD modes keep the length field out of the aligned region.
//! - A whole packet is never shorter than 16 bytes
//! - `packet_length` is at most 35000 on receipt
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::packet::{Framing, Packet};
//!
//! let packet = Packet::new(b"\x05payload".to_vec()).unwrap();
//! let bytes = packet.to_bytes();
//! assert_eq!(bytes.len() % 8, 0);
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"\x05payload");
//!
//! // chacha20-poly1305 keeps the length out of the 8-byte alignment
//! let aead = Packet::with_framing(b"x".to_vec(), Framing::aead(8)).unwrap();
//! assert_eq!((aead.to_bytes().len() - 4) % 8, 0);
//! ```

use bytes::{BufMut, BytesMut};
use rand::{Rng, RngCore};
use tether_platform::{TetherError, TetherResult};

/// Maximum `packet_length` accepted from the peer (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum size of a whole packet, length field included.
pub const MIN_PACKET_SIZE: usize = 16;

/// Minimum padding length in bytes.
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

/// Alignment rules of the cipher protecting a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    /// Cipher block size (8 for no cipher, 16 for AES, 8 for chacha20-poly1305)
    pub block_size: usize,
    /// Whether the 4-byte length field is part of the aligned region
    pub length_aligned: bool,
}

impl Framing {
    /// Framing before the first NEWKEYS.
    pub const PLAIN: Framing = Framing {
        block_size: 8,
        length_aligned: true,
    };

    /// Framing for a block or stream cipher with a separate MAC.
    pub const fn blocked(block_size: usize) -> Self {
        Self {
            block_size,
            length_aligned: true,
        }
    }

    /// Framing for an AEAD cipher whose length field is authenticated but not aligned.
    pub const fn aead(block_size: usize) -> Self {
        Self {
            block_size,
            length_aligned: false,
        }
    }

    /// Smallest padding that satisfies the alignment rules for `payload_len` bytes.
    pub fn min_padding_len(&self, payload_len: usize) -> usize {
        let aligned_prefix = if self.length_aligned { 4 } else { 0 };
        let unpadded = aligned_prefix + 1 + payload_len;
        let mut padding = self.block_size - unpadded % self.block_size;
        if padding < MIN_PADDING_LEN as usize {
            padding += self.block_size;
        }
        while 4 + 1 + payload_len + padding < MIN_PACKET_SIZE {
            padding += self.block_size;
        }
        padding
    }

    /// Padding length for `payload_len` bytes: the minimum plus a random
    /// number of whole blocks, kept within 255 bytes and [`MAX_PACKET_SIZE`].
    pub fn padding_len(&self, payload_len: usize) -> usize {
        let min = self.min_padding_len(payload_len);
        let room = (MAX_PADDING_LEN as usize)
            .saturating_sub(min)
            .min(MAX_PACKET_SIZE.saturating_sub(1 + payload_len + min));
        let extra_blocks = room / self.block_size;
        min + rand::thread_rng().gen_range(0..=extra_blocks) * self.block_size
    }

    /// Checks a received `packet_length` against the alignment rules.
    pub fn check_alignment(&self, packet_length: usize) -> TetherResult<()> {
        let aligned = if self.length_aligned {
            packet_length + 4
        } else {
            packet_length
        };
        if aligned % self.block_size != 0 {
            return Err(TetherError::Protocol(format!(
                "Packet length {} not aligned to block size {}",
                packet_length, self.block_size
            )));
        }
        Ok(())
    }
}

impl Default for Framing {
    fn default() -> Self {
        Framing::PLAIN
    }
}

/// Validates a `packet_length` read from the wire.
pub fn check_packet_length(packet_length: u32) -> TetherResult<usize> {
    let len = packet_length as usize;
    if len > MAX_PACKET_SIZE {
        return Err(TetherError::Protocol(format!(
            "Packet too large: {} bytes (maximum {})",
            len, MAX_PACKET_SIZE
        )));
    }
    if len < 5 {
        return Err(TetherError::Protocol(format!(
            "Packet too small: {} bytes (minimum 5)",
            len
        )));
    }
    Ok(len)
}

/// SSH binary packet in cleartext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a packet padded for the unencrypted transport.
    pub fn new(payload: Vec<u8>) -> TetherResult<Self> {
        Self::with_framing(payload, Framing::PLAIN)
    }

    /// Creates a packet padded for `framing`, with random padding bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Protocol`] if the padded packet would exceed
    /// [`MAX_PACKET_SIZE`].
    pub fn with_framing(payload: Vec<u8>, framing: Framing) -> TetherResult<Self> {
        let padding_len = framing.padding_len(payload.len());
        let packet_length = 1 + payload.len() + padding_len;
        if packet_length > MAX_PACKET_SIZE {
            return Err(TetherError::Protocol(format!(
                "Packet size {} exceeds maximum {}",
                packet_length, MAX_PACKET_SIZE
            )));
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Ok(Self { payload, padding })
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the packet and returns its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Value of the `packet_length` field.
    pub fn packet_length(&self) -> u32 {
        (1 + self.payload.len() + self.padding.len()) as u32
    }

    /// Serializes the cleartext packet, length field first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = self.packet_length() as usize;
        let mut buf = BytesMut::with_capacity(4 + packet_length);
        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        buf.to_vec()
    }

    /// Parses a whole cleartext packet (length field included, nothing trailing).
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.len() < 4 {
            return Err(TetherError::Protocol(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }
        let packet_length =
            check_packet_length(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))?;
        let body = &data[4..];
        if body.len() != packet_length {
            return Err(TetherError::Protocol(format!(
                "Incomplete packet: expected {} bytes, got {} bytes",
                packet_length,
                body.len()
            )));
        }
        Self::from_body(body)
    }

    /// Parses `padding_length || payload || padding`, the part covered by
    /// `packet_length`.
    pub fn from_body(body: &[u8]) -> TetherResult<Self> {
        let (&padding_length, rest) = body
            .split_first()
            .ok_or_else(|| TetherError::protocol("Empty packet body"))?;
        let padding_length = padding_length as usize;

        if padding_length < MIN_PADDING_LEN as usize {
            return Err(TetherError::Protocol(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_length, MIN_PADDING_LEN
            )));
        }
        if rest.len() < padding_length {
            return Err(TetherError::Protocol(format!(
                "Invalid packet: {} bytes cannot hold {} bytes of padding",
                rest.len(),
                padding_length
            )));
        }

        let payload_length = rest.len() - padding_length;
        Ok(Self {
            payload: rest[..payload_length].to_vec(),
            padding: rest[payload_length..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_packet_alignment() {
        let packet = Packet::new(b"test".to_vec()).unwrap();
        let total_size = 4 + 1 + packet.payload().len() + packet.padding().len();
        assert_eq!(total_size % 8, 0);
        assert!(packet.padding().len() >= MIN_PADDING_LEN as usize);
    }

    #[test]
    fn test_packet_minimum_size() {
        let bytes = Packet::new(b"x".to_vec()).unwrap().to_bytes();
        assert_eq!(bytes.len(), MIN_PACKET_SIZE);

        let bytes = Packet::with_framing(b"x".to_vec(), Framing::aead(8))
            .unwrap()
            .to_bytes();
        assert!(bytes.len() >= MIN_PACKET_SIZE);
    }

    #[test]
    fn test_gcm_framing_excludes_length() {
        let packet = Packet::with_framing(vec![0u8; 37], Framing::aead(16)).unwrap();
        assert_eq!(packet.packet_length() % 16, 0);
        Framing::aead(16)
            .check_alignment(packet.packet_length() as usize)
            .unwrap();
    }

    #[test]
    fn test_ctr_framing_includes_length() {
        let packet = Packet::with_framing(vec![1u8; 100], Framing::blocked(16)).unwrap();
        assert_eq!((packet.packet_length() + 4) % 16, 0);
        assert!(Framing::blocked(16)
            .check_alignment(packet.packet_length() as usize + 1)
            .is_err());
    }

    #[test]
    fn test_packet_invalid_padding_too_short() {
        let data = vec![
            0, 0, 0, 8, // packet_length = 8
            2, // padding_length = 2
            0x48, 0x65, 0x6c, 0x6c, 0x6f, // payload "Hello"
            0x00, 0x00, // padding
        ];
        match Packet::from_bytes(&data) {
            Err(TetherError::Protocol(msg)) => assert!(msg.contains("Padding too short")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_packet_length_limits() {
        assert!(check_packet_length(4).is_err());
        assert!(check_packet_length(5).is_ok());
        assert!(check_packet_length(MAX_PACKET_SIZE as u32).is_ok());
        assert!(check_packet_length(MAX_PACKET_SIZE as u32 + 1).is_err());
    }

    #[test]
    fn test_packet_invalid_incomplete() {
        let data = vec![0, 0, 0, 20, 4, 0x48, 0x65];
        assert!(matches!(
            Packet::from_bytes(&data),
            Err(TetherError::Protocol(_))
        ));
    }

    #[test]
    fn test_padding_stays_within_max_packet() {
        // Close to the limit only the minimum padding fits.
        let len = MAX_PACKET_SIZE - 1 - 8;
        let framing = Framing::PLAIN;
        for _ in 0..32 {
            let packet = Packet::with_framing(vec![0; len], framing).unwrap();
            assert!(packet.packet_length() as usize <= MAX_PACKET_SIZE);
            assert_eq!(packet.padding().len(), framing.min_padding_len(len));
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        assert!(Packet::new(vec![0u8; MAX_PACKET_SIZE]).is_err());
    }

    proptest! {
        #[test]
        fn prop_padding_rules_hold(len in 0usize..4096, framing_idx in 0usize..4) {
            let framing = [
                Framing::PLAIN,
                Framing::blocked(16),
                Framing::aead(8),
                Framing::aead(16),
            ][framing_idx];
            let packet = Packet::with_framing(vec![0xAB; len], framing).unwrap();
            let pad = packet.padding().len();
            prop_assert!((MIN_PADDING_LEN as usize..=MAX_PADDING_LEN as usize).contains(&pad));
            prop_assert!(4 + packet.packet_length() as usize >= MIN_PACKET_SIZE);
            prop_assert!(framing.check_alignment(packet.packet_length() as usize).is_ok());
            prop_assert!(pad >= framing.min_padding_len(len));
            prop_assert_eq!((pad - framing.min_padding_len(len)) % framing.block_size, 0);
        }

        #[test]
        fn prop_padding_length_varies(len in 0usize..4096, framing_idx in 0usize..4) {
            let framing = [
                Framing::PLAIN,
                Framing::blocked(16),
                Framing::aead(8),
                Framing::aead(16),
            ][framing_idx];
            let lengths: std::collections::HashSet<usize> =
                (0..64).map(|_| framing.padding_len(len)).collect();
            prop_assert!(lengths.len() > 1);
        }

        #[test]
        fn prop_cleartext_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let packet = Packet::new(payload.clone()).unwrap();
            let parsed = Packet::from_bytes(&packet.to_bytes()).unwrap();
            prop_assert_eq!(parsed.payload(), &payload[..]);
        }
    }
}
