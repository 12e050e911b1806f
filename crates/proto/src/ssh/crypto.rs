//! Packet protection: ciphers, MACs and their wire framing.
//!
//! Supported ciphers:
//! - `chacha20-poly1305@openssh.com` (AEAD, encrypted length)
//! - `aes256-gcm@openssh.com`, `aes128-gcm@openssh.com` (AEAD, length as AAD)
//! - `aes256-ctr`, `aes128-ctr` (stream cipher plus `hmac-sha2-256` / `hmac-sha2-512`)
//!
//! A [`PacketSealer`] and a [`PacketOpener`] each own one direction of the
//! transport. Both are driven with the packet sequence number of that
//! direction; neither keeps its own counter apart from the GCM invocation
//! counter, which RFC 5647 defines per key.

use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use ring::aead::{
    chacha20_poly1305_openssh as chacha, Aad, BoundKey, Nonce, NonceSequence, OpeningKey,
    SealingKey, UnboundKey, AES_128_GCM, AES_256_GCM,
};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use tether_platform::{TetherError, TetherResult};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ssh::packet::{Framing, Packet};

/// Cipher preference order offered by default.
pub const DEFAULT_CIPHERS: &[&str] = &[
    "chacha20-poly1305@openssh.com",
    "aes256-gcm@openssh.com",
    "aes128-gcm@openssh.com",
    "aes256-ctr",
    "aes128-ctr",
];

/// MAC preference order offered by default (only used with CTR ciphers).
pub const DEFAULT_MACS: &[&str] = &["hmac-sha2-256", "hmac-sha2-512"];

/// Compression offered (none is implemented).
pub const DEFAULT_COMPRESSION: &[&str] = &["none"];

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// ChaCha20-Poly1305 AEAD cipher (OpenSSH construction)
    ChaCha20Poly1305,
    /// AES-128-GCM AEAD cipher
    Aes128Gcm,
    /// AES-256-GCM AEAD cipher
    Aes256Gcm,
    /// AES-128-CTR stream cipher (requires separate MAC)
    Aes128Ctr,
    /// AES-256-CTR stream cipher (requires separate MAC)
    Aes256Ctr,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
        }
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "chacha20-poly1305@openssh.com" => Some(CipherAlgorithm::ChaCha20Poly1305),
            "aes128-gcm@openssh.com" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            _ => None,
        }
    }

    /// Key size in bytes. chacha20-poly1305 takes two 256-bit keys.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => chacha::KEY_LEN,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes256Ctr => 32,
        }
    }

    /// IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 12,
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => 16,
        }
    }

    /// Authentication tag size in bytes (0 for non-AEAD ciphers).
    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            16
        } else {
            0
        }
    }

    /// Cipher block size used for padding.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 8,
            _ => 16,
        }
    }

    /// Returns true if this is an AEAD cipher.
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlgorithm::ChaCha20Poly1305
                | CipherAlgorithm::Aes128Gcm
                | CipherAlgorithm::Aes256Gcm
        )
    }

    /// Padding rules for packets protected by this cipher.
    pub fn framing(&self) -> Framing {
        if self.is_aead() {
            Framing::aead(self.block_size())
        } else {
            Framing::blocked(self.block_size())
        }
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        self.mac_size()
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }
}

/// Key material for one direction, as derived by the key exchange.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    #[zeroize(skip)]
    cipher: CipherAlgorithm,
    #[zeroize(skip)]
    mac: Option<MacAlgorithm>,
    iv: Vec<u8>,
    key: Vec<u8>,
    mac_key: Vec<u8>,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("cipher", &self.cipher)
            .field("mac", &self.mac)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl DirectionKeys {
    /// Bundles derived keys. `mac` is ignored for AEAD ciphers.
    pub fn new(
        cipher: CipherAlgorithm,
        mac: Option<MacAlgorithm>,
        iv: Vec<u8>,
        key: Vec<u8>,
        mac_key: Vec<u8>,
    ) -> Self {
        let mac = if cipher.is_aead() { None } else { mac };
        Self {
            cipher,
            mac,
            iv,
            key,
            mac_key,
        }
    }

    /// Cipher these keys are for.
    pub fn cipher(&self) -> CipherAlgorithm {
        self.cipher
    }

    /// MAC in use, if the cipher is not AEAD.
    pub fn mac(&self) -> Option<MacAlgorithm> {
        self.mac
    }

    fn key(&self) -> TetherResult<&[u8]> {
        take(&self.key, self.cipher.key_size(), "cipher key")
    }

    fn iv(&self) -> TetherResult<&[u8]> {
        take(&self.iv, self.cipher.iv_size(), "IV")
    }

    fn mac_key(&self) -> TetherResult<MacKey> {
        let alg = self
            .mac
            .ok_or_else(|| TetherError::security("CTR cipher negotiated without a MAC"))?;
        MacKey::new(alg, &self.mac_key)
    }
}

fn take<'a>(material: &'a [u8], len: usize, what: &str) -> TetherResult<&'a [u8]> {
    material.get(..len).ok_or_else(|| {
        TetherError::Security(format!(
            "Insufficient {} material: expected {}, got {}",
            what,
            len,
            material.len()
        ))
    })
}

/// RFC 5647 nonce: 4-byte fixed field plus 8-byte invocation counter.
struct GcmNonce {
    fixed: [u8; 4],
    invocation: u64,
}

impl GcmNonce {
    fn new(iv: &[u8]) -> Self {
        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&iv[4..12]);
        Self {
            fixed,
            invocation: u64::from_be_bytes(counter),
        }
    }
}

impl NonceSequence for GcmNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..4].copy_from_slice(&self.fixed);
        nonce_bytes[4..].copy_from_slice(&self.invocation.to_be_bytes());
        self.invocation = self.invocation.wrapping_add(1);
        Nonce::try_assume_unique_for_key(&nonce_bytes)
    }
}

fn gcm_key(keys: &DirectionKeys) -> TetherResult<UnboundKey> {
    let alg = match keys.cipher {
        CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
        _ => &AES_256_GCM,
    };
    UnboundKey::new(alg, keys.key()?)
        .map_err(|_| TetherError::security("Failed to create AES-GCM key"))
}

fn chacha_key(keys: &DirectionKeys) -> TetherResult<[u8; chacha::KEY_LEN]> {
    let mut out = [0u8; chacha::KEY_LEN];
    out.copy_from_slice(keys.key()?);
    Ok(out)
}

enum CtrCipher {
    Aes128(Ctr128BE<Aes128>),
    Aes256(Ctr128BE<Aes256>),
}

impl CtrCipher {
    fn new(keys: &DirectionKeys) -> TetherResult<Self> {
        let (key, iv) = (keys.key()?, keys.iv()?);
        let invalid = |_| TetherError::security("Invalid AES-CTR key or IV length");
        Ok(match keys.cipher {
            CipherAlgorithm::Aes128Ctr => {
                CtrCipher::Aes128(Ctr128BE::<Aes128>::new_from_slices(key, iv).map_err(invalid)?)
            }
            _ => CtrCipher::Aes256(Ctr128BE::<Aes256>::new_from_slices(key, iv).map_err(invalid)?),
        })
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CtrCipher::Aes128(c) => c.apply_keystream(data),
            CtrCipher::Aes256(c) => c.apply_keystream(data),
        }
    }
}

/// HMAC key computing `MAC(key, sequence_number || unencrypted_packet)`.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> TetherResult<Self> {
        let key = take(key_material, algorithm.key_size(), "MAC key")?;
        Ok(Self {
            algorithm,
            key: key.to_vec(),
        })
    }

    /// Computes the MAC of a cleartext packet.
    pub fn compute(&self, sequence: u32, packet: &[u8]) -> TetherResult<Vec<u8>> {
        let bad_key = |_| TetherError::security("Invalid HMAC key");
        Ok(match self.algorithm {
            MacAlgorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).map_err(bad_key)?;
                mac.update(&sequence.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(&self.key).map_err(bad_key)?;
                mac.update(&sequence.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
        })
    }

    /// Verifies a received MAC in constant time.
    pub fn verify(&self, sequence: u32, packet: &[u8], received: &[u8]) -> TetherResult<()> {
        let computed = self.compute(sequence, packet)?;
        if computed.len() == received.len() && bool::from(computed.ct_eq(received)) {
            Ok(())
        } else {
            Err(TetherError::security("MAC verification failed"))
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

enum Protection<C, G> {
    Plain,
    ChaCha(Box<C>),
    Gcm(Box<G>),
    Ctr(Box<CtrCipher>, MacKey),
}

impl<C, G> Protection<C, G> {
    fn kind(&self) -> &'static str {
        match self {
            Protection::Plain => "none",
            Protection::ChaCha(_) => "chacha20-poly1305",
            Protection::Gcm(_) => "aes-gcm",
            Protection::Ctr(..) => "aes-ctr",
        }
    }

    fn framing(&self) -> Framing {
        match self {
            Protection::Plain => Framing::PLAIN,
            Protection::ChaCha(_) => CipherAlgorithm::ChaCha20Poly1305.framing(),
            Protection::Gcm(_) => CipherAlgorithm::Aes256Gcm.framing(),
            Protection::Ctr(..) => CipherAlgorithm::Aes256Ctr.framing(),
        }
    }
}

/// Outbound packet protection.
pub struct PacketSealer {
    inner: Protection<chacha::SealingKey, SealingKey<GcmNonce>>,
}

impl std::fmt::Debug for PacketSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PacketSealer({})", self.inner.kind())
    }
}

impl PacketSealer {
    /// No protection, used until the first NEWKEYS.
    pub fn plain() -> Self {
        Self {
            inner: Protection::Plain,
        }
    }

    /// Builds the sealer for freshly derived keys.
    pub fn new(keys: &DirectionKeys) -> TetherResult<Self> {
        let inner = match keys.cipher {
            CipherAlgorithm::ChaCha20Poly1305 => {
                let mut material = chacha_key(keys)?;
                let key = chacha::SealingKey::new(&material);
                material.zeroize();
                Protection::ChaCha(Box::new(key))
            }
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
                let nonce = GcmNonce::new(keys.iv()?);
                Protection::Gcm(Box::new(SealingKey::new(gcm_key(keys)?, nonce)))
            }
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => {
                Protection::Ctr(Box::new(CtrCipher::new(keys)?), keys.mac_key()?)
            }
        };
        Ok(Self { inner })
    }

    /// Returns `true` until keys are installed.
    pub fn is_plain(&self) -> bool {
        matches!(self.inner, Protection::Plain)
    }

    /// Padding rules for the current cipher.
    pub fn framing(&self) -> Framing {
        self.inner.framing()
    }

    /// Frames and protects `payload`, returning the bytes to put on the wire.
    pub fn seal(&mut self, sequence: u32, payload: Vec<u8>) -> TetherResult<Vec<u8>> {
        let mut wire = Packet::with_framing(payload, self.framing())?.to_bytes();
        match &mut self.inner {
            Protection::Plain => {}
            Protection::ChaCha(key) => {
                let mut tag = [0u8; chacha::TAG_LEN];
                key.seal_in_place(sequence, &mut wire, &mut tag);
                wire.extend_from_slice(&tag);
            }
            Protection::Gcm(key) => {
                let (len, body) = wire.split_at_mut(4);
                let tag = key
                    .seal_in_place_separate_tag(Aad::from(&*len), body)
                    .map_err(|_| TetherError::security("AES-GCM encryption failed"))?;
                wire.extend_from_slice(tag.as_ref());
            }
            Protection::Ctr(cipher, mac) => {
                let tag = mac.compute(sequence, &wire)?;
                cipher.apply(&mut wire);
                wire.extend_from_slice(&tag);
            }
        }
        Ok(wire)
    }
}

/// Inbound packet protection.
///
/// Reading a packet is a two step affair: [`PacketOpener::first_block_len`]
/// bytes are read and handed to [`PacketOpener::decrypt_length`], then the
/// remaining [`PacketOpener::remaining_len`] bytes are read and the whole
/// buffer is passed to [`PacketOpener::open`].
pub struct PacketOpener {
    inner: Protection<chacha::OpeningKey, OpeningKey<GcmNonce>>,
}

impl std::fmt::Debug for PacketOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PacketOpener({})", self.inner.kind())
    }
}

impl PacketOpener {
    /// No protection, used until the first NEWKEYS.
    pub fn plain() -> Self {
        Self {
            inner: Protection::Plain,
        }
    }

    /// Builds the opener for freshly derived keys.
    pub fn new(keys: &DirectionKeys) -> TetherResult<Self> {
        let inner = match keys.cipher {
            CipherAlgorithm::ChaCha20Poly1305 => {
                let mut material = chacha_key(keys)?;
                let key = chacha::OpeningKey::new(&material);
                material.zeroize();
                Protection::ChaCha(Box::new(key))
            }
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
                let nonce = GcmNonce::new(keys.iv()?);
                Protection::Gcm(Box::new(OpeningKey::new(gcm_key(keys)?, nonce)))
            }
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => {
                Protection::Ctr(Box::new(CtrCipher::new(keys)?), keys.mac_key()?)
            }
        };
        Ok(Self { inner })
    }

    /// Padding rules for the current cipher.
    pub fn framing(&self) -> Framing {
        self.inner.framing()
    }

    /// Bytes that must be read before the packet length is known.
    pub fn first_block_len(&self) -> usize {
        match self.inner {
            Protection::Ctr(..) => 16,
            _ => 4,
        }
    }

    fn trailer_len(&self) -> usize {
        match &self.inner {
            Protection::Plain => 0,
            Protection::ChaCha(_) | Protection::Gcm(_) => 16,
            Protection::Ctr(_, mac) => mac.algorithm().mac_size(),
        }
    }

    /// Recovers `packet_length` from the first block.
    ///
    /// For CTR the block is decrypted in place; other modes leave it untouched.
    pub fn decrypt_length(&mut self, sequence: u32, first: &mut [u8]) -> TetherResult<u32> {
        if first.len() != self.first_block_len() {
            return Err(TetherError::protocol("Short first block"));
        }
        let mut len = [0u8; 4];
        match &mut self.inner {
            Protection::Plain | Protection::Gcm(_) => len.copy_from_slice(&first[..4]),
            Protection::ChaCha(key) => {
                len.copy_from_slice(&first[..4]);
                len = key.decrypt_packet_length(sequence, len);
            }
            Protection::Ctr(cipher, _) => {
                cipher.apply(first);
                len.copy_from_slice(&first[..4]);
            }
        }
        Ok(u32::from_be_bytes(len))
    }

    /// Bytes still to read after the first block for a packet of `packet_length`.
    pub fn remaining_len(&self, packet_length: usize) -> TetherResult<usize> {
        self.framing().check_alignment(packet_length)?;
        let total = 4 + packet_length;
        if total < self.first_block_len() {
            return Err(TetherError::Protocol(format!(
                "Packet length {} shorter than cipher block",
                packet_length
            )));
        }
        Ok(total - self.first_block_len() + self.trailer_len())
    }

    /// Authenticates and decrypts a whole packet read from the wire.
    ///
    /// Returns the payload. Any verification failure is a [`TetherError::Security`].
    pub fn open(&mut self, sequence: u32, mut wire: Vec<u8>) -> TetherResult<Vec<u8>> {
        let trailer = self.trailer_len();
        if wire.len() < self.first_block_len() + trailer {
            return Err(TetherError::protocol("Truncated packet"));
        }
        let split = wire.len() - trailer;
        let body = match &mut self.inner {
            Protection::Plain => wire.split_off(4),
            Protection::ChaCha(key) => {
                let mut tag = [0u8; chacha::TAG_LEN];
                tag.copy_from_slice(&wire[split..]);
                wire.truncate(split);
                key.open_in_place(sequence, &mut wire, &tag)
                    .map_err(|_| TetherError::security("Packet authentication failed"))?
                    .to_vec()
            }
            Protection::Gcm(key) => {
                let (len, sealed) = wire.split_at_mut(4);
                key.open_in_place(Aad::from(&*len), sealed)
                    .map_err(|_| TetherError::security("Packet authentication failed"))?
                    .to_vec()
            }
            Protection::Ctr(cipher, mac) => {
                let received = wire.split_off(split);
                cipher.apply(&mut wire[16..]);
                mac.verify(sequence, &wire, &received)?;
                wire.split_off(4)
            }
        };
        Ok(Packet::from_body(&body)?.into_payload())
    }
}
