//! Key exchange methods and key derivation (RFC 4253, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - diffie-hellman-group14-sha256 (RFC 8268)
//! - curve25519-sha256 and curve25519-sha256@libssh.org (RFC 8731)
//! - The exchange hash H and the derivation of keys `A` to `F`
//!
//! # Security
//!
//! - DH Group14: 2048-bit MODP group, peer values range-checked
//! - Curve25519: ephemeral keys from `ring`, consumed by the agreement
//! - Private values and derived keys are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::kex_dh::Curve25519Exchange;
//!
//! let client = Curve25519Exchange::new().unwrap();
//! let server = Curve25519Exchange::new().unwrap();
//! let client_public = *client.public_key();
//! let server_public = *server.public_key();
//!
//! let k1 = client.compute_shared_secret(&server_public).unwrap();
//! let k2 = server.compute_shared_secret(&client_public).unwrap();
//! assert_eq!(k1, k2);
//! ```

use bytes::BufMut;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use tether_platform::{TetherError, TetherResult};
use zeroize::Zeroize;

use crate::ssh::crypto::DirectionKeys;
use crate::ssh::kex::Negotiated;
use crate::ssh::message::MessageType;
use crate::ssh::wire::{encode_mpint, WireReader, WireWrite};

/// Diffie-Hellman Group 14 parameters (RFC 3526).
mod dh_group14 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    /// DH Group 14 prime (2048-bit)
    pub static P: Lazy<BigUint> = Lazy::new(|| {
        BigUint::parse_bytes(
            b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
              29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
              EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
              E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
              EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
              C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
              83655D23DCA3AD961C62F356208552BB9ED529077096966D\
              670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
              E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
              DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
              15728E5A8AACAA68FFFFFFFFFFFFFFFF",
            16,
        )
        .expect("group14 prime is valid hex")
    });

    /// DH Group 14 generator
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Diffie-Hellman Group 14 key exchange.
pub struct DhGroup14Exchange {
    /// Private exponent x
    private_key: Vec<u8>,
    /// Public value g^x mod p
    public_key: Vec<u8>,
}

impl DhGroup14Exchange {
    /// Generates a fresh private exponent.
    pub fn new() -> Self {
        use num_bigint::{BigUint, RandBigInt};

        let mut rng = rand::thread_rng();
        let p_minus_one = dh_group14::P.clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = dh_group14::G.modpow(&x, &dh_group14::P);

        Self {
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        }
    }

    /// Returns the public value (big-endian magnitude).
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes K from the peer's public value, rejecting values outside 1 < y < p-1.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> TetherResult<Vec<u8>> {
        use num_bigint::BigUint;

        let y_peer = BigUint::from_bytes_be(peer_public);
        let p_minus_one = dh_group14::P.clone() - 1u32;
        if y_peer <= BigUint::from(1u32) || y_peer >= p_minus_one {
            return Err(TetherError::protocol("Invalid peer DH value: out of range"));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(y_peer.modpow(&x, &dh_group14::P).to_bytes_be())
    }
}

impl Default for DhGroup14Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DhGroup14Exchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Curve25519 key exchange.
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates a new ephemeral key pair.
    pub fn new() -> TetherResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| TetherError::security("Failed to generate Curve25519 key"))?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| TetherError::security("Failed to compute Curve25519 public key"))?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the shared secret, consuming the ephemeral key.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> TetherResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(TetherError::Protocol(format!(
                "Invalid Curve25519 public key length: {}",
                peer_public.len()
            )));
        }
        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);
        agree_ephemeral(self.private_key, &peer_public_key, |key_material| {
            key_material.to_vec()
        })
        .map_err(|_| TetherError::security("Curve25519 key agreement failed"))
    }
}

/// Client side ephemeral state for the negotiated method.
pub enum KexMethod {
    /// curve25519-sha256 / curve25519-sha256@libssh.org
    Curve25519(Curve25519Exchange),
    /// diffie-hellman-group14-sha256
    Group14(DhGroup14Exchange),
}

impl std::fmt::Debug for KexMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KexMethod::Curve25519(_) => f.write_str("KexMethod::Curve25519"),
            KexMethod::Group14(_) => f.write_str("KexMethod::Group14"),
        }
    }
}

impl KexMethod {
    /// Generates ephemeral keys for a negotiated kex method name.
    pub fn start(name: &str) -> TetherResult<Self> {
        match name {
            "curve25519-sha256" | "curve25519-sha256@libssh.org" => {
                Ok(KexMethod::Curve25519(Curve25519Exchange::new()?))
            }
            "diffie-hellman-group14-sha256" => Ok(KexMethod::Group14(DhGroup14Exchange::new())),
            other => Err(TetherError::Protocol(format!(
                "Unsupported key exchange method: {}",
                other
            ))),
        }
    }

    /// Returns `true` for the finite-field method, whose values are mpints.
    pub fn uses_mpint(&self) -> bool {
        matches!(self, KexMethod::Group14(_))
    }

    /// Our public value.
    pub fn public_value(&self) -> Vec<u8> {
        match self {
            KexMethod::Curve25519(x) => x.public_key().to_vec(),
            KexMethod::Group14(dh) => dh.public_key().to_vec(),
        }
    }

    /// SSH_MSG_KEX_ECDH_INIT / SSH_MSG_KEXDH_INIT payload.
    pub fn init_message(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(300);
        buf.put_u8(MessageType::KexdhInit as u8);
        match self {
            KexMethod::Curve25519(x) => buf.put_string(x.public_key()),
            KexMethod::Group14(dh) => buf.put_mpint(dh.public_key()),
        }
        buf
    }

    /// Computes K from the server's public value.
    pub fn agree(self, server_public: &[u8]) -> TetherResult<Vec<u8>> {
        match self {
            KexMethod::Curve25519(x) => x.compute_shared_secret(server_public),
            KexMethod::Group14(dh) => dh.compute_shared_secret(server_public),
        }
    }
}

/// SSH_MSG_KEX_ECDH_REPLY / SSH_MSG_KEXDH_REPLY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexReply {
    /// Server host key blob K_S
    pub host_key: Vec<u8>,
    /// Server public value (Q_S, or f as a magnitude)
    pub server_public: Vec<u8>,
    /// Signature blob over H
    pub signature: Vec<u8>,
}

impl KexReply {
    /// Parses the reply; `mpint` selects the finite-field encoding of f.
    pub fn parse(payload: &[u8], mpint: bool) -> TetherResult<Self> {
        let mut r = WireReader::new(payload);
        let msg = r.read_u8()?;
        if msg != MessageType::KexdhReply as u8 {
            return Err(TetherError::Protocol(format!(
                "Expected key exchange reply, got message {}",
                msg
            )));
        }
        let host_key = r.read_string()?.to_vec();
        let server_public = if mpint {
            r.read_mpint()?.to_vec()
        } else {
            r.read_string()?.to_vec()
        };
        let signature = r.read_string()?.to_vec();
        r.finish()?;
        Ok(Self {
            host_key,
            server_public,
            signature,
        })
    }

    /// Serializes the reply (used by test servers).
    pub fn to_bytes(&self, mpint: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(MessageType::KexdhReply as u8);
        buf.put_string(&self.host_key);
        if mpint {
            buf.put_mpint(&self.server_public);
        } else {
            buf.put_string(&self.server_public);
        }
        buf.put_string(&self.signature);
        buf
    }
}

/// Incremental exchange hash H (SHA-256 for every supported method).
pub struct ExchangeHash {
    hasher: Sha256,
}

impl ExchangeHash {
    /// Starts H with `V_C || V_S || I_C || I_S || K_S`.
    pub fn new(v_c: &str, v_s: &str, i_c: &[u8], i_s: &[u8], k_s: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(v_c.len() + v_s.len() + i_c.len() + i_s.len() + k_s.len() + 20);
        buf.put_string(v_c.as_bytes());
        buf.put_string(v_s.as_bytes());
        buf.put_string(i_c);
        buf.put_string(i_s);
        buf.put_string(k_s);
        let mut hasher = Sha256::new();
        hasher.update(&buf);
        Self { hasher }
    }

    /// Finishes H with the public values and K.
    pub fn finish(mut self, client_public: &[u8], server_public: &[u8], shared_secret: &[u8], mpint: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(client_public.len() + server_public.len() + 80);
        if mpint {
            buf.put_mpint(client_public);
            buf.put_mpint(server_public);
        } else {
            buf.put_string(client_public);
            buf.put_string(server_public);
        }
        buf.put_mpint(shared_secret);
        self.hasher.update(&buf);
        buf.zeroize();
        self.hasher.finalize().to_vec()
    }
}

/// Derives one key per RFC 4253 Section 7.2.
///
/// ```text
/// K1 = HASH(K || H || X || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || K3 || ...
/// ```
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Vec<u8> {
    let mut k_mpint = encode_mpint(shared_secret);

    let mut hasher = Sha256::new();
    hasher.update(&k_mpint);
    hasher.update(exchange_hash);
    hasher.update([key_type]);
    hasher.update(session_id);
    let mut key = hasher.finalize().to_vec();

    while key.len() < key_length {
        let mut hasher = Sha256::new();
        hasher.update(&k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&key);
        let block = hasher.finalize();
        key.extend_from_slice(&block);
    }

    k_mpint.zeroize();
    key.truncate(key_length);
    key
}

/// Which end of the connection keys are being installed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client: seals with client-to-server keys
    Client,
    /// Server: seals with server-to-client keys
    Server,
}

/// Keys for both directions after one exchange.
#[derive(Debug)]
pub struct SessionKeys {
    client_to_server: DirectionKeys,
    server_to_client: DirectionKeys,
}

impl SessionKeys {
    /// Derives keys `A` to `F` for the negotiated algorithms.
    pub fn derive(shared_secret: &[u8], exchange_hash: &[u8], session_id: &[u8], negotiated: &Negotiated) -> Self {
        let d = |letter: u8, len: usize| derive_key(shared_secret, exchange_hash, session_id, letter, len);

        let c2s = negotiated.cipher_client_to_server;
        let s2c = negotiated.cipher_server_to_client;
        let mac_c2s = negotiated.mac_client_to_server;
        let mac_s2c = negotiated.mac_server_to_client;

        Self {
            client_to_server: DirectionKeys::new(
                c2s,
                mac_c2s,
                d(b'A', c2s.iv_size()),
                d(b'C', c2s.key_size()),
                d(b'E', mac_c2s.map_or(0, |m| m.key_size())),
            ),
            server_to_client: DirectionKeys::new(
                s2c,
                mac_s2c,
                d(b'B', s2c.iv_size()),
                d(b'D', s2c.key_size()),
                d(b'F', mac_s2c.map_or(0, |m| m.key_size())),
            ),
        }
    }

    /// Splits into `(outbound, inbound)` keys for `role`.
    pub fn split(self, role: Role) -> (DirectionKeys, DirectionKeys) {
        match role {
            Role::Client => (self.client_to_server, self.server_to_client),
            Role::Server => (self.server_to_client, self.client_to_server),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm, PacketOpener, PacketSealer};

    #[test]
    fn test_dh_group14_key_exchange() {
        let client = DhGroup14Exchange::new();
        let server = DhGroup14Exchange::new();
        let client_secret = client.compute_shared_secret(server.public_key()).unwrap();
        let server_secret = server.compute_shared_secret(client.public_key()).unwrap();
        assert_eq!(client_secret, server_secret);
    }

    #[test]
    fn test_dh_group14_invalid_peer_key() {
        let exchange = DhGroup14Exchange::new();
        assert!(exchange.compute_shared_secret(&[1u8]).is_err());
        let p_minus_one = (dh_group14::P.clone() - 1u32).to_bytes_be();
        assert!(exchange.compute_shared_secret(&p_minus_one).is_err());
    }

    #[test]
    fn test_curve25519_rejects_bad_length() {
        let exchange = Curve25519Exchange::new().unwrap();
        assert!(exchange.compute_shared_secret(&[9u8; 31]).is_err());
    }

    #[test]
    fn test_kex_method_init_message() {
        let method = KexMethod::start("curve25519-sha256@libssh.org").unwrap();
        let init = method.init_message();
        assert_eq!(init[0], 30);
        assert_eq!(&init[1..5], &[0, 0, 0, 32]);
        assert!(KexMethod::start("diffie-hellman-group1-sha1").is_err());
    }

    #[test]
    fn test_kex_reply_round_trip() {
        let reply = KexReply {
            host_key: vec![1, 2, 3],
            server_public: vec![0x80, 0x01],
            signature: vec![4, 5],
        };
        assert_eq!(KexReply::parse(&reply.to_bytes(true), true).unwrap(), reply);
        assert_eq!(KexReply::parse(&reply.to_bytes(false), false).unwrap(), reply);
    }

    #[test]
    fn test_derive_key_extension_uses_all_previous_blocks() {
        let k = vec![0x42; 32];
        let h = vec![0x01; 32];
        let sid = vec![0x02; 32];

        let short = derive_key(&k, &h, &sid, b'C', 32);
        let long = derive_key(&k, &h, &sid, b'C', 96);
        assert_eq!(&long[..32], &short[..]);

        let mut hasher = Sha256::new();
        hasher.update(encode_mpint(&k));
        hasher.update(&h);
        hasher.update(&long[..64]);
        assert_eq!(&long[64..], &hasher.finalize()[..]);
    }

    #[test]
    fn test_shared_secret_leading_zero_is_stripped() {
        let h = vec![0x01; 32];
        let with_zero = derive_key(&[0, 0x12, 0x34], &h, &h, b'A', 16);
        let without = derive_key(&[0x12, 0x34], &h, &h, b'A', 16);
        assert_eq!(with_zero, without);
    }

    #[test]
    fn test_session_keys_pair_up_across_roles() {
        let negotiated = Negotiated {
            kex: "curve25519-sha256".to_string(),
            host_key: "ssh-ed25519".to_string(),
            cipher_client_to_server: CipherAlgorithm::Aes128Ctr,
            cipher_server_to_client: CipherAlgorithm::ChaCha20Poly1305,
            mac_client_to_server: Some(MacAlgorithm::HmacSha512),
            mac_server_to_client: None,
            strict: true,
        };
        let k = [7u8; 32];
        let h = [8u8; 32];
        let (client_out, client_in) = SessionKeys::derive(&k, &h, &h, &negotiated).split(Role::Client);
        let (server_out, server_in) = SessionKeys::derive(&k, &h, &h, &negotiated).split(Role::Server);

        let mut seal = PacketSealer::new(&client_out).unwrap();
        let mut open = PacketOpener::new(&server_in).unwrap();
        let wire = seal.seal(3, b"\x5ehello".to_vec()).unwrap();
        let mut first = wire[..16].to_vec();
        open.decrypt_length(3, &mut first).unwrap();
        first.extend_from_slice(&wire[16..]);
        assert_eq!(open.open(3, first).unwrap(), b"\x5ehello");

        assert_eq!(server_out.cipher(), client_in.cipher());
        assert_eq!(client_out.mac(), Some(MacAlgorithm::HmacSha512));
    }

    #[test]
    fn test_exchange_hash_depends_on_every_input() {
        let base = || ExchangeHash::new("SSH-2.0-a", "SSH-2.0-b", b"ic", b"is", b"ks");
        let h1 = base().finish(b"qc", b"qs", &[1, 2], false);
        let h2 = base().finish(b"qc", b"qs", &[1, 3], false);
        let h3 = ExchangeHash::new("SSH-2.0-a", "SSH-2.0-c", b"ic", b"is", b"ks").finish(b"qc", b"qs", &[1, 2], false);
        assert_eq!(h1.len(), 32);
        assert_ne!(h1, h2);
        assert_ne!(h1, h3);
    }
}
