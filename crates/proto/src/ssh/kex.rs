//! SSH key exchange negotiation (RFC 4253 Section 7).
//!
//! This module covers the algorithm-agnostic half of key exchange:
//! - SSH_MSG_KEXINIT construction and parsing
//! - SSH_MSG_NEWKEYS
//! - Algorithm negotiation (client preference order wins)
//! - Strict key exchange markers (`kex-strict-*-v00@openssh.com`)
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client entry the server also lists)
//! 3. Key exchange method messages (see [`crate::ssh::kex_dh`])
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Switch to the new keys
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::kex::{negotiate_algorithm, AlgorithmPreferences, KexInit};
//!
//! let kexinit = KexInit::client(&AlgorithmPreferences::default(), true);
//! assert_eq!(kexinit.to_bytes()[0], 20);
//!
//! let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
//! let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
//! assert_eq!(negotiate_algorithm("cipher", &client, &server).unwrap(), "aes256-ctr");
//! ```

use bytes::BufMut;
use rand::RngCore;
use tether_platform::{TetherError, TetherResult};

use crate::ssh::crypto::{
    CipherAlgorithm, MacAlgorithm, DEFAULT_CIPHERS, DEFAULT_COMPRESSION, DEFAULT_MACS,
};
use crate::ssh::error::{Result, SshError};
use crate::ssh::message::MessageType;
use crate::ssh::wire::{WireReader, WireWrite};

/// Key exchange methods in default preference order.
pub const DEFAULT_KEX: &[&str] = &[
    "curve25519-sha256",
    "curve25519-sha256@libssh.org",
    "diffie-hellman-group14-sha256",
];

/// Host key algorithms in default preference order.
pub const DEFAULT_HOST_KEY: &[&str] = &[
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "rsa-sha2-512",
    "rsa-sha2-256",
];

/// Pseudo-algorithm a client lists to offer strict key exchange.
pub const STRICT_KEX_CLIENT: &str = "kex-strict-c-v00@openssh.com";

/// Pseudo-algorithm a server lists to agree to strict key exchange.
pub const STRICT_KEX_SERVER: &str = "kex-strict-s-v00@openssh.com";

fn is_marker(name: &str) -> bool {
    name.starts_with("kex-strict-") || name.starts_with("ext-info-")
}

/// Ordered algorithm preferences per category.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AlgorithmPreferences {
    /// Key exchange methods
    pub kex: Vec<String>,
    /// Server host key algorithms
    pub host_key: Vec<String>,
    /// Ciphers (both directions)
    pub ciphers: Vec<String>,
    /// MACs (both directions)
    pub macs: Vec<String>,
    /// Compression (both directions)
    pub compression: Vec<String>,
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self {
            kex: owned(DEFAULT_KEX),
            host_key: owned(DEFAULT_HOST_KEY),
            ciphers: owned(DEFAULT_CIPHERS),
            macs: owned(DEFAULT_MACS),
            compression: owned(DEFAULT_COMPRESSION),
        }
    }
}

impl AlgorithmPreferences {
    /// Fails if a list is empty or names an algorithm this crate cannot run.
    pub fn validate(&self) -> TetherResult<()> {
        check_list("KexAlgorithms", &self.kex, |n| DEFAULT_KEX.contains(&n))?;
        check_list("HostKeyAlgorithms", &self.host_key, |n| {
            DEFAULT_HOST_KEY.contains(&n)
        })?;
        check_list("Ciphers", &self.ciphers, |n| {
            CipherAlgorithm::from_name(n).is_some()
        })?;
        check_list("MACs", &self.macs, |n| MacAlgorithm::from_name(n).is_some())?;
        check_list("Compression", &self.compression, |n| n == "none")
    }
}

fn check_list(option: &str, names: &[String], supported: impl Fn(&str) -> bool) -> TetherResult<()> {
    if names.is_empty() {
        return Err(TetherError::Config(format!("{} must not be empty", option)));
    }
    if let Some(bad) = names.iter().find(|n| !supported(n.as_str())) {
        return Err(TetherError::Config(format!(
            "{}: unsupported algorithm '{}'",
            option, bad
        )));
    }
    Ok(())
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_client_to_server: Vec<String>,
    encryption_server_to_client: Vec<String>,
    mac_client_to_server: Vec<String>,
    mac_server_to_client: Vec<String>,
    compression_client_to_server: Vec<String>,
    compression_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a KEXINIT listing `prefs` verbatim, with a fresh random cookie.
    pub fn from_preferences(prefs: &AlgorithmPreferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: prefs.kex.clone(),
            server_host_key_algorithms: prefs.host_key.clone(),
            encryption_client_to_server: prefs.ciphers.clone(),
            encryption_server_to_client: prefs.ciphers.clone(),
            mac_client_to_server: prefs.macs.clone(),
            mac_server_to_client: prefs.macs.clone(),
            compression_client_to_server: prefs.compression.clone(),
            compression_server_to_client: prefs.compression.clone(),
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// Builds the client KEXINIT. The strict-kex marker only goes into the
    /// initial exchange.
    pub fn client(prefs: &AlgorithmPreferences, initial: bool) -> Self {
        let mut kexinit = Self::from_preferences(prefs);
        if initial {
            kexinit.kex_algorithms.push(STRICT_KEX_CLIENT.to_string());
        }
        kexinit
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_client_to_server(&self) -> &[String] {
        &self.encryption_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_server_to_client(&self) -> &[String] {
        &self.encryption_server_to_client
    }

    /// Returns whether a guessed key exchange packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Sets the `first_kex_packet_follows` flag.
    pub fn set_first_kex_packet_follows(&mut self, follows: bool) {
        self.first_kex_packet_follows = follows;
    }

    /// Returns `true` if this KEXINIT lists `marker` among its kex methods.
    pub fn has_marker(&self, marker: &str) -> bool {
        self.kex_algorithms.iter().any(|k| k == marker)
    }

    /// Whether a guessed packet sent after `self` used the right method
    /// (RFC 4253 Section 7: first kex and host key entries must agree).
    pub fn guess_matches(&self, other: &KexInit) -> bool {
        let first_real = |list: &[String]| list.iter().find(|n| !is_marker(n)).cloned();
        first_real(&self.kex_algorithms) == first_real(&other.kex_algorithms)
            && self.server_host_key_algorithms.first() == other.server_host_key_algorithms.first()
    }

    /// Serializes the KEXINIT message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(512);
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);
        buf.put_name_list(&self.kex_algorithms);
        buf.put_name_list(&self.server_host_key_algorithms);
        buf.put_name_list(&self.encryption_client_to_server);
        buf.put_name_list(&self.encryption_server_to_client);
        buf.put_name_list(&self.mac_client_to_server);
        buf.put_name_list(&self.mac_server_to_client);
        buf.put_name_list(&self.compression_client_to_server);
        buf.put_name_list(&self.compression_server_to_client);
        buf.put_name_list(&self.languages_client_to_server);
        buf.put_name_list(&self.languages_server_to_client);
        buf.put_bool(self.first_kex_packet_follows);
        buf.put_u32(0);
        buf
    }

    /// Parses a KEXINIT message payload.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut r = WireReader::new(data);
        let msg = r.read_u8()?;
        if msg != MessageType::KexInit as u8 {
            return Err(TetherError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                msg
            )));
        }
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.read_raw(16)?);

        let kexinit = Self {
            cookie,
            kex_algorithms: r.read_name_list()?,
            server_host_key_algorithms: r.read_name_list()?,
            encryption_client_to_server: r.read_name_list()?,
            encryption_server_to_client: r.read_name_list()?,
            mac_client_to_server: r.read_name_list()?,
            mac_server_to_client: r.read_name_list()?,
            compression_client_to_server: r.read_name_list()?,
            compression_server_to_client: r.read_name_list()?,
            languages_client_to_server: r.read_name_list()?,
            languages_server_to_client: r.read_name_list()?,
            first_kex_packet_follows: r.read_bool()?,
        };
        // reserved
        r.read_u32()?;
        Ok(kexinit)
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Serializes the NEWKEYS message.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        match data {
            [21] => Ok(NewKeys),
            [] => Err(TetherError::protocol("NEWKEYS message is empty")),
            [21, ..] => Err(TetherError::protocol("Trailing bytes after NEWKEYS")),
            [other, ..] => Err(TetherError::Protocol(format!(
                "Invalid message type: expected 21 (SSH_MSG_NEWKEYS), got {}",
                other
            ))),
        }
    }
}

/// Picks the first algorithm in `client` that `server` also lists.
///
/// # Errors
///
/// [`SshError::NoCommonAlgorithm`] when the lists share nothing.
pub fn negotiate_algorithm(category: &'static str, client: &[String], server: &[String]) -> Result<String> {
    client
        .iter()
        .filter(|name| !is_marker(name))
        .find(|name| server.contains(*name))
        .cloned()
        .ok_or_else(|| SshError::NoCommonAlgorithm {
            category,
            client: client.to_vec(),
            server: server.to_vec(),
        })
}

/// Algorithms agreed for one key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Key exchange method
    pub kex: String,
    /// Server host key algorithm
    pub host_key: String,
    /// Cipher client to server
    pub cipher_client_to_server: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_server_to_client: CipherAlgorithm,
    /// MAC client to server (`None` for AEAD ciphers)
    pub mac_client_to_server: Option<MacAlgorithm>,
    /// MAC server to client (`None` for AEAD ciphers)
    pub mac_server_to_client: Option<MacAlgorithm>,
    /// Both sides offered strict key exchange
    pub strict: bool,
}

fn negotiate_cipher(category: &'static str, client: &[String], server: &[String]) -> Result<CipherAlgorithm> {
    let name = negotiate_algorithm(category, client, server)?;
    CipherAlgorithm::from_name(&name)
        .ok_or_else(|| SshError::protocol(format!("Negotiated unknown cipher {}", name)))
}

fn negotiate_mac(
    category: &'static str,
    cipher: CipherAlgorithm,
    client: &[String],
    server: &[String],
) -> Result<Option<MacAlgorithm>> {
    if cipher.is_aead() {
        return Ok(None);
    }
    let name = negotiate_algorithm(category, client, server)?;
    MacAlgorithm::from_name(&name)
        .map(Some)
        .ok_or_else(|| SshError::protocol(format!("Negotiated unknown MAC {}", name)))
}

/// Negotiates every category of a client/server KEXINIT pair.
pub fn negotiate(client: &KexInit, server: &KexInit) -> Result<Negotiated> {
    let kex = negotiate_algorithm("kex", &client.kex_algorithms, &server.kex_algorithms)?;
    let host_key = negotiate_algorithm(
        "host key",
        &client.server_host_key_algorithms,
        &server.server_host_key_algorithms,
    )?;
    let cipher_client_to_server = negotiate_cipher(
        "cipher",
        &client.encryption_client_to_server,
        &server.encryption_client_to_server,
    )?;
    let cipher_server_to_client = negotiate_cipher(
        "cipher",
        &client.encryption_server_to_client,
        &server.encryption_server_to_client,
    )?;
    let mac_client_to_server = negotiate_mac(
        "mac",
        cipher_client_to_server,
        &client.mac_client_to_server,
        &server.mac_client_to_server,
    )?;
    let mac_server_to_client = negotiate_mac(
        "mac",
        cipher_server_to_client,
        &client.mac_server_to_client,
        &server.mac_server_to_client,
    )?;
    negotiate_algorithm(
        "compression",
        &client.compression_client_to_server,
        &server.compression_client_to_server,
    )?;
    negotiate_algorithm(
        "compression",
        &client.compression_server_to_client,
        &server.compression_server_to_client,
    )?;

    Ok(Negotiated {
        kex,
        host_key,
        cipher_client_to_server,
        cipher_server_to_client,
        mac_client_to_server,
        mac_server_to_client,
        strict: client.has_marker(STRICT_KEX_CLIENT) && server.has_marker(STRICT_KEX_SERVER),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn names(list: &[&str]) -> Vec<String> {
        owned(list)
    }

    #[test]
    fn test_kexinit_round_trip() {
        let original = KexInit::client(&AlgorithmPreferences::default(), true);
        let parsed = KexInit::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(parsed, original);
        assert!(parsed.has_marker(STRICT_KEX_CLIENT));
    }

    #[test]
    fn test_rekey_kexinit_has_no_strict_marker() {
        let kexinit = KexInit::client(&AlgorithmPreferences::default(), false);
        assert!(!kexinit.has_marker(STRICT_KEX_CLIENT));
    }

    #[test]
    fn test_kexinit_parse_invalid_type() {
        let mut data = vec![99];
        data.extend_from_slice(&[0u8; 60]);
        match KexInit::from_bytes(&data) {
            Err(TetherError::Protocol(msg)) => assert!(msg.contains("Invalid message type")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_kexinit_parse_too_short() {
        assert!(KexInit::from_bytes(&[20, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_newkeys() {
        assert_eq!(NewKeys.to_bytes(), vec![21]);
        assert_eq!(NewKeys::from_bytes(&[21]).unwrap(), NewKeys);
        assert!(NewKeys::from_bytes(&[]).is_err());
        assert!(NewKeys::from_bytes(&[20]).is_err());
    }

    #[test]
    fn test_negotiate_defaults_with_strict_server() {
        let client = KexInit::client(&AlgorithmPreferences::default(), true);
        let mut server_prefs = AlgorithmPreferences::default();
        server_prefs.kex.push(STRICT_KEX_SERVER.to_string());
        server_prefs.ciphers = names(&["aes128-ctr"]);
        let server = KexInit::from_preferences(&server_prefs);

        let negotiated = negotiate(&client, &server).unwrap();
        assert_eq!(negotiated.kex, "curve25519-sha256");
        assert_eq!(negotiated.host_key, "ssh-ed25519");
        assert_eq!(negotiated.cipher_client_to_server, CipherAlgorithm::Aes128Ctr);
        assert_eq!(negotiated.mac_client_to_server, Some(MacAlgorithm::HmacSha256));
        assert!(negotiated.strict);
    }

    #[test]
    fn test_aead_needs_no_mac_overlap() {
        let client = KexInit::client(&AlgorithmPreferences::default(), true);
        let mut server_prefs = AlgorithmPreferences::default();
        server_prefs.macs = names(&["hmac-sha1"]);
        let server = KexInit::from_preferences(&server_prefs);
        let negotiated = negotiate(&client, &server).unwrap();
        assert_eq!(negotiated.mac_client_to_server, None);
        assert!(!negotiated.strict);
    }

    #[test]
    fn test_no_common_cipher_is_reported() {
        let client = KexInit::client(&AlgorithmPreferences::default(), true);
        let mut server_prefs = AlgorithmPreferences::default();
        server_prefs.ciphers = names(&["3des-cbc"]);
        let server = KexInit::from_preferences(&server_prefs);
        match negotiate(&client, &server) {
            Err(SshError::NoCommonAlgorithm { category, .. }) => assert_eq!(category, "cipher"),
            other => panic!("Expected NoCommonAlgorithm, got {:?}", other),
        }
    }

    #[test]
    fn test_markers_never_negotiated() {
        let client = names(&[STRICT_KEX_CLIENT, "curve25519-sha256"]);
        let server = names(&[STRICT_KEX_CLIENT, "curve25519-sha256"]);
        assert_eq!(
            negotiate_algorithm("kex", &client, &server).unwrap(),
            "curve25519-sha256"
        );
    }

    #[test]
    fn test_guess_matches() {
        let prefs = AlgorithmPreferences::default();
        let a = KexInit::client(&prefs, true);
        let mut b = KexInit::from_preferences(&prefs);
        assert!(a.guess_matches(&b));
        b.kex_algorithms.reverse();
        assert!(!a.guess_matches(&b));
    }

    #[test]
    fn test_preferences_validation() {
        assert!(AlgorithmPreferences::default().validate().is_ok());
        let mut prefs = AlgorithmPreferences::default();
        prefs.ciphers = names(&["aes256-cbc"]);
        assert!(matches!(prefs.validate(), Err(TetherError::Config(_))));
        prefs.ciphers.clear();
        assert!(prefs.validate().is_err());
    }

    fn algorithm_list() -> impl Strategy<Value = Vec<String>> {
        proptest::collection::vec("[a-e]{1,2}", 0..8)
    }

    proptest! {
        #[test]
        fn prop_negotiation_picks_first_client_entry_in_server_list(
            client in algorithm_list(),
            server in algorithm_list(),
        ) {
            let expected = client.iter().find(|c| server.contains(c)).cloned();
            match negotiate_algorithm("cipher", &client, &server) {
                Ok(chosen) => prop_assert_eq!(Some(chosen), expected),
                Err(SshError::NoCommonAlgorithm { category, .. }) => {
                    prop_assert_eq!(category, "cipher");
                    prop_assert!(expected.is_none());
                }
                Err(other) => prop_assert!(false, "unexpected error {:?}", other),
            }
        }
    }
}
