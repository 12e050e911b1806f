//! Host key trust policy.
//!
//! Key persistence is an injected capability: key exchange only sees the
//! [`HostKeyStore`] trait, so the negotiation path never touches the
//! filesystem directly and can be tested against [`MemoryHostKeyStore`].
//! Entries are keyed by `(host, port, key type)`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tether_platform::{TetherError, TetherResult};

use crate::ssh::error::{Result, SshError};
use crate::ssh::hostkey::{blob_key_type, fingerprint};
use crate::ssh::known_hosts::{host_key_name, KnownHostsFile};
use crate::ssh::logging;

/// Persistent mapping from `(host, port, key type)` to trusted public keys.
pub trait HostKeyStore: Send + Sync {
    /// Key blobs on record for this host and key type.
    fn get(&self, host: &str, port: u16, key_type: &str) -> TetherResult<Vec<Vec<u8>>>;

    /// Records a newly trusted key blob.
    fn put(&self, host: &str, port: u16, key_type: &str, key: &[u8]) -> TetherResult<()>;
}

type StoreKey = (String, u16, String);

/// In-memory store, for tests and for callers that manage trust themselves.
#[derive(Debug, Default)]
pub struct MemoryHostKeyStore {
    entries: Mutex<HashMap<StoreKey, Vec<Vec<u8>>>>,
}

impl MemoryHostKeyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys on record.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Returns `true` if nothing is on record.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> TetherError {
    TetherError::Other("host key store lock poisoned".into())
}

impl HostKeyStore for MemoryHostKeyStore {
    fn get(&self, host: &str, port: u16, key_type: &str) -> TetherResult<Vec<Vec<u8>>> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        let key = (host_key_name(host, port), port, key_type.to_string());
        Ok(entries.get(&key).cloned().unwrap_or_default())
    }

    fn put(&self, host: &str, port: u16, key_type: &str, key: &[u8]) -> TetherResult<()> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries
            .entry((host_key_name(host, port), port, key_type.to_string()))
            .or_default()
            .push(key.to_vec());
        Ok(())
    }
}

/// Store backed by an OpenSSH known_hosts file.
///
/// The file is read once when the store is opened; every `put` appends the
/// entry and rewrites the file atomically.
#[derive(Debug)]
pub struct KnownHostsStore {
    file: Mutex<KnownHostsFile>,
    hash_hostnames: bool,
}

impl KnownHostsStore {
    /// Opens (or prepares to create) the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> TetherResult<Self> {
        Ok(Self {
            file: Mutex::new(KnownHostsFile::from_file(path)?),
            hash_hostnames: false,
        })
    }

    /// Write new entries with hashed hostnames (`HashKnownHosts yes`).
    pub fn with_hashed_hostnames(mut self, hash: bool) -> Self {
        self.hash_hostnames = hash;
        self
    }

    /// Path of the backing file.
    pub fn path(&self) -> PathBuf {
        self.file
            .lock()
            .map(|file| file.path().to_path_buf())
            .unwrap_or_default()
    }
}

impl HostKeyStore for KnownHostsStore {
    fn get(&self, host: &str, port: u16, key_type: &str) -> TetherResult<Vec<Vec<u8>>> {
        let file = self.file.lock().map_err(|_| poisoned())?;
        Ok(file.lookup(host, port, key_type))
    }

    fn put(&self, host: &str, port: u16, key_type: &str, key: &[u8]) -> TetherResult<()> {
        let mut file = self.file.lock().map_err(|_| poisoned())?;
        if self.hash_hostnames {
            file.add_host_hashed(host, port, key_type, key)?;
        } else {
            file.add_host(host, port, key_type, key);
        }
        file.save()
    }
}

/// `StrictHostKeyChecking` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum HostKeyChecking {
    /// Only keys already on record are accepted.
    #[default]
    Strict,
    /// Unknown hosts are recorded and accepted; changed keys are rejected.
    AcceptNew,
    /// Any key is accepted and nothing is recorded.
    Insecure,
}

impl HostKeyChecking {
    /// Parses an OpenSSH option value.
    pub fn from_option_value(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "yes" | "strict" => Some(HostKeyChecking::Strict),
            "accept-new" => Some(HostKeyChecking::AcceptNew),
            "no" | "off" | "insecure" => Some(HostKeyChecking::Insecure),
            _ => None,
        }
    }

    /// Canonical OpenSSH option value.
    pub fn as_option_value(&self) -> &'static str {
        match self {
            HostKeyChecking::Strict => "yes",
            HostKeyChecking::AcceptNew => "accept-new",
            HostKeyChecking::Insecure => "no",
        }
    }
}

/// Why a host key was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// The key is on record.
    Known,
    /// First contact under `accept-new`; the key was recorded.
    AcceptedNew,
    /// Checking is disabled.
    Insecure,
}

impl TrustDecision {
    fn as_str(&self) -> &'static str {
        match self {
            TrustDecision::Known => "known",
            TrustDecision::AcceptedNew => "accepted-new",
            TrustDecision::Insecure => "insecure",
        }
    }
}

/// Applies `policy` to the host key blob presented by `host:port`.
///
/// # Errors
///
/// [`SshError::HostKeyRejected`] when the policy rejects the key, carrying
/// the key type and fingerprint of the presented key.
pub fn verify_host_key(
    store: &dyn HostKeyStore,
    policy: HostKeyChecking,
    host: &str,
    port: u16,
    key_blob: &[u8],
) -> Result<TrustDecision> {
    let key_type = blob_key_type(key_blob)
        .ok_or_else(|| SshError::protocol("Malformed host key blob"))?;
    let fp = fingerprint(key_blob);

    let reject = |reason: &str| {
        logging::log_host_key_decision(host, port, &key_type, &fp, "rejected");
        SshError::HostKeyRejected {
            host: host.to_string(),
            port,
            key_type: key_type.clone(),
            fingerprint: fp.clone(),
            reason: reason.to_string(),
        }
    };

    let decision = if policy == HostKeyChecking::Insecure {
        TrustDecision::Insecure
    } else {
        let recorded = store.get(host, port, &key_type)?;
        if recorded.iter().any(|k| k.as_slice() == key_blob) {
            TrustDecision::Known
        } else if !recorded.is_empty() {
            return Err(reject("host key does not match the key on record"));
        } else if policy == HostKeyChecking::AcceptNew {
            store.put(host, port, &key_type, key_blob)?;
            TrustDecision::AcceptedNew
        } else {
            return Err(reject("no host key on record and strict checking is enabled"));
        }
    };

    logging::log_host_key_decision(host, port, &key_type, &fp, decision.as_str());
    Ok(decision)
}
