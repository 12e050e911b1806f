//! SSH public keys and signatures (RFC 4253 Section 6.6, RFC 5656, RFC 8332, RFC 8709).
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - EdDSA signature using Ed25519
//! - `ecdsa-sha2-nistp256` - ECDSA signature using the P-256 curve
//! - `rsa-sha2-512` / `rsa-sha2-256` - RSA PKCS#1 v1.5 signatures (verification only)
//!
//! Verification covers every algorithm above. Signing is available for
//! Ed25519 and P-256 keys, which is what user authentication and the
//! in-process test server need.
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::hostkey::{fingerprint, verify_signature, Ed25519HostKey, HostKey};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hostkey = Ed25519HostKey::generate();
//! let blob = hostkey.public_key_bytes();
//! let signature = hostkey.sign(b"exchange hash")?;
//!
//! verify_signature("ssh-ed25519", &blob, b"exchange hash", &signature)?;
//! assert!(fingerprint(&blob).starts_with("SHA256:"));
//! # Ok(())
//! # }
//! ```

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use ring::signature::{RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512};
use sha2::{Digest, Sha256};
use tether_platform::{TetherError, TetherResult};
use zeroize::Zeroizing;

use crate::ssh::wire::{WireReader, WireWrite};

/// Host key / signature algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519
    SshEd25519,
    /// ecdsa-sha2-nistp256
    EcdsaSha2Nistp256,
    /// rsa-sha2-256 (key type `ssh-rsa`)
    RsaSha2_256,
    /// rsa-sha2-512 (key type `ssh-rsa`)
    RsaSha2_512,
}

impl HostKeyAlgorithm {
    /// Algorithm name as negotiated in KEXINIT
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::EcdsaSha2Nistp256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "ecdsa-sha2-nistp256" => Some(HostKeyAlgorithm::EcdsaSha2Nistp256),
            "rsa-sha2-256" => Some(HostKeyAlgorithm::RsaSha2_256),
            "rsa-sha2-512" => Some(HostKeyAlgorithm::RsaSha2_512),
            _ => None,
        }
    }

    /// Key type carried in the public key blob
    pub fn key_type(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::EcdsaSha2Nistp256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::RsaSha2_256 | HostKeyAlgorithm::RsaSha2_512 => "ssh-rsa",
        }
    }
}

/// A key pair that can produce SSH signature blobs.
pub trait HostKey: Send + Sync {
    /// Signature algorithm
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Public key blob (`string type || key data`)
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Signs `data`, returning an SSH signature blob (`string type || string sig`)
    fn sign(&self, data: &[u8]) -> TetherResult<Vec<u8>>;

    /// Algorithm name
    fn algorithm_name(&self) -> &'static str {
        self.algorithm().name()
    }
}

/// Ed25519 key pair
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
}

impl Ed25519HostKey {
    /// Generate a new Ed25519 key pair
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::Rng::gen(&mut rand::thread_rng());
        Self::from_seed(seed)
    }

    /// Create from the 32-byte seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let seed = Zeroizing::new(seed);
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Create from a seed slice
    pub fn from_bytes(secret_bytes: &[u8]) -> TetherResult<Self> {
        let seed: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| TetherError::security("Ed25519 secret key must be 32 bytes"))?;
        Ok(Self::from_seed(seed))
    }

    /// Get the secret key bytes (32 bytes)
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Raw 32-byte public key
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        PublicKey::Ed25519(self.public_key()).to_blob()
    }

    fn sign(&self, data: &[u8]) -> TetherResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        let mut blob = Vec::with_capacity(83);
        blob.put_string(b"ssh-ed25519");
        blob.put_string(signature.to_bytes());
        Ok(blob)
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

/// ECDSA key pair on P-256
#[derive(Clone)]
pub struct EcdsaP256HostKey {
    signing_key: p256::ecdsa::SigningKey,
}

impl EcdsaP256HostKey {
    /// Generate a new ECDSA P-256 key pair
    pub fn generate() -> Self {
        Self {
            signing_key: p256::ecdsa::SigningKey::random(&mut rand::thread_rng()),
        }
    }

    /// Create from a big-endian private scalar
    pub fn from_scalar(scalar: &[u8]) -> TetherResult<Self> {
        let signing_key = p256::ecdsa::SigningKey::from_slice(scalar)
            .map_err(|e| TetherError::Security(format!("Invalid P-256 private key: {}", e)))?;
        Ok(Self { signing_key })
    }

    /// Big-endian private scalar
    pub fn scalar_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signing_key.to_bytes().to_vec())
    }

    /// Uncompressed SEC1 public point
    pub fn public_point(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }
}

impl HostKey for EcdsaP256HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::EcdsaSha2Nistp256
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        PublicKey::EcdsaP256(self.public_point()).to_blob()
    }

    fn sign(&self, data: &[u8]) -> TetherResult<Vec<u8>> {
        use signature::Signer as _;

        let signature: p256::ecdsa::Signature = self.signing_key.sign(data);
        let raw = signature.to_bytes();
        let mut inner = Vec::with_capacity(74);
        inner.put_mpint(&raw[..32]);
        inner.put_mpint(&raw[32..]);

        let mut blob = Vec::with_capacity(inner.len() + 27);
        blob.put_string(b"ecdsa-sha2-nistp256");
        blob.put_string(&inner);
        Ok(blob)
    }
}

impl std::fmt::Debug for EcdsaP256HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdsaP256HostKey")
            .field("algorithm", &"ecdsa-sha2-nistp256")
            .finish_non_exhaustive()
    }
}

/// A parsed SSH public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// Ed25519 public key (32 bytes)
    Ed25519([u8; 32]),
    /// P-256 public point (uncompressed SEC1)
    EcdsaP256(Vec<u8>),
    /// RSA public key
    Rsa {
        /// Public exponent
        e: Vec<u8>,
        /// Modulus
        n: Vec<u8>,
    },
}

impl PublicKey {
    /// Parses a public key blob.
    pub fn from_blob(blob: &[u8]) -> TetherResult<Self> {
        let mut r = WireReader::new(blob);
        let key_type = r.read_utf8()?;
        let key = match key_type.as_str() {
            "ssh-ed25519" => {
                let raw: [u8; 32] = r
                    .read_string()?
                    .try_into()
                    .map_err(|_| TetherError::protocol("Ed25519 public key must be 32 bytes"))?;
                PublicKey::Ed25519(raw)
            }
            "ecdsa-sha2-nistp256" => {
                let curve = r.read_string()?;
                if curve != b"nistp256" {
                    return Err(TetherError::protocol("ECDSA key curve does not match key type"));
                }
                PublicKey::EcdsaP256(r.read_string()?.to_vec())
            }
            "ssh-rsa" => {
                let e = r.read_mpint()?.to_vec();
                let n = r.read_mpint()?.to_vec();
                PublicKey::Rsa { e, n }
            }
            other => {
                return Err(TetherError::NotImplemented(format!(
                    "Unsupported public key type: {}",
                    other
                )))
            }
        };
        r.finish()?;
        Ok(key)
    }

    /// Key type name
    pub fn key_type(&self) -> &'static str {
        match self {
            PublicKey::Ed25519(_) => "ssh-ed25519",
            PublicKey::EcdsaP256(_) => "ecdsa-sha2-nistp256",
            PublicKey::Rsa { .. } => "ssh-rsa",
        }
    }

    /// Encodes the public key blob.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.put_string(self.key_type().as_bytes());
        match self {
            PublicKey::Ed25519(raw) => blob.put_string(raw),
            PublicKey::EcdsaP256(point) => {
                blob.put_string(b"nistp256");
                blob.put_string(point);
            }
            PublicKey::Rsa { e, n } => {
                blob.put_mpint(e);
                blob.put_mpint(n);
            }
        }
        blob
    }

    /// Verifies a signature blob made with `algorithm` over `data`.
    pub fn verify(&self, algorithm: HostKeyAlgorithm, data: &[u8], signature_blob: &[u8]) -> TetherResult<()> {
        if algorithm.key_type() != self.key_type() {
            return Err(TetherError::Security(format!(
                "Signature algorithm {} does not fit a {} key",
                algorithm.name(),
                self.key_type()
            )));
        }

        let mut r = WireReader::new(signature_blob);
        let sig_alg = r.read_utf8()?;
        if sig_alg != algorithm.name() {
            return Err(TetherError::Security(format!(
                "Expected {} signature, got {}",
                algorithm.name(),
                sig_alg
            )));
        }
        let sig = r.read_string()?;
        r.finish()?;

        match self {
            PublicKey::Ed25519(raw) => verify_ed25519(raw, data, sig),
            PublicKey::EcdsaP256(point) => verify_p256(point, data, sig),
            PublicKey::Rsa { e, n } => verify_rsa(algorithm, e, n, data, sig),
        }
    }
}

fn bad_signature() -> TetherError {
    TetherError::security("Signature verification failed")
}

fn verify_ed25519(public_key: &[u8; 32], data: &[u8], sig: &[u8]) -> TetherResult<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| TetherError::Security(format!("Invalid Ed25519 public key: {}", e)))?;
    let sig: [u8; 64] = sig
        .try_into()
        .map_err(|_| TetherError::security("Ed25519 signature must be 64 bytes"))?;
    verifying_key
        .verify(data, &Signature::from_bytes(&sig))
        .map_err(|_| bad_signature())
}

fn verify_p256(point: &[u8], data: &[u8], sig: &[u8]) -> TetherResult<()> {
    use signature::Verifier as _;

    let verifying_key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
        .map_err(|e| TetherError::Security(format!("Invalid P-256 public key: {}", e)))?;

    let mut r = WireReader::new(sig);
    let sig_r = r.read_mpint()?;
    let sig_s = r.read_mpint()?;
    r.finish()?;
    if sig_r.len() > 32 || sig_s.len() > 32 {
        return Err(bad_signature());
    }
    let mut raw = [0u8; 64];
    raw[32 - sig_r.len()..32].copy_from_slice(sig_r);
    raw[64 - sig_s.len()..].copy_from_slice(sig_s);

    let signature = p256::ecdsa::Signature::from_slice(&raw).map_err(|_| bad_signature())?;
    verifying_key.verify(data, &signature).map_err(|_| bad_signature())
}

fn verify_rsa(algorithm: HostKeyAlgorithm, e: &[u8], n: &[u8], data: &[u8], sig: &[u8]) -> TetherResult<()> {
    let params = match algorithm {
        HostKeyAlgorithm::RsaSha2_512 => &RSA_PKCS1_2048_8192_SHA512,
        _ => &RSA_PKCS1_2048_8192_SHA256,
    };
    // Some servers strip leading zero bytes from the signature.
    let mut padded = Vec::with_capacity(n.len());
    if sig.len() < n.len() {
        padded.resize(n.len() - sig.len(), 0);
    }
    padded.extend_from_slice(sig);

    RsaPublicKeyComponents { n, e }
        .verify(params, data, &padded)
        .map_err(|_| bad_signature())
}

/// Verifies `signature_blob` over `data` with the key in `key_blob`.
///
/// `algorithm` is the negotiated host key algorithm name.
pub fn verify_signature(algorithm: &str, key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> TetherResult<()> {
    let algorithm = HostKeyAlgorithm::from_name(algorithm).ok_or_else(|| {
        TetherError::NotImplemented(format!("Unsupported host key algorithm: {}", algorithm))
    })?;
    PublicKey::from_blob(key_blob)?.verify(algorithm, data, signature_blob)
}

/// Key type named inside a public key blob, if readable.
pub fn blob_key_type(key_blob: &[u8]) -> Option<String> {
    WireReader::new(key_blob).read_utf8().ok()
}

/// OpenSSH-style fingerprint: `SHA256:` followed by unpadded base64.
pub fn fingerprint(key_blob: &[u8]) -> String {
    let digest = Sha256::digest(key_blob);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    )
}
