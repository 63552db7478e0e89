//! Core types for keyrelay.
//!
//! Defines the [`AgentBackend`] capability trait that every credential source
//! implements, the [`Identity`] data model exchanged with SSH clients, and the
//! [`Multiplexer`] that folds an ordered set of backends into one logical
//! agent.  Nothing in this crate knows about transports or the wire protocol.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::{BASE64_STANDARD_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use ssh_encoding::{Decode, Encode};
use ssh_key::public::KeyData;
use ssh_key::{Mpint, PrivateKey, PublicKey, Signature};
use tokio::io::{AsyncRead, AsyncWrite};

pub mod config;
pub mod multiplexer;
pub mod notify;
pub mod signing;

pub use multiplexer::Multiplexer;
pub use notify::{Notifier, Severity, TracingNotifier};

// ---------------------------------------------------------------------------
// Identity model
// ---------------------------------------------------------------------------

/// Raw SSH wire encoding of a public key (`string algorithm, …`).
///
/// Treated as opaque: equality is byte equality, and every derived attribute
/// is recomputed from the bytes on demand.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyBlob(Vec<u8>);

impl KeyBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_key_data(key: &KeyData) -> Result<Self, BackendError> {
        let mut bytes = Vec::new();
        key.encode(&mut bytes)
            .map_err(|e| BackendError::InvalidKey(format!("encode public key: {e}")))?;
        Ok(Self(bytes))
    }

    pub fn from_public_key(key: &PublicKey) -> Result<Self, BackendError> {
        Self::from_key_data(key.key_data())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Parse the blob into a typed public key.
    pub fn key_data(&self) -> Result<KeyData, ssh_key::Error> {
        let mut reader = self.0.as_slice();
        KeyData::decode(&mut reader)
    }

    /// Algorithm name: the leading string field of the encoding.
    pub fn algorithm(&self) -> Option<String> {
        let mut reader = self.0.as_slice();
        String::decode(&mut reader).ok()
    }

    /// OpenSSH-style SHA-256 fingerprint (`SHA256:<base64>`).
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.0);
        format!("SHA256:{}", BASE64_STANDARD_NO_PAD.encode(digest))
    }

    /// Key size in bits, when the algorithm defines one.
    pub fn bit_length(&self) -> Option<u32> {
        match self.key_data().ok()? {
            KeyData::Rsa(rsa) => mpint_bits(&rsa.n),
            KeyData::Dsa(dsa) => mpint_bits(&dsa.p),
            KeyData::Ecdsa(ecdsa) => match ecdsa.curve().as_str() {
                "nistp256" => Some(256),
                "nistp384" => Some(384),
                "nistp521" => Some(521),
                _ => None,
            },
            KeyData::Ed25519(_) => Some(256),
            _ => None,
        }
    }
}

impl fmt::Debug for KeyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyBlob({})", self.fingerprint())
    }
}

fn mpint_bits(value: &Mpint) -> Option<u32> {
    let bytes = value.as_positive_bytes()?;
    let first = *bytes.first()?;
    Some((bytes.len() as u32 - 1) * 8 + (8 - first.leading_zeros()))
}

/// A public key advertised to clients, with its backend-owned comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub blob: KeyBlob,
    pub comment: String,
}

impl Identity {
    pub fn new(blob: KeyBlob, comment: impl Into<String>) -> Self {
        Self {
            blob,
            comment: comment.into(),
        }
    }

    pub fn algorithm(&self) -> Option<String> {
        self.blob.algorithm()
    }

    pub fn fingerprint(&self) -> String {
        self.blob.fingerprint()
    }

    pub fn bit_length(&self) -> Option<u32> {
        self.blob.bit_length()
    }
}

/// Usage restrictions attached to a key when it is added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyConstraints {
    /// Remove the key automatically once this much time has passed.
    pub lifetime: Option<Duration>,
    /// Require interactive confirmation before each signature.
    pub confirm: bool,
}

/// Private key material submitted through `Add`.
#[derive(Clone)]
pub struct AddedKey {
    pub private_key: PrivateKey,
    pub constraints: KeyConstraints,
}

impl AddedKey {
    pub fn new(private_key: PrivateKey) -> Self {
        Self {
            private_key,
            constraints: KeyConstraints::default(),
        }
    }

    pub fn comment(&self) -> &str {
        self.private_key.comment()
    }
}

impl fmt::Debug for AddedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddedKey")
            .field("algorithm", &self.private_key.algorithm().as_str())
            .field("comment", &self.private_key.comment())
            .field("constraints", &self.constraints)
            .finish_non_exhaustive()
    }
}

/// `SSH_AGENT_RSA_SHA2_*` flags carried by sign requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SignatureFlags(u32);

impl SignatureFlags {
    pub const NONE: Self = Self(0);
    pub const RSA_SHA2_256: Self = Self(0x02);
    pub const RSA_SHA2_512: Self = Self(0x04);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

/// A signer over key material held by a backend.
///
/// Handed out by [`AgentBackend::signers`] so in-process callers can sign
/// without a round trip through the wire protocol.
#[derive(Clone)]
pub struct KeySigner {
    key: Arc<PrivateKey>,
}

impl KeySigner {
    pub fn new(key: Arc<PrivateKey>) -> Self {
        Self { key }
    }

    pub fn identity(&self) -> Result<Identity, BackendError> {
        let blob = KeyBlob::from_public_key(self.key.public_key())?;
        Ok(Identity::new(blob, self.key.comment()))
    }

    pub fn sign(&self, data: &[u8], flags: SignatureFlags) -> Result<Signature, BackendError> {
        signing::sign_with_flags(&self.key, data, flags)
    }
}

impl fmt::Debug for KeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySigner")
            .field("algorithm", &self.key.algorithm().as_str())
            .field("comment", &self.key.comment())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("agent locked")]
    Locked,
    #[error("agent not locked")]
    NotLocked,
    #[error("incorrect passphrase")]
    BadPassphrase,
    #[error("key not found")]
    NotFound,
    #[error("not supported")]
    NotSupported,
    #[error("extension not supported: {0}")]
    UnsupportedExtension(String),
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("operation refused: {0}")]
    Refused(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Signing with caller-selected signature algorithm flags.
///
/// Backends that can honour `SSH_AGENT_RSA_SHA2_*` expose this through
/// [`AgentBackend::extended_signer`]; the multiplexer asks once at
/// construction and remembers the answer.
#[async_trait::async_trait]
pub trait ExtendedSigner: Send + Sync {
    async fn sign_with_flags(
        &self,
        key: &KeyBlob,
        data: &[u8],
        flags: SignatureFlags,
    ) -> Result<Signature, BackendError>;
}

/// A credential source.
///
/// Only [`list`](Self::list) and [`sign`](Self::sign) are mandatory; every
/// mutating operation defaults to [`BackendError::NotSupported`] so read-only
/// stores (hardware, OS crypto APIs) implement just what they can.
///
/// Implementations must be safe for concurrent calls: the multiplexer shares
/// one instance across every connection without external locking.
#[async_trait::async_trait]
pub trait AgentBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn list(&self) -> Result<Vec<Identity>, BackendError>;

    async fn sign(&self, key: &KeyBlob, data: &[u8]) -> Result<Signature, BackendError>;

    /// The flag-aware signing capability, if this backend has one.
    fn extended_signer(self: Arc<Self>) -> Option<Arc<dyn ExtendedSigner>> {
        None
    }

    async fn add(&self, _key: AddedKey) -> Result<(), BackendError> {
        Err(BackendError::NotSupported)
    }

    async fn remove(&self, _key: &KeyBlob) -> Result<(), BackendError> {
        Err(BackendError::NotSupported)
    }

    async fn remove_all(&self) -> Result<(), BackendError> {
        Err(BackendError::NotSupported)
    }

    async fn lock(&self, _passphrase: &[u8]) -> Result<(), BackendError> {
        Err(BackendError::NotSupported)
    }

    async fn unlock(&self, _passphrase: &[u8]) -> Result<(), BackendError> {
        Err(BackendError::NotSupported)
    }

    /// Enumerate in-process signers over the backend's key material.
    async fn signers(&self) -> Result<Vec<KeySigner>, BackendError> {
        Err(BackendError::NotSupported)
    }

    async fn extension(&self, name: &str, _payload: &[u8]) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::UnsupportedExtension(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// A duplex byte stream carrying the agent protocol.
pub trait AgentStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> AgentStream for T {}

/// Type-erased stream handed from transports to sessions.
pub type BoxedStream = Box<dyn AgentStream>;

/// Opens outbound streams to another agent.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self) -> std::io::Result<BoxedStream>;
}
