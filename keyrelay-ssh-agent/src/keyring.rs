//! Volatile in-memory keyring.
//!
//! The [`Keyring`] is the primary backend: it is the only one clients can
//! add keys to.  Nothing is persisted; keys live until they are removed,
//! their lifetime constraint expires, or the process exits.
//!
//! Thread safety: all state sits behind one `std::sync::RwLock`.  No lock is
//! held across an `.await`.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hmac::{Hmac, Mac};
use keyrelay_core::signing::sign_with_flags;
use keyrelay_core::{
    AddedKey, AgentBackend, BackendError, ExtendedSigner, Identity, KeyBlob, KeySigner,
    SignatureFlags,
};
use sha2::Sha256;
use ssh_key::{PrivateKey, Signature};
use tokio::time::Instant;
use tracing::debug;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// One key held by the keyring.
struct KeyEntry {
    blob: KeyBlob,
    private_key: Arc<PrivateKey>,
    /// Absolute expiry derived from the lifetime constraint.
    expires_at: Option<Instant>,
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("blob", &self.blob)
            .field("comment", &self.private_key.comment())
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Salted MAC of the lock passphrase.  The passphrase itself is never kept.
struct LockTag {
    salt: [u8; 16],
    tag: Zeroizing<Vec<u8>>,
}

impl LockTag {
    fn new(passphrase: &[u8]) -> Result<Self, BackendError> {
        let salt: [u8; 16] = rand::random();
        let tag = Zeroizing::new(mac(&salt, passphrase)?.finalize().into_bytes().to_vec());
        Ok(Self { salt, tag })
    }

    /// Constant-time comparison against the stored tag.
    fn matches(&self, passphrase: &[u8]) -> Result<bool, BackendError> {
        Ok(mac(&self.salt, passphrase)?.verify_slice(&self.tag).is_ok())
    }
}

fn mac(salt: &[u8], passphrase: &[u8]) -> Result<HmacSha256, BackendError> {
    let mut mac = HmacSha256::new_from_slice(salt)
        .map_err(|e| BackendError::Other(anyhow::anyhow!("lock mac init: {e}")))?;
    mac.update(passphrase);
    Ok(mac)
}

#[derive(Default)]
struct KeyringState {
    /// Insertion order is the order clients see in `list`.
    entries: Vec<KeyEntry>,
    lock: Option<LockTag>,
}

impl KeyringState {
    fn prune_expired(&mut self, now: Instant) {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.expires_at.is_none_or(|deadline| deadline > now));
        let expired = before - self.entries.len();
        if expired > 0 {
            debug!(expired, "keyring: dropped expired keys");
        }
    }

    fn ensure_unlocked(&self) -> Result<(), BackendError> {
        if self.lock.is_some() {
            Err(BackendError::Locked)
        } else {
            Ok(())
        }
    }

    fn find(&self, key: &KeyBlob) -> Option<&KeyEntry> {
        self.entries.iter().find(|e| &e.blob == key)
    }
}

/// In-memory backend supporting every agent operation except
/// confirm-before-use.
///
/// Share it via [`Arc`]; every method takes `&self`.
#[derive(Default)]
pub struct Keyring {
    state: RwLock<KeyringState>,
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (keys, locked) = match self.state.read() {
            Ok(state) => (state.entries.len(), state.lock.is_some()),
            Err(_) => (0, false),
        };
        f.debug_struct("Keyring")
            .field("keys", &keys)
            .field("locked", &locked)
            .finish()
    }
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held, expired ones included until the next access.
    pub fn len(&self) -> usize {
        self.read().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, KeyringState>, BackendError> {
        self.state
            .read()
            .map_err(|_| BackendError::Other(anyhow::anyhow!("keyring lock poisoned")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, KeyringState>, BackendError> {
        self.state
            .write()
            .map_err(|_| BackendError::Other(anyhow::anyhow!("keyring lock poisoned")))
    }

    /// Write access with expired keys already removed.
    fn write_pruned(&self) -> Result<RwLockWriteGuard<'_, KeyringState>, BackendError> {
        let mut state = self.write()?;
        state.prune_expired(Instant::now());
        Ok(state)
    }

    /// Clone the key needed for a signature so signing happens without the
    /// lock held.
    fn signing_key(&self, key: &KeyBlob) -> Result<Arc<PrivateKey>, BackendError> {
        let state = self.write_pruned()?;
        state.ensure_unlocked()?;
        state
            .find(key)
            .map(|e| Arc::clone(&e.private_key))
            .ok_or(BackendError::NotFound)
    }
}

#[async_trait::async_trait]
impl AgentBackend for Keyring {
    fn name(&self) -> &str {
        "keyring"
    }

    async fn list(&self) -> Result<Vec<Identity>, BackendError> {
        let state = self.write_pruned()?;
        if state.lock.is_some() {
            return Ok(Vec::new());
        }
        Ok(state
            .entries
            .iter()
            .map(|e| Identity::new(e.blob.clone(), e.private_key.comment()))
            .collect())
    }

    async fn sign(&self, key: &KeyBlob, data: &[u8]) -> Result<Signature, BackendError> {
        self.sign_with_flags(key, data, SignatureFlags::NONE).await
    }

    fn extended_signer(self: Arc<Self>) -> Option<Arc<dyn ExtendedSigner>> {
        Some(self)
    }

    async fn add(&self, key: AddedKey) -> Result<(), BackendError> {
        if key.constraints.confirm {
            return Err(BackendError::Refused(
                "confirm-before-use constraint is not supported".to_string(),
            ));
        }
        if key.private_key.is_encrypted() {
            return Err(BackendError::InvalidKey("key is encrypted".to_string()));
        }

        let blob = KeyBlob::from_public_key(key.private_key.public_key())?;
        let now = Instant::now();
        let entry = KeyEntry {
            blob,
            expires_at: key.constraints.lifetime.map(|lifetime| now + lifetime),
            private_key: Arc::new(key.private_key),
        };

        let mut state = self.write()?;
        state.prune_expired(now);
        state.ensure_unlocked()?;

        debug!(
            key = ?entry.blob,
            comment = entry.private_key.comment(),
            lifetime = ?key.constraints.lifetime,
            "keyring: adding key"
        );
        match state.entries.iter_mut().find(|e| e.blob == entry.blob) {
            Some(existing) => *existing = entry,
            None => state.entries.push(entry),
        }
        Ok(())
    }

    async fn remove(&self, key: &KeyBlob) -> Result<(), BackendError> {
        let mut state = self.write_pruned()?;
        state.ensure_unlocked()?;

        let before = state.entries.len();
        state.entries.retain(|e| &e.blob != key);
        if state.entries.len() == before {
            return Err(BackendError::NotFound);
        }
        debug!(key = ?key, "keyring: removed key");
        Ok(())
    }

    async fn remove_all(&self) -> Result<(), BackendError> {
        let mut state = self.write()?;
        state.ensure_unlocked()?;
        let removed = state.entries.len();
        state.entries.clear();
        debug!(removed, "keyring: removed all keys");
        Ok(())
    }

    async fn lock(&self, passphrase: &[u8]) -> Result<(), BackendError> {
        let mut state = self.write()?;
        state.ensure_unlocked()?;
        state.lock = Some(LockTag::new(passphrase)?);
        debug!("keyring: locked");
        Ok(())
    }

    async fn unlock(&self, passphrase: &[u8]) -> Result<(), BackendError> {
        let mut state = self.write()?;
        let tag = state.lock.as_ref().ok_or(BackendError::NotLocked)?;
        if !tag.matches(passphrase)? {
            return Err(BackendError::BadPassphrase);
        }
        state.lock = None;
        debug!("keyring: unlocked");
        Ok(())
    }

    async fn signers(&self) -> Result<Vec<KeySigner>, BackendError> {
        let state = self.write_pruned()?;
        state.ensure_unlocked()?;
        Ok(state
            .entries
            .iter()
            .map(|e| KeySigner::new(Arc::clone(&e.private_key)))
            .collect())
    }
}

#[async_trait::async_trait]
impl ExtendedSigner for Keyring {
    async fn sign_with_flags(
        &self,
        key: &KeyBlob,
        data: &[u8],
        flags: SignatureFlags,
    ) -> Result<Signature, BackendError> {
        let private_key = self.signing_key(key)?;
        sign_with_flags(&private_key, data, flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ssh_key::private::{Ed25519Keypair, RsaKeypair};
    use ssh_key::{Algorithm, HashAlg};

    fn ed25519(seed: u8) -> PrivateKey {
        PrivateKey::new(
            Ed25519Keypair::from_seed(&[seed; 32]).into(),
            format!("ed25519-{seed}"),
        )
        .unwrap()
    }

    fn blob_of(key: &PrivateKey) -> KeyBlob {
        KeyBlob::from_public_key(key.public_key()).unwrap()
    }

    #[tokio::test]
    async fn list_preserves_insertion_order() {
        let keyring = Keyring::new();
        for seed in [3, 1, 2] {
            keyring.add(AddedKey::new(ed25519(seed))).await.unwrap();
        }

        let comments: Vec<String> = keyring
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.comment)
            .collect();
        assert_eq!(comments, ["ed25519-3", "ed25519-1", "ed25519-2"]);
    }

    #[tokio::test]
    async fn re_adding_a_key_replaces_it() {
        let keyring = Keyring::new();
        keyring.add(AddedKey::new(ed25519(1))).await.unwrap();
        let mut renamed = ed25519(1);
        renamed.set_comment("renamed");
        keyring.add(AddedKey::new(renamed)).await.unwrap();

        let listed = keyring.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].comment, "renamed");
    }

    #[tokio::test]
    async fn sign_and_verify() {
        let keyring = Keyring::new();
        let key = ed25519(5);
        keyring.add(AddedKey::new(key.clone())).await.unwrap();

        let sig = keyring.sign(&blob_of(&key), b"payload").await.unwrap();
        signature::Verifier::verify(key.public_key(), b"payload", &sig).unwrap();
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let keyring = Keyring::new();
        let err = keyring.sign(&blob_of(&ed25519(9)), b"x").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound));
        let err = keyring.remove(&blob_of(&ed25519(9))).await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound));
    }

    #[tokio::test]
    async fn rsa_signature_follows_flags() {
        let keypair = RsaKeypair::random(&mut ssh_key::rand_core::OsRng, 2048).unwrap();
        let key = PrivateKey::new(keypair.into(), "rsa").unwrap();
        let keyring = Arc::new(Keyring::new());
        keyring.add(AddedKey::new(key.clone())).await.unwrap();
        let blob = blob_of(&key);

        let cases = [
            (SignatureFlags::NONE, None),
            (SignatureFlags::RSA_SHA2_256, Some(HashAlg::Sha256)),
            (SignatureFlags::RSA_SHA2_512, Some(HashAlg::Sha512)),
            (SignatureFlags::from_bits(0x06), Some(HashAlg::Sha512)),
        ];
        for (flags, hash) in cases {
            let sig = keyring.sign_with_flags(&blob, b"data", flags).await.unwrap();
            assert_eq!(sig.algorithm(), Algorithm::Rsa { hash });
            if hash.is_some() {
                signature::Verifier::verify(key.public_key(), b"data", &sig).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn lock_semantics() {
        let keyring = Keyring::new();
        let key = ed25519(1);
        keyring.add(AddedKey::new(key.clone())).await.unwrap();

        assert!(matches!(
            keyring.unlock(b"pw").await,
            Err(BackendError::NotLocked)
        ));

        keyring.lock(b"pw").await.unwrap();
        assert!(keyring.list().await.unwrap().is_empty());
        assert!(matches!(keyring.lock(b"pw").await, Err(BackendError::Locked)));
        assert!(matches!(
            keyring.sign(&blob_of(&key), b"x").await,
            Err(BackendError::Locked)
        ));
        assert!(matches!(
            keyring.add(AddedKey::new(ed25519(2))).await,
            Err(BackendError::Locked)
        ));
        assert!(matches!(keyring.remove_all().await, Err(BackendError::Locked)));
        assert!(matches!(
            keyring.unlock(b"nope").await,
            Err(BackendError::BadPassphrase)
        ));

        keyring.unlock(b"pw").await.unwrap();
        assert_eq!(keyring.list().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lifetime_constraint_expires_key() {
        let keyring = Keyring::new();
        let mut short = AddedKey::new(ed25519(1));
        short.constraints.lifetime = Some(Duration::from_secs(30));
        keyring.add(short).await.unwrap();
        keyring.add(AddedKey::new(ed25519(2))).await.unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(keyring.list().await.unwrap().len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        let listed = keyring.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].comment, "ed25519-2");
        assert_eq!(keyring.len(), 1);
    }

    #[tokio::test]
    async fn confirm_constraint_is_refused() {
        let keyring = Keyring::new();
        let mut added = AddedKey::new(ed25519(1));
        added.constraints.confirm = true;
        assert!(matches!(
            keyring.add(added).await,
            Err(BackendError::Refused(_))
        ));
        assert!(keyring.is_empty());
    }

    #[tokio::test]
    async fn signers_expose_held_keys() {
        let keyring = Keyring::new();
        let key = ed25519(4);
        keyring.add(AddedKey::new(key.clone())).await.unwrap();

        let signers = keyring.signers().await.unwrap();
        assert_eq!(signers.len(), 1);
        assert_eq!(signers[0].identity().unwrap().blob, blob_of(&key));
        let sig = signers[0].sign(b"in-process", SignatureFlags::NONE).unwrap();
        signature::Verifier::verify(key.public_key(), b"in-process", &sig).unwrap();
    }
}
