//! Ordered composition of several backends into one logical agent.
//!
//! The multiplexer keeps the primary backend separate from the auxiliary
//! ones so the positional contract lives in the type: mutations without a
//! natural multi-backend meaning (`add`, `lock`, `unlock`, `signers`) only
//! ever reach the primary, while reads and removals walk every backend in
//! order, primary first.

use std::sync::Arc;

use ssh_key::Signature;
use tracing::debug;

use crate::{
    AddedKey, AgentBackend, BackendError, ExtendedSigner, Identity, KeyBlob, KeySigner,
    SignatureFlags,
};

/// A backend plus its flag-aware signer, resolved once at construction.
#[derive(Clone)]
struct Slot {
    backend: Arc<dyn AgentBackend>,
    extended: Option<Arc<dyn ExtendedSigner>>,
}

impl Slot {
    fn new(backend: Arc<dyn AgentBackend>) -> Self {
        let extended = Arc::clone(&backend).extended_signer();
        Self { backend, extended }
    }

    async fn sign(
        &self,
        key: &KeyBlob,
        data: &[u8],
        flags: SignatureFlags,
    ) -> Result<Signature, BackendError> {
        match &self.extended {
            Some(signer) => signer.sign_with_flags(key, data, flags).await,
            None => self.backend.sign(key, data).await,
        }
    }
}

pub struct Multiplexer {
    primary: Slot,
    auxiliary: Vec<Slot>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.slots().map(|s| s.backend.name()).collect();
        f.debug_struct("Multiplexer")
            .field("backends", &names)
            .finish()
    }
}

impl Multiplexer {
    pub fn new(primary: Arc<dyn AgentBackend>) -> Self {
        Self::with_auxiliary(primary, Vec::new())
    }

    pub fn with_auxiliary(
        primary: Arc<dyn AgentBackend>,
        auxiliary: Vec<Arc<dyn AgentBackend>>,
    ) -> Self {
        Self {
            primary: Slot::new(primary),
            auxiliary: auxiliary.into_iter().map(Slot::new).collect(),
        }
    }

    pub fn primary(&self) -> &Arc<dyn AgentBackend> {
        &self.primary.backend
    }

    /// Number of backends, primary included.
    pub fn len(&self) -> usize {
        1 + self.auxiliary.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn slots(&self) -> impl Iterator<Item = &Slot> {
        std::iter::once(&self.primary).chain(self.auxiliary.iter())
    }

    /// Concatenate every backend's identities; any failure fails the whole
    /// listing so callers never see a partial key set.
    pub async fn list(&self) -> Result<Vec<Identity>, BackendError> {
        let mut all = Vec::new();
        for slot in self.slots() {
            let identities = slot.backend.list().await?;
            all.extend(identities);
        }
        Ok(all)
    }

    /// First successful signature wins; otherwise the first failure is
    /// returned.
    pub async fn sign(
        &self,
        key: &KeyBlob,
        data: &[u8],
        flags: SignatureFlags,
    ) -> Result<Signature, BackendError> {
        let mut first_error = None;

        for slot in self.slots() {
            match slot.sign(key, data, flags).await {
                Ok(signature) => return Ok(signature),
                Err(e) => {
                    debug!(backend = slot.backend.name(), error = %e, "sign attempt failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        Err(first_error.unwrap_or(BackendError::NotFound))
    }

    pub async fn add(&self, key: AddedKey) -> Result<(), BackendError> {
        self.primary.backend.add(key).await
    }

    /// Stop at the first backend that removes the key; if none does, return
    /// the last backend's error.
    pub async fn remove(&self, key: &KeyBlob) -> Result<(), BackendError> {
        let mut last_error = BackendError::NotFound;

        for slot in self.slots() {
            match slot.backend.remove(key).await {
                Ok(()) => return Ok(()),
                Err(e) => last_error = e,
            }
        }

        Err(last_error)
    }

    /// Clear every backend, best effort; the first error (if any) is
    /// reported after all backends were asked.
    pub async fn remove_all(&self) -> Result<(), BackendError> {
        let mut errors = Vec::new();

        for slot in self.slots() {
            if let Err(e) = slot.backend.remove_all().await {
                debug!(backend = slot.backend.name(), error = %e, "remove_all failed");
                errors.push(e);
            }
        }

        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn lock(&self, passphrase: &[u8]) -> Result<(), BackendError> {
        self.primary.backend.lock(passphrase).await
    }

    pub async fn unlock(&self, passphrase: &[u8]) -> Result<(), BackendError> {
        self.primary.backend.unlock(passphrase).await
    }

    pub async fn signers(&self) -> Result<Vec<KeySigner>, BackendError> {
        self.primary.backend.signers().await
    }

    /// Extensions are not multiplexed.
    pub async fn extension(&self, name: &str, _payload: &[u8]) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::UnsupportedExtension(name.to_string()))
    }
}
