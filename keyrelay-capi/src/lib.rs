//! Signing backend over the operating system's certificate store.
//!
//! On Windows, certificates in the current user's `MY` store that carry a
//! CNG private key (software keys, smart cards, TPM-backed keys) are offered
//! as SSH identities.  Keys never leave the provider: signing hashes the
//! challenge locally and asks CNG for the signature.  The store is read-only
//! from the agent's point of view, so only listing and signing are supported.
//!
//! On other hosts [`CapiBackend::open`] reports the backend as unavailable.

use std::sync::Arc;

use async_trait::async_trait;
use keyrelay_core::{
    AgentBackend, BackendError, ExtendedSigner, Identity, KeyBlob, SignatureFlags,
};
use ssh_key::Signature;
use tracing::debug;

#[cfg_attr(not(windows), allow(dead_code))]
mod convert;
#[cfg(windows)]
mod store;

#[derive(Debug)]
pub struct CapiBackend {
    _private: (),
}

impl CapiBackend {
    /// Check that the certificate store can be opened.
    pub fn open() -> Result<Self, BackendError> {
        imp::check_available()?;
        debug!("certificate store available");
        Ok(Self { _private: () })
    }
}

async fn blocking<T, F>(f: F) -> Result<T, BackendError>
where
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
    T: Send + 'static,
{
    // Provider calls may block on a PIN prompt or a smart card.
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::Other(e.into()))?
}

#[async_trait]
impl AgentBackend for CapiBackend {
    fn name(&self) -> &str {
        "capi"
    }

    async fn list(&self) -> Result<Vec<Identity>, BackendError> {
        blocking(imp::list).await
    }

    async fn sign(&self, key: &KeyBlob, data: &[u8]) -> Result<Signature, BackendError> {
        self.sign_with_flags(key, data, SignatureFlags::NONE).await
    }

    fn extended_signer(self: Arc<Self>) -> Option<Arc<dyn ExtendedSigner>> {
        Some(self)
    }
}

#[async_trait]
impl ExtendedSigner for CapiBackend {
    async fn sign_with_flags(
        &self,
        key: &KeyBlob,
        data: &[u8],
        flags: SignatureFlags,
    ) -> Result<Signature, BackendError> {
        let key = key.clone();
        let data = data.to_vec();
        blocking(move || imp::sign(&key, &data, flags)).await
    }
}

#[cfg(windows)]
use store as imp;

#[cfg(not(windows))]
mod imp {
    use keyrelay_core::{BackendError, Identity, KeyBlob, SignatureFlags};
    use ssh_key::Signature;

    fn unavailable() -> BackendError {
        BackendError::Unavailable("certificate store requires Windows".into())
    }

    pub(crate) fn check_available() -> Result<(), BackendError> {
        Err(unavailable())
    }

    pub(crate) fn list() -> Result<Vec<Identity>, BackendError> {
        Err(unavailable())
    }

    pub(crate) fn sign(
        _blob: &KeyBlob,
        _data: &[u8],
        _flags: SignatureFlags,
    ) -> Result<Signature, BackendError> {
        Err(unavailable())
    }
}
