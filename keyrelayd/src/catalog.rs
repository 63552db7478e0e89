//! A key list model for front ends: one row per identity the agent offers,
//! plus adding key files and removing listed keys.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use keyrelay_core::{BackendError, Identity, KeyBlob, Multiplexer};
use keyrelay_ssh_agent::{KeyFileError, load_key_file};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRow {
    pub algorithm: String,
    pub bits: Option<u32>,
    pub fingerprint: String,
    pub comment: String,
    blob: KeyBlob,
}

impl From<Identity> for KeyRow {
    fn from(identity: Identity) -> Self {
        Self {
            algorithm: identity.algorithm().unwrap_or_else(|| "unknown".to_string()),
            bits: identity.bit_length(),
            fingerprint: identity.fingerprint(),
            comment: identity.comment,
            blob: identity.blob,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("cannot load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: KeyFileError,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("no key at row {0}")]
    NoSuchRow(usize),
}

#[derive(Debug)]
pub struct KeyCatalog {
    agent: Arc<Multiplexer>,
    rows: Mutex<Vec<KeyRow>>,
}

impl KeyCatalog {
    pub fn new(agent: Arc<Multiplexer>) -> Self {
        Self {
            agent,
            rows: Mutex::new(Vec::new()),
        }
    }

    /// Refresh the listing from the agent.
    pub async fn list(&self) -> Result<Vec<KeyRow>, CatalogError> {
        let rows: Vec<KeyRow> = self
            .agent
            .list()
            .await?
            .into_iter()
            .map(KeyRow::from)
            .collect();
        *self.rows.lock().unwrap_or_else(PoisonError::into_inner) = rows.clone();
        Ok(rows)
    }

    /// Load a key file into the agent and return the refreshed listing.
    pub async fn add_item(&self, path: &Path) -> Result<Vec<KeyRow>, CatalogError> {
        let key = load_key_file(path).map_err(|source| CatalogError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        self.agent.add(key).await?;
        self.list().await
    }

    /// Remove the key shown at `index` in the last listing.
    pub async fn remove_item(&self, index: usize) -> Result<(), CatalogError> {
        let blob = self
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .map(|row| row.blob.clone())
            .ok_or(CatalogError::NoSuchRow(index))?;
        self.agent.remove(&blob).await?;

        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        if rows.get(index).is_some_and(|row| row.blob == blob) {
            rows.remove(index);
        }
        Ok(())
    }
}

/// Load each key file into the agent, skipping files that cannot be used.
/// Returns how many keys were added.
pub async fn preload(agent: &Multiplexer, paths: &[PathBuf]) -> usize {
    let mut loaded = 0;
    for path in paths {
        let key = match load_key_file(path) {
            Ok(key) => key,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping key file");
                continue;
            }
        };
        match agent.add(key).await {
            Ok(()) => loaded += 1,
            Err(e) => debug!(path = %path.display(), error = %e, "key rejected by agent"),
        }
    }
    loaded
}
