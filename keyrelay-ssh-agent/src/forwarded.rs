//! Backend that relays every operation to another agent.
//!
//! Used in Hyper-V guest mode: the guest has no keys of its own and forwards
//! to the agent running on the host.  Each call opens a fresh stream through
//! the [`Connector`], so a host restart costs one failed request rather than
//! a dead backend.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use keyrelay_core::config::DEFAULT_MAX_MESSAGE_LEN;
use keyrelay_core::{
    AddedKey, AgentBackend, BackendError, BoxedStream, Connector, ExtendedSigner, Identity,
    KeyBlob, SignatureFlags,
};
use ssh_agent_lib::agent::Session as _;
use ssh_agent_lib::client::Client;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{
    AddIdentity, AddIdentityConstrained, KeyConstraint, Credential as PrivateCredential, RemoveIdentity,
    SignRequest,
};
use ssh_encoding::Encode as _;
use ssh_key::Signature;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;
use zeroize::Zeroizing;

use crate::proto::{
    Request, Response, code, decode_response, encode, from_wire_identity, read_frame, write_frame,
};

/// Stream to the remote agent, in the shape `ssh_agent_lib::client::Client`
/// expects.
struct HostStream(BoxedStream);

impl fmt::Debug for HostStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostStream")
    }
}

impl AsyncRead for HostStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for HostStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.0).poll_shutdown(cx)
    }
}

#[derive(Debug)]
pub struct ForwardedBackend {
    connector: Arc<dyn Connector>,
}

impl ForwardedBackend {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    async fn connect(&self) -> Result<BoxedStream, BackendError> {
        self.connector.connect().await.map_err(|e| {
            debug!(connector = ?self.connector, error = %e, "connect to remote agent failed");
            BackendError::Unavailable(format!("remote agent: {e}"))
        })
    }

    async fn client(&self) -> Result<Client<HostStream>, BackendError> {
        Ok(Client::new(HostStream(self.connect().await?)))
    }

    /// One request, one reply, decoded by hand.  Used where the host may
    /// send bytes the typed client would reject: identity comments that are
    /// not UTF-8, and passphrases that are not either.
    async fn exchange(&self, payload: &[u8]) -> Result<Response, BackendError> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, payload)
            .await
            .map_err(|e| BackendError::Unavailable(format!("remote agent: {e}")))?;
        let reply = read_frame(&mut stream, DEFAULT_MAX_MESSAGE_LEN)
            .await
            .map_err(|e| BackendError::Unavailable(format!("remote agent: {e}")))?
            .ok_or_else(|| BackendError::Unavailable("remote agent hung up".to_string()))?;
        decode_response(&reply)
            .map_err(|e| BackendError::Refused(format!("remote agent sent malformed reply: {e}")))
    }

    async fn lock_or_unlock(&self, kind: u8, passphrase: &[u8]) -> Result<(), BackendError> {
        let mut payload = Zeroizing::new(vec![kind]);
        passphrase
            .encode(&mut *payload)
            .map_err(|e| BackendError::Other(e.into()))?;
        match self.exchange(&payload).await? {
            Response::Success => Ok(()),
            _ => Err(BackendError::Refused("remote agent returned failure".to_string())),
        }
    }
}

/// Transport failures anywhere in the chain mean the host is unreachable;
/// anything else is the host saying no.
fn remote_error(err: AgentError) -> BackendError {
    let root: &(dyn std::error::Error + 'static) = &err;
    let unreachable =
        std::iter::successors(Some(root), |e| e.source()).any(|e| e.is::<io::Error>());
    if unreachable {
        BackendError::Unavailable(format!("remote agent: {err}"))
    } else {
        BackendError::Refused(format!("remote agent: {err}"))
    }
}

#[async_trait::async_trait]
impl AgentBackend for ForwardedBackend {
    fn name(&self) -> &str {
        "forwarded"
    }

    async fn list(&self) -> Result<Vec<Identity>, BackendError> {
        let payload =
            encode(&Request::RequestIdentities).map_err(|e| BackendError::Other(e.into()))?;
        let Response::IdentitiesAnswer(identities) = self.exchange(&payload).await? else {
            return Err(BackendError::Refused("remote agent returned failure".to_string()));
        };
        identities
            .iter()
            .map(|identity| from_wire_identity(identity).map_err(|e| BackendError::Other(e.into())))
            .collect()
    }

    async fn sign(&self, key: &KeyBlob, data: &[u8]) -> Result<Signature, BackendError> {
        self.sign_with_flags(key, data, SignatureFlags::NONE).await
    }

    fn extended_signer(self: Arc<Self>) -> Option<Arc<dyn ExtendedSigner>> {
        Some(self)
    }

    async fn add(&self, key: AddedKey) -> Result<(), BackendError> {
        if key.constraints.confirm {
            return Err(BackendError::Refused("confirmation is not supported".to_string()));
        }
        let lifetime = key.constraints.lifetime;
        let identity = AddIdentity {
            credential: PrivateCredential::Key {
                privkey: key.private_key.key_data().clone(),
                comment: key.private_key.comment().to_string(),
            },
        };

        let mut client = self.client().await?;
        let result = match lifetime {
            None => client.add_identity(identity).await,
            Some(lifetime) => {
                let seconds = u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX);
                client
                    .add_identity_constrained(AddIdentityConstrained {
                        identity,
                        constraints: vec![KeyConstraint::Lifetime(seconds)],
                    })
                    .await
            }
        };
        result.map_err(remote_error)
    }

    async fn remove(&self, key: &KeyBlob) -> Result<(), BackendError> {
        let pubkey = key
            .key_data()
            .map_err(|e| BackendError::InvalidKey(e.to_string()))?;
        self.client()
            .await?
            .remove_identity(RemoveIdentity { pubkey })
            .await
            .map_err(remote_error)
    }

    async fn remove_all(&self) -> Result<(), BackendError> {
        self.client()
            .await?
            .remove_all_identities()
            .await
            .map_err(remote_error)
    }

    async fn lock(&self, passphrase: &[u8]) -> Result<(), BackendError> {
        self.lock_or_unlock(code::LOCK, passphrase).await
    }

    async fn unlock(&self, passphrase: &[u8]) -> Result<(), BackendError> {
        self.lock_or_unlock(code::UNLOCK, passphrase).await
    }
}

#[async_trait::async_trait]
impl ExtendedSigner for ForwardedBackend {
    async fn sign_with_flags(
        &self,
        key: &KeyBlob,
        data: &[u8],
        flags: SignatureFlags,
    ) -> Result<Signature, BackendError> {
        let pubkey = key
            .key_data()
            .map_err(|e| BackendError::InvalidKey(e.to_string()))?;
        self.client()
            .await?
            .sign(SignRequest {
                pubkey,
                data: data.to_vec(),
                flags: flags.bits(),
            })
            .await
            .map_err(remote_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use keyrelay_core::Multiplexer;
    use ssh_encoding::Encode as _;
    use ssh_key::PrivateKey;
    use ssh_key::private::Ed25519Keypair;

    use crate::keyring::Keyring;
    use crate::session::AgentSession;

    /// Connects to an in-process agent over a fresh duplex pipe per call.
    #[derive(Debug)]
    struct InProcessConnector {
        session: AgentSession,
        connects: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Connector for InProcessConnector {
        async fn connect(&self) -> std::io::Result<BoxedStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (client, mut server) = tokio::io::duplex(16 * 1024);
            let session = self.session.clone();
            tokio::spawn(async move {
                let _ = session.run(&mut server).await;
            });
            Ok(Box::new(client))
        }
    }

    #[derive(Debug)]
    struct RefusingConnector;

    #[async_trait::async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self) -> std::io::Result<BoxedStream> {
            Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
        }
    }

    /// Answers every request with one canned reply payload.
    #[derive(Debug)]
    struct CannedConnector(Vec<u8>);

    #[async_trait::async_trait]
    impl Connector for CannedConnector {
        async fn connect(&self) -> std::io::Result<BoxedStream> {
            let (client, mut server) = tokio::io::duplex(16 * 1024);
            let reply = self.0.clone();
            tokio::spawn(async move {
                if let Ok(Some(_)) = read_frame(&mut server, 1 << 16).await {
                    let _ = write_frame(&mut server, &reply).await;
                }
            });
            Ok(Box::new(client))
        }
    }

    fn remote() -> Arc<InProcessConnector> {
        let agent = Arc::new(Multiplexer::new(Arc::new(Keyring::new())));
        Arc::new(InProcessConnector {
            session: AgentSession::new(agent),
            connects: AtomicUsize::new(0),
        })
    }

    fn host_key() -> PrivateKey {
        PrivateKey::new(Ed25519Keypair::from_seed(&[6u8; 32]).into(), "host-key").unwrap()
    }

    #[tokio::test]
    async fn round_trip_through_remote_session() {
        let connector = remote();
        let backend = Arc::new(ForwardedBackend::new(connector.clone()));
        let key = host_key();

        backend.add(AddedKey::new(key.clone())).await.unwrap();
        let listed = backend.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].comment, "host-key");

        let sig = backend.sign(&listed[0].blob, b"guest challenge").await.unwrap();
        signature::Verifier::verify(key.public_key(), b"guest challenge", &sig).unwrap();

        backend.remove(&listed[0].blob).await.unwrap();
        assert!(backend.list().await.unwrap().is_empty());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn lifetime_and_lock_reach_the_host() {
        let backend = ForwardedBackend::new(remote());
        let mut added = AddedKey::new(host_key());
        added.constraints.lifetime = Some(Duration::from_secs(600));
        backend.add(added).await.unwrap();

        backend.lock(&[0xde, 0xad]).await.unwrap();
        assert!(backend.list().await.unwrap().is_empty());
        assert!(matches!(
            backend.unlock(b"nope").await,
            Err(BackendError::Refused(_))
        ));
        backend.unlock(&[0xde, 0xad]).await.unwrap();
        assert_eq!(backend.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn host_comments_that_are_not_utf8_are_kept_lossily() {
        let blob = encode(host_key().public_key().key_data()).unwrap();
        let mut answer = vec![code::IDENTITIES_ANSWER];
        1u32.encode(&mut answer).unwrap();
        blob.encode(&mut answer).unwrap();
        [b'w', 0xff].as_slice().encode(&mut answer).unwrap();

        let backend = ForwardedBackend::new(Arc::new(CannedConnector(answer)));
        let listed = backend.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].comment, "w\u{fffd}");
        assert_eq!(listed[0].blob.as_bytes(), blob.as_slice());
    }

    #[tokio::test]
    async fn remote_failure_is_refused() {
        let backend = ForwardedBackend::new(remote());
        let err = backend
            .remove(&KeyBlob::from_public_key(host_key().public_key()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Refused(_)));
    }

    #[tokio::test]
    async fn connect_failure_is_unavailable() {
        let backend = ForwardedBackend::new(Arc::new(RefusingConnector));
        assert!(matches!(
            backend.list().await,
            Err(BackendError::Unavailable(_))
        ));
    }
}
