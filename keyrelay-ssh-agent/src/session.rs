//! Per-connection agent protocol session.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use keyrelay_core::config::DEFAULT_MAX_MESSAGE_LEN;
use keyrelay_core::{AddedKey, BackendError, KeyBlob, KeyConstraints, Multiplexer, SignatureFlags};
use ssh_agent_lib::agent::Session;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{
    AddIdentity, AddIdentityConstrained, Extension, Identity as WireIdentity, KeyConstraint,
    Credential as PrivateCredential, RemoveIdentity, SignRequest,
};
use ssh_encoding::Decode as _;
use ssh_key::{PrivateKey, Signature};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use zeroize::Zeroizing;

use crate::proto::{
    ProtoError, Request, Response, code, decode_request, encode, read_frame, to_wire_identity,
    write_frame,
};

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u32, max: u32 },
    #[error("zero-length frame")]
    EmptyFrame,
    #[error("malformed request: {0}")]
    Decode(#[from] ProtoError),
    #[error("wire encoding: {0}")]
    Encoding(#[from] ssh_encoding::Error),
}

/// Serves agent requests from one client against the shared multiplexer.
///
/// Requests are handled strictly in order: the next frame is not read until
/// the reply to the previous one has been flushed.
#[derive(Debug, Clone)]
pub struct AgentSession {
    agent: Arc<Multiplexer>,
    max_message_len: u32,
}

impl AgentSession {
    pub fn new(agent: Arc<Multiplexer>) -> Self {
        Self {
            agent,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }

    pub fn with_max_message_len(mut self, max_message_len: u32) -> Self {
        self.max_message_len = max_message_len;
        self
    }

    /// Serve until the client disconnects.
    ///
    /// A clean close between frames returns `Ok(())`.  Framing and decode
    /// failures end the session with an error; unknown message types and
    /// backend failures are answered with `SSH_AGENT_FAILURE` and the session
    /// continues.
    pub async fn run<S>(&self, stream: &mut S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let mut session = self.clone();
        loop {
            let Some(payload) = read_frame(stream, self.max_message_len).await? else {
                debug!("agent client disconnected");
                return Ok(());
            };

            let reply = session.reply(&payload).await?;
            write_frame(stream, &encode(&reply)?).await?;
        }
    }

    async fn reply(&mut self, payload: &[u8]) -> Result<Response, SessionError> {
        // Passphrases are raw bytes; they never pass through a `String`.
        match payload[0] {
            code::LOCK | code::UNLOCK => return self.lock_or_unlock(payload).await,
            _ => {}
        }

        let request = match decode_request(payload) {
            Ok(request) => request,
            Err(ProtoError::UnsupportedCommand { .. }) => {
                debug!(kind = payload[0], "unsupported message type");
                return Ok(Response::Failure);
            }
            Err(e) => return Err(e.into()),
        };

        if let Request::Extension(extension) = request {
            return Ok(self.extension_reply(extension).await);
        }

        Ok(match self.handle(request).await {
            Ok(response) => response,
            Err(_) => Response::Failure,
        })
    }

    async fn lock_or_unlock(&self, payload: &[u8]) -> Result<Response, SessionError> {
        let passphrase = Zeroizing::new(Vec::<u8>::decode(&mut &payload[1..])?);
        let (op, result) = if payload[0] == code::LOCK {
            ("lock", self.agent.lock(&passphrase).await)
        } else {
            ("unlock", self.agent.unlock(&passphrase).await)
        };
        Ok(match result {
            Ok(()) => Response::Success,
            Err(e) => {
                debug!(op, error = %e, "request failed");
                Response::Failure
            }
        })
    }

    async fn extension_reply(&self, extension: Extension) -> Response {
        let name = extension.name;
        let details = match encode(&extension.details) {
            Ok(details) => details,
            Err(_) => return Response::ExtensionFailure,
        };
        match self.agent.extension(&name, &details).await {
            Ok(reply) => Response::ExtensionResponse(Extension {
                name,
                details: reply.into(),
            }),
            Err(BackendError::UnsupportedExtension(_)) => {
                debug!(extension = %name, "unsupported extension");
                Response::Failure
            }
            Err(e) => {
                debug!(extension = %name, error = %e, "extension failed");
                Response::ExtensionFailure
            }
        }
    }

    async fn add(
        &self,
        credential: PrivateCredential,
        constraints: KeyConstraints,
    ) -> Result<(), AgentError> {
        let PrivateCredential::Key { privkey, comment } = credential else {
            return Err(failed("add_identity", BackendError::NotSupported));
        };
        let private_key = PrivateKey::new(privkey, comment)
            .map_err(|e| failed("add_identity", BackendError::InvalidKey(e.to_string())))?;

        let key = AddedKey {
            private_key,
            constraints,
        };
        debug!(comment = key.comment(), constraints = ?key.constraints, "add_identity");
        self.agent
            .add(key)
            .await
            .map_err(|e| failed("add_identity", e))
    }
}

fn key_blob(op: &str, key: &ssh_key::public::KeyData) -> Result<KeyBlob, AgentError> {
    KeyBlob::from_key_data(key).map_err(|e| failed(op, e))
}

fn failed(op: &str, err: BackendError) -> AgentError {
    debug!(op, error = %err, "request failed");
    AgentError::other(io::Error::other(err.to_string()))
}

#[ssh_agent_lib::async_trait]
impl Session for AgentSession {
    async fn request_identities(&mut self) -> Result<Vec<WireIdentity>, AgentError> {
        let identities = self
            .agent
            .list()
            .await
            .map_err(|e| failed("request_identities", e))?;

        let wire: Vec<WireIdentity> = identities
            .iter()
            .filter_map(|identity| match to_wire_identity(identity) {
                Ok(wire) => Some(wire),
                Err(e) => {
                    debug!(key = ?identity.blob, error = %e, "skipping unparseable key");
                    None
                }
            })
            .collect();
        debug!(count = wire.len(), "request_identities");
        Ok(wire)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        let key = key_blob("sign", &request.pubkey)?;
        debug!(
            key = ?key,
            data_len = request.data.len(),
            flags = request.flags,
            "sign"
        );
        self.agent
            .sign(&key, &request.data, SignatureFlags::from_bits(request.flags))
            .await
            .map_err(|e| failed("sign", e))
    }

    async fn add_identity(&mut self, identity: AddIdentity) -> Result<(), AgentError> {
        self.add(identity.credential, KeyConstraints::default()).await
    }

    async fn add_identity_constrained(
        &mut self,
        identity: AddIdentityConstrained,
    ) -> Result<(), AgentError> {
        let mut constraints = KeyConstraints::default();
        for constraint in identity.constraints {
            match constraint {
                KeyConstraint::Lifetime(seconds) => {
                    constraints.lifetime = Some(Duration::from_secs(u64::from(seconds)));
                }
                KeyConstraint::Confirm => {
                    return Err(failed(
                        "add_identity",
                        BackendError::Refused("confirmation is not supported".to_string()),
                    ));
                }
                other => {
                    return Err(failed(
                        "add_identity",
                        BackendError::Refused(format!("unsupported constraint {other:?}")),
                    ));
                }
            }
        }
        self.add(identity.identity.credential, constraints).await
    }

    async fn remove_identity(&mut self, identity: RemoveIdentity) -> Result<(), AgentError> {
        let key = key_blob("remove_identity", &identity.pubkey)?;
        debug!(key = ?key, "remove_identity");
        self.agent
            .remove(&key)
            .await
            .map_err(|e| failed("remove_identity", e))
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        self.agent
            .remove_all()
            .await
            .map_err(|e| failed("remove_all_identities", e))
    }
}
