//! Framing for the agent protocol, plus glue to `ssh-agent-lib`'s message
//! types.
//!
//! Every message travels as `u32` big-endian length followed by the payload;
//! the first payload byte is the message type.  Payloads are decoded and
//! encoded with [`ssh_agent_lib::proto`]; the framing lives here so sessions
//! can apply their own size limit and answer one request at a time.
//!
//! Key comments are free-form bytes on the wire.  A comment that is not
//! UTF-8 is rewritten lossily before decoding instead of failing the whole
//! message.

use keyrelay_core::{Identity, KeyBlob};
use ssh_agent_lib::proto::Identity as WireIdentity;
pub use ssh_agent_lib::proto::{ProtoError, Request, Response};
use ssh_encoding::{Decode, Encode};
use ssh_key::PublicKey;
use ssh_key::private::KeypairData;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use zeroize::Zeroizing;

use crate::session::SessionError;

/// Message type codes.
pub mod code {
    pub const FAILURE: u8 = 5;
    pub const SUCCESS: u8 = 6;
    pub const REQUEST_IDENTITIES: u8 = 11;
    pub const IDENTITIES_ANSWER: u8 = 12;
    pub const SIGN_REQUEST: u8 = 13;
    pub const SIGN_RESPONSE: u8 = 14;
    pub const ADD_IDENTITY: u8 = 17;
    pub const REMOVE_IDENTITY: u8 = 18;
    pub const ADD_SMARTCARD_KEY: u8 = 20;
    pub const LOCK: u8 = 22;
    pub const UNLOCK: u8 = 23;
    pub const ADD_ID_CONSTRAINED: u8 = 25;
    pub const EXTENSION: u8 = 27;
    pub const EXTENSION_FAILURE: u8 = 28;
}

pub fn decode_request(payload: &[u8]) -> Result<Request, ProtoError> {
    Request::decode(&mut &payload[..]).or_else(|err| match add_with_lossy_comment(payload) {
        Some(repaired) => Request::decode(&mut repaired.as_slice()).map_err(|_| err),
        None => Err(err),
    })
}

pub fn decode_response(payload: &[u8]) -> Result<Response, ProtoError> {
    Response::decode(&mut &payload[..]).or_else(|err| {
        match identities_with_lossy_comments(payload) {
            Some(repaired) => Response::decode(&mut repaired.as_slice()).map_err(|_| err),
            None => Err(err),
        }
    })
}

pub fn encode(message: &impl Encode) -> Result<Vec<u8>, ssh_encoding::Error> {
    let mut out = Vec::new();
    message.encode(&mut out)?;
    Ok(out)
}

/// Copy of an add request whose comment is replaced by its lossy UTF-8
/// form, or `None` when the comment is not what made decoding fail.
fn add_with_lossy_comment(payload: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
    let (&kind, body) = payload.split_first()?;
    if kind != code::ADD_IDENTITY && kind != code::ADD_ID_CONSTRAINED {
        return None;
    }

    let mut reader = body;
    KeypairData::decode(&mut reader).ok()?;
    let key_len = body.len() - reader.len();
    let comment = Vec::<u8>::decode(&mut reader).ok()?;
    if std::str::from_utf8(&comment).is_ok() {
        return None;
    }

    let mut repaired = Zeroizing::new(Vec::with_capacity(payload.len() + 8));
    repaired.push(kind);
    repaired.extend_from_slice(&body[..key_len]);
    String::from_utf8_lossy(&comment)
        .into_owned()
        .encode(&mut *repaired)
        .ok()?;
    repaired.extend_from_slice(reader);
    Some(repaired)
}

fn identities_with_lossy_comments(payload: &[u8]) -> Option<Vec<u8>> {
    let (&kind, mut reader) = payload.split_first()?;
    if kind != code::IDENTITIES_ANSWER {
        return None;
    }

    let count = u32::decode(&mut reader).ok()?;
    let mut repaired = vec![kind];
    count.encode(&mut repaired).ok()?;
    for _ in 0..count {
        let blob = Vec::<u8>::decode(&mut reader).ok()?;
        let comment = Vec::<u8>::decode(&mut reader).ok()?;
        blob.encode(&mut repaired).ok()?;
        String::from_utf8_lossy(&comment)
            .into_owned()
            .encode(&mut repaired)
            .ok()?;
    }
    Some(repaired)
}

pub fn to_wire_identity(identity: &Identity) -> Result<WireIdentity, ssh_key::Error> {
    Ok(WireIdentity {
        pubkey: PublicKey::from(identity.blob.key_data()?).into(),
        comment: identity.comment.clone(),
    })
}

pub fn from_wire_identity(identity: &WireIdentity) -> Result<Identity, ssh_encoding::Error> {
    let blob = encode(&identity.pubkey)?;
    Ok(Identity::new(KeyBlob::new(blob), identity.comment.clone()))
}

/// Read one frame.  `Ok(None)` means the peer closed the stream cleanly
/// before sending a length prefix.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Option<Vec<u8>>, SessionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix);
    if len == 0 {
        return Err(SessionError::EmptyFrame);
    }
    if len > max_len {
        return Err(SessionError::FrameTooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one frame with a single `write_all`, then flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_agent_lib::proto::{AddIdentity, Credential as PrivateCredential, SignRequest};
    use ssh_key::PrivateKey;
    use ssh_key::private::Ed25519Keypair;

    fn test_key() -> PrivateKey {
        PrivateKey::new(Ed25519Keypair::from_seed(&[9u8; 32]).into(), "proto@test").unwrap()
    }

    fn raw_add(key: &PrivateKey, comment: &[u8]) -> Vec<u8> {
        let mut payload = vec![code::ADD_IDENTITY];
        key.key_data().encode(&mut payload).unwrap();
        comment.encode(&mut payload).unwrap();
        payload
    }

    #[test]
    fn sign_request_decodes_through_the_codec() {
        let key = test_key();
        let request = Request::SignRequest(SignRequest {
            pubkey: key.public_key().key_data().clone(),
            data: b"session-id".to_vec(),
            flags: 2,
        });
        let payload = encode(&request).unwrap();
        assert_eq!(payload[0], code::SIGN_REQUEST);

        match decode_request(&payload).unwrap() {
            Request::SignRequest(sign) => {
                assert_eq!(&sign.pubkey, key.public_key().key_data());
                assert_eq!(sign.data, b"session-id");
                assert_eq!(sign.flags, 2);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn non_utf8_add_comment_is_replaced() {
        let key = test_key();
        let payload = raw_add(&key, &[b'k', 0xff, b'y']);

        match decode_request(&payload).unwrap() {
            Request::AddIdentity(AddIdentity {
                credential: PrivateCredential::Key { privkey, comment },
            }) => {
                assert_eq!(comment, "k\u{fffd}y");
                assert_eq!(&privkey, key.key_data());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn truncated_add_is_still_an_error() {
        let key = test_key();
        let mut payload = raw_add(&key, b"ok");
        payload.truncate(payload.len() - 1);
        assert!(decode_request(&payload).is_err());
    }

    #[test]
    fn unknown_code_is_unsupported_command() {
        assert!(matches!(
            decode_request(&[200]),
            Err(ProtoError::UnsupportedCommand { .. })
        ));
    }

    #[test]
    fn non_utf8_identity_comment_is_replaced() {
        let blob = encode(test_key().public_key().key_data()).unwrap();
        let mut payload = vec![code::IDENTITIES_ANSWER];
        1u32.encode(&mut payload).unwrap();
        blob.encode(&mut payload).unwrap();
        [b'h', 0xc3].as_slice().encode(&mut payload).unwrap();

        let Response::IdentitiesAnswer(identities) = decode_response(&payload).unwrap() else {
            panic!("not an identities answer");
        };
        let identity = from_wire_identity(&identities[0]).unwrap();
        assert_eq!(identity.comment, "h\u{fffd}");
        assert_eq!(identity.blob.as_bytes(), blob.as_slice());
    }

    #[test]
    fn wire_identity_keeps_the_key_blob() {
        let blob = KeyBlob::from_public_key(test_key().public_key()).unwrap();
        let identity = Identity::new(blob.clone(), "c");
        let wire = to_wire_identity(&identity).unwrap();
        assert_eq!(from_wire_identity(&wire).unwrap(), identity);

        let payload = encode(&Response::IdentitiesAnswer(vec![wire])).unwrap();
        let mut expected = vec![code::IDENTITIES_ANSWER, 0, 0, 0, 1];
        blob.as_bytes().encode(&mut expected).unwrap();
        "c".encode(&mut expected).unwrap();
        assert_eq!(payload, expected);
    }

    #[tokio::test]
    async fn read_frame_clean_eof_is_none() {
        let mut input: &[u8] = &[];
        assert!(read_frame(&mut input, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_frame_short_prefix_is_error() {
        let mut input: &[u8] = &[0, 0];
        assert!(matches!(
            read_frame(&mut input, 1024).await,
            Err(SessionError::Io(_))
        ));
    }

    #[tokio::test]
    async fn read_frame_rejects_zero_and_oversized_lengths() {
        let mut zero: &[u8] = &[0, 0, 0, 0];
        assert!(matches!(
            read_frame(&mut zero, 1024).await,
            Err(SessionError::EmptyFrame)
        ));

        let mut big: &[u8] = &[0, 0, 4, 1, 11];
        assert!(matches!(
            read_frame(&mut big, 1024).await,
            Err(SessionError::FrameTooLarge { len: 1025, max: 1024 })
        ));
    }
}
