//! Translation between CNG key and signature formats and SSH encodings.
//!
//! Kept free of FFI so the byte layouts can be checked on any host.

use keyrelay_core::{BackendError, SignatureFlags};
use sha2::Digest as _;
use ssh_encoding::Encode as _;
use ssh_key::public::{EcdsaPublicKey, KeyData, RsaPublicKey};
use ssh_key::{Algorithm, EcdsaCurve, HashAlg, Mpint, Signature};

const BCRYPT_RSAPUBLIC_MAGIC: u32 = 0x3141_5352;
const BCRYPT_ECDSA_PUBLIC_P256_MAGIC: u32 = 0x3153_4345;
const BCRYPT_ECDSA_PUBLIC_P384_MAGIC: u32 = 0x3353_4345;
const BCRYPT_ECDSA_PUBLIC_P521_MAGIC: u32 = 0x3553_4345;

fn invalid(what: &str) -> BackendError {
    BackendError::InvalidKey(format!("malformed CNG {what} blob"))
}

fn read_u32(blob: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = blob.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Parse a `BCRYPT_RSAPUBLIC_BLOB`: a little-endian header of six `u32`s
/// followed by the big-endian exponent and modulus.
pub(crate) fn rsa_public_from_bcrypt(blob: &[u8]) -> Result<KeyData, BackendError> {
    if read_u32(blob, 0) != Some(BCRYPT_RSAPUBLIC_MAGIC) {
        return Err(invalid("RSA"));
    }
    let exp_len = read_u32(blob, 8).ok_or_else(|| invalid("RSA"))? as usize;
    let mod_len = read_u32(blob, 12).ok_or_else(|| invalid("RSA"))? as usize;
    let body = &blob[24.min(blob.len())..];
    let e = body.get(..exp_len).ok_or_else(|| invalid("RSA"))?;
    let n = body
        .get(exp_len..exp_len + mod_len)
        .ok_or_else(|| invalid("RSA"))?;

    let mpint = |bytes: &[u8]| Mpint::from_positive_bytes(bytes).map_err(|_| invalid("RSA"));
    Ok(KeyData::Rsa(RsaPublicKey {
        e: mpint(e)?,
        n: mpint(n)?,
    }))
}

/// Parse a `BCRYPT_ECCPUBLIC_BLOB` for one of the NIST curves.
pub(crate) fn ecdsa_public_from_bcrypt(blob: &[u8]) -> Result<KeyData, BackendError> {
    let magic = read_u32(blob, 0).ok_or_else(|| invalid("ECC"))?;
    let expected_len = match magic {
        BCRYPT_ECDSA_PUBLIC_P256_MAGIC => 32,
        BCRYPT_ECDSA_PUBLIC_P384_MAGIC => 48,
        BCRYPT_ECDSA_PUBLIC_P521_MAGIC => 66,
        _ => return Err(BackendError::InvalidKey(format!("unsupported ECC magic {magic:#x}"))),
    };
    let key_len = read_u32(blob, 4).ok_or_else(|| invalid("ECC"))? as usize;
    if key_len != expected_len {
        return Err(invalid("ECC"));
    }
    let point = blob.get(8..8 + 2 * key_len).ok_or_else(|| invalid("ECC"))?;

    let mut sec1 = Vec::with_capacity(1 + point.len());
    sec1.push(0x04);
    sec1.extend_from_slice(point);
    let key = EcdsaPublicKey::from_sec1_bytes(&sec1).map_err(|_| invalid("ECC"))?;
    Ok(KeyData::Ecdsa(key))
}

/// How a signature over a certificate's key is produced and encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignScheme {
    /// PKCS#1 v1.5; `None` is the legacy SHA-1 `ssh-rsa` form.
    Rsa(Option<HashAlg>),
    Ecdsa(EcdsaCurve),
}

impl SignScheme {
    pub(crate) fn for_key(key: &KeyData, flags: SignatureFlags) -> Result<Self, BackendError> {
        match key {
            KeyData::Rsa(_) if flags.contains(SignatureFlags::RSA_SHA2_512) => {
                Ok(Self::Rsa(Some(HashAlg::Sha512)))
            }
            KeyData::Rsa(_) if flags.contains(SignatureFlags::RSA_SHA2_256) => {
                Ok(Self::Rsa(Some(HashAlg::Sha256)))
            }
            KeyData::Rsa(_) => Ok(Self::Rsa(None)),
            KeyData::Ecdsa(ecdsa) => Ok(Self::Ecdsa(ecdsa.curve())),
            other => Err(BackendError::InvalidKey(format!(
                "unsupported certificate key type {}",
                other.algorithm()
            ))),
        }
    }

    /// The hash the key signs over.
    pub(crate) fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Rsa(None) => sha1::Sha1::digest(data).to_vec(),
            Self::Rsa(Some(HashAlg::Sha256)) | Self::Ecdsa(EcdsaCurve::NistP256) => {
                sha2::Sha256::digest(data).to_vec()
            }
            Self::Ecdsa(EcdsaCurve::NistP384) => sha2::Sha384::digest(data).to_vec(),
            _ => sha2::Sha512::digest(data).to_vec(),
        }
    }

    /// CNG algorithm identifier for the PKCS#1 padding info.
    pub(crate) fn cng_hash_name(self) -> &'static str {
        match self {
            Self::Rsa(None) => "SHA1",
            Self::Rsa(Some(HashAlg::Sha256)) | Self::Ecdsa(EcdsaCurve::NistP256) => "SHA256",
            Self::Ecdsa(EcdsaCurve::NistP384) => "SHA384",
            _ => "SHA512",
        }
    }

    /// Wrap the raw CNG output: PKCS#1 bytes for RSA, `r || s` for ECDSA.
    pub(crate) fn signature(self, raw: Vec<u8>) -> Result<Signature, BackendError> {
        let encode_err = |e: ssh_key::Error| BackendError::Refused(format!("encode signature: {e}"));
        match self {
            Self::Rsa(hash) => Signature::new(Algorithm::Rsa { hash }, raw).map_err(encode_err),
            Self::Ecdsa(curve) => {
                if raw.is_empty() || raw.len() % 2 != 0 {
                    return Err(BackendError::Refused("malformed ECDSA signature".into()));
                }
                let (r, s) = raw.split_at(raw.len() / 2);
                let mut data = Vec::new();
                for part in [r, s] {
                    let mpint = Mpint::from_positive_bytes(part).map_err(encode_err)?;
                    mpint
                        .encode(&mut data)
                        .map_err(|e| BackendError::Refused(format!("encode signature: {e}")))?;
                }
                Signature::new(Algorithm::Ecdsa { curve }, data).map_err(encode_err)
            }
        }
    }
}
