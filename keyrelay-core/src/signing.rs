//! Flag-aware signing over in-memory private keys.
//!
//! RSA is the only algorithm whose signature hash is negotiable: clients ask
//! for `rsa-sha2-512` / `rsa-sha2-256` through [`SignatureFlags`], and the
//! legacy `ssh-rsa` (SHA-1) form is used when neither flag is set.  Every
//! other key type has exactly one signature algorithm and ignores the flags.

use rsa::BigUint;
use rsa::pkcs1v15::SigningKey;
use signature::{SignatureEncoding as _, Signer as _};
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::{Algorithm, HashAlg, Mpint, PrivateKey, Signature};

use crate::{BackendError, SignatureFlags};

pub fn sign_with_flags(
    key: &PrivateKey,
    data: &[u8],
    flags: SignatureFlags,
) -> Result<Signature, BackendError> {
    match key.key_data() {
        KeypairData::Rsa(keypair) => sign_rsa(keypair, data, flags),
        _ => key
            .try_sign(data)
            .map_err(|e| BackendError::Refused(format!("signing failed: {e}"))),
    }
}

/// Convert an SSH RSA keypair into an `rsa` private key.
///
/// Built from `n`, `e`, `d` and both primes; ssh-key's own `TryFrom` passes
/// `p` twice, which `rsa` rejects.
pub fn rsa_private_key(keypair: &RsaKeypair) -> Result<rsa::RsaPrivateKey, BackendError> {
    rsa::RsaPrivateKey::from_components(
        biguint(&keypair.public.n)?,
        biguint(&keypair.public.e)?,
        biguint(&keypair.private.d)?,
        vec![biguint(&keypair.private.p)?, biguint(&keypair.private.q)?],
    )
    .map_err(|e| BackendError::InvalidKey(format!("rsa key: {e}")))
}

fn biguint(value: &Mpint) -> Result<BigUint, BackendError> {
    value
        .as_positive_bytes()
        .map(BigUint::from_bytes_be)
        .ok_or_else(|| BackendError::InvalidKey("rsa key: negative component".to_string()))
}

fn sign_rsa(
    keypair: &RsaKeypair,
    data: &[u8],
    flags: SignatureFlags,
) -> Result<Signature, BackendError> {
    let private = rsa_private_key(keypair)?;

    let (hash, raw) = if flags.contains(SignatureFlags::RSA_SHA2_512) {
        let raw = SigningKey::<sha2::Sha512>::new(private)
            .try_sign(data)
            .map_err(refused)?;
        (Some(HashAlg::Sha512), raw.to_vec())
    } else if flags.contains(SignatureFlags::RSA_SHA2_256) {
        let raw = SigningKey::<sha2::Sha256>::new(private)
            .try_sign(data)
            .map_err(refused)?;
        (Some(HashAlg::Sha256), raw.to_vec())
    } else {
        let raw = SigningKey::<sha1::Sha1>::new(private)
            .try_sign(data)
            .map_err(refused)?;
        (None, raw.to_vec())
    };

    Signature::new(Algorithm::Rsa { hash }, raw)
        .map_err(|e| BackendError::Refused(format!("encode rsa signature: {e}")))
}

fn refused(err: signature::Error) -> BackendError {
    BackendError::Refused(format!("rsa signing failed: {err}"))
}
