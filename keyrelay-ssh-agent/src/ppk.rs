//! PuTTY private key files (`.ppk`, format versions 2 and 3).
//!
//! Only unencrypted Ed25519, RSA and NIST-P ECDSA files are accepted.  The file MAC is always verified:
//! version 2 uses HMAC-SHA1 keyed with the SHA-1 of a fixed label, version 3
//! uses HMAC-SHA256 with an empty key when there is no passphrase.  Both
//! cover the algorithm, encryption, comment and both blobs, each encoded as
//! an SSH string.

use base64::prelude::{BASE64_STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use signature::Signer as _;
use ssh_encoding::{Decode, Encode};
use ssh_key::private::{Ed25519Keypair, KeypairData, RsaKeypair, RsaPrivateKey};
use ssh_key::public::KeyData;
use ssh_key::{EcdsaCurve, Mpint, PrivateKey};
use zeroize::Zeroizing;

use keyrelay_core::signing::rsa_private_key;

const HEADER_PREFIX: &str = "PuTTY-User-Key-File-";
const V2_MAC_LABEL: &[u8] = b"putty-private-key-file-mac-key";

#[derive(thiserror::Error, Debug)]
pub enum PpkError {
    #[error("unsupported format version {0}")]
    UnsupportedVersion(String),
    #[error("missing {0} field")]
    MissingField(&'static str),
    #[error("key is encrypted")]
    Encrypted,
    #[error("bad base64 in {field}: {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error("MAC verification failed")]
    MacMismatch,
    #[error("unsupported key algorithm {0}")]
    UnsupportedAlgorithm(String),
    #[error("malformed key blob: {0}")]
    Malformed(String),
}

impl From<ssh_encoding::Error> for PpkError {
    fn from(err: ssh_encoding::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<ssh_key::Error> for PpkError {
    fn from(err: ssh_key::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

pub fn looks_like_ppk(text: &str) -> bool {
    text.trim_start().starts_with(HEADER_PREFIX)
}

/// The fields of a `.ppk` file, blobs already base64-decoded.
struct PpkFile {
    version: u8,
    algorithm: String,
    encryption: String,
    comment: String,
    public_blob: Vec<u8>,
    private_blob: Zeroizing<Vec<u8>>,
    mac: String,
}

pub fn parse(text: &str) -> Result<PrivateKey, PpkError> {
    let file = PpkFile::parse(text)?;
    if file.encryption != "none" {
        return Err(PpkError::Encrypted);
    }
    file.verify_mac()?;

    let public = KeyData::decode(&mut file.public_blob.as_slice())?;
    if public.algorithm().as_str() != file.algorithm {
        return Err(PpkError::Malformed(format!(
            "header says {} but public blob is {}",
            file.algorithm,
            public.algorithm()
        )));
    }

    let reader = &mut file.private_blob.as_slice();
    let keypair = match public {
        KeyData::Ed25519(public) => {
            // Little-endian private scalar; short encodings drop high zero bytes.
            let scalar = Zeroizing::new(Vec::<u8>::decode(reader)?);
            if scalar.len() > 32 {
                return Err(PpkError::Malformed("ed25519 private key too long".into()));
            }
            let mut seed = Zeroizing::new([0u8; 32]);
            seed[..scalar.len()].copy_from_slice(&scalar);

            let keypair = Ed25519Keypair::from_seed(&seed);
            if keypair.public != public {
                return Err(PpkError::Malformed(
                    "ed25519 private key does not match public key".into(),
                ));
            }
            KeypairData::Ed25519(keypair)
        }
        KeyData::Rsa(public) => {
            let d = Mpint::decode(reader)?;
            let p = Mpint::decode(reader)?;
            let q = Mpint::decode(reader)?;
            let iqmp = Mpint::decode(reader)?;
            let keypair = RsaKeypair {
                public,
                private: RsaPrivateKey { d, iqmp, p, q },
            };
            rsa_private_key(&keypair).map_err(|e| PpkError::Malformed(e.to_string()))?;
            KeypairData::Rsa(keypair)
        }
        KeyData::Ecdsa(public) => {
            let d = Zeroizing::new(Mpint::decode(reader)?);
            ecdsa_keypair(&file.public_blob, public.curve(), &d)?
        }
        other => return Err(PpkError::UnsupportedAlgorithm(other.algorithm().to_string())),
    };

    let key = PrivateKey::new(keypair, file.comment)?;
    if key.algorithm().is_ecdsa() {
        check_pairing(&key)?;
    }
    Ok(key)
}

/// ECDSA keypairs use the agent encoding: the public blob followed by the
/// private scalar as a fixed-width string.
fn ecdsa_keypair(
    public_blob: &[u8],
    curve: EcdsaCurve,
    d: &Mpint,
) -> Result<KeypairData, PpkError> {
    let width = match curve {
        EcdsaCurve::NistP256 => 32,
        EcdsaCurve::NistP384 => 48,
        EcdsaCurve::NistP521 => 66,
    };
    let scalar = d
        .as_positive_bytes()
        .ok_or_else(|| PpkError::Malformed("negative ecdsa private key".into()))?;
    if scalar.len() > width {
        return Err(PpkError::Malformed("ecdsa private key too long".into()));
    }

    let mut padded = Zeroizing::new(vec![0u8; width]);
    padded[width - scalar.len()..].copy_from_slice(scalar);
    let mut encoded = Zeroizing::new(public_blob.to_vec());
    padded.as_slice().encode(&mut *encoded)?;

    Ok(KeypairData::decode(&mut encoded.as_slice())?)
}

/// The private scalar of an ECDSA file must sign for its public key.
fn check_pairing(key: &PrivateKey) -> Result<(), PpkError> {
    const CHALLENGE: &[u8] = b"keyrelay ppk pairing";
    let mismatch = || PpkError::Malformed("private key does not match public key".into());

    let sig = key.try_sign(CHALLENGE).map_err(|_| mismatch())?;
    signature::Verifier::verify(key.public_key(), CHALLENGE, &sig).map_err(|_| mismatch())
}

impl PpkFile {
    fn parse(text: &str) -> Result<Self, PpkError> {
        let mut lines = text.lines().map(str::trim_end);

        let (version, algorithm) = lines
            .next()
            .and_then(|line| line.trim_start().strip_prefix(HEADER_PREFIX))
            .and_then(|rest| rest.split_once(": "))
            .ok_or(PpkError::MissingField("header"))?;
        let version = match version {
            "2" => 2,
            "3" => 3,
            other => return Err(PpkError::UnsupportedVersion(other.to_string())),
        };

        let mut encryption = None;
        let mut comment = None;
        let mut public_blob = None;
        let mut private_blob = None;
        let mut mac = None;

        while let Some(line) = lines.next() {
            let Some((key, value)) = line.split_once(": ") else {
                continue;
            };
            match key {
                "Encryption" => encryption = Some(value.to_string()),
                "Comment" => comment = Some(value.to_string()),
                "Public-Lines" => {
                    public_blob = Some(read_blob(&mut lines, value, "Public-Lines")?);
                }
                "Private-Lines" => {
                    private_blob = Some(Zeroizing::new(read_blob(
                        &mut lines,
                        value,
                        "Private-Lines",
                    )?));
                }
                "Private-MAC" => mac = Some(value.to_string()),
                // Key-Derivation, Argon2-* only appear on encrypted files.
                _ => {}
            }
        }

        Ok(Self {
            version,
            algorithm: algorithm.to_string(),
            encryption: encryption.ok_or(PpkError::MissingField("Encryption"))?,
            comment: comment.unwrap_or_default(),
            public_blob: public_blob.ok_or(PpkError::MissingField("Public-Lines"))?,
            private_blob: private_blob.ok_or(PpkError::MissingField("Private-Lines"))?,
            mac: mac.ok_or(PpkError::MissingField("Private-MAC"))?,
        })
    }

    fn mac_input(&self) -> Result<Vec<u8>, PpkError> {
        let mut data = Vec::new();
        self.algorithm.encode(&mut data)?;
        self.encryption.encode(&mut data)?;
        self.comment.encode(&mut data)?;
        self.public_blob.encode(&mut data)?;
        self.private_blob.as_slice().encode(&mut data)?;
        Ok(data)
    }

    fn verify_mac(&self) -> Result<(), PpkError> {
        let expected = hex::decode(&self.mac).map_err(|_| PpkError::MacMismatch)?;
        let data = Zeroizing::new(self.mac_input()?);

        let verified = match self.version {
            2 => {
                let key = Sha1::digest(V2_MAC_LABEL);
                let mut mac = Hmac::<Sha1>::new_from_slice(&key)
                    .map_err(|e| PpkError::Malformed(e.to_string()))?;
                mac.update(&data);
                mac.verify_slice(&expected).is_ok()
            }
            _ => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&[])
                    .map_err(|e| PpkError::Malformed(e.to_string()))?;
                mac.update(&data);
                mac.verify_slice(&expected).is_ok()
            }
        };

        if verified {
            Ok(())
        } else {
            Err(PpkError::MacMismatch)
        }
    }
}

fn read_blob<'a>(
    lines: &mut impl Iterator<Item = &'a str>,
    count: &str,
    field: &'static str,
) -> Result<Vec<u8>, PpkError> {
    let count: usize = count
        .trim()
        .parse()
        .map_err(|_| PpkError::MissingField(field))?;

    let mut encoded = String::new();
    for _ in 0..count {
        encoded.push_str(lines.next().ok_or(PpkError::MissingField(field))?.trim());
    }

    BASE64_STANDARD
        .decode(encoded)
        .map_err(|source| PpkError::Base64 { field, source })
}
