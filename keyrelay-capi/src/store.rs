//! Current-user `MY` certificate store access through CryptoAPI and CNG.
//!
//! Handles are not `Send`, so every call opens the store, does its work and
//! closes it again on the calling (blocking) thread.

use std::ffi::c_void;
use std::ptr;

use keyrelay_core::{BackendError, Identity, KeyBlob, SignatureFlags};
use ssh_key::Signature;
use ssh_key::public::KeyData;
use tracing::debug;
use windows_sys::Win32::Security::Cryptography::{
    BCRYPT_KEY_HANDLE, BCRYPT_PKCS1_PADDING_INFO, BCryptDestroyKey, BCryptExportKey, CERT_CONTEXT,
    CertCloseStore, CertEnumCertificatesInStore, CertFreeCertificateContext, CertGetNameStringW,
    CertOpenSystemStoreW, CryptAcquireCertificatePrivateKey, CryptImportPublicKeyInfoEx2,
    HCERTSTORE, NCryptFreeObject, NCryptSignHash,
};

use crate::convert::{SignScheme, ecdsa_public_from_bcrypt, rsa_public_from_bcrypt};

const X509_ASN_ENCODING: u32 = 0x1;
const PKCS_7_ASN_ENCODING: u32 = 0x1_0000;
const CERT_NAME_SIMPLE_DISPLAY_TYPE: u32 = 4;
const CRYPT_ACQUIRE_CACHE_FLAG: u32 = 0x1;
const CRYPT_ACQUIRE_SILENT_FLAG: u32 = 0x40;
const CRYPT_ACQUIRE_ONLY_NCRYPT_KEY_FLAG: u32 = 0x4_0000;
const CERT_NCRYPT_KEY_SPEC: u32 = 0xffff_ffff;
const NCRYPT_PAD_PKCS1_FLAG: u32 = 0x2;

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn unavailable(what: &str) -> BackendError {
    BackendError::Unavailable(format!("{what}: {}", std::io::Error::last_os_error()))
}

/// An open `MY` store, closed on drop.
struct Store(HCERTSTORE);

impl Store {
    fn open() -> Result<Self, BackendError> {
        let name = wide("MY");
        // SAFETY: `name` is NUL-terminated and outlives the call.
        let handle = unsafe { CertOpenSystemStoreW(0, name.as_ptr()) };
        if handle.is_null() {
            return Err(unavailable("open certificate store"));
        }
        Ok(Self(handle))
    }

    /// Visit every certificate; the context is only valid inside `f`.
    fn for_each<F>(&self, mut f: F) -> Result<(), BackendError>
    where
        F: FnMut(*const CERT_CONTEXT) -> Result<bool, BackendError>,
    {
        let mut ctx: *const CERT_CONTEXT = ptr::null();
        loop {
            // SAFETY: the previous context is released by the enumeration.
            ctx = unsafe { CertEnumCertificatesInStore(self.0, ctx) }.cast_const();
            if ctx.is_null() {
                return Ok(());
            }
            match f(ctx) {
                Ok(true) => {}
                other => {
                    // SAFETY: ctx came from the enumeration and is still owned.
                    unsafe { CertFreeCertificateContext(ctx) };
                    return other.map(|_| ());
                }
            }
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // SAFETY: handle came from CertOpenSystemStoreW.
        unsafe { CertCloseStore(self.0, 0) };
    }
}

/// A CNG private key handle acquired from a certificate.
struct NcryptKey {
    handle: usize,
    owned: bool,
}

impl NcryptKey {
    fn acquire(ctx: *const CERT_CONTEXT, silent: bool) -> Option<Self> {
        let mut flags = CRYPT_ACQUIRE_ONLY_NCRYPT_KEY_FLAG | CRYPT_ACQUIRE_CACHE_FLAG;
        if silent {
            flags |= CRYPT_ACQUIRE_SILENT_FLAG;
        }
        let mut handle = 0usize;
        let mut key_spec = 0u32;
        let mut owned = 0;
        // SAFETY: all out-pointers refer to locals.
        let ok = unsafe {
            CryptAcquireCertificatePrivateKey(
                ctx,
                flags,
                ptr::null(),
                &mut handle,
                &mut key_spec,
                &mut owned,
            )
        };
        (ok != 0 && key_spec == CERT_NCRYPT_KEY_SPEC).then_some(Self {
            handle,
            owned: owned != 0,
        })
    }
}

impl Drop for NcryptKey {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: we own the handle per CryptAcquireCertificatePrivateKey.
            unsafe { NCryptFreeObject(self.handle) };
        }
    }
}

fn display_name(ctx: *const CERT_CONTEXT) -> String {
    let mut buf = [0u16; 256];
    // SAFETY: buf is writable for its full length.
    let len = unsafe {
        CertGetNameStringW(
            ctx,
            CERT_NAME_SIMPLE_DISPLAY_TYPE,
            0,
            ptr::null(),
            buf.as_mut_ptr(),
            buf.len() as u32,
        )
    };
    String::from_utf16_lossy(&buf[..(len as usize).saturating_sub(1)])
}

/// The certificate's public key in SSH form, when it is RSA or NIST ECDSA.
fn public_key(ctx: *const CERT_CONTEXT) -> Result<KeyData, BackendError> {
    let mut key: BCRYPT_KEY_HANDLE = ptr::null_mut();
    // SAFETY: ctx is a live certificate context with a populated pCertInfo.
    let imported = unsafe {
        CryptImportPublicKeyInfoEx2(
            X509_ASN_ENCODING | PKCS_7_ASN_ENCODING,
            &(*(*ctx).pCertInfo).SubjectPublicKeyInfo,
            0,
            ptr::null(),
            &mut key,
        )
    };
    if imported == 0 {
        return Err(unavailable("import certificate public key"));
    }

    let result = export(key, "RSAPUBLICBLOB")
        .and_then(|blob| rsa_public_from_bcrypt(&blob))
        .or_else(|_| {
            export(key, "ECCPUBLICBLOB").and_then(|blob| ecdsa_public_from_bcrypt(&blob))
        });
    // SAFETY: key came from CryptImportPublicKeyInfoEx2.
    unsafe { BCryptDestroyKey(key) };
    result
}

fn export(key: BCRYPT_KEY_HANDLE, blob_type: &str) -> Result<Vec<u8>, BackendError> {
    let blob_type = wide(blob_type);
    let mut len = 0u32;
    // SAFETY: first call only queries the size.
    let status = unsafe {
        BCryptExportKey(key, ptr::null_mut(), blob_type.as_ptr(), ptr::null_mut(), 0, &mut len, 0)
    };
    if status != 0 {
        return Err(BackendError::InvalidKey(format!("export {status:#x}")));
    }
    let mut buf = vec![0u8; len as usize];
    // SAFETY: buf has exactly `len` writable bytes.
    let status = unsafe {
        BCryptExportKey(
            key,
            ptr::null_mut(),
            blob_type.as_ptr(),
            buf.as_mut_ptr(),
            len,
            &mut len,
            0,
        )
    };
    if status != 0 {
        return Err(BackendError::InvalidKey(format!("export {status:#x}")));
    }
    buf.truncate(len as usize);
    Ok(buf)
}

pub(crate) fn check_available() -> Result<(), BackendError> {
    Store::open().map(drop)
}

pub(crate) fn list() -> Result<Vec<Identity>, BackendError> {
    let store = Store::open()?;
    let mut identities = Vec::new();
    store.for_each(|ctx| {
        if NcryptKey::acquire(ctx, true).is_none() {
            return Ok(true);
        }
        match public_key(ctx) {
            Ok(key) => {
                let blob = KeyBlob::from_key_data(&key)?;
                identities.push(Identity::new(blob, display_name(ctx)));
            }
            Err(e) => debug!(error = %e, "skipping certificate"),
        }
        Ok(true)
    })?;
    Ok(identities)
}

pub(crate) fn sign(
    blob: &KeyBlob,
    data: &[u8],
    flags: SignatureFlags,
) -> Result<Signature, BackendError> {
    let store = Store::open()?;
    let mut outcome = Err(BackendError::NotFound);
    store.for_each(|ctx| {
        let Ok(key) = public_key(ctx) else {
            return Ok(true);
        };
        if KeyBlob::from_key_data(&key)? != *blob {
            return Ok(true);
        }
        let private = NcryptKey::acquire(ctx, false)
            .ok_or_else(|| BackendError::Refused("private key not accessible".into()))?;
        let scheme = SignScheme::for_key(&key, flags)?;
        outcome = sign_hash(&private, scheme, data);
        Ok(false)
    })?;
    outcome
}

fn sign_hash(key: &NcryptKey, scheme: SignScheme, data: &[u8]) -> Result<Signature, BackendError> {
    let digest = scheme.digest(data);
    let alg = wide(scheme.cng_hash_name());
    let pkcs1 = BCRYPT_PKCS1_PADDING_INFO {
        pszAlgId: alg.as_ptr(),
    };
    let (padding, pad_flags) = match scheme {
        SignScheme::Rsa(_) => (
            ptr::from_ref(&pkcs1).cast::<c_void>(),
            NCRYPT_PAD_PKCS1_FLAG,
        ),
        SignScheme::Ecdsa(_) => (ptr::null::<c_void>(), 0),
    };

    let mut len = 0u32;
    // SAFETY: size query; padding info and digest outlive both calls.
    let status = unsafe {
        NCryptSignHash(
            key.handle,
            padding,
            digest.as_ptr(),
            digest.len() as u32,
            ptr::null_mut(),
            0,
            &mut len,
            pad_flags,
        )
    };
    if status != 0 {
        return Err(BackendError::Refused(format!("NCryptSignHash {status:#x}")));
    }
    let mut raw = vec![0u8; len as usize];
    // SAFETY: raw has exactly `len` writable bytes.
    let status = unsafe {
        NCryptSignHash(
            key.handle,
            padding,
            digest.as_ptr(),
            digest.len() as u32,
            raw.as_mut_ptr(),
            len,
            &mut len,
            pad_flags,
        )
    };
    if status != 0 {
        return Err(BackendError::Refused(format!("NCryptSignHash {status:#x}")));
    }
    raw.truncate(len as usize);
    scheme.signature(raw)
}
