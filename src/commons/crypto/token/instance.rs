//! Leased key handles.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use openssl::pkey::{Id, PKey, PKeyRef, Private};
use openssl::sign::{Signer, Verifier};
use openssl::x509::{X509, X509Ref};
use crate::commons::crypto::algorithm::{
    DigestAlgorithm, KeyKind, SignatureAlgorithm
};
use super::TokenError;


//------------ CryptoInstance ------------------------------------------------

/// A key together with its certificate chain.
///
/// An instance is acquired from a [`CryptoToken`][super::CryptoToken] for
/// the duration of a single request unless it lives in an
/// [`InstanceCache`], in which case it is shared by all requests to the
/// worker owning the cache.
pub struct CryptoInstance {
    alias: String,
    key: SigningKey,
    provider: &'static str,
    chain: Vec<X509>,
    shared: bool,
}

impl CryptoInstance {
    pub fn new(
        alias: impl Into<String>,
        key: SigningKey,
        provider: &'static str,
        chain: Vec<X509>,
    ) -> Self {
        CryptoInstance {
            alias: alias.into(),
            key,
            provider,
            chain,
            shared: false,
        }
    }

    pub(super) fn into_shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    /// Returns the certificate chain, starting with the signer certificate.
    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    pub fn certificate(&self) -> Option<&X509Ref> {
        self.chain.first().map(AsRef::as_ref)
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn key_kind(&self) -> KeyKind {
        self.key.kind()
    }

    /// Signs data with the given algorithm.
    ///
    /// RSA signatures use PKCS#1 v1.5 padding, ECDSA signatures are
    /// returned DER encoded.
    pub fn sign(
        &self,
        alg: SignatureAlgorithm,
        data: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        if alg.key_kind() != self.key_kind() {
            return Err(TokenError::InvalidParameter(format!(
                "Signature algorithm {} does not match {} key '{}'",
                alg, self.key_kind(), self.alias
            )))
        }
        match &self.key {
            SigningKey::Software(pkey) => sign_with_key(pkey, alg, data),
            #[cfg(feature = "hsm")]
            SigningKey::Pkcs11(key) => key.sign(alg, data),
        }
    }

    /// Creates a test signature and verifies it.
    ///
    /// Verification uses the signer certificate if there is one. For
    /// software keys without a certificate the key itself is used and for
    /// PKCS#11 keys without one only signing is tested.
    pub fn self_test(&self) -> Result<(), TokenError> {
        const DATA: &[u8] = b"signserver crypto token self test";
        let alg = SignatureAlgorithm::new(
            DigestAlgorithm::Sha256, self.key_kind()
        );
        let signature = self.sign(alg, DATA)?;

        let verified = match (self.certificate(), &self.key) {
            (Some(cert), _) => {
                let public = cert.public_key()?;
                verify(&*public, alg, DATA, &signature)?
            }
            (None, SigningKey::Software(pkey)) => {
                verify(&**pkey, alg, DATA, &signature)?
            }
            #[cfg(feature = "hsm")]
            (None, SigningKey::Pkcs11(_)) => true,
        };
        if verified {
            Ok(())
        }
        else {
            Err(TokenError::Other(format!(
                "Test signature with key '{}' does not verify", self.alias
            )))
        }
    }
}

impl fmt::Debug for CryptoInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CryptoInstance")
            .field("alias", &self.alias)
            .field("provider", &self.provider)
            .field("chain_len", &self.chain.len())
            .field("shared", &self.shared)
            .finish()
    }
}

fn sign_with_key(
    pkey: &PKeyRef<Private>,
    alg: SignatureAlgorithm,
    data: &[u8],
) -> Result<Vec<u8>, TokenError> {
    let mut signer = Signer::new(alg.digest().message_digest(), pkey)?;
    signer.update(data)?;
    Ok(signer.sign_to_vec()?)
}

fn verify<T: openssl::pkey::HasPublic>(
    pkey: &PKeyRef<T>,
    alg: SignatureAlgorithm,
    data: &[u8],
    signature: &[u8],
) -> Result<bool, TokenError> {
    let mut verifier = Verifier::new(alg.digest().message_digest(), pkey)?;
    verifier.update(data)?;
    Ok(verifier.verify(signature)?)
}


//------------ SigningKey ----------------------------------------------------

/// The private key of a crypto instance.
pub enum SigningKey {
    /// A key held in memory.
    Software(PKey<Private>),

    /// A key living in a PKCS#11 token, used through a pooled session.
    #[cfg(feature = "hsm")]
    Pkcs11(super::pkcs11::Pkcs11Key),
}

impl SigningKey {
    pub fn kind(&self) -> KeyKind {
        match self {
            SigningKey::Software(pkey) => software_key_kind(pkey),
            #[cfg(feature = "hsm")]
            SigningKey::Pkcs11(key) => key.kind(),
        }
    }
}

pub fn software_key_kind(pkey: &PKeyRef<Private>) -> KeyKind {
    if pkey.id() == Id::EC {
        KeyKind::Ec
    }
    else {
        KeyKind::Rsa
    }
}


//------------ InstanceCache -------------------------------------------------

/// Crypto instances shared by all requests to a worker.
///
/// The cache belongs to the active state of a worker and is dropped with
/// it when the worker is reloaded.
#[derive(Debug, Default)]
pub struct InstanceCache {
    instances: Mutex<HashMap<String, Arc<CryptoInstance>>>,
}

impl InstanceCache {
    /// Returns the cached instance for an alias or creates it.
    ///
    /// The lock is held while creating the instance so that concurrent
    /// requests do not acquire the same key twice.
    pub fn get_or_insert_with<F>(
        &self,
        alias: &str,
        op: F,
    ) -> Result<Arc<CryptoInstance>, TokenError>
    where
        F: FnOnce() -> Result<CryptoInstance, TokenError>,
    {
        let mut instances = self.instances.lock().unwrap();
        if let Some(instance) = instances.get(alias) {
            return Ok(instance.clone())
        }
        let instance = Arc::new(op()?);
        instances.insert(alias.to_string(), instance.clone());
        Ok(instance)
    }

    pub fn len(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.instances.lock().unwrap().clear()
    }
}


//------------ Tests ---------------------------------------------------------
