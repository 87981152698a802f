//! Crypto tokens: sources of private keys and their certificates.
//!
//! A [`CryptoToken`] hands out [`CryptoInstance`]s, short lived leases on
//! a single key together with its certificate chain. Every instance that
//! was acquired must be given back through [`CryptoToken::release`]. The
//! token keeps count of both so leaks can be detected.

use std::{error, fmt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use log::{debug, warn};
use openssl::error::ErrorStack;
use openssl::x509::X509;
use serde::Serialize;
use crate::commons::error::IoError;
use crate::server::worker::{WorkerConfig, props};

pub use self::instance::{CryptoInstance, InstanceCache, SigningKey};
pub use self::keystore::KeystoreToken;
#[cfg(feature = "hsm")]
pub use self::pkcs11::Pkcs11Token;

pub mod instance;
pub mod keystore;
#[cfg(feature = "hsm")]
pub mod pkcs11;


//------------ CryptoToken ---------------------------------------------------

/// A configured crypto token.
#[derive(Debug)]
pub struct CryptoToken {
    kind: TokenKind,
    acquired: AtomicU64,
    released: AtomicU64,
}

#[derive(Debug)]
enum TokenKind {
    Keystore(KeystoreToken),
    #[cfg(feature = "hsm")]
    Pkcs11(Pkcs11Token),
}

impl CryptoToken {
    /// Creates the token described by a worker's properties.
    ///
    /// Returns `Ok(None)` if the worker does not configure a token.
    /// The PKCS#11 libraries known to the server are used to resolve
    /// `SHAREDLIBRARYNAME`.
    pub fn from_properties(
        config: &WorkerConfig,
        libraries: &HashMap<String, PathBuf>,
    ) -> Result<Option<Self>, TokenError> {
        let kind = match config.get_non_empty(props::CRYPTOTOKEN) {
            None => return Ok(None),
            Some(kind) => kind.to_uppercase(),
        };
        let kind = match kind.as_str() {
            "KEYSTORE" => {
                TokenKind::Keystore(KeystoreToken::from_properties(config)?)
            }
            #[cfg(feature = "hsm")]
            "PKCS11" => {
                TokenKind::Pkcs11(
                    Pkcs11Token::from_properties(config, libraries)?
                )
            }
            #[cfg(not(feature = "hsm"))]
            "PKCS11" => {
                let _ = libraries;
                return Err(TokenError::Initialization(vec![
                    "PKCS#11 support is not enabled in this build".into()
                ]))
            }
            other => {
                return Err(TokenError::Initialization(vec![
                    format!("Unsupported crypto token: {other}")
                ]))
            }
        };
        Ok(Some(CryptoToken::new(kind)))
    }

    fn new(kind: TokenKind) -> Self {
        CryptoToken {
            kind,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Returns a short description of the token for logging.
    pub fn provider(&self) -> &'static str {
        match self.kind {
            TokenKind::Keystore(_) => keystore::PROVIDER,
            #[cfg(feature = "hsm")]
            TokenKind::Pkcs11(_) => pkcs11::PROVIDER,
        }
    }

    /// Activates the token with the given authentication code.
    ///
    /// Activating an active token does nothing.
    pub fn activate(&self, auth_code: &str) -> Result<(), TokenError> {
        match &self.kind {
            TokenKind::Keystore(token) => token.activate(auth_code),
            #[cfg(feature = "hsm")]
            TokenKind::Pkcs11(token) => token.activate(auth_code),
        }
    }

    /// Activates the token if it was configured with an activation code.
    ///
    /// Returns `None` if there is no such code.
    pub fn auto_activate(&self) -> Option<Result<(), TokenError>> {
        match &self.kind {
            TokenKind::Keystore(token) => token.auto_activate(),
            #[cfg(feature = "hsm")]
            TokenKind::Pkcs11(token) => token.auto_activate(),
        }
    }

    pub fn deactivate(&self) {
        match &self.kind {
            TokenKind::Keystore(token) => token.deactivate(),
            #[cfg(feature = "hsm")]
            TokenKind::Pkcs11(token) => token.deactivate(),
        }
    }

    pub fn is_active(&self) -> bool {
        match &self.kind {
            TokenKind::Keystore(token) => token.is_active(),
            #[cfg(feature = "hsm")]
            TokenKind::Pkcs11(token) => token.is_active(),
        }
    }

    /// Returns the alias of the key used when a worker names none.
    pub fn default_key(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Keystore(token) => token.default_key(),
            #[cfg(feature = "hsm")]
            TokenKind::Pkcs11(token) => token.default_key(),
        }
    }

    /// Returns the status of the token.
    ///
    /// The token is only active if it has been activated and every given
    /// key can be used to create a signature that verifies.
    pub fn status(&self, aliases: &[&str]) -> TokenStatus {
        if !self.is_active() {
            return TokenStatus::Offline
        }
        for alias in aliases {
            let instance = match self.acquire(alias, None) {
                Ok(instance) => instance,
                Err(err) => {
                    debug!("Status check for key '{alias}' failed: {err}");
                    return TokenStatus::Offline
                }
            };
            let res = instance.self_test();
            self.release(instance);
            if let Err(err) = res {
                warn!("Self test for key '{alias}' failed: {err}");
                return TokenStatus::Offline
            }
        }
        TokenStatus::Active
    }

    /// Acquires a crypto instance for the key with the given alias.
    ///
    /// If a cache is given, the instance is taken from the cache or
    /// created and added to it while holding the cache's lock. Cached
    /// instances are shared and survive their release.
    pub fn acquire(
        &self,
        alias: &str,
        cache: Option<&InstanceCache>,
    ) -> Result<Arc<CryptoInstance>, TokenError> {
        let res = match cache {
            Some(cache) => {
                cache.get_or_insert_with(alias, || {
                    self.acquire_instance(alias).map(CryptoInstance::into_shared)
                })
            }
            None => self.acquire_instance(alias).map(Arc::new),
        };
        if res.is_ok() {
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }
        res
    }

    fn acquire_instance(
        &self, alias: &str
    ) -> Result<CryptoInstance, TokenError> {
        match &self.kind {
            TokenKind::Keystore(token) => token.acquire(alias),
            #[cfg(feature = "hsm")]
            TokenKind::Pkcs11(token) => token.acquire(alias),
        }
    }

    /// Gives back a crypto instance.
    ///
    /// For instances backed by a PKCS#11 session, this returns the session
    /// to the pool. Shared instances stay in their cache.
    pub fn release(&self, instance: Arc<CryptoInstance>) {
        self.released.fetch_add(1, Ordering::SeqCst);
        if !instance.is_shared() {
            debug!("Released crypto instance for key '{}'", instance.alias());
        }
        drop(instance)
    }

    /// Returns the number of acquired and released instances so far.
    pub fn lease_counts(&self) -> (u64, u64) {
        (
            self.acquired.load(Ordering::SeqCst),
            self.released.load(Ordering::SeqCst),
        )
    }

    /// Generates a new key pair.
    ///
    /// The key algorithm is `RSA` or `ECDSA`, the key spec is the modulus
    /// length for RSA and the curve name for ECDSA.
    pub fn generate_key(
        &self,
        key_alg: &str,
        key_spec: &str,
        alias: &str,
    ) -> Result<(), TokenError> {
        let spec = KeySpec::parse(key_alg, key_spec)?;
        match &self.kind {
            TokenKind::Keystore(token) => token.generate_key(spec, alias),
            #[cfg(feature = "hsm")]
            TokenKind::Pkcs11(token) => token.generate_key(spec, alias),
        }
    }

    pub fn remove_key(&self, alias: &str) -> Result<(), TokenError> {
        match &self.kind {
            TokenKind::Keystore(token) => token.remove_key(alias),
            #[cfg(feature = "hsm")]
            TokenKind::Pkcs11(token) => token.remove_key(alias),
        }
    }

    /// Replaces the certificate chain of a key.
    ///
    /// The chain starts with the certificate for the key itself.
    pub fn import_certificate_chain(
        &self,
        alias: &str,
        chain: &[X509],
    ) -> Result<(), TokenError> {
        let leaf = chain.first().ok_or_else(|| {
            TokenError::InvalidParameter("Empty certificate chain".into())
        })?;
        match &self.kind {
            TokenKind::Keystore(token) => {
                token.import_certificate_chain(alias, leaf, chain)
            }
            #[cfg(feature = "hsm")]
            TokenKind::Pkcs11(token) => {
                token.import_certificate_chain(alias, chain)
            }
        }
    }

    /// Returns the aliases of all keys in the token.
    pub fn aliases(&self) -> Result<Vec<String>, TokenError> {
        match &self.kind {
            TokenKind::Keystore(token) => token.aliases(),
            #[cfg(feature = "hsm")]
            TokenKind::Pkcs11(token) => token.aliases(),
        }
    }
}


//------------ TokenStatus ---------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenStatus {
    Active,
    Offline,
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            TokenStatus::Active => "ACTIVE",
            TokenStatus::Offline => "OFFLINE",
        })
    }
}


//------------ KeySpec -------------------------------------------------------

/// The kind of key to generate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeySpec {
    Rsa(u32),
    Ec(Curve),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Curve {
    P256,
    P384,
}

impl KeySpec {
    pub fn parse(key_alg: &str, key_spec: &str) -> Result<Self, TokenError> {
        let spec = key_spec.trim();
        match key_alg.trim().to_uppercase().as_str() {
            "RSA" => {
                let bits = spec.parse::<u32>().map_err(|_| {
                    TokenError::InvalidParameter(
                        format!("Invalid RSA key length: {spec}")
                    )
                })?;
                if !(1024..=8192).contains(&bits) {
                    return Err(TokenError::InvalidParameter(
                        format!("Unsupported RSA key length: {bits}")
                    ))
                }
                Ok(KeySpec::Rsa(bits))
            }
            "ECDSA" | "EC" => {
                match spec.to_lowercase().as_str() {
                    "prime256v1" | "secp256r1" | "p-256" => {
                        Ok(KeySpec::Ec(Curve::P256))
                    }
                    "secp384r1" | "p-384" => Ok(KeySpec::Ec(Curve::P384)),
                    _ => Err(TokenError::InvalidParameter(
                        format!("Unsupported curve: {spec}")
                    ))
                }
            }
            other => Err(TokenError::InvalidParameter(
                format!("Unsupported key algorithm: {other}")
            ))
        }
    }
}


//------------ TokenError ----------------------------------------------------

#[derive(Debug)]
pub enum TokenError {
    /// There is no key with the given alias.
    NoSuchAlias(String),

    /// The token is not active or cannot be reached.
    Offline(String),

    /// The authentication code was rejected.
    Authentication(String),

    /// The token cannot hold any more keys.
    OutOfSpace(String),

    InvalidParameter(String),

    /// The token configuration is invalid.
    Initialization(Vec<String>),

    OpenSsl(ErrorStack),

    Io(IoError),

    #[cfg(feature = "hsm")]
    Pkcs11(String),

    Other(String),
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenError::NoSuchAlias(alias) => {
                write!(f, "No key with alias '{alias}' found")
            }
            TokenError::Offline(msg)
            | TokenError::Authentication(msg)
            | TokenError::OutOfSpace(msg)
            | TokenError::InvalidParameter(msg)
            | TokenError::Other(msg) => f.write_str(msg),
            TokenError::Initialization(errors) => {
                write!(f, "Crypto token misconfigured: {}", errors.join(", "))
            }
            TokenError::OpenSsl(err) => write!(f, "OpenSSL error: {err}"),
            TokenError::Io(err) => err.fmt(f),
            #[cfg(feature = "hsm")]
            TokenError::Pkcs11(msg) => write!(f, "PKCS#11 error: {msg}"),
        }
    }
}

impl error::Error for TokenError {}

impl From<ErrorStack> for TokenError {
    fn from(err: ErrorStack) -> Self {
        TokenError::OpenSsl(err)
    }
}

impl From<IoError> for TokenError {
    fn from(err: IoError) -> Self {
        TokenError::Io(err)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::crypto::algorithm::SignatureAlgorithm;
    use crate::test;

    fn keystore_token(dir: &std::path::Path) -> CryptoToken {
        let config: WorkerConfig = [
            ("CRYPTOTOKEN", "KEYSTORE"),
            ("KEYSTOREPATH", dir.to_str().unwrap()),
            ("KEYSTOREPASSWORD", "foo123"),
            ("DEFAULTKEY", "signer"),
        ].into_iter().collect();
        CryptoToken::from_properties(&config, &HashMap::new())
            .unwrap().unwrap()
    }

    #[test]
    fn no_token_configured() {
        let config = WorkerConfig::new();
        assert!(
            CryptoToken::from_properties(&config, &HashMap::new())
                .unwrap().is_none()
        );
    }

    #[test]
    fn unknown_token_kind() {
        let config: WorkerConfig = [("CRYPTOTOKEN", "JKS")]
            .into_iter().collect();
        match CryptoToken::from_properties(&config, &HashMap::new()) {
            Err(TokenError::Initialization(errors)) => {
                assert_eq!(errors, vec!["Unsupported crypto token: JKS"])
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn status_requires_working_keys() {
        let dir = test::tmp_dir();
        let token = keystore_token(dir.path());
        assert_eq!(token.status(&["signer"]), TokenStatus::Offline);

        token.auto_activate().unwrap().unwrap();
        token.generate_key("RSA", "2048", "signer").unwrap();
        assert_eq!(token.status(&["signer"]), TokenStatus::Active);
        assert_eq!(token.status(&["missing"]), TokenStatus::Offline);

        token.deactivate();
        assert_eq!(token.status(&["signer"]), TokenStatus::Offline);
    }

    #[test]
    fn leases_are_counted() {
        let dir = test::tmp_dir();
        let token = keystore_token(dir.path());
        token.auto_activate().unwrap().unwrap();
        token.generate_key("ECDSA", "prime256v1", "signer").unwrap();

        let instance = token.acquire("signer", None).unwrap();
        instance.sign(
            SignatureAlgorithm::new(
                crate::commons::crypto::algorithm::DigestAlgorithm::Sha256,
                crate::commons::crypto::algorithm::KeyKind::Ec,
            ),
            b"data"
        ).unwrap();
        assert_eq!(token.lease_counts(), (1, 0));
        token.release(instance);
        assert_eq!(token.lease_counts(), (1, 1));

        assert!(matches!(
            token.acquire("missing", None),
            Err(TokenError::NoSuchAlias(_))
        ));
        assert_eq!(token.lease_counts(), (1, 1));
    }

    #[test]
    fn cached_instances_are_shared() {
        let dir = test::tmp_dir();
        let token = keystore_token(dir.path());
        token.auto_activate().unwrap().unwrap();
        token.generate_key("RSA", "2048", "signer").unwrap();

        let cache = InstanceCache::default();
        let one = token.acquire("signer", Some(&cache)).unwrap();
        let two = token.acquire("signer", Some(&cache)).unwrap();
        assert!(one.is_shared());
        assert!(Arc::ptr_eq(&one, &two));
        token.release(one);
        token.release(two);
        assert_eq!(cache.len(), 1);
        assert_eq!(token.lease_counts(), (2, 2));
    }

    #[test]
    fn key_specs() {
        assert_eq!(KeySpec::parse("rsa", "2048").unwrap(), KeySpec::Rsa(2048));
        assert_eq!(
            KeySpec::parse("ECDSA", "secp384r1").unwrap(),
            KeySpec::Ec(Curve::P384)
        );
        assert!(KeySpec::parse("RSA", "big").is_err());
        assert!(KeySpec::parse("DSA", "1024").is_err());
        assert!(KeySpec::parse("ECDSA", "brainpoolP256r1").is_err());
    }
}
