//! Crypto tokens backed by a PKCS#11 library.
//!
//! Each library is loaded and initialized once per process. An activated
//! token keeps one logged in session for the lifetime of the activation
//! and hands out further sessions from an r2d2 pool. Since a login applies
//! to all sessions of an application with the token, pooled sessions are
//! logged in as well.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use backoff::ExponentialBackoff;
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as Pkcs11Error, RvError};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{
    Attribute, AttributeType, CertificateType, KeyType, ObjectClass,
    ObjectHandle,
};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::x509::X509;
use r2d2::PooledConnection;
use secrecy::{ExposeSecret, SecretString};
use crate::commons::crypto::algorithm::{
    DigestAlgorithm, KeyKind, SignatureAlgorithm
};
use crate::server::worker::{WorkerConfig, props};
use super::{CryptoInstance, Curve, KeySpec, SigningKey, TokenError};


/// The provider name of PKCS#11 instances.
pub const PROVIDER: &str = "PKCS11";

/// The maximum number of pooled sessions per token.
const MAX_SESSIONS: u32 = 10;

/// The time to wait before retrying a failed operation.
const RETRY_REQ_AFTER: Duration = Duration::from_secs(2);

/// The factor by which the retry wait grows.
const RETRY_REQ_AFTER_MULTIPLIER: f64 = 1.5;

/// The time after which to stop retrying.
const RETRY_REQ_UNTIL_MAX: Duration = Duration::from_secs(30);

/// DER encoded curve OIDs for the EC_PARAMS attribute.
const PRIME256V1_PARAMS: &[u8] = &[
    0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07
];
const SECP384R1_PARAMS: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22];


//------------ Libraries -----------------------------------------------------

lazy_static! {
    /// The loaded libraries keyed by their path.
    static ref LIBRARIES: Mutex<HashMap<PathBuf, Arc<Pkcs11>>> = {
        Mutex::new(HashMap::new())
    };
}

/// Returns the initialized library at the given path, loading it if needed.
fn library(path: &Path) -> Result<Arc<Pkcs11>, TokenError> {
    let mut libraries = LIBRARIES.lock().unwrap();
    if let Some(ctx) = libraries.get(path) {
        return Ok(ctx.clone())
    }

    let ctx = Pkcs11::new(path).map_err(|err| {
        TokenError::Offline(format!(
            "Unable to load PKCS#11 library {}: {}", path.display(), err
        ))
    })?;
    match ctx.initialize(CInitializeArgs::OsThreads) {
        Ok(())
        | Err(Pkcs11Error::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {}
        Err(err) => {
            return Err(TokenError::Offline(format!(
                "Unable to initialize PKCS#11 library {}: {}",
                path.display(), err
            )))
        }
    }
    info!("Loaded PKCS#11 library {}", path.display());
    let ctx = Arc::new(ctx);
    libraries.insert(path.to_path_buf(), ctx.clone());
    Ok(ctx)
}


//------------ SlotSelector --------------------------------------------------

/// How to find the slot of the token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SlotSelector {
    /// The slot with the given id.
    Number(u64),

    /// The n-th slot with a token present.
    Index(usize),

    /// The slot whose token carries the given label.
    Label(String),
}

impl SlotSelector {
    fn find(&self, ctx: &Pkcs11) -> Result<Slot, TokenError> {
        let slots = ctx.get_slots_with_token().map_err(token_error)?;
        let found = match self {
            SlotSelector::Number(id) => {
                slots.into_iter().find(|slot| slot.id() == *id)
            }
            SlotSelector::Index(idx) => slots.get(*idx).copied(),
            SlotSelector::Label(label) => {
                slots.into_iter().find(|slot| {
                    ctx.get_token_info(*slot).is_ok_and(|info| {
                        info.label().trim_end() == label
                    })
                })
            }
        };
        found.ok_or_else(|| {
            TokenError::Offline(format!("No PKCS#11 token found in slot {self}"))
        })
    }
}

impl fmt::Display for SlotSelector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SlotSelector::Number(id) => write!(f, "number {id}"),
            SlotSelector::Index(idx) => write!(f, "index {idx}"),
            SlotSelector::Label(label) => write!(f, "labelled '{label}'"),
        }
    }
}


//------------ SessionManager ------------------------------------------------

/// Opens read/write sessions for the pool.
#[derive(Debug)]
struct SessionManager {
    ctx: Arc<Pkcs11>,
    slot: Slot,
}

impl r2d2::ManageConnection for SessionManager {
    type Connection = Session;
    type Error = Pkcs11Error;

    fn connect(&self) -> Result<Session, Pkcs11Error> {
        self.ctx.open_rw_session(self.slot)
    }

    fn is_valid(&self, session: &mut Session) -> Result<(), Pkcs11Error> {
        session.get_session_info().map(|_| ())
    }

    fn has_broken(&self, _session: &mut Session) -> bool {
        false
    }
}

/// The state of an activated token.
struct ActiveSlot {
    pool: r2d2::Pool<SessionManager>,

    /// Keeps the login alive while the token is active.
    login_session: Mutex<Session>,
}


//------------ Pkcs11Token ---------------------------------------------------

pub struct Pkcs11Token {
    library: PathBuf,
    slot: SlotSelector,
    pin: Option<SecretString>,
    default_key: Option<String>,
    generation_limit: Option<usize>,
    active: RwLock<Option<Arc<ActiveSlot>>>,
}

impl fmt::Debug for Pkcs11Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pkcs11Token")
            .field("library", &self.library)
            .field("slot", &self.slot)
            .field("default_key", &self.default_key)
            .field("generation_limit", &self.generation_limit)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Pkcs11Token {
    /// Creates a token from worker properties.
    ///
    /// All configuration problems are reported together.
    pub fn from_properties(
        config: &WorkerConfig,
        libraries: &HashMap<String, PathBuf>,
    ) -> Result<Self, TokenError> {
        let mut errors = Vec::new();

        let library = match (
            config.get_non_empty("SHAREDLIBRARY"),
            config.get_non_empty("SHAREDLIBRARYNAME"),
        ) {
            (Some(_), Some(_)) => {
                errors.push(
                    "Can not specify both SHAREDLIBRARY and \
                     SHAREDLIBRARYNAME at the same time".to_string()
                );
                None
            }
            (Some(path), None) => Some(PathBuf::from(path)),
            (None, Some(name)) => match libraries.get(name) {
                Some(path) => Some(path.clone()),
                None => {
                    errors.push(format!(
                        "SHAREDLIBRARYNAME {name} is not referring to a \
                         defined value"
                    ));
                    None
                }
            }
            (None, None) => {
                errors.push(
                    "Missing SHAREDLIBRARYNAME property".to_string()
                );
                None
            }
        };

        let slot = match Self::slot_selector(config) {
            Ok(slot) => Some(slot),
            Err(err) => {
                errors.push(err);
                None
            }
        };

        let generation_limit = match config.get_non_empty("KEYGENERATIONLIMIT") {
            None => None,
            Some(value) => match value.parse::<usize>() {
                Ok(limit) => Some(limit),
                Err(_) => {
                    errors.push(format!(
                        "Illegal value for KEYGENERATIONLIMIT: {value}"
                    ));
                    None
                }
            }
        };

        match (library, slot) {
            (Some(library), Some(slot)) if errors.is_empty() => {
                Ok(Pkcs11Token {
                    library,
                    slot,
                    pin: config.get_non_empty("PIN").map(|pin| {
                        SecretString::new(pin.to_string())
                    }),
                    default_key: config.get_non_empty(props::DEFAULTKEY)
                        .map(ToString::to_string),
                    generation_limit,
                    active: RwLock::new(None),
                })
            }
            _ => Err(TokenError::Initialization(errors))
        }
    }

    fn slot_selector(config: &WorkerConfig) -> Result<SlotSelector, String> {
        let legacy = config.get_non_empty("SLOT");
        let value = config.get_non_empty("SLOTLABELVALUE");
        let label_type = config.get_non_empty("SLOTLABELTYPE");

        if let Some(slot) = legacy {
            if value.is_some() {
                return Err(
                    "Can not specify both SLOT and SLOTLABELVALUE at the \
                     same time".to_string()
                )
            }
            return slot.parse().map(SlotSelector::Number).map_err(|_| {
                format!("Illegal value for SLOT: {slot}")
            })
        }

        let value = value.ok_or_else(|| {
            "Missing SLOTLABELVALUE property".to_string()
        })?;
        match label_type.map(str::to_uppercase).as_deref() {
            Some("SLOT_NUMBER") => {
                value.parse().map(SlotSelector::Number).map_err(|_| {
                    format!("Illegal slot number: {value}")
                })
            }
            Some("SLOT_INDEX") => {
                value.trim_start_matches('i').parse()
                    .map(SlotSelector::Index)
                    .map_err(|_| format!("Illegal slot index: {value}"))
            }
            Some("SLOT_LABEL") | None => {
                Ok(SlotSelector::Label(value.to_string()))
            }
            Some(other) => Err(format!("Illegal SLOTLABELTYPE: {other}")),
        }
    }

    pub fn default_key(&self) -> Option<&str> {
        self.default_key.as_deref()
    }

    pub fn auto_activate(&self) -> Option<Result<(), TokenError>> {
        self.pin.as_ref().map(|pin| self.activate(pin.expose_secret()))
    }

    /// Logs in to the token.
    ///
    /// A wrong PIN fails right away, all other failures are retried for a
    /// while before the token is considered offline.
    pub fn activate(&self, pin: &str) -> Result<(), TokenError> {
        if self.is_active() {
            return Ok(())
        }
        let ctx = library(&self.library)?;
        let slot = self.slot.find(&ctx)?;

        let login_session = retry("PKCS#11 login", || {
            let session = ctx.open_rw_session(slot)
                .map_err(|err| backoff::Error::transient(token_error(err)))?;
            match session.login(UserType::User, Some(&AuthPin::new(pin.to_string().into()))) {
                Ok(())
                | Err(Pkcs11Error::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {
                    Ok(session)
                }
                Err(err) => match token_error(err) {
                    err @ TokenError::Authentication(_) => {
                        Err(backoff::Error::permanent(err))
                    }
                    err => Err(backoff::Error::transient(err)),
                }
            }
        })?;

        let pool = r2d2::Pool::builder()
            .max_size(MAX_SESSIONS)
            .build_unchecked(SessionManager { ctx, slot });

        *self.active.write().unwrap() = Some(Arc::new(ActiveSlot {
            pool,
            login_session: Mutex::new(login_session),
        }));
        info!(
            "Activated PKCS#11 token in slot {} of {}",
            self.slot, self.library.display()
        );
        Ok(())
    }

    pub fn deactivate(&self) {
        if let Some(active) = self.active.write().unwrap().take() {
            if let Err(err) = active.login_session.lock().unwrap().logout() {
                warn!("PKCS#11 logout failed: {err}");
            }
            info!("Deactivated PKCS#11 token in slot {}", self.slot);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.read().unwrap().is_some()
    }

    fn active(&self) -> Result<Arc<ActiveSlot>, TokenError> {
        self.active.read().unwrap().clone().ok_or_else(|| {
            TokenError::Offline("Crypto token is not active".into())
        })
    }

    /// Returns a pooled session, retrying if none can be had.
    fn session(
        &self
    ) -> Result<PooledConnection<SessionManager>, TokenError> {
        let active = self.active()?;
        retry("PKCS#11 session", || {
            active.pool.get().map_err(|err| {
                backoff::Error::transient(TokenError::Offline(format!(
                    "Unable to get PKCS#11 session: {err}"
                )))
            })
        })
    }

    pub fn acquire(&self, alias: &str) -> Result<CryptoInstance, TokenError> {
        let session = self.session()?;
        let (handle, kind) = find_private_key(&session, alias)?.ok_or_else(|| {
            TokenError::NoSuchAlias(alias.to_string())
        })?;
        let chain = find_certificates(&session, alias)?;
        debug!("Acquired PKCS#11 key '{alias}'");
        Ok(CryptoInstance::new(
            alias,
            SigningKey::Pkcs11(Pkcs11Key {
                session: Mutex::new(session),
                handle,
                kind,
            }),
            PROVIDER,
            chain,
        ))
    }

    pub fn generate_key(
        &self,
        spec: KeySpec,
        alias: &str,
    ) -> Result<(), TokenError> {
        let session = self.session()?;
        if let Some(limit) = self.generation_limit {
            let count = session.find_objects(&[
                Attribute::Class(ObjectClass::PRIVATE_KEY)
            ]).map_err(token_error)?.len();
            if count >= limit {
                return Err(TokenError::OutOfSpace(
                    format!("Key generation limit exceeded: {limit}")
                ))
            }
        }
        if find_private_key(&session, alias)?.is_some() {
            return Err(TokenError::InvalidParameter(
                format!("Key with alias '{alias}' already exists")
            ))
        }

        let label = alias.as_bytes().to_vec();
        let (mechanism, mut public) = match spec {
            KeySpec::Rsa(bits) => (
                Mechanism::RsaPkcsKeyPairGen,
                vec![
                    Attribute::ModulusBits(u64::from(bits).into()),
                    Attribute::PublicExponent(vec![0x01, 0x00, 0x01]),
                ],
            ),
            KeySpec::Ec(curve) => (
                Mechanism::EccKeyPairGen,
                vec![Attribute::EcParams(match curve {
                    Curve::P256 => PRIME256V1_PARAMS.to_vec(),
                    Curve::P384 => SECP384R1_PARAMS.to_vec(),
                })],
            ),
        };
        public.extend([
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::Label(label.clone()),
        ]);
        let private = [
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Sign(true),
            Attribute::Label(label),
        ];
        session.generate_key_pair(&mechanism, &public, &private)
            .map_err(|err| TokenError::Pkcs11(err.to_string()))?;
        info!("Generated PKCS#11 key '{alias}'");
        Ok(())
    }

    pub fn remove_key(&self, alias: &str) -> Result<(), TokenError> {
        let session = self.session()?;
        let label = Attribute::Label(alias.as_bytes().to_vec());
        let mut found = false;
        for class in [
            ObjectClass::PRIVATE_KEY,
            ObjectClass::PUBLIC_KEY,
            ObjectClass::CERTIFICATE,
        ] {
            let handles = session.find_objects(
                &[Attribute::Class(class), label.clone()]
            ).map_err(token_error)?;
            for handle in handles {
                if class == ObjectClass::PRIVATE_KEY {
                    found = true;
                }
                session.destroy_object(handle)
                    .map_err(|err| TokenError::Pkcs11(err.to_string()))?;
            }
        }
        if found {
            Ok(())
        }
        else {
            Err(TokenError::NoSuchAlias(alias.to_string()))
        }
    }

    /// Stores a certificate chain as certificate objects for the key.
    ///
    /// The objects carry the alias as label and their position in the chain
    /// as id. Any previously stored chain is removed.
    pub fn import_certificate_chain(
        &self,
        alias: &str,
        chain: &[X509],
    ) -> Result<(), TokenError> {
        let session = self.session()?;
        if find_private_key(&session, alias)?.is_none() {
            return Err(TokenError::NoSuchAlias(alias.to_string()))
        }
        let label = alias.as_bytes().to_vec();
        let old = session.find_objects(&[
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::Label(label.clone()),
        ]).map_err(token_error)?;
        for handle in old {
            session.destroy_object(handle)
                .map_err(|err| TokenError::Pkcs11(err.to_string()))?;
        }
        for (idx, cert) in chain.iter().enumerate() {
            session.create_object(&[
                Attribute::Class(ObjectClass::CERTIFICATE),
                Attribute::CertificateType(CertificateType::X_509),
                Attribute::Token(true),
                Attribute::Label(label.clone()),
                Attribute::Id(vec![idx as u8]),
                Attribute::Value(cert.to_der()?),
            ]).map_err(|err| TokenError::Pkcs11(err.to_string()))?;
        }
        Ok(())
    }

    pub fn aliases(&self) -> Result<Vec<String>, TokenError> {
        let session = self.session()?;
        let handles = session.find_objects(&[
            Attribute::Class(ObjectClass::PRIVATE_KEY)
        ]).map_err(token_error)?;
        let mut res = Vec::new();
        for handle in handles {
            let attrs = session.get_attributes(
                handle, &[AttributeType::Label]
            ).map_err(token_error)?;
            for attr in attrs {
                if let Attribute::Label(label) = attr {
                    res.push(String::from_utf8_lossy(&label).into_owned());
                }
            }
        }
        res.sort();
        Ok(res)
    }
}

fn find_private_key(
    session: &Session, alias: &str
) -> Result<Option<(ObjectHandle, KeyKind)>, TokenError> {
    let handle = session.find_objects(&[
        Attribute::Class(ObjectClass::PRIVATE_KEY),
        Attribute::Label(alias.as_bytes().to_vec()),
    ]).map_err(token_error)?.into_iter().next();
    let handle = match handle {
        Some(handle) => handle,
        None => return Ok(None),
    };
    let attrs = session.get_attributes(handle, &[AttributeType::KeyType])
        .map_err(token_error)?;
    let kind = attrs.into_iter().find_map(|attr| match attr {
        Attribute::KeyType(key_type) if key_type == KeyType::EC => {
            Some(KeyKind::Ec)
        }
        Attribute::KeyType(key_type) if key_type == KeyType::RSA => {
            Some(KeyKind::Rsa)
        }
        _ => None,
    }).ok_or_else(|| {
        TokenError::InvalidParameter(
            format!("Key '{alias}' is neither an RSA nor an EC key")
        )
    })?;
    Ok(Some((handle, kind)))
}

/// Returns the certificates stored for a key, ordered by their id.
fn find_certificates(
    session: &Session, alias: &str
) -> Result<Vec<X509>, TokenError> {
    let handles = session.find_objects(&[
        Attribute::Class(ObjectClass::CERTIFICATE),
        Attribute::Label(alias.as_bytes().to_vec()),
    ]).map_err(token_error)?;
    let mut certs = Vec::new();
    for handle in handles {
        let mut id = Vec::new();
        let mut value = None;
        for attr in session.get_attributes(
            handle, &[AttributeType::Id, AttributeType::Value]
        ).map_err(token_error)? {
            match attr {
                Attribute::Id(bytes) => id = bytes,
                Attribute::Value(bytes) => value = Some(bytes),
                _ => {}
            }
        }
        if let Some(value) = value {
            certs.push((id, X509::from_der(&value)?));
        }
    }
    certs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(certs.into_iter().map(|(_, cert)| cert).collect())
}


//------------ Pkcs11Key -----------------------------------------------------

/// A private key in a PKCS#11 token together with the session to use it.
pub struct Pkcs11Key {
    session: Mutex<PooledConnection<SessionManager>>,
    handle: ObjectHandle,
    kind: KeyKind,
}

impl Pkcs11Key {
    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn sign(
        &self,
        alg: SignatureAlgorithm,
        data: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        let session = self.session.lock().unwrap();
        match self.kind {
            KeyKind::Rsa => {
                let mechanism = match alg.digest() {
                    DigestAlgorithm::Sha1 => Mechanism::Sha1RsaPkcs,
                    DigestAlgorithm::Sha224 => Mechanism::Sha224RsaPkcs,
                    DigestAlgorithm::Sha256 => Mechanism::Sha256RsaPkcs,
                    DigestAlgorithm::Sha384 => Mechanism::Sha384RsaPkcs,
                    DigestAlgorithm::Sha512 => Mechanism::Sha512RsaPkcs,
                };
                session.sign(&mechanism, self.handle, data)
                    .map_err(token_error)
            }
            KeyKind::Ec => {
                let digest = alg.digest().digest(data)?;
                let raw = session.sign(&Mechanism::Ecdsa, self.handle, &digest)
                    .map_err(token_error)?;
                ecdsa_raw_to_der(&raw)
            }
        }
    }
}

/// Converts a raw `r || s` ECDSA signature into its DER form.
fn ecdsa_raw_to_der(raw: &[u8]) -> Result<Vec<u8>, TokenError> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(TokenError::Pkcs11(
            format!("Invalid ECDSA signature length: {}", raw.len())
        ))
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    let sig = EcdsaSig::from_private_components(
        BigNum::from_slice(r)?, BigNum::from_slice(s)?
    )?;
    Ok(sig.to_der()?)
}


//------------ Helpers -------------------------------------------------------

/// Converts a PKCS#11 error.
///
/// PIN problems are authentication errors, everything else means the token
/// is not usable right now.
fn token_error(err: Pkcs11Error) -> TokenError {
    match err {
        Pkcs11Error::Pkcs11(
            RvError::PinIncorrect | RvError::PinInvalid | RvError::PinLenRange,
            _
        ) => TokenError::Authentication(err.to_string()),
        _ => TokenError::Offline(err.to_string()),
    }
}

/// Runs an operation, retrying transient failures with exponential backoff.
fn retry<T, F>(desc: &str, op: F) -> Result<T, TokenError>
where
    F: FnMut() -> Result<T, backoff::Error<TokenError>>,
{
    let backoff_policy = ExponentialBackoff {
        initial_interval: RETRY_REQ_AFTER,
        multiplier: RETRY_REQ_AFTER_MULTIPLIER,
        max_elapsed_time: Some(RETRY_REQ_UNTIL_MAX),
        ..Default::default()
    };
    let notify = |err, next: Duration| {
        warn!(
            "{} failed, retrying in {} seconds: {}",
            desc, next.as_secs(), err
        );
    };
    backoff::retry_notify(backoff_policy, op, notify).map_err(|err| {
        match err {
            backoff::Error::Permanent(err) => err,
            backoff::Error::Transient { err, .. } => err,
        }
    })
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> WorkerConfig {
        pairs.iter().copied().collect()
    }

    fn init_errors(
        config: &WorkerConfig, libraries: &HashMap<String, PathBuf>
    ) -> Vec<String> {
        match Pkcs11Token::from_properties(config, libraries) {
            Err(TokenError::Initialization(errors)) => errors,
            other => panic!("expected initialization error: {other:?}"),
        }
    }

    #[test]
    fn all_configuration_errors_are_reported() {
        let errors = init_errors(
            &config(&[
                ("SHAREDLIBRARY", "/usr/lib/softhsm/libsofthsm2.so"),
                ("SHAREDLIBRARYNAME", "SoftHSM"),
                ("SLOT", "1"),
                ("SLOTLABELVALUE", "Token"),
                ("KEYGENERATIONLIMIT", "-1"),
            ]),
            &HashMap::new(),
        );
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("both SHAREDLIBRARY and SHAREDLIBRARYNAME"));
        assert!(errors[1].contains("both SLOT and SLOTLABELVALUE"));
        assert!(errors[2].contains("KEYGENERATIONLIMIT"));
    }

    #[test]
    fn library_names_are_resolved() {
        let mut libraries = HashMap::new();
        libraries.insert(
            "SoftHSM".to_string(),
            PathBuf::from("/usr/lib/softhsm/libsofthsm2.so")
        );
        let token = Pkcs11Token::from_properties(
            &config(&[
                ("SHAREDLIBRARYNAME", "SoftHSM"),
                ("SLOTLABELTYPE", "SLOT_INDEX"),
                ("SLOTLABELVALUE", "0"),
                ("PIN", "1234"),
            ]),
            &libraries,
        ).unwrap();
        assert_eq!(token.library, PathBuf::from("/usr/lib/softhsm/libsofthsm2.so"));
        assert_eq!(token.slot, SlotSelector::Index(0));
        assert!(!token.is_active());

        let errors = init_errors(
            &config(&[
                ("SHAREDLIBRARYNAME", "Unknown"),
                ("SLOTLABELVALUE", "Token"),
            ]),
            &libraries,
        );
        assert_eq!(
            errors,
            vec!["SHAREDLIBRARYNAME Unknown is not referring to a defined value"]
        );
    }

    #[test]
    fn slot_selectors() {
        let select = |pairs: &[(&str, &str)]| {
            Pkcs11Token::slot_selector(&config(pairs))
        };
        assert_eq!(select(&[("SLOT", "3")]), Ok(SlotSelector::Number(3)));
        assert_eq!(
            select(&[("SLOTLABELTYPE", "SLOT_NUMBER"), ("SLOTLABELVALUE", "7")]),
            Ok(SlotSelector::Number(7))
        );
        assert_eq!(
            select(&[("SLOTLABELTYPE", "SLOT_LABEL"), ("SLOTLABELVALUE", "Signer")]),
            Ok(SlotSelector::Label("Signer".into()))
        );
        assert!(select(&[("SLOTLABELTYPE", "SLOT_NUMBER"), ("SLOTLABELVALUE", "x")]).is_err());
        assert!(select(&[("SLOTLABELTYPE", "SLOT_UUID"), ("SLOTLABELVALUE", "x")]).is_err());
        assert!(select(&[]).is_err());
    }

    #[test]
    fn raw_ecdsa_signatures() {
        let mut raw = vec![0u8; 64];
        raw[31] = 1;
        raw[63] = 2;
        let der = ecdsa_raw_to_der(&raw).unwrap();
        assert_eq!(der, vec![0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x02]);
        assert!(ecdsa_raw_to_der(&[1, 2, 3]).is_err());
    }

    /// Runs against SoftHSM when the library is available.
    #[cfg(feature = "hsm-tests-pkcs11")]
    #[test]
    fn softhsm_generate_and_sign() {
        let token = Pkcs11Token::from_properties(
            &config(&[
                ("SHAREDLIBRARY", "/usr/lib/softhsm/libsofthsm2.so"),
                ("SLOTLABELTYPE", "SLOT_LABEL"),
                ("SLOTLABELVALUE", "SignServer"),
                ("PIN", "1234"),
            ]),
            &HashMap::new(),
        ).unwrap();
        token.auto_activate().unwrap().unwrap();
        let _ = token.remove_key("hsm-test");
        token.generate_key(KeySpec::Ec(Curve::P256), "hsm-test").unwrap();
        let instance = token.acquire("hsm-test").unwrap();
        instance.self_test().unwrap();
        token.remove_key("hsm-test").unwrap();
    }
}
