//! A software keystore: a directory of password protected key files.
//!
//! Every key is stored as `<alias>.json` holding the private key as PKCS#8
//! encrypted with the keystore password and the DER encoded certificate
//! chain, both base64 encoded.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use log::{debug, info};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::symm::Cipher;
use openssl::x509::{X509, X509NameBuilder};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use crate::commons::error::IoError;
use crate::commons::file;
use crate::server::worker::{WorkerConfig, props};
use super::{CryptoInstance, Curve, KeySpec, SigningKey, TokenError};


/// The provider name of keystore instances.
pub const PROVIDER: &str = "OpenSSL";

const KEY_FILE_EXTENSION: &str = "json";


//------------ KeystoreToken -------------------------------------------------

#[derive(Debug)]
pub struct KeystoreToken {
    dir: PathBuf,
    auto_activation: Option<String>,
    default_key: Option<String>,
    generation_limit: Option<usize>,
    state: RwLock<Option<Unlocked>>,
}

/// The keys of an activated keystore.
struct Unlocked {
    password: String,
    keys: HashMap<String, (PKey<Private>, Vec<X509>)>,
}

impl std::fmt::Debug for Unlocked {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Unlocked")
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl KeystoreToken {
    pub fn from_properties(config: &WorkerConfig) -> Result<Self, TokenError> {
        let mut errors = Vec::new();

        let dir = config.get_non_empty("KEYSTOREPATH").map(PathBuf::from);
        if dir.is_none() {
            errors.push("Missing KEYSTOREPATH property".to_string());
        }

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

        match dir {
            Some(dir) if errors.is_empty() => {
                Ok(KeystoreToken {
                    dir,
                    auto_activation: config.get("KEYSTOREPASSWORD")
                        .map(ToString::to_string),
                    default_key: config.get_non_empty(props::DEFAULTKEY)
                        .map(ToString::to_string),
                    generation_limit,
                    state: RwLock::new(None),
                })
            }
            _ => Err(TokenError::Initialization(errors))
        }
    }

    pub fn default_key(&self) -> Option<&str> {
        self.default_key.as_deref()
    }

    pub fn auto_activate(&self) -> Option<Result<(), TokenError>> {
        self.auto_activation.as_ref().map(|code| self.activate(code))
    }

    /// Unlocks all keys in the keystore.
    pub fn activate(&self, password: &str) -> Result<(), TokenError> {
        if self.is_active() {
            return Ok(())
        }
        if !self.dir.is_dir() {
            return Err(TokenError::Offline(format!(
                "Keystore directory {} not found", self.dir.display()
            )))
        }

        let mut keys = HashMap::new();
        for alias in self.aliases()? {
            let stored: StoredKey = file::load_json(&self.key_path(&alias))?;
            let (key, chain) = stored.unlock(password)?;
            keys.insert(alias, (key, chain));
        }
        info!(
            "Activated keystore {} with {} key(s)",
            self.dir.display(), keys.len()
        );
        *self.state.write().unwrap() = Some(Unlocked {
            password: password.to_string(),
            keys,
        });
        Ok(())
    }

    pub fn deactivate(&self) {
        if self.state.write().unwrap().take().is_some() {
            info!("Deactivated keystore {}", self.dir.display());
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.read().unwrap().is_some()
    }

    pub fn acquire(&self, alias: &str) -> Result<CryptoInstance, TokenError> {
        let state = self.state.read().unwrap();
        let unlocked = state.as_ref().ok_or_else(not_active)?;
        let (key, chain) = unlocked.keys.get(alias).ok_or_else(|| {
            TokenError::NoSuchAlias(alias.to_string())
        })?;
        Ok(CryptoInstance::new(
            alias, SigningKey::Software(key.clone()), PROVIDER, chain.clone()
        ))
    }

    /// Generates a new key with a self-signed placeholder certificate.
    pub fn generate_key(
        &self,
        spec: KeySpec,
        alias: &str,
    ) -> Result<(), TokenError> {
        check_alias(alias)?;
        let mut state = self.state.write().unwrap();
        let unlocked = state.as_mut().ok_or_else(not_active)?;

        if let Some(limit) = self.generation_limit {
            if self.aliases()?.len() >= limit {
                return Err(TokenError::OutOfSpace(
                    format!("Key generation limit exceeded: {limit}")
                ))
            }
        }
        if unlocked.keys.contains_key(alias) {
            return Err(TokenError::InvalidParameter(
                format!("Key with alias '{alias}' already exists")
            ))
        }

        let key = match spec {
            KeySpec::Rsa(bits) => PKey::from_rsa(Rsa::generate(bits)?)?,
            KeySpec::Ec(curve) => {
                let nid = match curve {
                    Curve::P256 => Nid::X9_62_PRIME256V1,
                    Curve::P384 => Nid::SECP384R1,
                };
                let group = EcGroup::from_curve_name(nid)?;
                PKey::from_ec_key(EcKey::generate(&group)?)?
            }
        };
        let cert = placeholder_certificate(&key, alias)?;
        let chain = vec![cert];

        self.store(alias, &key, &chain, &unlocked.password)?;
        unlocked.keys.insert(alias.to_string(), (key, chain));
        debug!("Generated key '{alias}' in keystore {}", self.dir.display());
        Ok(())
    }

    pub fn remove_key(&self, alias: &str) -> Result<(), TokenError> {
        let path = self.key_path(alias);
        if !path.is_file() {
            return Err(TokenError::NoSuchAlias(alias.to_string()))
        }
        file::delete_file(&path)?;
        if let Some(unlocked) = self.state.write().unwrap().as_mut() {
            unlocked.keys.remove(alias);
        }
        Ok(())
    }

    pub fn import_certificate_chain(
        &self,
        alias: &str,
        leaf: &X509,
        chain: &[X509],
    ) -> Result<(), TokenError> {
        let mut state = self.state.write().unwrap();
        let unlocked = state.as_mut().ok_or_else(not_active)?;
        let password = unlocked.password.clone();
        let (key, stored_chain) = unlocked.keys.get_mut(alias).ok_or_else(|| {
            TokenError::NoSuchAlias(alias.to_string())
        })?;
        if !leaf.public_key()?.public_eq(key) {
            return Err(TokenError::InvalidParameter(format!(
                "Certificate does not match key '{alias}'"
            )))
        }
        self.store(alias, key, chain, &password)?;
        *stored_chain = chain.to_vec();
        Ok(())
    }

    /// Returns the aliases of all keys in the keystore directory.
    pub fn aliases(&self) -> Result<Vec<String>, TokenError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            IoError::new(
                format!("could not read dir: {}", self.dir.display()), e
            )
        })?;
        let mut res = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| {
                IoError::new(
                    format!("could not read dir: {}", self.dir.display()), e
                )
            })?.path();
            if path.extension().is_some_and(|ext| ext == KEY_FILE_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    res.push(stem.to_string());
                }
            }
        }
        res.sort();
        Ok(res)
    }

    fn store(
        &self,
        alias: &str,
        key: &PKey<Private>,
        chain: &[X509],
        password: &str,
    ) -> Result<(), TokenError> {
        let stored = StoredKey::lock(key, chain, password)?;
        file::save_json(&stored, &self.key_path(alias))?;
        Ok(())
    }

    fn key_path(&self, alias: &str) -> PathBuf {
        self.dir.join(format!("{alias}.{KEY_FILE_EXTENSION}"))
    }
}

fn not_active() -> TokenError {
    TokenError::Offline("Crypto token is not active".into())
}

fn check_alias(alias: &str) -> Result<(), TokenError> {
    let valid = !alias.is_empty() && alias.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
    }) && !alias.starts_with('.');
    if valid {
        Ok(())
    }
    else {
        Err(TokenError::InvalidParameter(format!("Invalid key alias: '{alias}'")))
    }
}

/// Creates a self-signed certificate for a freshly generated key.
fn placeholder_certificate(
    key: &PKey<Private>, alias: &str
) -> Result<X509, TokenError> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, alias)?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(63, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(serial.to_asn1_integer()?.as_ref())?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key)?;
    builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(Asn1Time::days_from_now(365)?.as_ref())?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}


//------------ StoredKey -----------------------------------------------------

/// The on-disk form of a keystore entry.
#[derive(Deserialize, Serialize)]
struct StoredKey {
    #[serde(
        serialize_with = "ser_base64",
        deserialize_with = "de_base64"
    )]
    key: Bytes,

    #[serde(
        serialize_with = "ser_base64_list",
        deserialize_with = "de_base64_list"
    )]
    chain: Vec<Bytes>,
}

impl StoredKey {
    fn lock(
        key: &PKey<Private>,
        chain: &[X509],
        password: &str,
    ) -> Result<Self, TokenError> {
        let key = key.private_key_to_pkcs8_passphrase(
            Cipher::aes_256_cbc(), password.as_bytes()
        )?;
        let chain = chain.iter().map(|cert| {
            cert.to_der().map(Bytes::from)
        }).collect::<Result<_, _>>()?;
        Ok(StoredKey { key: key.into(), chain })
    }

    fn unlock(
        &self, password: &str
    ) -> Result<(PKey<Private>, Vec<X509>), TokenError> {
        let key = PKey::private_key_from_pkcs8_passphrase(
            &self.key, password.as_bytes()
        ).map_err(|_| {
            TokenError::Authentication("Incorrect keystore password".into())
        })?;
        let chain = self.chain.iter().map(|der| {
            X509::from_der(der)
        }).collect::<Result<_, _>>()?;
        Ok((key, chain))
    }
}

fn ser_base64<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    BASE64.encode(bytes).serialize(s)
}

fn de_base64<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
    let s = String::deserialize(d)?;
    BASE64.decode(s).map(Bytes::from).map_err(de::Error::custom)
}

fn ser_base64_list<S: Serializer>(
    list: &[Bytes], s: S
) -> Result<S::Ok, S::Error> {
    list.iter().map(|b| BASE64.encode(b)).collect::<Vec<_>>().serialize(s)
}

fn de_base64_list<'de, D: Deserializer<'de>>(
    d: D
) -> Result<Vec<Bytes>, D::Error> {
    Vec::<String>::deserialize(d)?.into_iter().map(|s| {
        BASE64.decode(s).map(Bytes::from).map_err(de::Error::custom)
    }).collect()
}


/// Writes a key and its chain into a keystore directory.
///
/// Used to provision keystores with keys created elsewhere.
pub fn write_entry(
    dir: &Path,
    alias: &str,
    key: &PKey<Private>,
    chain: &[X509],
    password: &str,
) -> Result<(), TokenError> {
    check_alias(alias)?;
    let stored = StoredKey::lock(key, chain, password)?;
    file::save_json(&stored, &dir.join(format!("{alias}.{KEY_FILE_EXTENSION}")))?;
    Ok(())
}


//------------ Tests ---------------------------------------------------------
