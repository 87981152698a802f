//! Deciding whether a client may use a worker.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use log::trace;
use openssl::memcmp;
use openssl::nid::Nid;
use openssl::x509::X509Ref;
use crate::commons::crypto::algorithm::DigestAlgorithm;
use crate::commons::crypto::cert;
use crate::commons::error::Error;
use crate::server::context::RequestContext;
use crate::server::worker::{props, WorkerConfig};

/// Property prefix of the client certificate rules.
pub const AUTHCLIENT_PREFIX: &str = "AUTHCLIENT";

/// Property prefix of the users of the username authorizer.
pub const USER_PREFIX: &str = "USER.";


//------------ Authorizer ----------------------------------------------------

#[derive(Debug)]
pub enum Authorizer {
    /// Everyone may use the worker.
    NoAuth,

    /// Clients must present a certificate matching one of the rules.
    ClientCert {
        worker_id: u32,
        rules: Vec<ClientRule>,
    },

    /// Clients must present a known username and password.
    Username {
        users: HashMap<String, UserEntry>,
    },

    /// Only requests forwarded by a dispatcher are accepted.
    Dispatched,
}

impl Authorizer {
    /// Creates the authorizer from the `AUTHTYPE` property.
    ///
    /// Problems with the configuration are added to `errors`.
    pub fn from_properties(
        worker_id: u32,
        config: &WorkerConfig,
        errors: &mut Vec<String>,
    ) -> Self {
        let auth_type = config.get_non_empty(props::AUTHTYPE)
            .unwrap_or("CLIENTCERT").to_uppercase();
        match auth_type.as_str() {
            "NOAUTH" => Authorizer::NoAuth,
            "DISPATCHED" => Authorizer::Dispatched,
            "CLIENTCERT" => {
                let mut rules = Vec::new();
                for (_, value) in config.with_prefix(AUTHCLIENT_PREFIX) {
                    match ClientRule::from_str(value) {
                        Ok(rule) => rules.push(rule),
                        Err(err) => errors.push(err),
                    }
                }
                Authorizer::ClientCert { worker_id, rules }
            }
            "USERNAME" => {
                let mut users = HashMap::new();
                for (name, value) in config.with_prefix(USER_PREFIX) {
                    match UserEntry::from_str(value) {
                        Ok(entry) => {
                            users.insert(name.to_uppercase(), entry);
                        }
                        Err(err) => errors.push(format!(
                            "Illegal value for {USER_PREFIX}{name}: {err}"
                        )),
                    }
                }
                Authorizer::Username { users }
            }
            _ => {
                errors.push(format!("Unsupported AUTHTYPE: {auth_type}"));
                Authorizer::ClientCert { worker_id, rules: Vec::new() }
            }
        }
    }

    /// Returns the name of the authorization type for the worker log.
    pub fn auth_type(&self) -> &'static str {
        match self {
            Authorizer::NoAuth => "NOAUTH",
            Authorizer::ClientCert { .. } => "CLIENTCERT",
            Authorizer::Username { .. } => "USERNAME",
            Authorizer::Dispatched => "DISPATCHED",
        }
    }

    /// Checks whether the client of a request is authorized.
    pub fn is_authorized(&self, context: &RequestContext) -> Result<(), Error> {
        match self {
            Authorizer::NoAuth => Ok(()),
            Authorizer::Dispatched => {
                if context.is_dispatched() {
                    Ok(())
                }
                else {
                    Err(Error::illegal_request(
                        "Dispatched authorization required"
                    ))
                }
            }
            Authorizer::ClientCert { worker_id, rules } => {
                let cert = context.client_certificate().ok_or_else(|| {
                    Error::illegal_request(
                        "Error, client authentication is required."
                    )
                })?;
                if rules.iter().any(|rule| rule.matches(cert)) {
                    Ok(())
                }
                else {
                    let serial = cert::serial_hex(cert).unwrap_or_default();
                    Err(Error::illegal_request(format!(
                        "Worker {}: Client is not authorized: \
                         SN: {}, issuer DN: {}",
                        worker_id, serial, cert::issuer_dn(cert)
                    )))
                }
            }
            Authorizer::Username { users } => {
                let credentials = context.credentials().ok_or_else(|| {
                    Error::AuthorizationRequired(
                        "Username/password authentication required".into()
                    )
                })?;

                // Unknown users are checked against a dummy entry so both
                // paths take the same time.
                let name = credentials.username.to_uppercase();
                let unknown = UserEntry::UNKNOWN;
                let (entry, known) = match users.get(&name) {
                    Some(entry) => (entry, true),
                    None => (&unknown, false),
                };
                if entry.verify(&credentials.password) && known {
                    Ok(())
                }
                else {
                    trace!("Authentication denied for user '{}'", name);
                    Err(Error::AuthorizationRequired(
                        "Authentication denied".into()
                    ))
                }
            }
        }
    }
}


//------------ ClientRule ----------------------------------------------------

/// A rule matching client certificates.
///
/// Rules are written as `<TYPE>:<value>;<issuer DN>`. A rule without a
/// type matches on the serial number.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientRule {
    matcher: ClientMatcher,
    value: String,
    issuer: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientMatcher {
    SerialNumber,
    SubjectCommonName,
    SubjectSerialNumber,
}

impl ClientRule {
    pub fn matches(&self, cert: &X509Ref) -> bool {
        if cert::normalize_dn(&cert::issuer_dn(cert)) != self.issuer {
            return false
        }
        match self.matcher {
            ClientMatcher::SerialNumber => {
                cert::serial_hex(cert).is_ok_and(|hex| hex == self.value)
            }
            ClientMatcher::SubjectCommonName => {
                cert::subject_rdn(cert, Nid::COMMONNAME)
                    .is_some_and(|cn| cn == self.value)
            }
            ClientMatcher::SubjectSerialNumber => {
                cert::subject_rdn(cert, Nid::SERIALNUMBER)
                    .is_some_and(|sn| sn == self.value)
            }
        }
    }
}

impl FromStr for ClientRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (subject, issuer) = s.split_once(';').ok_or_else(|| {
            format!("Illegal client rule, missing issuer DN: {s}")
        })?;
        let (matcher, value) = match subject.split_once(':') {
            Some((kind, value)) => {
                let matcher = match kind.trim().to_uppercase().as_str() {
                    "CERTIFICATE_SERIALNO" => ClientMatcher::SerialNumber,
                    "SUBJECT_RDN_CN" => ClientMatcher::SubjectCommonName,
                    "SUBJECT_RDN_SERIALNO" => {
                        ClientMatcher::SubjectSerialNumber
                    }
                    other => {
                        return Err(format!(
                            "Illegal client rule, unsupported type: {other}"
                        ))
                    }
                };
                (matcher, value.trim())
            }
            None => (ClientMatcher::SerialNumber, subject.trim()),
        };
        let value = match matcher {
            ClientMatcher::SerialNumber => {
                let hex = value.to_lowercase();
                let hex = hex.trim_start_matches('0');
                if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(format!(
                        "Illegal client rule, serial number is not hex: {value}"
                    ))
                }
                if hex.is_empty() { "0".to_string() } else { hex.to_string() }
            }
            _ => value.to_string(),
        };
        if value.is_empty() || issuer.trim().is_empty() {
            return Err(format!("Illegal client rule: {s}"))
        }
        Ok(ClientRule {
            matcher,
            value,
            issuer: cert::normalize_dn(issuer),
        })
    }
}


//------------ UserEntry -----------------------------------------------------

/// The stored password of a user.
///
/// Either the plain password or `<hex digest>:<ALG>[:<salt>]` where the
/// digest is taken over the password followed by the salt.
#[derive(Clone, Eq, PartialEq)]
pub enum UserEntry {
    Plain(String),
    Hashed {
        digest: Vec<u8>,
        alg: DigestAlgorithm,
        salt: String,
    },
}

impl UserEntry {
    const UNKNOWN: UserEntry = UserEntry::Hashed {
        digest: Vec::new(),
        alg: DigestAlgorithm::Sha256,
        salt: String::new(),
    };

    pub fn verify(&self, password: &str) -> bool {
        match self {
            UserEntry::Plain(stored) => {
                stored.len() == password.len()
                    && memcmp::eq(stored.as_bytes(), password.as_bytes())
            }
            UserEntry::Hashed { digest, alg, salt } => {
                let mut input = password.as_bytes().to_vec();
                input.extend_from_slice(salt.as_bytes());
                match alg.digest(&input) {
                    Ok(computed) => {
                        computed.len() == digest.len()
                            && memcmp::eq(&computed, digest)
                    }
                    Err(_) => false,
                }
            }
        }
    }
}

impl FromStr for UserEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let first = parts.next().unwrap_or_default();
        let alg = match parts.next() {
            None => return Ok(UserEntry::Plain(s.to_string())),
            Some(alg) => alg,
        };
        let alg = match alg.trim().to_uppercase().as_str() {
            "SHA1" | "SHA256" | "SHA512" => {
                DigestAlgorithm::from_str(alg).map_err(|e| e.to_string())?
            }
            other => {
                return Err(format!("unsupported hash algorithm: {other}"))
            }
        };
        let digest = hex::decode(first.trim())
            .map_err(|_| "hashed password is not hex".to_string())?;
        if digest.len() != alg.digest_len() {
            return Err(format!("wrong length for a {alg} digest"))
        }
        Ok(UserEntry::Hashed {
            digest,
            alg,
            salt: parts.next().unwrap_or_default().to_string(),
        })
    }
}

impl fmt::Debug for UserEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UserEntry::Plain(_) => f.write_str("Plain(..)"),
            UserEntry::Hashed { alg, .. } => {
                write!(f, "Hashed({alg})")
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------
