//! The RFC 3161 time-stamp signer.

use std::str::FromStr;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bcder::Oid;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::debug;
use openssl::x509::{X509, X509NameBuilder};
use rand::RngCore;
use crate::commons::crypto::algorithm::{DigestAlgorithm, SignatureAlgorithm};
use crate::commons::crypto::cert::ExtendedKeyUsage;
use crate::commons::crypto::cms::{SignedDataBuilder, SigningCertificate};
use crate::commons::crypto::oid;
use crate::commons::crypto::token::CryptoInstance;
use crate::commons::crypto::tsp::{
    Accuracy, FailureInfo, TimeStampReq, TimeStampResp, TstInfo
};
use crate::commons::error::Error;
use crate::server::archive::Archivable;
use crate::server::context::RequestContext;
use crate::server::request::{SignatureRequest, SignatureResponse};
use crate::server::worker::{parse_bool, props, WorkerConfig};

pub const REQUEST_CONTENT_TYPE: &str = "application/timestamp-query";
pub const RESPONSE_CONTENT_TYPE: &str = "application/timestamp-reply";

const MIN_SERIAL_NUMBER_LENGTH: usize = 8;
const MAX_SERIAL_NUMBER_LENGTH: usize = 20;
const DEFAULT_SERIAL_NUMBER_LENGTH: usize = 8;

const STATUS_OK: &str = "Operation Okay";

/// Property names.
pub mod tsa_props {
    pub const TIMESOURCE: &str = "TIMESOURCE";
    pub const ACCEPTEDALGORITHMS: &str = "ACCEPTEDALGORITHMS";
    pub const ACCEPTEDPOLICIES: &str = "ACCEPTEDPOLICIES";
    pub const ACCEPTEDEXTENSIONS: &str = "ACCEPTEDEXTENSIONS";
    pub const DEFAULTTSAPOLICYOID: &str = "DEFAULTTSAPOLICYOID";
    pub const ACCURACYMICROS: &str = "ACCURACYMICROS";
    pub const ACCURACYMILLIS: &str = "ACCURACYMILLIS";
    pub const ACCURACYSECONDS: &str = "ACCURACYSECONDS";
    pub const ORDERING: &str = "ORDERING";
    pub const TSA: &str = "TSA";
    pub const TSA_FROM_CERT: &str = "TSA_FROM_CERT";
    pub const REQUIREVALIDCHAIN: &str = "REQUIREVALIDCHAIN";
    pub const MAXSERIALNUMBERLENGTH: &str = "MAXSERIALNUMBERLENGTH";
    pub const INCLUDESIGNINGTIMEATTRIBUTE: &str = "INCLUDESIGNINGTIMEATTRIBUTE";
    pub const CERTIFICATE_DIGEST_ALGORITHM: &str = "CERTIFICATE_DIGEST_ALGORITHM";
}

/// Worker log entries.
pub mod tsa_log_keys {
    pub const TSA_TIMESTAMPREQUEST_ENCODED: &str = "TSA_TIMESTAMPREQUEST_ENCODED";
    pub const TSA_TIMESTAMPRESPONSE_ENCODED: &str = "TSA_TIMESTAMPRESPONSE_ENCODED";
    pub const TSA_SERIALNUMBER: &str = "TSA_SERIALNUMBER";
    pub const TSA_TIME: &str = "TSA_TIME";
    pub const TSA_POLICYID: &str = "TSA_POLICYID";
    pub const TSA_PKISTATUS: &str = "TSA_PKISTATUS";
    pub const TSA_PKIFAILUREINFO: &str = "TSA_PKIFAILUREINFO";
    pub const TSA_PKISTATUS_STRING: &str = "TSA_PKISTATUS_STRING";
    pub const TSA_EXCEPTION: &str = "TSA_EXCEPTION";
    pub const TSA_REQUESTEDPOLICYOID: &str = "TSA_REQUESTEDPOLICYOID";
}

use self::tsa_log_keys::*;
use self::tsa_props::*;


//------------ TimeSource ----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeSource {
    /// The local system clock.
    Local,

    /// A clock that must be in sync with an external reference.
    ///
    /// No synchronisation is available so this source never provides a
    /// time.
    InSync,
}

impl TimeSource {
    pub fn now(self) -> Option<DateTime<Utc>> {
        match self {
            TimeSource::Local => Some(Utc::now()),
            TimeSource::InSync => None,
        }
    }
}


//------------ TsaName -------------------------------------------------------

#[derive(Clone, Debug)]
enum TsaName {
    None,

    /// The DER encoded directory name to include.
    Configured(Bytes),

    /// Use the subject of the signer certificate.
    FromCertificate,
}


//------------ TimeStampSigner -----------------------------------------------

#[derive(Clone, Debug)]
pub struct TimeStampSigner {
    time_source: TimeSource,
    signature_algorithm: Option<SignatureAlgorithm>,
    accepted_algorithms: Option<Vec<DigestAlgorithm>>,
    accepted_policies: Option<Vec<Oid<Bytes>>>,
    accepted_extensions: Option<Vec<Oid<Bytes>>>,
    default_policy: Oid<Bytes>,
    accuracy: Accuracy,
    ordering: bool,
    tsa_name: TsaName,
    require_valid_chain: bool,
    serial_number_length: usize,
    include_status_string: bool,
    include_signing_time: bool,
    certificate_digest: DigestAlgorithm,
}

impl TimeStampSigner {
    /// Creates the signer, adding all configuration problems to `errors`.
    pub fn init(config: &WorkerConfig, errors: &mut Vec<String>) -> Self {
        let time_source = match config.get_non_empty(TIMESOURCE) {
            None => TimeSource::Local,
            Some(value) if value.eq_ignore_ascii_case("LOCAL") => {
                TimeSource::Local
            }
            Some(value) if value.eq_ignore_ascii_case("INSYNC") => {
                TimeSource::InSync
            }
            Some(value) => {
                errors.push(format!("Could not create time source: {value}"));
                TimeSource::Local
            }
        };

        let signature_algorithm = config.get_non_empty(
            props::SIGNATUREALGORITHM
        ).and_then(|value| {
            SignatureAlgorithm::from_str(value).map_err(|err| {
                errors.push(format!("Illegal signature algorithm: {err}"))
            }).ok()
        });

        let accepted_algorithms = config.get(ACCEPTEDALGORITHMS).map(|value| {
            list(value).filter_map(|name| {
                DigestAlgorithm::from_str(name).map_err(|_| {
                    errors.push(format!(
                        "Unknown algorithm in {ACCEPTEDALGORITHMS}: {name}"
                    ))
                }).ok()
            }).collect()
        });
        let accepted_policies = oid_list(config, ACCEPTEDPOLICIES, errors);
        let accepted_extensions = oid_list(config, ACCEPTEDEXTENSIONS, errors);

        let default_policy = match config.get_non_empty(DEFAULTTSAPOLICYOID) {
            None => {
                errors.push(
                    "No default TSA policy OID has been configured".into()
                );
                oid::owned(oid::ID_DATA)
            }
            Some(value) => oid::parse(value).unwrap_or_else(|err| {
                errors.push(format!(
                    "TSA policy OID {value} is invalid: {err}"
                ));
                oid::owned(oid::ID_DATA)
            })
        };

        let accuracy = Accuracy {
            seconds: number(config, ACCURACYSECONDS, errors),
            millis: sub_second(config, ACCURACYMILLIS, errors),
            micros: sub_second(config, ACCURACYMICROS, errors),
        };

        let tsa_from_cert = flag(config, TSA_FROM_CERT, false, errors);
        let tsa_name = match (config.get_non_empty(TSA), tsa_from_cert) {
            (Some(_), true) => {
                errors.push(format!(
                    "Can not set {TSA_FROM_CERT} to true and set {TSA} \
                     worker property at the same time"
                ));
                TsaName::None
            }
            (Some(name), false) => match directory_name(name) {
                Ok(der) => TsaName::Configured(der),
                Err(err) => {
                    errors.push(err);
                    TsaName::None
                }
            },
            (None, true) => TsaName::FromCertificate,
            (None, false) => TsaName::None,
        };

        let serial_number_length = match config.get(MAXSERIALNUMBERLENGTH) {
            None => DEFAULT_SERIAL_NUMBER_LENGTH,
            Some(value) => match value.trim().parse::<i64>() {
                Err(_) => {
                    errors.push(format!(
                        "Maximum serial number length specified is invalid: \
                         \"{value}\""
                    ));
                    DEFAULT_SERIAL_NUMBER_LENGTH
                }
                Ok(len) if len > MAX_SERIAL_NUMBER_LENGTH as i64 => {
                    errors.push(format!(
                        "Maximum serial number length specified is too large: \
                         {len}"
                    ));
                    DEFAULT_SERIAL_NUMBER_LENGTH
                }
                Ok(len) if len < MIN_SERIAL_NUMBER_LENGTH as i64 => {
                    errors.push(format!(
                        "Maximum serial number length specified is too small: \
                         {len}"
                    ));
                    DEFAULT_SERIAL_NUMBER_LENGTH
                }
                Ok(len) => len as usize,
            }
        };

        let certificate_digest = match config.get_non_empty(
            CERTIFICATE_DIGEST_ALGORITHM
        ) {
            None => DigestAlgorithm::Sha256,
            Some(value) => DigestAlgorithm::from_str(value).unwrap_or_else(|_| {
                errors.push(format!(
                    "Illegal value for {CERTIFICATE_DIGEST_ALGORITHM}: {value}"
                ));
                DigestAlgorithm::Sha256
            })
        };

        TimeStampSigner {
            time_source,
            signature_algorithm,
            accepted_algorithms,
            accepted_policies,
            accepted_extensions,
            default_policy,
            accuracy,
            ordering: flag(config, ORDERING, false, errors),
            tsa_name,
            require_valid_chain: flag(config, REQUIREVALIDCHAIN, false, errors),
            serial_number_length,
            include_status_string: flag(
                config, props::INCLUDESTATUSSTRING, true, errors
            ),
            include_signing_time: flag(
                config, INCLUDESIGNINGTIMEATTRIBUTE, true, errors
            ),
            certificate_digest,
        }
    }

    /// Returns problems that prevent the signer from working right now.
    pub fn live_errors(&self) -> Vec<String> {
        let mut res = Vec::new();
        if self.time_source.now().is_none() {
            res.push("Time source not available".into());
        }
        res
    }

    /// Returns the problems with the signer's certificate chain.
    pub fn certificate_errors(&self, chain: &[X509]) -> Vec<String> {
        let mut res = Vec::new();
        let Some(cert) = chain.first() else {
            res.push("No signer certificate available".into());
            return res
        };
        match ExtendedKeyUsage::from_cert(cert) {
            Ok(None) => {
                res.push("Missing extended key usage timeStamping".into());
            }
            Ok(Some(eku)) => {
                if !eku.has_time_stamping() {
                    res.push("Missing extended key usage timeStamping".into());
                }
                if !eku.critical {
                    res.push(
                        "The extended key usage extension must be present \
                         and marked as critical".into()
                    );
                }
                if eku.has_time_stamping() && !eku.is_time_stamping_only() {
                    res.push(
                        "No other extended key usages than timeStamping is \
                         allowed".into()
                    );
                }
            }
            Err(_) => res.push("Unable to parse certificate".into()),
        }
        if self.require_valid_chain && !valid_chain(chain) {
            res.push(format!(
                "Not strictly valid chain and {REQUIREVALIDCHAIN} specified"
            ));
        }
        res
    }

    /// Answers a time-stamp request.
    ///
    /// Requests that are well-formed but not acceptable are answered with
    /// a rejection response rather than an error.
    pub fn process(
        &self,
        request: &SignatureRequest,
        context: &mut RequestContext,
        instance: &CryptoInstance,
    ) -> Result<SignatureResponse, Error> {
        let data = request.data();
        if data.is_empty() {
            return Err(Error::illegal_request("Request must contain data"))
        }
        let tsr = TimeStampReq::decode(data.clone()).map_err(|err| {
            debug!("Could not parse TimeStampRequest: {err}");
            Error::illegal_request("Could not parse TimeStampRequest")
        })?;
        let log = context.log_mut();
        let encoded_request = data.clone();
        log.put_deferred(TSA_TIMESTAMPREQUEST_ENCODED, move || {
            BASE64.encode(&encoded_request)
        });

        let serial = serial_number(self.serial_number_length);
        let archive_id = serial_hex(&serial);
        log.put(TSA_SERIALNUMBER, &archive_id);

        let gen_time = self.time_source.now().ok_or_else(|| {
            log.put(TSA_EXCEPTION, "timeSourceNotAvailable");
            Error::ServiceUnavailable("Time source is not available".into())
        })?;
        log.put(TSA_TIME, gen_time.timestamp_millis());

        let policy = tsr.req_policy.clone()
            .unwrap_or_else(|| self.default_policy.clone());
        log.put(TSA_POLICYID, oid::to_dotted(&policy));

        let (response, granted) = match self.check_request(&tsr) {
            Err((info, msg)) => {
                debug!("Rejecting time-stamp request: {msg}");
                let status_string = Some(msg.to_string());
                (TimeStampResp::rejection(info, status_string), false)
            }
            Ok(()) => {
                let token = self.token(
                    &tsr, policy, serial, gen_time, instance
                )?;
                let status_string = self.include_status_string.then(|| {
                    STATUS_OK.to_string()
                });
                (TimeStampResp::granted(token, status_string), true)
            }
        };
        let response_bytes = response.to_bytes();

        let log = context.log_mut();
        log.put(TSA_PKISTATUS, response.status);
        if let Some(info) = response.fail_info {
            log.put(TSA_PKIFAILUREINFO, info.bit());
        }
        if let Some(status_string) = response.status_string.as_ref() {
            log.put(TSA_PKISTATUS_STRING, status_string);
        }
        let encoded_response = response_bytes.clone();
        log.put_deferred(TSA_TIMESTAMPRESPONSE_ENCODED, move || {
            BASE64.encode(&encoded_response)
        });

        if granted {
            context.set_fulfilled(true);
        }

        let archivables = vec![
            Archivable::request(REQUEST_CONTENT_TYPE, data.clone(), &archive_id),
            Archivable::response(
                RESPONSE_CONTENT_TYPE, response_bytes.clone(), &archive_id
            ),
        ];
        let signer_certificate = granted.then(|| {
            instance.certificate().map(|cert| cert.to_owned())
        }).flatten();
        Ok(SignatureResponse::new(
            request.request_id(),
            response_bytes,
            RESPONSE_CONTENT_TYPE,
            archive_id,
        ).with_signer_certificate(signer_certificate)
        .with_archivables(archivables))
    }

    /// Checks the request against the accepted algorithms, policies and
    /// extensions.
    fn check_request(
        &self, tsr: &TimeStampReq
    ) -> Result<(), (FailureInfo, &'static str)> {
        let imprint = &tsr.message_imprint;
        let alg = DigestAlgorithm::from_oid(&imprint.hash_algorithm)
            .filter(|alg| {
                self.accepted_algorithms.as_ref()
                    .is_none_or(|accepted| accepted.contains(alg))
            })
            .ok_or((FailureInfo::BadAlg, "request contains unknown algorithm"))?;

        if let (Some(policy), Some(accepted)) = (
            tsr.req_policy.as_ref(), self.accepted_policies.as_ref()
        ) {
            if !accepted.contains(policy) {
                return Err((
                    FailureInfo::UnacceptedPolicy,
                    "request contains unknown policy"
                ))
            }
        }

        if let Some(accepted) = self.accepted_extensions.as_ref() {
            if tsr.extensions.iter().any(|ext| !accepted.contains(&ext.oid)) {
                return Err((
                    FailureInfo::UnacceptedExtension,
                    "request contains unknown extension"
                ))
            }
        }

        if imprint.hashed_message.len() != alg.digest_len() {
            return Err((
                FailureInfo::BadDataFormat,
                "imprint digest the wrong length"
            ))
        }
        Ok(())
    }

    /// Creates the signed token.
    fn token(
        &self,
        tsr: &TimeStampReq,
        policy: Oid<Bytes>,
        serial: Vec<u8>,
        gen_time: DateTime<Utc>,
        instance: &CryptoInstance,
    ) -> Result<Bytes, Error> {
        let cert = instance.certificate().ok_or_else(|| {
            Error::offline("No signer certificate available")
        })?;
        let tsa = match &self.tsa_name {
            TsaName::None => None,
            TsaName::Configured(der) => Some(der.clone()),
            TsaName::FromCertificate => Some(Bytes::from(
                cert.subject_name().to_der().map_err(|err| {
                    Error::signserver(format!("Cannot encode TSA name: {err}"))
                })?
            )),
        };
        let tst_info = TstInfo {
            policy,
            message_imprint: tsr.message_imprint.clone(),
            serial,
            gen_time,
            accuracy: Some(self.accuracy),
            ordering: self.ordering,
            nonce: tsr.nonce.clone(),
            tsa,
        }.to_bytes();

        let alg = self.signature_algorithm.unwrap_or_else(|| {
            SignatureAlgorithm::new(DigestAlgorithm::Sha256, instance.key_kind())
        });
        let digest = alg.digest().digest(&tst_info).map_err(|err| {
            Error::signserver(format!("Cannot digest TSTInfo: {err}"))
        })?;

        let mut builder = SignedDataBuilder::new(
            oid::owned(oid::CT_TSTINFO), alg
        ).signing_certificate(
            SigningCertificate::for_digest(self.certificate_digest)
        );
        if self.include_signing_time {
            builder = builder.signing_time(gen_time);
        }
        if tsr.cert_req {
            builder = builder.certificates(instance.chain().iter().cloned());
        }
        let prepared = builder.prepare(&digest, cert).map_err(|err| {
            Error::signserver(format!("Error constructing time-stamp token: {err}"))
        })?;
        let signature = instance.sign(alg, &prepared.to_be_signed())?;
        Ok(prepared.finish(&signature, Some(&tst_info)))
    }
}


//------------ Helpers -------------------------------------------------------

/// Splits a `;` separated list, dropping empty entries.
fn list(value: &str) -> impl Iterator<Item = &str> {
    value.split(';').map(str::trim).filter(|s| !s.is_empty())
}

/// Reads a list of object identifiers.
///
/// An absent property gives `None`, an empty one an empty list.
fn oid_list(
    config: &WorkerConfig, key: &str, errors: &mut Vec<String>
) -> Option<Vec<Oid<Bytes>>> {
    config.get(key).map(|value| {
        list(value).filter_map(|item| {
            oid::parse(item).map_err(|err| {
                errors.push(format!("Illegal value in {key}: {err}"))
            }).ok()
        }).collect()
    })
}

fn number<T: FromStr>(
    config: &WorkerConfig, key: &str, errors: &mut Vec<String>
) -> Option<T> {
    config.get_non_empty(key).and_then(|value| {
        value.parse().map_err(|_| {
            errors.push(format!("Illegal value for {key}: {value}"))
        }).ok()
    })
}

/// Reads the millis or micros of the accuracy, which must be 1 to 999.
fn sub_second(
    config: &WorkerConfig, key: &str, errors: &mut Vec<String>
) -> Option<u16> {
    let value = number::<u16>(config, key, errors)?;
    if (1..=999).contains(&value) {
        Some(value)
    }
    else {
        errors.push(format!(
            "Illegal value for {key}: {value}. Must be between 1 and 999."
        ));
        None
    }
}

fn flag(
    config: &WorkerConfig, key: &str, default: bool, errors: &mut Vec<String>
) -> bool {
    match config.get_non_empty(key) {
        None => default,
        Some(value) => parse_bool(value).unwrap_or_else(|| {
            errors.push(format!(
                "Incorrect value for property {key}. Expecting TRUE or FALSE."
            ));
            default
        })
    }
}

/// Encodes a directory name given as “CN=TSA,O=Example”.
fn directory_name(name: &str) -> Result<Bytes, String> {
    let err = |e: openssl::error::ErrorStack| {
        format!("Illegal value for {TSA}: {name}: {e}")
    };
    let mut builder = X509NameBuilder::new().map_err(err)?;
    for rdn in name.split(',').rev() {
        let (key, value) = rdn.split_once('=').ok_or_else(|| {
            format!("Illegal value for {TSA}: {name}")
        })?;
        builder.append_entry_by_text(key.trim(), value.trim()).map_err(err)?;
    }
    Ok(Bytes::from(builder.build().to_der().map_err(err)?))
}

/// Checks that every certificate is signed by the next one in the chain.
fn valid_chain(chain: &[X509]) -> bool {
    chain.windows(2).all(|pair| {
        pair[1].public_key()
            .and_then(|key| pair[0].verify(&key))
            .unwrap_or(false)
    })
}

/// Draws a random serial number of the given length.
///
/// The bytes are read as a two's complement integer and its absolute value
/// is returned as unsigned big endian bytes.
fn serial_number(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    if bytes.first().is_some_and(|b| b & 0x80 != 0) {
        let mut carry = true;
        for byte in bytes.iter_mut().rev() {
            *byte = !*byte;
            if carry {
                let (value, overflow) = byte.overflowing_add(1);
                *byte = value;
                carry = overflow;
            }
        }
    }
    bytes
}

/// Renders a serial number as lower case hex without leading zeros.
fn serial_hex(serial: &[u8]) -> String {
    let hex = hex::encode(serial);
    let hex = hex.trim_start_matches('0');
    if hex.is_empty() { "0".into() } else { hex.into() }
}


//------------ Tests ---------------------------------------------------------
