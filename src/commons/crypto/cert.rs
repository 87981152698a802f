//! Inspection of X.509 certificates.
//!
//! Certificates are handled as openssl [`X509`] values. The few things
//! openssl does not expose, such as the criticality of an extension, are
//! read from the DER encoding with bcder.
use bcder::{Mode, OctetString, Oid, Tag};
use bcder::decode::{self, DecodeError};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::error::ErrorStack;
use openssl::hash::{self, MessageDigest};
use openssl::nid::Nid;
use openssl::x509::{X509NameRef, X509Ref};

use super::der::CodecError;
use super::oid;


/// id-ce-privateKeyUsagePeriod
const CE_PRIVATE_KEY_USAGE_PERIOD: bcder::ConstOid
    = bcder::Oid(&[85, 29, 16]);


//------------ Names ---------------------------------------------------------

/// Renders a name most specific RDN first, e.g. “CN=TSA,O=Example,C=SE”.
pub fn dn_string(name: &X509NameRef) -> String {
    let mut rdns: Vec<String> = name.entries().map(|entry| {
        let key = entry.object().nid().short_name().unwrap_or("?");
        let value = entry.data().as_utf8()
            .map(|s| s.to_string())
            .unwrap_or_default();
        format!("{key}={value}")
    }).collect();
    rdns.reverse();
    rdns.join(",")
}

/// Normalises a distinguished name for comparison.
///
/// The RDNs are trimmed and the whole name is lower cased so that
/// “CN=Foo, O=Bar” and “cn=foo,o=bar” compare equal.
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| {
            match rdn.split_once('=') {
                Some((k, v)) => format!("{}={}", k.trim(), v.trim()),
                None => rdn.trim().to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(",")
        .to_lowercase()
}

/// Returns the first value of the given RDN type in the subject.
pub fn subject_rdn(cert: &X509Ref, nid: Nid) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(nid)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
}

pub fn issuer_dn(cert: &X509Ref) -> String {
    dn_string(cert.issuer_name())
}

pub fn subject_dn(cert: &X509Ref) -> String {
    dn_string(cert.subject_name())
}


//------------ Numbers and Hashes --------------------------------------------

/// The serial number as big endian bytes.
pub fn serial_bytes(cert: &X509Ref) -> Result<Vec<u8>, ErrorStack> {
    Ok(cert.serial_number().to_bn()?.to_vec())
}

/// The serial number in lower case hex without leading zeroes.
pub fn serial_hex(cert: &X509Ref) -> Result<String, ErrorStack> {
    let hex = cert.serial_number().to_bn()?.to_hex_str()?;
    let hex = hex.trim_start_matches('0').to_lowercase();
    Ok(if hex.is_empty() { "0".into() } else { hex })
}

/// The identifier of a key for usage counting.
///
/// This is the hex encoded SHA-256 hash over the DER encoded
/// SubjectPublicKeyInfo of the certificate.
pub fn key_hash(cert: &X509Ref) -> Result<String, ErrorStack> {
    let spki = cert.public_key()?.public_key_to_der()?;
    let digest = hash::hash(MessageDigest::sha256(), &spki)?;
    Ok(hex::encode(digest))
}


//------------ Extensions ----------------------------------------------------

#[derive(Clone, Debug)]
pub struct Extension {
    pub oid: Oid<Bytes>,
    pub critical: bool,
    pub value: Bytes,
}

/// Returns all extensions of a certificate.
pub fn extensions(cert: &X509Ref) -> Result<Vec<Extension>, CodecError> {
    let der = cert.to_der().map_err(|e| CodecError::Decode(e.to_string()))?;
    Ok(Mode::Der.decode(Bytes::from(der), |cons| {
        cons.take_sequence(|cons| {
            let res = cons.take_sequence(take_tbs_extensions)?;
            cons.skip_all()?; // signatureAlgorithm, signatureValue
            Ok(res)
        })
    })?)
}

//    TBSCertificate  ::=  SEQUENCE  {
//        version         [0]  EXPLICIT Version DEFAULT v1,
//        serialNumber         CertificateSerialNumber,
//        signature            AlgorithmIdentifier,
//        issuer               Name,
//        validity             Validity,
//        subject              Name,
//        subjectPublicKeyInfo SubjectPublicKeyInfo,
//        issuerUniqueID  [1]  IMPLICIT UniqueIdentifier OPTIONAL,
//        subjectUniqueID [2]  IMPLICIT UniqueIdentifier OPTIONAL,
//        extensions      [3]  EXPLICIT Extensions OPTIONAL
//        }
//
// Unique identifiers are not expected in the certificates we deal with.
fn take_tbs_extensions<S: decode::Source>(
    cons: &mut decode::Constructed<S>
) -> Result<Vec<Extension>, DecodeError<S::Error>> {
    cons.take_opt_constructed_if(Tag::CTX_0, |cons| cons.skip_all())?;
    for _ in 0..6 {
        cons.skip_one()?;
    }
    let mut res = Vec::new();
    cons.take_opt_constructed_if(Tag::CTX_3, |cons| {
        cons.take_sequence(|cons| {
            while let Some(ext) = cons.take_opt_sequence(|cons| {
                let oid = Oid::take_from(cons)?;
                let critical = cons.take_opt_bool()?.unwrap_or(false);
                let value = OctetString::take_from(cons)?.into_bytes();
                Ok(Extension { oid, critical, value })
            })? {
                res.push(ext);
            }
            Ok(())
        })
    })?;
    Ok(res)
}


//------------ ExtendedKeyUsage ----------------------------------------------

#[derive(Clone, Debug)]
pub struct ExtendedKeyUsage {
    pub critical: bool,
    pub purposes: Vec<Oid<Bytes>>,
}

impl ExtendedKeyUsage {
    pub fn from_cert(cert: &X509Ref) -> Result<Option<Self>, CodecError> {
        let Some(ext) = extensions(cert)?.into_iter().find(|ext| {
            ext.oid == oid::CE_EXTENDED_KEY_USAGE
        }) else {
            return Ok(None)
        };

        let purposes = Mode::Der.decode(ext.value, |cons| {
            cons.take_sequence(|cons| {
                let mut res = Vec::new();
                while let Some(purpose) = Oid::take_opt_from(cons)? {
                    res.push(purpose);
                }
                Ok(res)
            })
        })?;
        Ok(Some(ExtendedKeyUsage { critical: ext.critical, purposes }))
    }

    /// Whether time stamping is the one and only purpose.
    pub fn is_time_stamping_only(&self) -> bool {
        self.purposes.len() == 1
            && self.purposes[0] == oid::KP_TIME_STAMPING
    }

    pub fn has_time_stamping(&self) -> bool {
        self.purposes.iter().any(|p| *p == oid::KP_TIME_STAMPING)
    }
}


//------------ Validity ------------------------------------------------------

/// Why a certificate may not be used at a given moment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValidityError {
    NotYetValid,
    Expired,
    PrivateKeyNotYetValid,
    PrivateKeyExpired,
    Unreadable(String),
}

impl std::fmt::Display for ValidityError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ValidityError::NotYetValid => {
                f.write_str("Certificate is not yet valid")
            }
            ValidityError::Expired => f.write_str("Certificate has expired"),
            ValidityError::PrivateKeyNotYetValid => {
                f.write_str("Private key usage period has not started")
            }
            ValidityError::PrivateKeyExpired => {
                f.write_str("Private key usage period has expired")
            }
            ValidityError::Unreadable(msg) => {
                write!(f, "Cannot read certificate validity: {msg}")
            }
        }
    }
}

/// Checks that a certificate is valid now and for at least the given days.
pub fn check_validity(
    cert: &X509Ref,
    min_remaining_days: u32,
) -> Result<(), ValidityError> {
    let unreadable = |e: ErrorStack| ValidityError::Unreadable(e.to_string());

    let now = Asn1Time::days_from_now(0).map_err(unreadable)?;
    if cert.not_before() > now {
        return Err(ValidityError::NotYetValid)
    }
    let horizon = Asn1Time::days_from_now(min_remaining_days)
        .map_err(unreadable)?;
    if cert.not_after() < horizon {
        return Err(ValidityError::Expired)
    }
    Ok(())
}

/// Checks the private key usage period extension if there is one.
pub fn check_private_key_validity(
    cert: &X509Ref,
    now: DateTime<Utc>,
) -> Result<(), ValidityError> {
    let exts = extensions(cert)
        .map_err(|e| ValidityError::Unreadable(e.to_string()))?;
    let Some(ext) = exts.into_iter().find(|ext| {
        ext.oid == CE_PRIVATE_KEY_USAGE_PERIOD
    }) else {
        return Ok(())
    };

    // PrivateKeyUsagePeriod ::= SEQUENCE {
    //     notBefore       [0]     GeneralizedTime OPTIONAL,
    //     notAfter        [1]     GeneralizedTime OPTIONAL }
    let (not_before, not_after) = Mode::Der.decode(ext.value, |cons| {
        cons.take_sequence(|cons| {
            let not_before = cons.take_opt_primitive_if(
                Tag::CTX_0, |prim| prim.take_all()
            )?;
            let not_after = cons.take_opt_primitive_if(
                Tag::CTX_1, |prim| prim.take_all()
            )?;
            Ok((not_before, not_after))
        })
    }).map_err(|e| ValidityError::Unreadable(e.to_string()))?;

    if let Some(time) = not_before {
        if parse_generalized_time(&time)? > now {
            return Err(ValidityError::PrivateKeyNotYetValid)
        }
    }
    if let Some(time) = not_after {
        if parse_generalized_time(&time)? < now {
            return Err(ValidityError::PrivateKeyExpired)
        }
    }
    Ok(())
}

fn parse_generalized_time(raw: &[u8]) -> Result<DateTime<Utc>, ValidityError> {
    let s = std::str::from_utf8(raw)
        .map_err(|e| ValidityError::Unreadable(e.to_string()))?;
    let s = s.trim_end_matches('Z');
    let whole = s.split('.').next().unwrap_or(s);
    NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S")
        .map(|dt| dt.and_utc())
        .map_err(|e| ValidityError::Unreadable(e.to_string()))
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn time_stamping_eku_is_found() {
        let (_key, cert) = test::tsa_key_and_cert("CN=TSA Signer,O=Test");
        let eku = ExtendedKeyUsage::from_cert(&cert).unwrap().unwrap();
        assert!(eku.critical);
        assert!(eku.is_time_stamping_only());
    }

    #[test]
    fn missing_eku() {
        let (_key, cert) = test::plain_key_and_cert("CN=Plain");
        assert!(ExtendedKeyUsage::from_cert(&cert).unwrap().is_none());
    }

    #[test]
    fn names_render_most_specific_first() {
        let (_key, cert) = test::tsa_key_and_cert("CN=TSA Signer,O=Test");
        assert_eq!(subject_dn(&cert), "CN=TSA Signer,O=Test");
        assert_eq!(
            normalize_dn(" cn=TSA Signer , O = test"),
            normalize_dn("CN=TSA Signer,O=Test")
        );
        assert_eq!(
            subject_rdn(&cert, Nid::COMMONNAME).as_deref(),
            Some("TSA Signer")
        );
    }

    #[test]
    fn validity_window() {
        let (_key, cert) = test::tsa_key_and_cert("CN=TSA");
        assert!(check_validity(&cert, 0).is_ok());
        assert_eq!(
            check_validity(&cert, 10_000),
            Err(ValidityError::Expired)
        );
        assert!(check_private_key_validity(&cert, Utc::now()).is_ok());
    }

    #[test]
    fn key_hash_is_stable() {
        let (_key, cert) = test::tsa_key_and_cert("CN=TSA");
        let hash = key_hash(&cert).unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, key_hash(&cert).unwrap());
    }
}
