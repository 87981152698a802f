//! Object identifiers used throughout the crate.

use std::{error, fmt};
use bcder::{ConstOid, Oid};
use bytes::Bytes;


//------------ CMS -----------------------------------------------------------

/// [RFC 5652](https://tools.ietf.org/html/rfc5652) id-data.
pub const ID_DATA: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 7, 1]);

/// [RFC 5652](https://tools.ietf.org/html/rfc5652) id-signedData.
pub const SIGNED_DATA: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 7, 2]);

/// [RFC 3161](https://tools.ietf.org/html/rfc3161) id-ct-TSTInfo.
pub const CT_TSTINFO: ConstOid
    = Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 16, 1, 4]);

pub const CONTENT_TYPE: ConstOid
    = Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 3]);
pub const MESSAGE_DIGEST: ConstOid
    = Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 4]);
pub const SIGNING_TIME: ConstOid
    = Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 5]);

/// [RFC 2634](https://tools.ietf.org/html/rfc2634) id-aa-signingCertificate.
pub const SIGNING_CERTIFICATE: ConstOid
    = Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 16, 2, 12]);

/// [RFC 5035](https://tools.ietf.org/html/rfc5035) id-aa-signingCertificateV2.
pub const SIGNING_CERTIFICATE_V2: ConstOid
    = Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 16, 2, 47]);


//------------ Digest Algorithms ---------------------------------------------

pub const SHA1: ConstOid = Oid(&[43, 14, 3, 2, 26]);
pub const SHA224: ConstOid = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 4]);
pub const SHA256: ConstOid = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 1]);
pub const SHA384: ConstOid = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 2]);
pub const SHA512: ConstOid = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 3]);


//------------ Signature Algorithms ------------------------------------------

pub const SHA1_WITH_RSA: ConstOid
    = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 5]);
pub const SHA224_WITH_RSA: ConstOid
    = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 14]);
pub const SHA256_WITH_RSA: ConstOid
    = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 11]);
pub const SHA384_WITH_RSA: ConstOid
    = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 12]);
pub const SHA512_WITH_RSA: ConstOid
    = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 13]);

pub const ECDSA_WITH_SHA1: ConstOid = Oid(&[42, 134, 72, 206, 61, 4, 1]);
pub const ECDSA_WITH_SHA224: ConstOid
    = Oid(&[42, 134, 72, 206, 61, 4, 3, 1]);
pub const ECDSA_WITH_SHA256: ConstOid
    = Oid(&[42, 134, 72, 206, 61, 4, 3, 2]);
pub const ECDSA_WITH_SHA384: ConstOid
    = Oid(&[42, 134, 72, 206, 61, 4, 3, 3]);
pub const ECDSA_WITH_SHA512: ConstOid
    = Oid(&[42, 134, 72, 206, 61, 4, 3, 4]);


//------------ Certificate Extensions ----------------------------------------

pub const CE_EXTENDED_KEY_USAGE: ConstOid = Oid(&[85, 29, 37]);

/// id-kp-timeStamping.
pub const KP_TIME_STAMPING: ConstOid = Oid(&[43, 6, 1, 5, 5, 7, 3, 8]);


//------------ Parsing -------------------------------------------------------

/// Parses an object identifier in dotted decimal notation.
pub fn parse(s: &str) -> Result<Oid<Bytes>, InvalidOid> {
    let mut arcs = Vec::new();
    for part in s.trim().split('.') {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidOid(s.into()))
        }
        arcs.push(part.parse::<u64>().map_err(|_| InvalidOid(s.into()))?);
    }
    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] >= 40) {
        return Err(InvalidOid(s.into()))
    }

    let first = arcs[0]
        .checked_mul(40)
        .and_then(|v| v.checked_add(arcs[1]))
        .ok_or_else(|| InvalidOid(s.into()))?;

    let mut res = Vec::new();
    push_base128(&mut res, first);
    for arc in &arcs[2..] {
        push_base128(&mut res, *arc);
    }
    Ok(Oid(Bytes::from(res)))
}

fn push_base128(target: &mut Vec<u8>, mut value: u64) {
    let mut tmp = [0u8; 10];
    let mut pos = tmp.len() - 1;
    tmp[pos] = (value & 0x7f) as u8;
    value >>= 7;
    while value > 0 {
        pos -= 1;
        tmp[pos] = 0x80 | (value & 0x7f) as u8;
        value >>= 7;
    }
    target.extend_from_slice(&tmp[pos..]);
}

/// Turns a constant object identifier into an owned one.
pub fn owned(oid: ConstOid) -> Oid<Bytes> {
    Oid(Bytes::from_static(oid.0))
}

/// Returns the dotted decimal notation of an object identifier.
pub fn to_dotted(oid: &Oid<impl AsRef<[u8]>>) -> String {
    oid.to_string()
}


//------------ InvalidOid ----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvalidOid(String);

impl fmt::Display for InvalidOid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid object identifier '{}'", self.0)
    }
}

impl error::Error for InvalidOid {}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_oids() {
        assert_eq!(parse("1.2.840.113549.1.7.1").unwrap(), ID_DATA);
        assert_eq!(parse("2.16.840.1.101.3.4.2.1").unwrap(), SHA256);
        assert_eq!(parse("1.3.6.1.5.5.7.3.8").unwrap(), KP_TIME_STAMPING);
        assert_eq!(parse(" 2.5.29.37 ").unwrap(), CE_EXTENDED_KEY_USAGE);
    }

    #[test]
    fn dotted_form_survives_parsing() {
        let oid = parse("1.2.3.4").unwrap();
        assert_eq!(to_dotted(&oid), "1.2.3.4");
    }

    #[test]
    fn reject_invalid_oids() {
        for bad in ["", "1", "1..2", "3.1", "1.40", "a.b.c", "1.2.-3"] {
            assert!(parse(bad).is_err(), "accepted '{bad}'");
        }
    }
}
